//! Memory probe collaborator.
//!
//! The streaming merger consults the probe between batches and adapts its
//! chunk size to the reported pressure level. The probe combines an
//! engine-maintained allocation counter with process RSS and system-available
//! readings sampled through `sysinfo`.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sysinfo::{Pid, System};

/// Point-in-time memory readings.
#[derive(Clone, Copy, Debug)]
pub struct MemoryStatus {
    /// Bytes the engine believes it currently holds in batch buffers.
    pub allocated_bytes: u64,
    /// Resident set size of the process, when the platform reports one.
    pub process_rss_bytes: Option<u64>,
    /// Memory the system still has available, when the platform reports it.
    pub system_available_bytes: Option<u64>,
}

/// Pressure ladder driving the merger's batch sizing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Plenty of headroom.
    Normal,
    /// Approaching a limit; batch size is halved.
    Warning,
    /// Very close to a limit; batch size is halved again and the probe is
    /// asked to release what it can.
    Critical,
    /// A limit is exhausted; the merge aborts.
    Emergency,
}

/// Budget knobs evaluated by [`SystemProbe::pressure`].
#[derive(Clone, Copy, Debug)]
pub struct MemoryLimits {
    /// Cap on engine-tracked batch allocations.
    pub max_allocator_bytes: u64,
    /// Optional cap on process RSS.
    pub max_process_bytes: Option<u64>,
    /// Floor under which system-available memory counts as pressure.
    pub min_system_available_bytes: u64,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            max_allocator_bytes: 512 * 1024 * 1024,
            max_process_bytes: None,
            min_system_available_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Memory probe consumed by the engine.
pub trait MemoryProbe: Send + Sync {
    /// Record `bytes` of engine-held buffers.
    fn track(&self, bytes: u64);

    /// Forget `bytes` of engine-held buffers.
    fn release(&self, bytes: u64);

    /// Current readings.
    fn status(&self) -> MemoryStatus;

    /// Current pressure level.
    fn pressure(&self) -> MemoryPressure;

    /// Hint that now is a good moment to return memory to the OS. Optional.
    fn hint_release(&self) {}
}

/// Probe backed by an allocation counter plus `sysinfo` samples.
pub struct SystemProbe {
    limits: MemoryLimits,
    allocated: AtomicU64,
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemProbe {
    /// Build a probe enforcing `limits`.
    pub fn new(limits: MemoryLimits) -> Self {
        Self {
            limits,
            allocated: AtomicU64::new(0),
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    fn sample(&self) -> (Option<u64>, Option<u64>) {
        let mut system = self.system.lock();
        system.refresh_memory();
        let available = Some(system.available_memory());
        let rss = self.pid.and_then(|pid| {
            if system.refresh_process(pid) {
                system.process(pid).map(|process| process.memory())
            } else {
                None
            }
        });
        (rss, available)
    }

    fn level_for_ratio(used: u64, cap: u64) -> MemoryPressure {
        if cap == 0 || used >= cap {
            MemoryPressure::Emergency
        } else if used * 100 >= cap * 85 {
            MemoryPressure::Critical
        } else if used * 100 >= cap * 70 {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Normal
        }
    }
}

impl MemoryProbe for SystemProbe {
    fn track(&self, bytes: u64) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    fn release(&self, bytes: u64) {
        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    fn status(&self) -> MemoryStatus {
        let (rss, available) = self.sample();
        MemoryStatus {
            allocated_bytes: self.allocated.load(Ordering::Relaxed),
            process_rss_bytes: rss,
            system_available_bytes: available,
        }
    }

    fn pressure(&self) -> MemoryPressure {
        let status = self.status();
        let mut level = Self::level_for_ratio(
            status.allocated_bytes,
            self.limits.max_allocator_bytes,
        );
        if let (Some(rss), Some(cap)) = (status.process_rss_bytes, self.limits.max_process_bytes) {
            level = level.max(Self::level_for_ratio(rss, cap));
        }
        if let Some(available) = status.system_available_bytes {
            let floor = self.limits.min_system_available_bytes;
            if available < floor / 2 {
                level = level.max(MemoryPressure::Emergency);
            } else if available < floor {
                level = level.max(MemoryPressure::Critical);
            }
        }
        level
    }
}
