//! Adaptive key tracker.
//!
//! During rewrite every target row asks "does the source hold this key, and
//! which row is it?". The workload is query-heavy and update-light, sized
//! by the deduplicated source cardinality. Three tiers trade memory for
//! certainty:
//!
//! - **Exact**: a plain hash map, for small sources.
//! - **Evicting**: a bounded map that drops its oldest entries past a cap.
//!   An evicted key answers "absent", so its source row is re-emitted later;
//!   the eviction count is reported so callers can see when that happened.
//! - **Probabilistic**: a double-hashed Bloom filter in front of a sorted
//!   digest slice. The filter rejects most misses in O(k); hits are
//!   confirmed by binary search, so answers are exact at ~20 bytes/key.
//!
//! Callers that cannot tolerate the evicting tier's miss risk skip it with
//! `strict` and go straight to the probabilistic tier.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

/// Tier selection thresholds and sizing.
#[derive(Clone, Copy, Debug)]
pub struct TrackerOptions {
    /// Largest cardinality handled by the exact tier.
    pub exact_limit: usize,
    /// Largest cardinality handled by the evicting tier.
    pub evicting_limit: usize,
    /// Target false-positive rate of the Bloom front in the probabilistic
    /// tier. Only lookup cost is affected; answers stay exact.
    pub false_positive_rate: f64,
    /// Skip the evicting tier entirely.
    pub strict: bool,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            exact_limit: 1 << 20,
            evicting_limit: 8 << 20,
            false_positive_rate: 0.01,
            strict: false,
        }
    }
}

/// Which tier a merge ran with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerTier {
    /// Plain hash map.
    Exact,
    /// Bounded map with oldest-first eviction.
    Evicting,
    /// Bloom filter plus sorted-slice confirmation.
    Probabilistic,
}

impl std::fmt::Display for TrackerTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerTier::Exact => f.write_str("exact"),
            TrackerTier::Evicting => f.write_str("evicting"),
            TrackerTier::Probabilistic => f.write_str("probabilistic"),
        }
    }
}

enum Index {
    Exact(FxHashMap<u128, u32>),
    Evicting {
        map: FxHashMap<u128, u32>,
        evictions: u64,
    },
    Probabilistic {
        bloom: DigestBloom,
        sorted: Vec<(u128, u32)>,
    },
}

/// Tracks which source keys exist and which have been applied.
pub(crate) struct KeyTracker {
    index: Index,
    tier: TrackerTier,
    /// One bit per tracked entry, set once the row has been written.
    applied: Vec<u64>,
    applied_count: usize,
}

impl KeyTracker {
    /// Build a tracker over `(digest, row)` entries, picking the tier from
    /// the entry count.
    pub(crate) fn build(entries: &[(u128, u32)], options: &TrackerOptions) -> Self {
        let n = entries.len();
        let (index, tier) = if n <= options.exact_limit {
            (
                Index::Exact(entries.iter().copied().collect()),
                TrackerTier::Exact,
            )
        } else if !options.strict && n <= options.evicting_limit {
            let cap = options.exact_limit.max(1);
            let mut map = FxHashMap::default();
            let mut order = VecDeque::with_capacity(cap);
            let mut evictions = 0u64;
            for &(digest, row) in entries {
                if map.insert(digest, row).is_none() {
                    order.push_back(digest);
                }
                while map.len() > cap {
                    if let Some(oldest) = order.pop_front() {
                        map.remove(&oldest);
                        evictions += 1;
                    }
                }
            }
            (Index::Evicting { map, evictions }, TrackerTier::Evicting)
        } else {
            let bloom = DigestBloom::from_entries(entries, options.false_positive_rate);
            let mut sorted: Vec<(u128, u32)> = entries.to_vec();
            sorted.sort_unstable_by_key(|(digest, _)| *digest);
            (
                Index::Probabilistic { bloom, sorted },
                TrackerTier::Probabilistic,
            )
        };

        let words = entries.len().div_ceil(64);
        Self {
            index,
            tier,
            applied: vec![0u64; words],
            applied_count: 0,
        }
    }

    /// Row index of the source row holding `digest`, if tracked.
    pub(crate) fn lookup(&self, digest: u128) -> Option<u32> {
        match &self.index {
            Index::Exact(map) => map.get(&digest).copied(),
            Index::Evicting { map, .. } => map.get(&digest).copied(),
            Index::Probabilistic { bloom, sorted } => {
                if !bloom.contains(digest) {
                    return None;
                }
                sorted
                    .binary_search_by_key(&digest, |(d, _)| *d)
                    .ok()
                    .map(|pos| sorted[pos].1)
            }
        }
    }

    /// Record that tracked entry `pos` has been written.
    pub(crate) fn mark_applied(&mut self, pos: u32) {
        let word = (pos / 64) as usize;
        let bit = 1u64 << (pos % 64);
        if self.applied[word] & bit == 0 {
            self.applied[word] |= bit;
            self.applied_count += 1;
        }
    }

    pub(crate) fn is_applied(&self, pos: u32) -> bool {
        let word = (pos / 64) as usize;
        self.applied[word] & (1u64 << (pos % 64)) != 0
    }

    pub(crate) fn applied_count(&self) -> usize {
        self.applied_count
    }

    pub(crate) fn tier(&self) -> TrackerTier {
        self.tier
    }

    pub(crate) fn evictions(&self) -> u64 {
        match &self.index {
            Index::Evicting { evictions, .. } => *evictions,
            _ => 0,
        }
    }
}

/// Bloom filter over 128-bit digests.
///
/// The digest already carries two independent 64-bit hashes, so probe `i`
/// is `h1 + i*h2` with an unbiased 64→[0, m) reduction via 128-bit multiply.
struct DigestBloom {
    bits: Vec<u64>,
    m_bits: u64,
    k_hashes: u32,
}

impl DigestBloom {
    fn from_entries(entries: &[(u128, u32)], false_positive_rate: f64) -> Self {
        let n = entries.len().max(1) as f64;
        let p = false_positive_rate.clamp(1e-6, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let k_hashes = ((m_bits as f64 / n) * ln2).round().clamp(1.0, 16.0) as u32;

        let mut bloom = Self {
            bits: vec![0u64; (m_bits as usize).div_ceil(64)],
            m_bits,
            k_hashes,
        };
        for &(digest, _) in entries {
            bloom.insert(digest);
        }
        bloom
    }

    fn probes(&self, digest: u128) -> impl Iterator<Item = u64> + '_ {
        let h1 = (digest >> 64) as u64;
        let h2 = digest as u64;
        (0..self.k_hashes).map(move |i| {
            let combined = h1.wrapping_add(h2.wrapping_mul(i as u64));
            // Lemire fast range reduction.
            ((combined as u128 * self.m_bits as u128) >> 64) as u64
        })
    }

    fn insert(&mut self, digest: u128) {
        let probes: Vec<u64> = self.probes(digest).collect();
        for bit in probes {
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
    }

    fn contains(&self, digest: u128) -> bool {
        self.probes(digest)
            .all(|bit| self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: u32) -> Vec<(u128, u32)> {
        (0..n)
            .map(|i| (crate::key::digest128(&i.to_le_bytes()), i))
            .collect()
    }

    #[test]
    fn exact_tier_round_trips() {
        let entries = entries(100);
        let mut tracker = KeyTracker::build(&entries, &TrackerOptions::default());
        assert_eq!(tracker.tier(), TrackerTier::Exact);
        assert_eq!(tracker.lookup(entries[42].0), Some(42));
        assert_eq!(tracker.lookup(crate::key::digest128(b"absent")), None);

        assert!(!tracker.is_applied(42));
        tracker.mark_applied(42);
        tracker.mark_applied(42);
        assert!(tracker.is_applied(42));
        assert_eq!(tracker.applied_count(), 1);
    }

    #[test]
    fn evicting_tier_reports_evictions() {
        let entries = entries(64);
        let options = TrackerOptions {
            exact_limit: 16,
            evicting_limit: 1000,
            ..TrackerOptions::default()
        };
        let tracker = KeyTracker::build(&entries, &options);
        assert_eq!(tracker.tier(), TrackerTier::Evicting);
        assert_eq!(tracker.evictions(), 48);
        // The newest entries survive, the oldest were dropped.
        assert_eq!(tracker.lookup(entries[63].0), Some(63));
        assert_eq!(tracker.lookup(entries[0].0), None);
    }

    #[test]
    fn probabilistic_tier_is_exact() {
        let entries = entries(1000);
        let options = TrackerOptions {
            exact_limit: 10,
            evicting_limit: 100,
            ..TrackerOptions::default()
        };
        let tracker = KeyTracker::build(&entries, &options);
        assert_eq!(tracker.tier(), TrackerTier::Probabilistic);
        for (digest, row) in &entries {
            assert_eq!(tracker.lookup(*digest), Some(*row));
        }
        // Bloom false positives fall through to the sorted slice, so misses
        // stay misses.
        for i in 5000..6000u32 {
            let foreign = crate::key::digest128(&(u64::from(i) << 33).to_le_bytes());
            assert_eq!(tracker.lookup(foreign), None);
        }
    }

    #[test]
    fn strict_skips_the_evicting_tier() {
        let entries = entries(64);
        let options = TrackerOptions {
            exact_limit: 16,
            evicting_limit: 1000,
            strict: true,
            ..TrackerOptions::default()
        };
        let tracker = KeyTracker::build(&entries, &options);
        assert_eq!(tracker.tier(), TrackerTier::Probabilistic);
        assert_eq!(tracker.lookup(entries[0].0), Some(0));
    }
}
