//! Merge configuration.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use parquet::{
    basic::{BrotliLevel, Compression, GzipLevel, ZstdLevel},
    file::properties::{EnabledStatistics, WriterProperties},
};

use crate::{
    cancel::CancelToken, error::MergeError, memory::MemoryLimits, metadata,
    tracker::TrackerOptions,
};

/// Progress observer: `(processed_rows, total_rows)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Operating parameters of one merge.
///
/// Every knob has a builder-style `with_*` setter; the defaults are meant
/// for datasets in the hundreds of millions of rows on commodity hardware.
#[derive(Clone)]
pub struct MergeOptions {
    /// Compression codec applied to every written data page.
    pub(crate) compression: Compression,

    /// Maximum rows per freshly inserted file.
    pub(crate) max_rows_per_file: usize,

    /// Rows per Parquet row group in written files.
    pub(crate) row_group_size: usize,

    /// Row bound for streaming batches during confirmation and rewrite.
    pub(crate) merge_chunk_size_rows: usize,

    /// Width of the footer-read and confirmation fan-out.
    pub(crate) io_fanout: usize,

    /// Memory budget evaluated by the probe between batches.
    pub(crate) memory: MemoryLimits,

    /// Adaptive key tracker sizing.
    pub(crate) tracker: TrackerOptions,

    /// Write partition values into data files instead of only into paths.
    pub(crate) materialize_partition_columns: bool,

    /// Progress observer.
    pub(crate) progress_callback: Option<ProgressCallback>,

    /// Cancellation flag checked between batches and files.
    pub(crate) cancel_token: Option<CancelToken>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            compression: Compression::SNAPPY,
            max_rows_per_file: 5_000_000,
            row_group_size: 500_000,
            merge_chunk_size_rows: 10_000,
            io_fanout: metadata::default_fanout(),
            memory: MemoryLimits::default(),
            tracker: TrackerOptions::default(),
            materialize_partition_columns: false,
            progress_callback: None,
            cancel_token: None,
        }
    }
}

impl MergeOptions {
    /// Fresh options with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the output compression codec.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the output compression codec by name (`snappy`, `zstd`, `lz4`,
    /// `gzip`, `brotli`, `uncompressed`).
    pub fn compression_name(self, name: &str) -> Result<Self, MergeError> {
        let codec = match name.to_ascii_lowercase().as_str() {
            "uncompressed" | "none" => Compression::UNCOMPRESSED,
            "snappy" => Compression::SNAPPY,
            "gzip" => Compression::GZIP(GzipLevel::default()),
            "lz4" => Compression::LZ4,
            "lz4_raw" => Compression::LZ4_RAW,
            "zstd" => Compression::ZSTD(ZstdLevel::default()),
            "brotli" => Compression::BROTLI(BrotliLevel::default()),
            other => {
                return Err(MergeError::InvalidArgument(format!(
                    "unknown compression codec `{other}`"
                )))
            }
        };
        Ok(self.compression(codec))
    }

    /// Cap the rows per freshly inserted file.
    pub fn max_rows_per_file(mut self, rows: usize) -> Self {
        self.max_rows_per_file = rows;
        self
    }

    /// Rows per Parquet row group in written files.
    pub fn row_group_size(mut self, rows: usize) -> Self {
        self.row_group_size = rows;
        self
    }

    /// Row bound for streaming batches during confirmation and rewrite.
    pub fn merge_chunk_size_rows(mut self, rows: usize) -> Self {
        self.merge_chunk_size_rows = rows;
        self
    }

    /// Width of the footer-read and confirmation fan-out.
    pub fn io_fanout(mut self, width: usize) -> Self {
        self.io_fanout = width.max(1);
        self
    }

    /// Cap on engine-tracked batch allocations.
    pub fn max_allocator_bytes(mut self, bytes: u64) -> Self {
        self.memory.max_allocator_bytes = bytes;
        self
    }

    /// Optional cap on process RSS.
    pub fn max_process_bytes(mut self, bytes: Option<u64>) -> Self {
        self.memory.max_process_bytes = bytes;
        self
    }

    /// Floor under which system-available memory counts as pressure.
    pub fn min_system_available_bytes(mut self, bytes: u64) -> Self {
        self.memory.min_system_available_bytes = bytes;
        self
    }

    /// Largest source cardinality handled by the exact tracker tier.
    pub fn tracker_exact_limit(mut self, keys: usize) -> Self {
        self.tracker.exact_limit = keys;
        self
    }

    /// Largest source cardinality handled by the evicting tracker tier.
    pub fn tracker_evicting_limit(mut self, keys: usize) -> Self {
        self.tracker.evicting_limit = keys;
        self
    }

    /// Target false-positive rate of the probabilistic tracker tier.
    pub fn tracker_false_positive_rate(mut self, rate: f64) -> Self {
        self.tracker.false_positive_rate = rate;
        self
    }

    /// Skip the evicting tracker tier; exactness over memory.
    pub fn strict_tracker(mut self, strict: bool) -> Self {
        self.tracker.strict = strict;
        self
    }

    /// Write partition values into data files instead of only into paths.
    pub fn materialize_partition_columns(mut self, materialize: bool) -> Self {
        self.materialize_partition_columns = materialize;
        self
    }

    /// Observe progress as `(processed_rows, total_rows)`.
    pub fn progress_callback(
        mut self,
        callback: impl Fn(u64, u64) + Send + Sync + 'static,
    ) -> Self {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    /// Attach a cancellation token.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Writer properties for every file this merge produces. Statistics are
    /// always written so the next merge can prune.
    pub(crate) fn writer_properties(&self) -> WriterProperties {
        WriterProperties::builder()
            .set_compression(self.compression)
            .set_max_row_group_size(self.row_group_size.max(1))
            .set_statistics_enabled(EnabledStatistics::Chunk)
            .set_created_by(concat!("hivemerge version ", env!("CARGO_PKG_VERSION")).to_owned())
            .build()
    }
}

impl Debug for MergeOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeOptions")
            .field("compression", &self.compression)
            .field("max_rows_per_file", &self.max_rows_per_file)
            .field("row_group_size", &self.row_group_size)
            .field("merge_chunk_size_rows", &self.merge_chunk_size_rows)
            .field("io_fanout", &self.io_fanout)
            .field("memory", &self.memory)
            .field("tracker", &self.tracker)
            .field(
                "materialize_partition_columns",
                &self.materialize_partition_columns,
            )
            .field("progress_callback", &self.progress_callback.is_some())
            .field("cancel_token", &self.cancel_token.is_some())
            .finish()
    }
}
