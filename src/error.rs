//! Error types surfaced by the merge engine.

use thiserror::Error;

use crate::path::DatasetPath;

/// Any failure produced while planning, validating, rewriting, or promoting
/// a merge.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MergeError {
    /// Caller-supplied arguments are unusable (bad options, unknown columns,
    /// missing key list for `update`/`upsert`).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A key or partition column of the source contains nulls.
    #[error("column `{column}` contains {count} null value(s) in the source")]
    NullKey {
        /// Offending column.
        column: String,
        /// Number of nulls observed.
        count: usize,
    },

    /// A key present in both source and target carries a different partition
    /// value in the source. Partitions are immutable per key.
    #[error(
        "partition move for key {key:#034x}: column `{column}` is `{target_value}` in `{file}` but `{source_value}` in the source"
    )]
    PartitionMove {
        /// Canonical digest of the offending key.
        key: u128,
        /// Partition column with the conflicting value.
        column: String,
        /// Value carried by the source row.
        source_value: String,
        /// Value encoded in the target file's path.
        target_value: String,
        /// Target file holding the key.
        file: DatasetPath,
    },

    /// Source and target schemas are incompatible.
    #[error("schema mismatch: {0}")]
    Schema(String),

    /// A filesystem operation failed.
    #[error("filesystem error on `{path}`: {source}")]
    Filesystem {
        /// Path of the failed operation.
        path: DatasetPath,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A Parquet file could not be decoded during confirmation or rewrite.
    #[error("corrupt parquet file `{path}`: {source}")]
    CorruptParquet {
        /// Offending file.
        path: DatasetPath,
        /// Decoder error.
        #[source]
        source: parquet::errors::ParquetError,
    },

    /// The memory probe reported emergency pressure.
    #[error("memory budget exceeded: {0}")]
    MemoryBudgetExceeded(String),

    /// The caller's cancellation token was set.
    #[error("merge cancelled")]
    Cancelled,

    /// Promotion renamed some outputs but not all of them. The dataset needs
    /// operator reconciliation; staging is left in place.
    #[error(transparent)]
    PartialPromotion(#[from] PartialPromotionError),

    /// Parquet error outside of a per-file decode context.
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Arrow compute or schema error.
    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
}

/// Promotion stopped partway: `completed` renames are visible in the dataset,
/// `pending` ones still live under the staging directory.
#[derive(Debug, Error)]
#[error(
    "promotion incomplete: {done} of {total} renames applied, staging `{staging}` left for reconciliation: {source}",
    done = .completed.len(),
    total = .completed.len() + .pending.len()
)]
pub struct PartialPromotionError {
    /// Renames that were applied, as `(staging, target)` pairs.
    pub completed: Vec<(DatasetPath, DatasetPath)>,
    /// Renames that were not applied, as `(staging, target)` pairs.
    pub pending: Vec<(DatasetPath, DatasetPath)>,
    /// Staging directory holding the pending outputs.
    pub staging: DatasetPath,
    /// First rename failure.
    #[source]
    pub source: std::io::Error,
}

impl MergeError {
    pub(crate) fn fs(path: &DatasetPath, source: std::io::Error) -> Self {
        MergeError::Filesystem {
            path: path.clone(),
            source,
        }
    }

    pub(crate) fn corrupt(path: &DatasetPath, source: parquet::errors::ParquetError) -> Self {
        MergeError::CorruptParquet {
            path: path.clone(),
            source,
        }
    }
}
