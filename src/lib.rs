#![deny(missing_docs)]
//! Incremental merge engine for Hive-partitioned Parquet datasets.
//!
//! `hivemerge` applies `insert`, `update`, and `upsert` batches to an
//! existing Parquet dataset in a streaming, memory-bounded, crash-safe way:
//!
//! - Footer statistics and partition values prune the files a merge can
//!   possibly touch; a key-column confirmation scan proves the rest.
//! - Affected files are rewritten batch-by-batch with matched rows replaced
//!   in place (full-row semantics); rows with new keys become fresh
//!   partitioned files.
//! - Every output lands in a hidden staging directory first and is swapped
//!   into place by renames, so readers never observe a half-written file.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use arrow::array::{Int64Array, RecordBatch, StringArray};
//! use arrow::datatypes::{DataType, Field, Schema};
//! use hivemerge::{DatasetPath, MergeEngine, MergeOptions, MergeStrategy, TokioFs};
//!
//! # async fn example() -> Result<(), hivemerge::MergeError> {
//! let schema = Arc::new(Schema::new(vec![
//!     Field::new("id", DataType::Int64, false),
//!     Field::new("day", DataType::Utf8, false),
//!     Field::new("v", DataType::Utf8, false),
//! ]));
//! let batch = RecordBatch::try_new(
//!     schema,
//!     vec![
//!         Arc::new(Int64Array::from(vec![2, 4])),
//!         Arc::new(StringArray::from(vec!["2024-01-01", "2024-01-02"])),
//!         Arc::new(StringArray::from(vec!["B", "D"])),
//!     ],
//! )?;
//!
//! let engine = MergeEngine::new(TokioFs);
//! let result = engine
//!     .merge(
//!         vec![batch],
//!         &DatasetPath::new("/data/events"),
//!         MergeStrategy::Upsert,
//!         vec!["id".into()],
//!         vec!["day".into()],
//!         MergeOptions::default(),
//!     )
//!     .await?;
//! assert_eq!(result.deleted, 0);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod error;
pub mod fs;
pub mod memory;
pub mod path;

mod key;
mod logging;
mod merge;
mod metadata;
mod option;
mod plan;
mod pruning;
mod scan;
mod source;
mod staging;
mod tracker;
mod validate;

pub use cancel::CancelToken;
pub use error::{MergeError, PartialPromotionError};
pub use fs::{FileMeta, Fs, FsFile, TokioFs};
pub use memory::{MemoryLimits, MemoryPressure, MemoryProbe, MemoryStatus, SystemProbe};
pub use merge::{
    FileOperation, FileReport, MergeEngine, MergeResult, MergeStrategy, TrackerReport,
};
pub use option::{MergeOptions, ProgressCallback};
pub use path::DatasetPath;
pub use tracker::{TrackerOptions, TrackerTier};
