//! Parquet footer analysis.
//!
//! One descriptor per dataset file: row count, partition values parsed from
//! the path, and per-key-column statistics merged across row groups. This is
//! a footer-only pass; row-group data is never touched here. Files whose
//! footers cannot be read are logged and marked unreadable so downstream
//! pruning treats them as affected.

use std::cmp::Ordering;
use std::collections::HashMap;

use arrow::datatypes::{DataType, SchemaRef};
use futures_util::{stream, StreamExt};
use parquet::arrow::async_reader::ParquetRecordBatchStreamBuilder;
use parquet::file::statistics::Statistics;

use crate::{
    error::MergeError,
    fs::{FileMeta, Fs},
    logging::merge_log,
    path::DatasetPath,
};

/// Default width of the footer-read fan-out.
pub(crate) fn default_fanout() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

/// A footer min/max value, comparable only within its own variant.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum StatValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl StatValue {
    pub(crate) fn partial_cmp(&self, other: &StatValue) -> Option<Ordering> {
        match (self, other) {
            (StatValue::Int(a), StatValue::Int(b)) => Some(a.cmp(b)),
            (StatValue::Float(a), StatValue::Float(b)) => a.partial_cmp(b),
            (StatValue::Bool(a), StatValue::Bool(b)) => Some(a.cmp(b)),
            (StatValue::Bytes(a), StatValue::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Min/max/null-count for one column, merged across row groups.
#[derive(Clone, Debug)]
pub(crate) struct ColumnStats {
    pub min: Option<StatValue>,
    pub max: Option<StatValue>,
    pub null_count: u64,
    /// When false the footer gave no usable ordering for this column and
    /// pruning must treat the file as a hit.
    pub reliable: bool,
}

impl ColumnStats {
    fn unreliable() -> Self {
        Self {
            min: None,
            max: None,
            null_count: 0,
            reliable: false,
        }
    }
}

/// Everything the planner needs to know about one target file.
#[derive(Clone, Debug)]
pub(crate) struct FileDescriptor {
    pub path: DatasetPath,
    /// Hive partition values parsed from the path, in path order.
    pub partitions: Vec<(String, String)>,
    pub rows: u64,
    pub size_bytes: Option<u64>,
    /// Arrow schema of the file; `None` when the footer was unreadable.
    pub schema: Option<SchemaRef>,
    /// Per key column statistics.
    pub stats: HashMap<String, ColumnStats>,
    /// False when the footer could not be read; such files are always
    /// treated as affected.
    pub readable: bool,
}

impl FileDescriptor {
    pub(crate) fn partition_value(&self, column: &str) -> Option<&str> {
        self.partitions
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }
}

/// Whether footer min/max ordering is trustworthy for a column of this type.
///
/// Unsigned types wider than 16 bits are stored sign-reinterpreted in the
/// physical encoding, so their footer ordering cannot be trusted.
fn stats_comparable(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Boolean
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::Float32
            | DataType::Float64
            | DataType::Date32
            | DataType::Date64
            | DataType::Timestamp(_, _)
            | DataType::Utf8
            | DataType::LargeUtf8
            | DataType::Binary
            | DataType::LargeBinary
    )
}

fn stat_bounds(statistics: &Statistics) -> Option<(StatValue, StatValue)> {
    match statistics {
        Statistics::Boolean(s) => Some((
            StatValue::Bool(*s.min_opt()?),
            StatValue::Bool(*s.max_opt()?),
        )),
        Statistics::Int32(s) => Some((
            StatValue::Int(i64::from(*s.min_opt()?)),
            StatValue::Int(i64::from(*s.max_opt()?)),
        )),
        Statistics::Int64(s) => Some((
            StatValue::Int(*s.min_opt()?),
            StatValue::Int(*s.max_opt()?),
        )),
        Statistics::Float(s) => Some((
            StatValue::Float(f64::from(*s.min_opt()?)),
            StatValue::Float(f64::from(*s.max_opt()?)),
        )),
        Statistics::Double(s) => Some((
            StatValue::Float(*s.min_opt()?),
            StatValue::Float(*s.max_opt()?),
        )),
        Statistics::ByteArray(s) => Some((
            StatValue::Bytes(s.min_opt()?.data().to_vec()),
            StatValue::Bytes(s.max_opt()?.data().to_vec()),
        )),
        Statistics::FixedLenByteArray(s) => Some((
            StatValue::Bytes(s.min_opt()?.data().to_vec()),
            StatValue::Bytes(s.max_opt()?.data().to_vec()),
        )),
        Statistics::Int96(_) => None,
    }
}

/// Enumerate the dataset and read every footer with a bounded fan-out.
///
/// The returned list is sorted by full path so downstream planning is
/// deterministic. Hidden entries (`.`- or `_`-prefixed segments, which
/// include staging leftovers) are not part of the dataset.
pub(crate) async fn analyze_dataset<F: Fs>(
    fs: &F,
    root: &DatasetPath,
    key_columns: &[String],
    fanout: usize,
) -> Result<Vec<FileDescriptor>, MergeError> {
    let mut files: Vec<FileMeta> = fs
        .list(root)
        .await
        .map_err(|err| MergeError::fs(root, err))?
        .into_iter()
        .filter(|meta| meta.path.is_parquet() && !is_hidden(root, &meta.path))
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));

    merge_log!(
        log::Level::Debug,
        "dataset_enumerated",
        "root={} files={}",
        root,
        files.len()
    );

    let mut descriptors: Vec<FileDescriptor> = stream::iter(files)
        .map(|meta| read_descriptor(fs, root, key_columns, meta))
        .buffer_unordered(fanout.max(1))
        .collect()
        .await;
    descriptors.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(descriptors)
}

fn is_hidden(root: &DatasetPath, path: &DatasetPath) -> bool {
    path.strip_prefix(root)
        .map(|rel| {
            rel.split('/')
                .any(|segment| segment.starts_with('.') || segment.starts_with('_'))
        })
        .unwrap_or(true)
}

async fn read_descriptor<F: Fs>(
    fs: &F,
    root: &DatasetPath,
    key_columns: &[String],
    meta: FileMeta,
) -> FileDescriptor {
    let partitions = meta.path.partition_values_below(root);
    let mut descriptor = FileDescriptor {
        path: meta.path,
        partitions,
        rows: 0,
        size_bytes: meta.size,
        schema: None,
        stats: HashMap::new(),
        readable: false,
    };

    let file = match fs.open_read(&descriptor.path).await {
        Ok(file) => file,
        Err(err) => {
            merge_log!(
                log::Level::Warn,
                "footer_unreadable",
                "path={} error={}",
                descriptor.path,
                err
            );
            return descriptor;
        }
    };

    let builder = match ParquetRecordBatchStreamBuilder::new(file).await {
        Ok(builder) => builder,
        Err(err) => {
            merge_log!(
                log::Level::Warn,
                "footer_unreadable",
                "path={} error={}",
                descriptor.path,
                err
            );
            return descriptor;
        }
    };

    let schema = builder.schema().clone();
    let parquet_meta = builder.metadata().clone();
    descriptor.rows = parquet_meta.file_metadata().num_rows().max(0) as u64;

    for key in key_columns {
        let comparable = schema
            .field_with_name(key)
            .map(|field| stats_comparable(field.data_type()))
            .unwrap_or(false);
        if !comparable {
            descriptor.stats.insert(key.clone(), ColumnStats::unreliable());
            continue;
        }

        let mut merged = ColumnStats {
            min: None,
            max: None,
            null_count: 0,
            reliable: true,
        };
        for row_group in parquet_meta.row_groups() {
            let column = row_group
                .columns()
                .iter()
                .find(|column| column.column_descr().name() == key.as_str());
            let Some(column) = column else {
                merged = ColumnStats::unreliable();
                break;
            };
            let bounds = column.statistics().and_then(|statistics| {
                statistics
                    .null_count_opt()
                    .zip(stat_bounds(statistics))
            });
            let Some((nulls, (min, max))) = bounds else {
                merged = ColumnStats::unreliable();
                break;
            };
            merged.null_count += nulls;
            merged.min = Some(match merged.min.take() {
                Some(current) if current.partial_cmp(&min) != Some(Ordering::Greater) => current,
                _ => min,
            });
            merged.max = Some(match merged.max.take() {
                Some(current) if current.partial_cmp(&max) != Some(Ordering::Less) => current,
                _ => max,
            });
        }
        descriptor.stats.insert(key.clone(), merged);
    }

    descriptor.schema = Some(schema);
    descriptor.readable = true;
    descriptor
}
