//! Shared fixtures for the end-to-end merge tests.

#![allow(dead_code)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, AsArray, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

/// Schema of target data files: partition values live in paths only.
pub fn target_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("v", DataType::Utf8, true),
    ]))
}

/// Write one target file under `root/rel`.
pub fn write_target_file(root: &Path, rel: &str, rows: &[(i64, Option<&str>)]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let schema = target_schema();
    let batch = RecordBatch::try_new(
        Arc::clone(&schema),
        vec![
            Arc::new(Int64Array::from(
                rows.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
            )),
        ],
    )
    .unwrap();
    let file = File::create(&path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

/// A source batch carrying a `day` partition column.
pub fn partitioned_source(rows: &[(i64, &str, &str)]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("day", DataType::Utf8, true),
        Field::new("v", DataType::Utf8, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(
                rows.iter().map(|(id, _, _)| *id).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, day, _)| Some(*day)).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, _, v)| Some(*v)).collect::<Vec<_>>(),
            )),
        ],
    )
    .unwrap()
}

/// A flat source batch matching the target schema.
pub fn flat_source(rows: &[(i64, Option<&str>)]) -> RecordBatch {
    let schema = target_schema();
    RecordBatch::try_new(
        Arc::clone(&schema),
        vec![
            Arc::new(Int64Array::from(
                rows.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
            )),
        ],
    )
    .unwrap()
}

/// Rows of one file, in file order.
pub fn read_rows(path: &Path) -> Vec<(i64, Option<String>)> {
    let file = File::open(path).unwrap();
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap();
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.unwrap();
        let ids = batch
            .column(batch.schema().index_of("id").unwrap())
            .as_primitive::<arrow::datatypes::Int64Type>()
            .clone();
        let values = batch
            .column(batch.schema().index_of("v").unwrap())
            .as_string::<i32>()
            .clone();
        for row in 0..batch.num_rows() {
            let value = if values.is_null(row) {
                None
            } else {
                Some(values.value(row).to_string())
            };
            rows.push((ids.value(row), value));
        }
    }
    rows
}

/// Every visible parquet file under `root`, sorted.
pub fn parquet_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries {
            let entry = entry.unwrap();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.starts_with('_') {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if name.ends_with(".parquet") {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

/// All dataset rows as a sorted multiset.
pub fn dataset_rows(root: &Path) -> Vec<(i64, Option<String>)> {
    let mut rows: Vec<(i64, Option<String>)> = parquet_files(root)
        .iter()
        .flat_map(|path| read_rows(path))
        .collect();
    rows.sort();
    rows
}

/// CRC of a file's bytes, for byte-identity assertions.
pub fn file_crc(path: &Path) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&std::fs::read(path).unwrap());
    hasher.finalize()
}

/// Whether any staging directory is left under `root`.
pub fn staging_leftovers(root: &Path) -> bool {
    std::fs::read_dir(root)
        .map(|entries| {
            entries.flatten().any(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".staging-")
            })
        })
        .unwrap_or(false)
}
