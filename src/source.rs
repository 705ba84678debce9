//! In-memory view of the rows being merged.

use arrow::array::{Array, AsArray, RecordBatch};
use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, SchemaRef};
use rustc_hash::FxHashMap;

use crate::{error::MergeError, key};

/// Render one partition-column cell as its Hive path token.
pub(crate) fn partition_token(
    column: &str,
    array: &dyn Array,
    row: usize,
) -> Result<String, MergeError> {
    use arrow::datatypes::*;

    let token = match array.data_type() {
        DataType::Utf8 => array.as_string::<i32>().value(row).to_string(),
        DataType::LargeUtf8 => array.as_string::<i64>().value(row).to_string(),
        DataType::Boolean => array.as_boolean().value(row).to_string(),
        DataType::Int8 => array.as_primitive::<Int8Type>().value(row).to_string(),
        DataType::Int16 => array.as_primitive::<Int16Type>().value(row).to_string(),
        DataType::Int32 => array.as_primitive::<Int32Type>().value(row).to_string(),
        DataType::Int64 => array.as_primitive::<Int64Type>().value(row).to_string(),
        DataType::UInt8 => array.as_primitive::<UInt8Type>().value(row).to_string(),
        DataType::UInt16 => array.as_primitive::<UInt16Type>().value(row).to_string(),
        DataType::UInt32 => array.as_primitive::<UInt32Type>().value(row).to_string(),
        DataType::UInt64 => array.as_primitive::<UInt64Type>().value(row).to_string(),
        other => {
            return Err(MergeError::InvalidArgument(format!(
                "partition column `{column}` has type {other}, which cannot be encoded in a path"
            )))
        }
    };
    Ok(token)
}

/// The source batch, normalized and indexed for one merge.
#[derive(Debug)]
pub(crate) struct SourceTable {
    /// All source rows as a single batch.
    pub batch: RecordBatch,
    /// Indices of the key columns within `batch`.
    pub key_indices: Vec<usize>,
    /// Canonical key digest per row. Empty when no key columns are declared.
    pub digests: Vec<u128>,
    /// Hive path tokens per row, one entry per partition column. Empty when
    /// no partition columns are declared.
    pub partition_tokens: Vec<Vec<String>>,
    /// Row indices surviving last-write-wins dedup, ascending.
    pub dedup_rows: Vec<u32>,
}

impl SourceTable {
    /// Normalize `batches` into a single table and index it.
    ///
    /// Key and partition columns must exist, and must not contain nulls:
    /// keys because matching on null is undefined, partition values because
    /// a null has no Hive path token.
    pub fn try_new(
        batches: Vec<RecordBatch>,
        key_columns: &[String],
        partition_columns: &[String],
    ) -> Result<Self, MergeError> {
        let schema = batches
            .first()
            .map(|b| b.schema())
            .ok_or_else(|| MergeError::InvalidArgument("source batch list is empty".into()))?;
        let batch = concat_batches(&schema, batches.iter())?;

        let key_indices = resolve_columns(&schema, key_columns)?;
        let partition_indices = resolve_columns(&schema, partition_columns)?;

        for (&idx, name) in key_indices.iter().zip(key_columns) {
            let nulls = batch.column(idx).null_count();
            if nulls > 0 {
                return Err(MergeError::NullKey {
                    column: name.clone(),
                    count: nulls,
                });
            }
        }
        for (&idx, name) in partition_indices.iter().zip(partition_columns) {
            let nulls = batch.column(idx).null_count();
            if nulls > 0 {
                return Err(MergeError::NullKey {
                    column: name.clone(),
                    count: nulls,
                });
            }
        }

        let digests = if key_indices.is_empty() {
            Vec::new()
        } else {
            key::batch_digests(&batch, &key_indices)?
                .into_iter()
                .map(|digest| {
                    digest.ok_or_else(|| MergeError::NullKey {
                        column: key_columns.join(","),
                        count: 1,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut partition_tokens = Vec::new();
        if !partition_indices.is_empty() {
            partition_tokens.reserve(batch.num_rows());
            for row in 0..batch.num_rows() {
                let mut tokens = Vec::with_capacity(partition_indices.len());
                for (&idx, name) in partition_indices.iter().zip(partition_columns) {
                    tokens.push(partition_token(name, batch.column(idx).as_ref(), row)?);
                }
                partition_tokens.push(tokens);
            }
        }

        let dedup_rows = if digests.is_empty() {
            (0..batch.num_rows() as u32).collect()
        } else {
            let mut last = FxHashMap::default();
            for (row, digest) in digests.iter().enumerate() {
                last.insert(*digest, row as u32);
            }
            (0..batch.num_rows() as u32)
                .filter(|&row| last[&digests[row as usize]] == row)
                .collect()
        };

        Ok(Self {
            batch,
            key_indices,
            digests,
            partition_tokens,
            dedup_rows,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }
}

fn resolve_columns(
    schema: &SchemaRef,
    names: &[String],
) -> Result<Vec<usize>, MergeError> {
    names
        .iter()
        .map(|name| {
            schema.index_of(name).map_err(|_| {
                MergeError::Schema(format!("column `{name}` is missing from the source"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{Field, Schema};

    use super::*;

    fn batch(ids: Vec<i64>, days: Vec<Option<&str>>, values: Vec<&str>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("day", DataType::Utf8, true),
            Field::new("v", DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(days)),
                Arc::new(StringArray::from(values)),
            ],
        )
        .unwrap()
    }

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dedup_keeps_the_last_write() {
        let source = SourceTable::try_new(
            vec![batch(
                vec![1, 2, 1],
                vec![Some("a"), Some("a"), Some("a")],
                vec!["old", "x", "new"],
            )],
            &strings(&["id"]),
            &[],
        )
        .unwrap();
        assert_eq!(source.dedup_rows, vec![1, 2]);
    }

    #[test]
    fn null_partition_value_is_rejected() {
        let err = SourceTable::try_new(
            vec![batch(vec![1], vec![None], vec!["z"])],
            &strings(&["id"]),
            &strings(&["day"]),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::NullKey { column, .. } if column == "day"));
    }

    #[test]
    fn partition_tokens_follow_declaration_order() {
        let source = SourceTable::try_new(
            vec![batch(vec![7], vec![Some("2024-01-01")], vec!["a"])],
            &strings(&["id"]),
            &strings(&["day"]),
        )
        .unwrap();
        assert_eq!(source.partition_tokens, vec![vec!["2024-01-01".to_string()]]);
    }

    #[test]
    fn unknown_key_column_is_a_schema_error() {
        let err = SourceTable::try_new(
            vec![batch(vec![1], vec![Some("d")], vec!["a"])],
            &strings(&["nope"]),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::Schema(_)));
    }
}
