//! Pre-merge invariant checks.
//!
//! Null-key rejection happens when the source table is normalized (see
//! [`crate::source::SourceTable::try_new`]); the checks here cover the
//! request shape, schema compatibility with each target file, and partition
//! immutability. All of them run before the first staging write.

use arrow::compute::can_cast_types;
use arrow::datatypes::Schema;

use crate::{
    error::MergeError,
    merge::MergeStrategy,
    metadata::FileDescriptor,
    option::MergeOptions,
    scan::PartitionConflict,
    source::SourceTable,
};

/// Reject malformed requests before any IO happens.
pub(crate) fn check_request(
    strategy: MergeStrategy,
    key_columns: &[String],
    partition_columns: &[String],
    options: &MergeOptions,
) -> Result<(), MergeError> {
    if key_columns.is_empty() && strategy != MergeStrategy::Insert {
        return Err(MergeError::InvalidArgument(format!(
            "no key columns declared for strategy `{strategy}`"
        )));
    }
    for (list, what) in [(key_columns, "key"), (partition_columns, "partition")] {
        for (idx, name) in list.iter().enumerate() {
            if list[..idx].contains(name) {
                return Err(MergeError::InvalidArgument(format!(
                    "duplicate {what} column `{name}`"
                )));
            }
        }
    }
    if options.merge_chunk_size_rows == 0 {
        return Err(MergeError::InvalidArgument(
            "merge_chunk_size_rows must be positive".into(),
        ));
    }
    if options.row_group_size == 0 {
        return Err(MergeError::InvalidArgument(
            "row_group_size must be positive".into(),
        ));
    }
    if options.max_rows_per_file == 0 {
        return Err(MergeError::InvalidArgument(
            "max_rows_per_file must be positive".into(),
        ));
    }
    Ok(())
}

fn assignable(source: &arrow::datatypes::DataType, target: &arrow::datatypes::DataType) -> bool {
    source == target || can_cast_types(source, target)
}

/// Verify one target file's schema against the source.
///
/// Full-row replacement requires the source to supply every target column;
/// the reverse direction guards against silently dropping source columns.
/// Partition columns live in paths unless materialization was requested.
pub(crate) fn check_schema(
    source: &SourceTable,
    descriptor: &FileDescriptor,
    partition_columns: &[String],
    key_columns: &[String],
    materialize_partitions: bool,
) -> Result<(), MergeError> {
    // Unreadable footers surface as read failures later; nothing to check.
    let Some(file_schema) = descriptor.schema.as_ref() else {
        return Ok(());
    };
    let source_schema = source.schema();

    for key in key_columns {
        if file_schema.field_with_name(key).is_err() {
            return Err(MergeError::Schema(format!(
                "key column `{key}` is missing from `{}`",
                descriptor.path
            )));
        }
    }

    for field in file_schema.fields() {
        let Ok(source_field) = source_schema.field_with_name(field.name()) else {
            return Err(MergeError::Schema(format!(
                "column `{}` of `{}` is missing from the source",
                field.name(),
                descriptor.path
            )));
        };
        if !assignable(source_field.data_type(), field.data_type()) {
            return Err(MergeError::Schema(format!(
                "column `{}`: source type {} is not assignable to target type {} in `{}`",
                field.name(),
                source_field.data_type(),
                field.data_type(),
                descriptor.path
            )));
        }
    }

    for field in source_schema.fields() {
        let is_partition = partition_columns.contains(field.name());
        if is_partition && !materialize_partitions {
            continue;
        }
        if file_schema.field_with_name(field.name()).is_err() {
            return Err(MergeError::Schema(format!(
                "source column `{}` is missing from `{}`",
                field.name(),
                descriptor.path
            )));
        }
    }

    Ok(())
}

/// Turn partition evidence collected by the confirmation scan into an error.
pub(crate) fn check_partition_conflicts(
    conflicts: &[PartitionConflict],
) -> Result<(), MergeError> {
    let Some(conflict) = conflicts.first() else {
        return Ok(());
    };
    Err(MergeError::PartitionMove {
        key: conflict.key,
        column: conflict.column.clone(),
        source_value: conflict.source_value.clone(),
        target_value: conflict.target_value.clone(),
        file: conflict.file.clone(),
    })
}

/// Schema a rewritten or freshly inserted file is written with.
///
/// Path-only partition encoding strips the partition columns; materialized
/// encoding keeps the source schema as-is.
pub(crate) fn output_schema(
    source_schema: &Schema,
    partition_columns: &[String],
    materialize_partitions: bool,
) -> Schema {
    if materialize_partitions || partition_columns.is_empty() {
        return source_schema.clone();
    }
    let fields: Vec<_> = source_schema
        .fields()
        .iter()
        .filter(|field| !partition_columns.contains(field.name()))
        .cloned()
        .collect();
    Schema::new(fields)
}
