//! Statistics-based pruning.

use std::cmp::Ordering;
use std::collections::HashMap;

use arrow::array::{Array, AsArray};
use arrow::compute;
use arrow::datatypes::DataType;

use crate::metadata::{FileDescriptor, StatValue};
use crate::source::SourceTable;

/// Per key column, the min/max of the source values in footer-comparable
/// form. `None` means the column's type gives no usable range.
pub(crate) fn source_key_ranges(
    source: &SourceTable,
    key_columns: &[String],
) -> HashMap<String, Option<(StatValue, StatValue)>> {
    let mut ranges = HashMap::new();
    for (&idx, name) in source.key_indices.iter().zip(key_columns) {
        let array = source.batch.column(idx);
        ranges.insert(name.clone(), column_range(array.as_ref()));
    }
    ranges
}

fn column_range(array: &dyn Array) -> Option<(StatValue, StatValue)> {
    use arrow::datatypes::*;

    if array.is_empty() {
        return None;
    }

    macro_rules! int_range {
        ($ty:ty) => {{
            let typed = array.as_primitive::<$ty>();
            let min = compute::min(typed)? as i64;
            let max = compute::max(typed)? as i64;
            Some((StatValue::Int(min), StatValue::Int(max)))
        }};
    }

    match array.data_type() {
        DataType::Int8 => int_range!(Int8Type),
        DataType::Int16 => int_range!(Int16Type),
        DataType::Int32 => int_range!(Int32Type),
        DataType::Int64 => int_range!(Int64Type),
        DataType::UInt8 => int_range!(UInt8Type),
        DataType::UInt16 => int_range!(UInt16Type),
        DataType::Date32 => int_range!(Date32Type),
        DataType::Date64 => int_range!(Date64Type),
        DataType::Timestamp(unit, _) => match unit {
            TimeUnit::Second => int_range!(TimestampSecondType),
            TimeUnit::Millisecond => int_range!(TimestampMillisecondType),
            TimeUnit::Microsecond => int_range!(TimestampMicrosecondType),
            TimeUnit::Nanosecond => int_range!(TimestampNanosecondType),
        },
        DataType::Float32 => {
            let typed = array.as_primitive::<Float32Type>();
            Some((
                StatValue::Float(compute::min(typed)? as f64),
                StatValue::Float(compute::max(typed)? as f64),
            ))
        }
        DataType::Float64 => {
            let typed = array.as_primitive::<Float64Type>();
            Some((
                StatValue::Float(compute::min(typed)?),
                StatValue::Float(compute::max(typed)?),
            ))
        }
        DataType::Boolean => {
            let typed = array.as_boolean();
            Some((
                StatValue::Bool(compute::min_boolean(typed)?),
                StatValue::Bool(compute::max_boolean(typed)?),
            ))
        }
        DataType::Utf8 => {
            let typed = array.as_string::<i32>();
            Some((
                StatValue::Bytes(compute::min_string(typed)?.as_bytes().to_vec()),
                StatValue::Bytes(compute::max_string(typed)?.as_bytes().to_vec()),
            ))
        }
        DataType::LargeUtf8 => {
            let typed = array.as_string::<i64>();
            Some((
                StatValue::Bytes(compute::min_string(typed)?.as_bytes().to_vec()),
                StatValue::Bytes(compute::max_string(typed)?.as_bytes().to_vec()),
            ))
        }
        DataType::Binary => {
            let typed = array.as_binary::<i32>();
            Some((
                StatValue::Bytes(compute::min_binary(typed)?.to_vec()),
                StatValue::Bytes(compute::max_binary(typed)?.to_vec()),
            ))
        }
        DataType::LargeBinary => {
            let typed = array.as_binary::<i64>();
            Some((
                StatValue::Bytes(compute::min_binary(typed)?.to_vec()),
                StatValue::Bytes(compute::max_binary(typed)?.to_vec()),
            ))
        }
        _ => None,
    }
}

/// Drop candidates whose footer ranges prove disjointness from the source.
///
/// One provably disjoint key column is enough to exclude a file: a composite
/// key cannot match when one of its columns cannot. Exclusion additionally
/// requires a zero null count, since footer min/max say nothing about nulls.
pub(crate) fn prune_by_statistics(
    candidates: Vec<FileDescriptor>,
    ranges: &HashMap<String, Option<(StatValue, StatValue)>>,
) -> (Vec<FileDescriptor>, Vec<FileDescriptor>) {
    // Probe narrow source ranges first so the common exclusion is cheap.
    let mut ordered: Vec<(&String, &(StatValue, StatValue))> = ranges
        .iter()
        .filter_map(|(name, range)| range.as_ref().map(|r| (name, r)))
        .collect();
    ordered.sort_by(|a, b| {
        range_span(a.1)
            .partial_cmp(&range_span(b.1))
            .unwrap_or(Ordering::Equal)
    });

    let mut kept = Vec::new();
    let mut preserved = Vec::new();
    'files: for descriptor in candidates {
        if descriptor.readable {
            for (name, (source_min, source_max)) in &ordered {
                let Some(stats) = descriptor.stats.get(*name) else {
                    continue;
                };
                if !stats.reliable || stats.null_count > 0 {
                    continue;
                }
                let (Some(file_min), Some(file_max)) = (&stats.min, &stats.max) else {
                    continue;
                };
                let above = source_min.partial_cmp(file_max) == Some(Ordering::Greater);
                let below = source_max.partial_cmp(file_min) == Some(Ordering::Less);
                if above || below {
                    preserved.push(descriptor);
                    continue 'files;
                }
            }
        }
        kept.push(descriptor);
    }
    (kept, preserved)
}

fn range_span(range: &(StatValue, StatValue)) -> f64 {
    match range {
        (StatValue::Int(min), StatValue::Int(max)) => (max - min) as f64,
        (StatValue::Float(min), StatValue::Float(max)) => max - min,
        _ => f64::INFINITY,
    }
}
