//! Canonical key encoding.
//!
//! Composite keys are folded into a fixed-width 128-bit digest built from a
//! length-prefixed concatenation of per-column binary encodings, hashed with
//! two independently seeded 64-bit passes. Equality of digests stands in for
//! equality of keys everywhere downstream, so the tracker never stores
//! variable-width key material.

use std::hash::Hasher;

use arrow::array::{Array, ArrayRef, AsArray, RecordBatch};
use arrow::datatypes::{DataType, TimeUnit};
use rustc_hash::FxHasher;

use crate::error::MergeError;

// Stable salts for the two base hashes.
const SEED1: u64 = 0x9E37_79B9_7F4A_7C15;
const SEED2: u64 = 0xD1B5_4A32_D192_ED03;

pub(crate) fn fxhash64_with_seed(seed: u64, bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(seed);
    hasher.write(bytes);
    hasher.finish()
}

/// Digest an encoded key buffer into the canonical 128-bit form.
pub(crate) fn digest128(bytes: &[u8]) -> u128 {
    let hi = fxhash64_with_seed(SEED1, bytes);
    let lo = fxhash64_with_seed(SEED2, bytes);
    ((hi as u128) << 64) | lo as u128
}

fn unsupported(column: &str, data_type: &DataType) -> MergeError {
    MergeError::Schema(format!(
        "key column `{column}` has type {data_type} which has no canonical key encoding"
    ))
}

macro_rules! encode_primitive {
    ($array:expr, $row:expr, $buf:expr, $ty:ty, $widen:ty) => {{
        let value = $array.as_primitive::<$ty>().value($row) as $widen;
        let bytes = value.to_le_bytes();
        $buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        $buf.extend_from_slice(&bytes);
    }};
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Append the canonical encoding of one non-null cell to `buf`.
fn encode_value(
    column: &str,
    array: &dyn Array,
    row: usize,
    buf: &mut Vec<u8>,
) -> Result<(), MergeError> {
    use arrow::datatypes::*;

    match array.data_type() {
        DataType::Boolean => {
            encode_bytes(buf, &[array.as_boolean().value(row) as u8]);
        }
        DataType::Int8 => encode_primitive!(array, row, buf, Int8Type, i64),
        DataType::Int16 => encode_primitive!(array, row, buf, Int16Type, i64),
        DataType::Int32 => encode_primitive!(array, row, buf, Int32Type, i64),
        DataType::Int64 => encode_primitive!(array, row, buf, Int64Type, i64),
        DataType::UInt8 => encode_primitive!(array, row, buf, UInt8Type, u64),
        DataType::UInt16 => encode_primitive!(array, row, buf, UInt16Type, u64),
        DataType::UInt32 => encode_primitive!(array, row, buf, UInt32Type, u64),
        DataType::UInt64 => encode_primitive!(array, row, buf, UInt64Type, u64),
        DataType::Float32 => {
            let value = array.as_primitive::<Float32Type>().value(row) as f64;
            encode_bytes(buf, &value.to_bits().to_le_bytes());
        }
        DataType::Float64 => {
            let value = array.as_primitive::<Float64Type>().value(row);
            encode_bytes(buf, &value.to_bits().to_le_bytes());
        }
        DataType::Date32 => encode_primitive!(array, row, buf, Date32Type, i64),
        DataType::Date64 => encode_primitive!(array, row, buf, Date64Type, i64),
        DataType::Timestamp(unit, _) => match unit {
            TimeUnit::Second => encode_primitive!(array, row, buf, TimestampSecondType, i64),
            TimeUnit::Millisecond => {
                encode_primitive!(array, row, buf, TimestampMillisecondType, i64)
            }
            TimeUnit::Microsecond => {
                encode_primitive!(array, row, buf, TimestampMicrosecondType, i64)
            }
            TimeUnit::Nanosecond => {
                encode_primitive!(array, row, buf, TimestampNanosecondType, i64)
            }
        },
        DataType::Decimal128(_, _) => {
            let value = array.as_primitive::<Decimal128Type>().value(row);
            encode_bytes(buf, &value.to_le_bytes());
        }
        DataType::Utf8 => encode_bytes(buf, array.as_string::<i32>().value(row).as_bytes()),
        DataType::LargeUtf8 => encode_bytes(buf, array.as_string::<i64>().value(row).as_bytes()),
        DataType::Binary => encode_bytes(buf, array.as_binary::<i32>().value(row)),
        DataType::LargeBinary => encode_bytes(buf, array.as_binary::<i64>().value(row)),
        DataType::FixedSizeBinary(_) => {
            encode_bytes(buf, array.as_fixed_size_binary().value(row));
        }
        other => return Err(unsupported(column, other)),
    }
    Ok(())
}

/// Digest the key columns of `batch`, one entry per row.
///
/// Rows with a null in any key column digest to `None`; the source side
/// rejects those up front, while target batches simply pass such rows
/// through unmatched.
pub(crate) fn batch_digests(
    batch: &RecordBatch,
    key_indices: &[usize],
) -> Result<Vec<Option<u128>>, MergeError> {
    let schema = batch.schema();
    let arrays: Vec<(&str, ArrayRef)> = key_indices
        .iter()
        .map(|&idx| (schema.field(idx).name().as_str(), batch.column(idx).clone()))
        .collect();

    let mut digests = Vec::with_capacity(batch.num_rows());
    let mut buf = Vec::with_capacity(64);
    'rows: for row in 0..batch.num_rows() {
        buf.clear();
        for (column, array) in &arrays {
            if array.is_null(row) {
                digests.push(None);
                continue 'rows;
            }
            encode_value(column, array.as_ref(), row, &mut buf)?;
        }
        digests.push(Some(digest128(&buf)));
    }
    Ok(digests)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{Field, Schema};

    use super::*;

    fn batch(ids: Vec<i64>, names: Vec<Option<&str>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(names)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn equal_keys_share_a_digest() {
        let a = batch(vec![1, 2], vec![Some("x"), Some("y")]);
        let b = batch(vec![2, 3], vec![Some("y"), Some("z")]);
        let da = batch_digests(&a, &[0, 1]).unwrap();
        let db = batch_digests(&b, &[0, 1]).unwrap();
        assert_eq!(da[1], db[0]);
        assert_ne!(da[0], db[1]);
    }

    #[test]
    fn column_boundaries_matter() {
        // ("ab", "c") and ("a", "bc") must not collide: the length prefix
        // keeps column boundaries inside the encoding.
        let a = batch(vec![1], vec![Some("ab")]);
        let b = batch(vec![1], vec![Some("ab")]);
        assert_eq!(
            batch_digests(&a, &[1]).unwrap(),
            batch_digests(&b, &[1]).unwrap()
        );

        let mut buf1 = Vec::new();
        encode_bytes(&mut buf1, b"ab");
        encode_bytes(&mut buf1, b"c");
        let mut buf2 = Vec::new();
        encode_bytes(&mut buf2, b"a");
        encode_bytes(&mut buf2, b"bc");
        assert_ne!(digest128(&buf1), digest128(&buf2));
    }

    #[test]
    fn null_key_rows_digest_to_none() {
        let a = batch(vec![1, 2], vec![Some("x"), None]);
        let digests = batch_digests(&a, &[0, 1]).unwrap();
        assert!(digests[0].is_some());
        assert!(digests[1].is_none());
    }

    #[test]
    fn unsupported_key_type_is_rejected() {
        use arrow::array::ListArray;
        use arrow::datatypes::Int32Type;

        let list = ListArray::from_iter_primitive::<Int32Type, _, _>(vec![Some(vec![Some(1)])]);
        let schema = Arc::new(Schema::new(vec![Field::new(
            "v",
            list.data_type().clone(),
            true,
        )]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(list)]).unwrap();
        assert!(matches!(
            batch_digests(&batch, &[0]),
            Err(MergeError::Schema(_))
        ));
    }
}
