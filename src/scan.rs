//! Key-intersection confirmation.
//!
//! Statistics can only prove absence; this pass proves presence. It reads
//! just the key columns of each candidate file in bounded batches and
//! intersects them with the source key digests. Files with a non-empty
//! intersection are affected; the rest join the preserved set.
//!
//! While matching, the scan also collects partition evidence: for every
//! matched key, the partition values encoded in the file's path must equal
//! the partition values the source carries for that key. Conflicts are
//! handed to the validator, which turns them into `PartitionMove` errors
//! before anything is written.

use futures_util::{stream, StreamExt};
use parquet::arrow::async_reader::ParquetRecordBatchStreamBuilder;
use parquet::arrow::ProjectionMask;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    cancel::CancelToken,
    error::MergeError,
    fs::Fs,
    key,
    logging::merge_log,
    metadata::FileDescriptor,
    path::DatasetPath,
    source::SourceTable,
};

/// A matched key whose source partition values disagree with the file that
/// holds it.
#[derive(Clone, Debug)]
pub(crate) struct PartitionConflict {
    pub key: u128,
    pub column: String,
    pub source_value: String,
    pub target_value: String,
    pub file: DatasetPath,
}

/// Result of confirming all candidates.
pub(crate) struct ScanOutcome {
    pub affected: Vec<FileDescriptor>,
    pub preserved: Vec<FileDescriptor>,
    /// Source digests seen in the target. Complete only when the scan ran
    /// without short-circuiting.
    pub matched: FxHashSet<u128>,
    pub conflicts: Vec<PartitionConflict>,
}

struct FileScan {
    descriptor: FileDescriptor,
    hit: bool,
    matched: FxHashSet<u128>,
    conflicts: Vec<PartitionConflict>,
}

/// Confirm which candidates actually hold source keys.
///
/// `short_circuit` stops reading a file at its first match; the caller may
/// only enable it when neither the complete matched set nor partition
/// evidence is needed.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn confirm_candidates<F: Fs>(
    fs: &F,
    candidates: Vec<FileDescriptor>,
    source: &SourceTable,
    source_index: &FxHashMap<u128, u32>,
    partition_columns: &[String],
    batch_rows: usize,
    short_circuit: bool,
    fanout: usize,
    cancel: Option<&CancelToken>,
) -> Result<ScanOutcome, MergeError> {
    let scans: Vec<FileScan> = stream::iter(candidates)
        .map(|descriptor| {
            scan_file(
                fs,
                descriptor,
                source,
                source_index,
                partition_columns,
                batch_rows,
                short_circuit,
                cancel,
            )
        })
        .buffer_unordered(fanout.max(1))
        .collect::<Vec<Result<FileScan, MergeError>>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;

    let mut outcome = ScanOutcome {
        affected: Vec::new(),
        preserved: Vec::new(),
        matched: FxHashSet::default(),
        conflicts: Vec::new(),
    };
    for scan in scans {
        outcome.matched.extend(scan.matched);
        outcome.conflicts.extend(scan.conflicts);
        if scan.hit {
            outcome.affected.push(scan.descriptor);
        } else {
            outcome.preserved.push(scan.descriptor);
        }
    }
    outcome.affected.sort_by(|a, b| a.path.cmp(&b.path));
    outcome.preserved.sort_by(|a, b| a.path.cmp(&b.path));

    merge_log!(
        log::Level::Debug,
        "confirmation_done",
        "affected={} preserved={} matched_keys={}",
        outcome.affected.len(),
        outcome.preserved.len(),
        outcome.matched.len()
    );
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn scan_file<F: Fs>(
    fs: &F,
    descriptor: FileDescriptor,
    source: &SourceTable,
    source_index: &FxHashMap<u128, u32>,
    partition_columns: &[String],
    batch_rows: usize,
    short_circuit: bool,
    cancel: Option<&CancelToken>,
) -> Result<FileScan, MergeError> {
    if let Some(token) = cancel {
        if token.is_cancelled() {
            return Err(MergeError::Cancelled);
        }
    }

    let mut scan = FileScan {
        descriptor,
        hit: false,
        matched: FxHashSet::default(),
        conflicts: Vec::new(),
    };

    // An unreadable footer was already logged; the file is affected by fiat.
    if !scan.descriptor.readable {
        scan.hit = true;
        return Ok(scan);
    }

    let source_schema = source.batch.schema();
    let key_names: Vec<String> = source
        .key_indices
        .iter()
        .map(|&idx| source_schema.field(idx).name().clone())
        .collect();

    let file = fs
        .open_read(&scan.descriptor.path)
        .await
        .map_err(|err| MergeError::fs(&scan.descriptor.path, err))?;
    let builder = ParquetRecordBatchStreamBuilder::new(file)
        .await
        .map_err(|err| MergeError::corrupt(&scan.descriptor.path, err))?;

    let file_schema = builder.schema().clone();
    let mut root_indices = Vec::with_capacity(key_names.len());
    for name in &key_names {
        let idx = file_schema.index_of(name).map_err(|_| {
            MergeError::Schema(format!(
                "key column `{name}` is missing from `{}`",
                scan.descriptor.path
            ))
        })?;
        root_indices.push(idx);
    }

    let mask = ProjectionMask::roots(builder.parquet_schema(), root_indices.iter().copied());
    let mut stream = builder
        .with_batch_size(batch_rows.max(1))
        .with_projection(mask)
        .build()
        .map_err(|err| MergeError::corrupt(&scan.descriptor.path, err))?;

    while let Some(batch) = stream.next().await {
        let batch = batch.map_err(|err| MergeError::corrupt(&scan.descriptor.path, err))?;
        let projected_schema = batch.schema();
        let key_indices: Vec<usize> = key_names
            .iter()
            .map(|name| projected_schema.index_of(name))
            .collect::<Result<_, _>>()?;

        for digest in key::batch_digests(&batch, &key_indices)?.into_iter().flatten() {
            let Some(&pos) = source_index.get(&digest) else {
                continue;
            };
            scan.hit = true;
            scan.matched.insert(digest);
            let source_row = source.dedup_rows[pos as usize];
            record_conflicts(&mut scan, digest, source_row, source, partition_columns);
            if short_circuit {
                return Ok(scan);
            }
        }

        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(MergeError::Cancelled);
            }
        }
    }
    Ok(scan)
}

fn record_conflicts(
    scan: &mut FileScan,
    digest: u128,
    source_row: u32,
    source: &SourceTable,
    partition_columns: &[String],
) {
    if partition_columns.is_empty() {
        return;
    }
    let tokens = &source.partition_tokens[source_row as usize];
    for (column, source_value) in partition_columns.iter().zip(tokens) {
        let Some(target_value) = scan.descriptor.partition_value(column) else {
            // Flat layout under declared partitions: nothing to compare.
            continue;
        };
        if target_value != source_value.as_str() {
            scan.conflicts.push(PartitionConflict {
                key: digest,
                column: column.clone(),
                source_value: source_value.clone(),
                target_value: target_value.to_string(),
                file: scan.descriptor.path.clone(),
            });
        }
    }
}
