//! Streaming rewrite of affected files and emission of new files.
//!
//! Each affected file is copied batch-by-batch into staging with matched
//! rows substituted in place: row order equals read order, a replaced row
//! sits exactly where the old one was. Source rows that never matched any
//! target row during the pass are grouped by partition and written as fresh
//! `part-*` files. Memory pressure is consulted between batches and shrinks
//! the working chunk; emergency pressure aborts the merge.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{Array, RecordBatch, UInt32Array};
use arrow::compute::{self, concat_batches};
use arrow::datatypes::SchemaRef;
use futures_util::StreamExt;
use parquet::arrow::async_reader::ParquetRecordBatchStreamBuilder;
use parquet::arrow::AsyncArrowWriter;

use crate::{
    cancel::CancelToken,
    error::MergeError,
    fs::Fs,
    key::{self, fxhash64_with_seed},
    logging::merge_log,
    memory::{MemoryPressure, MemoryProbe},
    merge::MergeStrategy,
    metadata::FileDescriptor,
    option::{MergeOptions, ProgressCallback},
    path::DatasetPath,
    source::SourceTable,
    staging::StagingArea,
    tracker::KeyTracker,
    validate,
};

/// Floor for the adaptive chunk so pressure can never stall the stream.
const MIN_CHUNK_ROWS: usize = 256;

/// Salt for deterministic file-name hashes.
const NAME_SEED: u64 = 0x8F9C_0D4A_33B1_77E5;

/// Shared read-only state of the rewriting phase.
pub(crate) struct RewriteContext<'a, F: Fs> {
    pub fs: &'a F,
    pub root: &'a DatasetPath,
    pub source: &'a SourceTable,
    pub strategy: MergeStrategy,
    pub partition_columns: &'a [String],
    pub options: &'a MergeOptions,
    pub probe: &'a dyn MemoryProbe,
    pub cancel: Option<&'a CancelToken>,
}

impl<F: Fs> RewriteContext<'_, F> {
    pub(crate) fn check_cancel(&self) -> Result<(), MergeError> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(MergeError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Rows-processed reporting toward the caller's `progress_callback`.
pub(crate) struct Progress {
    callback: Option<ProgressCallback>,
    processed: u64,
    total: u64,
}

impl Progress {
    pub(crate) fn new(callback: Option<ProgressCallback>, total: u64) -> Self {
        Self {
            callback,
            processed: 0,
            total,
        }
    }

    pub(crate) fn advance(&mut self, rows: u64) {
        self.processed += rows;
        if let Some(callback) = &self.callback {
            callback(self.processed, self.total);
        }
    }

    /// Re-anchor the total once the final new-row count is known.
    pub(crate) fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    /// Emit the terminal `(total, total)` observation.
    pub(crate) fn finish(&mut self) {
        self.total = self.processed;
        if let Some(callback) = &self.callback {
            callback(self.processed, self.total);
        }
    }
}

/// Metadata of one written (or preserved) output file.
#[derive(Clone, Debug)]
pub(crate) struct FileWriteReport {
    pub target: DatasetPath,
    pub rows: u64,
    pub bytes: u64,
}

/// Rewrite every affected file into staging.
///
/// Returns the per-file reports and the number of replaced rows.
pub(crate) async fn rewrite_affected<F: Fs>(
    ctx: &RewriteContext<'_, F>,
    affected: &[FileDescriptor],
    tracker: &mut KeyTracker,
    staging: &mut StagingArea,
    progress: &mut Progress,
) -> Result<(Vec<FileWriteReport>, u64), MergeError> {
    let mut reports = Vec::with_capacity(affected.len());
    let mut updated = 0u64;
    for (index, descriptor) in affected.iter().enumerate() {
        ctx.check_cancel()?;
        let report =
            rewrite_file(ctx, descriptor, index, tracker, staging, progress, &mut updated).await?;
        reports.push(report);
    }
    Ok((reports, updated))
}

async fn rewrite_file<F: Fs>(
    ctx: &RewriteContext<'_, F>,
    descriptor: &FileDescriptor,
    index: usize,
    tracker: &mut KeyTracker,
    staging: &mut StagingArea,
    progress: &mut Progress,
    updated: &mut u64,
) -> Result<FileWriteReport, MergeError> {
    let file = ctx
        .fs
        .open_read(&descriptor.path)
        .await
        .map_err(|err| MergeError::fs(&descriptor.path, err))?;
    let builder = ParquetRecordBatchStreamBuilder::new(file)
        .await
        .map_err(|err| MergeError::corrupt(&descriptor.path, err))?;
    let file_schema = builder.schema().clone();
    let mut stream = builder
        .with_batch_size(ctx.options.merge_chunk_size_rows.max(1))
        .build()
        .map_err(|err| MergeError::corrupt(&descriptor.path, err))?;

    let source_schema = ctx.source.schema();
    let key_indices: Vec<usize> = ctx
        .source
        .key_indices
        .iter()
        .map(|&idx| file_schema.index_of(source_schema.field(idx).name()))
        .collect::<Result<_, _>>()?;
    let source_proj = project_source(ctx.source, &file_schema)?;

    let staging_path = staging.rewrite_slot(index);
    let out = ctx
        .fs
        .open_write(&staging_path)
        .await
        .map_err(|err| MergeError::fs(&staging_path, err))?;
    let mut writer = AsyncArrowWriter::try_new(
        out,
        file_schema.clone(),
        Some(ctx.options.writer_properties()),
    )?;

    let mut chunk_rows = ctx.options.merge_chunk_size_rows.max(1);
    let mut rows_out = 0u64;
    while let Some(batch) = stream.next().await {
        let batch = batch.map_err(|err| MergeError::corrupt(&descriptor.path, err))?;
        let mut offset = 0;
        while offset < batch.num_rows() {
            let len = chunk_rows.min(batch.num_rows() - offset);
            let slice = batch.slice(offset, len);
            offset += len;

            let out_batch = merge_slice(ctx, &slice, &key_indices, &source_proj, tracker, updated)?;
            let held = (slice.get_array_memory_size() + out_batch.get_array_memory_size()) as u64;
            ctx.probe.track(held);
            writer.write(&out_batch).await?;
            rows_out += out_batch.num_rows() as u64;

            progress.advance(len as u64);
            // Probe while the batch buffers are still accounted for.
            let pressure = apply_pressure(ctx.probe, chunk_rows);
            ctx.probe.release(held);
            chunk_rows = pressure?;
            ctx.check_cancel()?;
        }
    }

    let bytes = writer.bytes_written() as u64;
    writer.close().await?;
    staging.record_rewrite(staging_path, descriptor.path.clone());
    merge_log!(
        log::Level::Info,
        "file_rewritten",
        "path={} rows={} bytes={}",
        descriptor.path,
        rows_out,
        bytes
    );
    Ok(FileWriteReport {
        target: descriptor.path.clone(),
        rows: rows_out,
        bytes,
    })
}

/// Substitute matched rows of one slice with their source rows, in place.
fn merge_slice<F: Fs>(
    ctx: &RewriteContext<'_, F>,
    slice: &RecordBatch,
    key_indices: &[usize],
    source_proj: &RecordBatch,
    tracker: &mut KeyTracker,
    updated: &mut u64,
) -> Result<RecordBatch, MergeError> {
    debug_assert!(ctx.strategy != MergeStrategy::Insert);

    let digests = key::batch_digests(slice, key_indices)?;
    let slice_len = slice.num_rows() as u32;
    let mut out_indices: Vec<u32> = Vec::with_capacity(slice.num_rows());
    let mut replacement_rows: Vec<u32> = Vec::new();
    for (row, digest) in digests.iter().enumerate() {
        match digest.and_then(|digest| tracker.lookup(digest)) {
            Some(pos) => {
                tracker.mark_applied(pos);
                *updated += 1;
                out_indices.push(slice_len + replacement_rows.len() as u32);
                replacement_rows.push(ctx.source.dedup_rows[pos as usize]);
            }
            None => out_indices.push(row as u32),
        }
    }

    if replacement_rows.is_empty() {
        return Ok(slice.clone());
    }
    let replacements = take_batch(source_proj, &UInt32Array::from(replacement_rows))?;
    let combined = concat_batches(&slice.schema(), [slice, &replacements])?;
    take_batch(&combined, &UInt32Array::from(out_indices))
}

/// Write the not-yet-applied source rows as fresh partitioned files.
pub(crate) async fn write_new_files<F: Fs>(
    ctx: &RewriteContext<'_, F>,
    positions: &[u32],
    descriptors: &[FileDescriptor],
    staging: &mut StagingArea,
    progress: &mut Progress,
) -> Result<(Vec<FileWriteReport>, u64), MergeError> {
    if positions.is_empty() {
        return Ok((Vec::new(), 0));
    }

    let schema: SchemaRef = match descriptors.iter().find_map(|d| d.schema.clone()) {
        Some(schema) => schema,
        None => Arc::new(validate::output_schema(
            &ctx.source.schema(),
            ctx.partition_columns,
            ctx.options.materialize_partition_columns,
        )),
    };
    let source_proj = project_source(ctx.source, &schema)?;

    let mut groups: BTreeMap<Vec<String>, Vec<u32>> = BTreeMap::new();
    for &pos in positions {
        let row = ctx.source.dedup_rows[pos as usize];
        let tokens = if ctx.source.partition_tokens.is_empty() {
            Vec::new()
        } else {
            ctx.source.partition_tokens[row as usize].clone()
        };
        groups.entry(tokens).or_default().push(row);
    }

    let mut reports = Vec::new();
    let mut inserted = 0u64;
    for (tokens, rows) in groups {
        ctx.check_cancel()?;
        let rel_dir = ctx
            .partition_columns
            .iter()
            .zip(&tokens)
            .map(|(column, token)| format!("{column}={token}"))
            .collect::<Vec<_>>()
            .join("/");
        // Number new files after the ones already in this partition.
        let existing = descriptors
            .iter()
            .filter(|descriptor| {
                ctx.partition_columns
                    .iter()
                    .zip(&tokens)
                    .all(|(column, token)| descriptor.partition_value(column) == Some(token.as_str()))
            })
            .count();

        for (seq, chunk) in rows.chunks(ctx.options.max_rows_per_file.max(1)).enumerate() {
            ctx.check_cancel()?;
            let indices = UInt32Array::from(chunk.to_vec());
            let batch = take_batch(&source_proj, &indices)?;
            let name = format!(
                "part-{:05}-{}.parquet",
                existing + seq,
                content_hash(ctx.source, chunk)
            );
            let relative = if rel_dir.is_empty() {
                name
            } else {
                format!("{rel_dir}/{name}")
            };

            let staging_path = staging.new_file_slot(&relative);
            let out = ctx
                .fs
                .open_write(&staging_path)
                .await
                .map_err(|err| MergeError::fs(&staging_path, err))?;
            let mut writer = AsyncArrowWriter::try_new(
                out,
                schema.clone(),
                Some(ctx.options.writer_properties()),
            )?;
            let held = batch.get_array_memory_size() as u64;
            ctx.probe.track(held);
            writer.write(&batch).await?;
            let pressure = check_emergency(ctx.probe);
            ctx.probe.release(held);
            pressure?;
            let bytes = writer.bytes_written() as u64;
            writer.close().await?;

            let target = ctx.root.child(&relative);
            staging.record_new_file(staging_path, target.clone());
            inserted += chunk.len() as u64;
            progress.advance(chunk.len() as u64);
            merge_log!(
                log::Level::Info,
                "file_inserted",
                "path={} rows={} bytes={}",
                target,
                chunk.len(),
                bytes
            );
            reports.push(FileWriteReport {
                target,
                rows: chunk.len() as u64,
                bytes,
            });
        }
    }
    Ok((reports, inserted))
}

/// Project the source batch onto `schema`, casting assignable columns.
fn project_source(source: &SourceTable, schema: &SchemaRef) -> Result<RecordBatch, MergeError> {
    let source_schema = source.batch.schema();
    let mut columns = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let idx = source_schema.index_of(field.name())?;
        let column = source.batch.column(idx);
        let column = if column.data_type() == field.data_type() {
            column.clone()
        } else {
            compute::cast(column.as_ref(), field.data_type())?
        };
        columns.push(column);
    }
    RecordBatch::try_new(schema.clone(), columns).map_err(Into::into)
}

fn take_batch(batch: &RecordBatch, indices: &UInt32Array) -> Result<RecordBatch, MergeError> {
    let columns = batch
        .columns()
        .iter()
        .map(|column| compute::take(column.as_ref(), indices, None))
        .collect::<Result<Vec<_>, _>>()?;
    RecordBatch::try_new(batch.schema(), columns).map_err(Into::into)
}

fn memory_exhausted(probe: &dyn MemoryProbe) -> MergeError {
    let status = probe.status();
    MergeError::MemoryBudgetExceeded(format!(
        "allocated={} process_rss={:?} system_available={:?}",
        status.allocated_bytes, status.process_rss_bytes, status.system_available_bytes
    ))
}

fn check_emergency(probe: &dyn MemoryProbe) -> Result<(), MergeError> {
    match probe.pressure() {
        MemoryPressure::Emergency => Err(memory_exhausted(probe)),
        MemoryPressure::Critical => {
            probe.hint_release();
            Ok(())
        }
        _ => Ok(()),
    }
}

fn apply_pressure(probe: &dyn MemoryProbe, chunk_rows: usize) -> Result<usize, MergeError> {
    let next = match probe.pressure() {
        MemoryPressure::Normal => return Ok(chunk_rows),
        MemoryPressure::Warning => chunk_rows / 2,
        MemoryPressure::Critical => {
            probe.hint_release();
            chunk_rows / 4
        }
        MemoryPressure::Emergency => return Err(memory_exhausted(probe)),
    };
    let next = next.max(MIN_CHUNK_ROWS).min(chunk_rows);
    if next < chunk_rows {
        merge_log!(
            log::Level::Debug,
            "chunk_shrunk",
            "from={} to={}",
            chunk_rows,
            next
        );
    }
    Ok(next)
}

fn content_hash(source: &SourceTable, rows: &[u32]) -> String {
    let mut bytes = Vec::with_capacity(rows.len() * 16);
    if source.digests.is_empty() {
        for &row in rows {
            bytes.extend_from_slice(&row.to_le_bytes());
        }
    } else {
        for &row in rows {
            bytes.extend_from_slice(&source.digests[row as usize].to_le_bytes());
        }
    }
    format!("{:016x}", fxhash64_with_seed(NAME_SEED, &bytes))
}
