//! Merge orchestration.
//!
//! [`MergeEngine::merge`] drives the whole pipeline as a linear state
//! machine: `Planning → Validating → Rewriting → Promoting → Done`, with
//! `Failed` reachable from every non-terminal state. Failure before
//! promotion removes staging entirely; a partial promotion leaves staging in
//! place and surfaces the completed and pending rename sets.

pub(crate) mod rewrite;

use std::fmt;
use std::sync::Arc;

use arrow::array::RecordBatch;

use crate::{
    error::MergeError,
    fs::Fs,
    logging::merge_log,
    memory::{MemoryProbe, SystemProbe},
    metadata::{self, FileDescriptor},
    option::MergeOptions,
    path::DatasetPath,
    plan::{self, MergePlan},
    pruning, scan,
    source::SourceTable,
    staging::StagingArea,
    tracker::{KeyTracker, TrackerTier},
    validate,
};

use self::rewrite::{FileWriteReport, Progress, RewriteContext};

/// How source rows combine with target rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Add rows whose keys are absent from the target; rows with existing
    /// keys are discarded.
    Insert,
    /// Replace rows whose keys exist in the target; rows with new keys are
    /// discarded.
    Update,
    /// Replace existing keys and add new ones.
    Upsert,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::Insert => f.write_str("insert"),
            MergeStrategy::Update => f.write_str("update"),
            MergeStrategy::Upsert => f.write_str("upsert"),
        }
    }
}

/// What happened to one dataset file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOperation {
    /// Replaced in place by a staged rewrite.
    Rewritten,
    /// Newly created for source rows with fresh keys.
    Inserted,
    /// Untouched.
    Preserved,
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileOperation::Rewritten => f.write_str("rewritten"),
            FileOperation::Inserted => f.write_str("inserted"),
            FileOperation::Preserved => f.write_str("preserved"),
        }
    }
}

/// Per-file entry of a [`MergeResult`].
#[derive(Clone, Debug)]
pub struct FileReport {
    /// Final path of the file.
    pub path: DatasetPath,
    /// Rows in the file after the merge.
    pub rows: u64,
    /// What the merge did to it.
    pub operation: FileOperation,
    /// Byte size, where known.
    pub size_bytes: Option<u64>,
}

/// Which tracker tier ran, and how lossy it was.
#[derive(Clone, Copy, Debug)]
pub struct TrackerReport {
    /// Tier selected from the deduplicated source cardinality.
    pub tier: TrackerTier,
    /// Keys dropped by the evicting tier; always zero elsewhere.
    pub evictions: u64,
}

/// Outcome of a completed merge.
#[derive(Clone, Debug)]
pub struct MergeResult {
    /// Strategy that ran.
    pub strategy: MergeStrategy,
    /// Rows in the source batch, before deduplication.
    pub source_rows: u64,
    /// Target rows before the merge.
    pub target_rows_before: u64,
    /// Target rows after the merge.
    pub target_rows_after: u64,
    /// Source rows written with keys new to the target.
    pub inserted: u64,
    /// Target rows replaced by source rows.
    pub updated: u64,
    /// Always zero for `insert`/`update`/`upsert`.
    pub deleted: u64,
    /// Every dataset file with its operation, in path order.
    pub files: Vec<FileReport>,
    /// Tracker telemetry; absent when the merge never built one.
    pub tracker: Option<TrackerReport>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MergePhase {
    Planning,
    Validating,
    Rewriting,
    Promoting,
    Done,
    Failed,
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergePhase::Planning => "planning",
            MergePhase::Validating => "validating",
            MergePhase::Rewriting => "rewriting",
            MergePhase::Promoting => "promoting",
            MergePhase::Done => "done",
            MergePhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn transition(phase: &mut MergePhase, next: MergePhase) {
    merge_log!(
        log::Level::Debug,
        "phase_transition",
        "from={} to={}",
        phase,
        next
    );
    *phase = next;
}

/// Incremental merge engine over one filesystem collaborator.
///
/// The engine is stateless between merges; it owns nothing but the
/// collaborators. One dataset must only ever see a single writer at a time.
pub struct MergeEngine<F: Fs> {
    fs: F,
    probe: Option<Arc<dyn MemoryProbe>>,
}

impl<F: Fs> MergeEngine<F> {
    /// Build an engine over `fs`. The memory probe defaults to a
    /// [`SystemProbe`] configured from the per-merge options.
    pub fn new(fs: F) -> Self {
        Self { fs, probe: None }
    }

    /// Replace the memory probe.
    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// The filesystem collaborator.
    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Merge `source` into the dataset at `target_root`.
    ///
    /// `key_columns` identify rows; `partition_columns` (possibly empty)
    /// declare the Hive layout. On success the dataset reflects the merge
    /// atomically per file; on failure before promotion it is untouched.
    pub async fn merge(
        &self,
        source: Vec<RecordBatch>,
        target_root: &DatasetPath,
        strategy: MergeStrategy,
        key_columns: Vec<String>,
        partition_columns: Vec<String>,
        options: MergeOptions,
    ) -> Result<MergeResult, MergeError> {
        validate::check_request(strategy, &key_columns, &partition_columns, &options)?;

        let probe: Arc<dyn MemoryProbe> = match &self.probe {
            Some(probe) => Arc::clone(probe),
            None => Arc::new(SystemProbe::new(options.memory)),
        };
        let source_rows: usize = source.iter().map(|batch| batch.num_rows()).sum();
        merge_log!(
            log::Level::Info,
            "merge_start",
            "strategy={} root={} source_rows={}",
            strategy,
            target_root,
            source_rows
        );

        if source_rows == 0 {
            return self.empty_source_result(target_root, strategy, &key_columns, &options).await;
        }

        let source_table = SourceTable::try_new(source, &key_columns, &partition_columns)?;
        let cancel = options.cancel_token.clone();
        let cancel_ref = cancel.as_ref();

        let mut phase = MergePhase::Planning;

        // Planning: enumerate, analyze footers, prune, confirm.
        let all_descriptors = metadata::analyze_dataset(
            &self.fs,
            target_root,
            &key_columns,
            options.io_fanout,
        )
        .await?;
        if all_descriptors.is_empty() && strategy == MergeStrategy::Update {
            return Err(MergeError::InvalidArgument(
                "target dataset is empty; nothing to update".into(),
            ));
        }
        let target_rows_before: u64 = all_descriptors.iter().map(|d| d.rows).sum();

        let entries = plan::source_entries(&source_table);
        let index = plan::source_pos_index(&entries);

        let (merge_plan, matched, conflicts) = if key_columns.is_empty() {
            // Keyless insert is a plain append; every file is preserved.
            let merge_plan =
                plan::build_plan(strategy, Vec::new(), Vec::new(), all_descriptors.clone());
            (merge_plan, Default::default(), Vec::new())
        } else {
            let pruned = pruning::prune(
                all_descriptors.clone(),
                &source_table,
                &partition_columns,
                &key_columns,
            );
            // Short-circuiting forfeits the complete matched set and the
            // partition evidence, so it is only safe when neither is needed.
            let short_circuit =
                partition_columns.is_empty() && strategy != MergeStrategy::Insert;
            let scanned = scan::confirm_candidates(
                &self.fs,
                pruned.candidates,
                &source_table,
                &index,
                &partition_columns,
                options.merge_chunk_size_rows,
                short_circuit,
                options.io_fanout,
                cancel_ref,
            )
            .await?;
            // Files outside every source partition cannot legitimately hold
            // a source key; a hit there is a partition move. The first match
            // per file is enough evidence.
            let mut conflicts = scanned.conflicts;
            let mut preserved = pruned.preserved;
            if !pruned.foreign.is_empty() {
                let foreign = scan::confirm_candidates(
                    &self.fs,
                    pruned.foreign,
                    &source_table,
                    &index,
                    &partition_columns,
                    options.merge_chunk_size_rows,
                    true,
                    options.io_fanout,
                    cancel_ref,
                )
                .await?;
                conflicts.extend(foreign.conflicts);
                preserved.extend(foreign.affected);
                preserved.extend(foreign.preserved);
            }
            let merge_plan =
                plan::build_plan(strategy, scanned.affected, scanned.preserved, preserved);
            (merge_plan, scanned.matched, conflicts)
        };

        transition(&mut phase, MergePhase::Validating);
        for descriptor in &all_descriptors {
            validate::check_schema(
                &source_table,
                descriptor,
                &partition_columns,
                &key_columns,
                options.materialize_partition_columns,
            )?;
        }
        validate::check_partition_conflicts(&conflicts)?;

        transition(&mut phase, MergePhase::Rewriting);
        if let Some(token) = cancel_ref {
            if token.is_cancelled() {
                return Err(MergeError::Cancelled);
            }
        }

        let mut tracker = KeyTracker::build(&entries, &options.tracker);
        if strategy == MergeStrategy::Insert {
            // Matched keys already exist in the target; their source rows
            // are spoken for and must not be written.
            for digest in &matched {
                if let Some(&pos) = index.get(digest) {
                    tracker.mark_applied(pos);
                }
            }
        }

        let estimated_new = match strategy {
            MergeStrategy::Update => 0,
            _ => source_table.dedup_rows.len().saturating_sub(matched.len()),
        };
        let mut progress = Progress::new(
            options.progress_callback.clone(),
            merge_plan.affected_rows + estimated_new as u64,
        );

        let mut staging = StagingArea::new(target_root);
        let ctx = RewriteContext {
            fs: &self.fs,
            root: target_root,
            source: &source_table,
            strategy,
            partition_columns: &partition_columns,
            options: &options,
            probe: probe.as_ref(),
            cancel: cancel_ref,
        };

        let totals = match run_rewrites(
            &ctx,
            &merge_plan,
            &all_descriptors,
            &mut tracker,
            &mut staging,
            &mut progress,
        )
        .await
        {
            Ok(totals) => totals,
            Err(err) => {
                transition(&mut phase, MergePhase::Failed);
                staging.cleanup(&self.fs).await;
                return Err(err);
            }
        };

        if let Some(token) = cancel_ref {
            if token.is_cancelled() {
                transition(&mut phase, MergePhase::Failed);
                staging.cleanup(&self.fs).await;
                return Err(MergeError::Cancelled);
            }
        }

        transition(&mut phase, MergePhase::Promoting);
        if let Err(err) = staging.promote(&self.fs).await {
            // A partial promotion keeps staging for reconciliation; promote
            // itself already left it in place.
            transition(&mut phase, MergePhase::Failed);
            return Err(err);
        }

        transition(&mut phase, MergePhase::Done);
        progress.finish();

        let rewrite_output_rows: u64 = totals.rewritten.iter().map(|report| report.rows).sum();
        let target_rows_after =
            target_rows_before - merge_plan.affected_rows + rewrite_output_rows + totals.inserted;

        let mut files = Vec::with_capacity(
            totals.rewritten.len() + totals.inserted_files.len() + merge_plan.preserved.len(),
        );
        files.extend(totals.rewritten.into_iter().map(|report| FileReport {
            path: report.target,
            rows: report.rows,
            operation: FileOperation::Rewritten,
            size_bytes: Some(report.bytes),
        }));
        files.extend(totals.inserted_files.into_iter().map(|report| FileReport {
            path: report.target,
            rows: report.rows,
            operation: FileOperation::Inserted,
            size_bytes: Some(report.bytes),
        }));
        files.extend(merge_plan.preserved.iter().map(preserved_report));
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let result = MergeResult {
            strategy,
            source_rows: source_rows as u64,
            target_rows_before,
            target_rows_after,
            inserted: totals.inserted,
            updated: totals.updated,
            deleted: 0,
            files,
            tracker: Some(TrackerReport {
                tier: tracker.tier(),
                evictions: tracker.evictions(),
            }),
        };
        merge_log!(
            log::Level::Info,
            "merge_done",
            "strategy={} inserted={} updated={} before={} after={}",
            strategy,
            result.inserted,
            result.updated,
            result.target_rows_before,
            result.target_rows_after
        );
        Ok(result)
    }

    async fn empty_source_result(
        &self,
        target_root: &DatasetPath,
        strategy: MergeStrategy,
        key_columns: &[String],
        options: &MergeOptions,
    ) -> Result<MergeResult, MergeError> {
        let descriptors =
            metadata::analyze_dataset(&self.fs, target_root, key_columns, options.io_fanout)
                .await?;
        let target_rows: u64 = descriptors.iter().map(|d| d.rows).sum();
        if let Some(callback) = &options.progress_callback {
            callback(0, 0);
        }
        Ok(MergeResult {
            strategy,
            source_rows: 0,
            target_rows_before: target_rows,
            target_rows_after: target_rows,
            inserted: 0,
            updated: 0,
            deleted: 0,
            files: descriptors.iter().map(preserved_report).collect(),
            tracker: None,
        })
    }
}

fn preserved_report(descriptor: &FileDescriptor) -> FileReport {
    FileReport {
        path: descriptor.path.clone(),
        rows: descriptor.rows,
        operation: FileOperation::Preserved,
        size_bytes: descriptor.size_bytes,
    }
}

struct RewriteTotals {
    rewritten: Vec<FileWriteReport>,
    inserted_files: Vec<FileWriteReport>,
    updated: u64,
    inserted: u64,
}

async fn run_rewrites<F: Fs>(
    ctx: &RewriteContext<'_, F>,
    merge_plan: &MergePlan,
    all_descriptors: &[FileDescriptor],
    tracker: &mut KeyTracker,
    staging: &mut StagingArea,
    progress: &mut Progress,
) -> Result<RewriteTotals, MergeError> {
    let (rewritten, updated) =
        rewrite::rewrite_affected(ctx, &merge_plan.affected, tracker, staging, progress).await?;

    let dedup_len = ctx.source.dedup_rows.len() as u32;
    let unapplied: Vec<u32> = if ctx.source.digests.is_empty() {
        (0..dedup_len).collect()
    } else {
        (0..dedup_len).filter(|&pos| !tracker.is_applied(pos)).collect()
    };

    let (inserted_files, inserted) = match ctx.strategy {
        MergeStrategy::Update => {
            if !unapplied.is_empty() {
                merge_log!(
                    log::Level::Debug,
                    "rows_discarded",
                    "strategy=update rows={}",
                    unapplied.len()
                );
            }
            (Vec::new(), 0)
        }
        MergeStrategy::Insert | MergeStrategy::Upsert => {
            progress.set_total(merge_plan.affected_rows + unapplied.len() as u64);
            rewrite::write_new_files(ctx, &unapplied, all_descriptors, staging, progress).await?
        }
    };

    Ok(RewriteTotals {
        rewritten,
        inserted_files,
        updated,
        inserted,
    })
}
