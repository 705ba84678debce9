//! Candidate-file selection.
//!
//! Two conservative passes narrow the dataset before any row data is read.
//! Statistics go first: a min/max disjointness proof on any key column
//! excludes a file outright. The partition pass then splits the survivors
//! into files inside the source's partitions (real rewrite candidates) and
//! files outside them. Partitions are immutable per key, so the outside
//! files cannot legitimately hold a source key; they still have to be
//! scanned for key presence, because a hit there is exactly what a
//! partition move looks like. Skipping them would turn an invariant
//! violation into silent row duplication.

pub(crate) mod partition;
pub(crate) mod statistics;

use crate::logging::merge_log;
use crate::metadata::FileDescriptor;
use crate::source::SourceTable;

/// How each dataset file enters the confirmation scan.
pub(crate) struct PruneOutcome {
    /// Files that may hold source keys in their declared partitions.
    pub candidates: Vec<FileDescriptor>,
    /// Stats-surviving files outside every source partition. Never
    /// rewritten; scanned only to surface partition moves.
    pub foreign: Vec<FileDescriptor>,
    /// Files proven to hold no source key.
    pub preserved: Vec<FileDescriptor>,
}

/// Run both pruning passes.
pub(crate) fn prune(
    descriptors: Vec<FileDescriptor>,
    source: &SourceTable,
    partition_columns: &[String],
    key_columns: &[String],
) -> PruneOutcome {
    let total = descriptors.len();

    let ranges = statistics::source_key_ranges(source, key_columns);
    let (survivors, preserved) = statistics::prune_by_statistics(descriptors, &ranges);
    let after_stats = survivors.len();

    let source_partitions = partition::distinct_source_partitions(source);
    let (candidates, foreign) =
        partition::prune_by_partitions(survivors, partition_columns, &source_partitions);

    merge_log!(
        log::Level::Debug,
        "pruning_done",
        "files={} after_stats={} candidates={} foreign={}",
        total,
        after_stats,
        candidates.len(),
        foreign.len()
    );

    PruneOutcome {
        candidates,
        foreign,
        preserved,
    }
}
