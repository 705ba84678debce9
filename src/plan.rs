//! Rewrite planning.
//!
//! The plan partitions the dataset's files into the set that will be
//! rewritten and the set left untouched, and fixes the tracker entries for
//! the deduplicated source. Row routing is finalized during rewrite via the
//! tracker's applied bitmap, because a short-circuited confirmation scan
//! intentionally under-reports matches.

use rustc_hash::FxHashMap;

use crate::{
    merge::MergeStrategy,
    metadata::FileDescriptor,
    source::SourceTable,
};

/// `(digest, position)` pairs for the deduplicated source, position being an
/// index into [`SourceTable::dedup_rows`].
pub(crate) fn source_entries(source: &SourceTable) -> Vec<(u128, u32)> {
    if source.digests.is_empty() {
        return Vec::new();
    }
    source
        .dedup_rows
        .iter()
        .enumerate()
        .map(|(pos, &row)| (source.digests[row as usize], pos as u32))
        .collect()
}

/// Digest → deduplicated position.
pub(crate) fn source_pos_index(entries: &[(u128, u32)]) -> FxHashMap<u128, u32> {
    entries.iter().copied().collect()
}

/// The file-level outcome of planning.
pub(crate) struct MergePlan {
    /// Files to rewrite, in path order.
    pub affected: Vec<FileDescriptor>,
    /// Files left untouched, in path order.
    pub preserved: Vec<FileDescriptor>,
    /// Total input rows across `affected`.
    pub affected_rows: u64,
}

/// Combine pruning and confirmation results into the final file partition.
///
/// `insert` never rewrites: files holding matched keys keep their rows, and
/// the matched source rows are simply discarded. For `update` and `upsert`
/// every confirmed file is rewritten in place.
pub(crate) fn build_plan(
    strategy: MergeStrategy,
    scan_affected: Vec<FileDescriptor>,
    scan_preserved: Vec<FileDescriptor>,
    prune_preserved: Vec<FileDescriptor>,
) -> MergePlan {
    let mut preserved = prune_preserved;
    preserved.extend(scan_preserved);

    let affected = match strategy {
        MergeStrategy::Insert => {
            preserved.extend(scan_affected);
            Vec::new()
        }
        MergeStrategy::Update | MergeStrategy::Upsert => scan_affected,
    };

    let mut preserved = preserved;
    preserved.sort_by(|a, b| a.path.cmp(&b.path));
    let affected_rows = affected.iter().map(|descriptor| descriptor.rows).sum();

    MergePlan {
        affected,
        preserved,
        affected_rows,
    }
}
