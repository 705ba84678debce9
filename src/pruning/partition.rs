//! Partition-value pruning.

use rustc_hash::FxHashSet;

use crate::metadata::FileDescriptor;
use crate::source::SourceTable;

/// The distinct partition-value tuples present in the source, in declared
/// column order.
pub(crate) fn distinct_source_partitions(source: &SourceTable) -> FxHashSet<Vec<String>> {
    source.partition_tokens.iter().cloned().collect()
}

/// Split files into those whose partition mapping appears in the source set
/// and those provably outside it (the foreign set).
///
/// A file with no usable mapping for the declared columns (flat layout, or
/// an unreadable footer) stays a candidate: absence of evidence is not
/// exclusion.
pub(crate) fn prune_by_partitions(
    descriptors: Vec<FileDescriptor>,
    partition_columns: &[String],
    source_partitions: &FxHashSet<Vec<String>>,
) -> (Vec<FileDescriptor>, Vec<FileDescriptor>) {
    if partition_columns.is_empty() {
        return (descriptors, Vec::new());
    }

    let mut candidates = Vec::new();
    let mut preserved = Vec::new();
    for descriptor in descriptors {
        if !descriptor.readable {
            candidates.push(descriptor);
            continue;
        }
        let tokens: Option<Vec<String>> = partition_columns
            .iter()
            .map(|column| {
                descriptor
                    .partition_value(column)
                    .map(|value| value.to_string())
            })
            .collect();
        match tokens {
            Some(tokens) if !source_partitions.contains(&tokens) => preserved.push(descriptor),
            _ => candidates.push(descriptor),
        }
    }
    (candidates, preserved)
}
