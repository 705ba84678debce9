//! Staging and promotion.
//!
//! Every output of a merge is written under `<root>/.staging-<ulid>/` and
//! becomes visible only through promotion: first each rewrite output
//! replaces its original file, then new files move into their partition
//! directories, then the staging directory is dropped. A target file is
//! never deleted before its replacement exists; the rename either swaps the
//! pair or fails with the original intact.
//!
//! Promotion keeps going past an individual failure so that as much of the
//! merge as possible lands, then surfaces the completed and pending sets in
//! a [`PartialPromotionError`]. Staging is left in place in that case so an
//! operator can finish the job by hand.

use ulid::Ulid;

use crate::{
    error::{MergeError, PartialPromotionError},
    fs::Fs,
    logging::merge_log,
    path::DatasetPath,
};

/// One staged output and the location it promotes to.
#[derive(Clone, Debug)]
pub(crate) struct RenameOp {
    pub staging: DatasetPath,
    pub target: DatasetPath,
}

/// The in-flight output set of one merge.
pub(crate) struct StagingArea {
    dir: DatasetPath,
    rewrites: Vec<RenameOp>,
    new_files: Vec<RenameOp>,
}

impl StagingArea {
    pub(crate) fn new(root: &DatasetPath) -> Self {
        Self {
            dir: root.child(format!(".staging-{}", Ulid::new())),
            rewrites: Vec::new(),
            new_files: Vec::new(),
        }
    }

    pub(crate) fn dir(&self) -> &DatasetPath {
        &self.dir
    }

    /// Staging location for the `index`-th rewrite output.
    ///
    /// Rewrites live flat in the staging root; the mapping back to the path
    /// they replace is carried by the recorded op, not the layout.
    pub(crate) fn rewrite_slot(&self, index: usize) -> DatasetPath {
        self.dir.child(format!("rewrite-{index:05}.parquet"))
    }

    /// Staging location for a new file at `relative` below the dataset root.
    /// New files mirror their final layout inside staging.
    pub(crate) fn new_file_slot(&self, relative: &str) -> DatasetPath {
        self.dir.child(relative)
    }

    pub(crate) fn record_rewrite(&mut self, staging: DatasetPath, target: DatasetPath) {
        self.rewrites.push(RenameOp { staging, target });
    }

    pub(crate) fn record_new_file(&mut self, staging: DatasetPath, target: DatasetPath) {
        self.new_files.push(RenameOp { staging, target });
    }

    /// Swap the staged outputs into place.
    pub(crate) async fn promote<F: Fs>(self, fs: &F) -> Result<(), MergeError> {
        let mut completed = Vec::new();
        let mut pending = Vec::new();
        let mut first_error: Option<std::io::Error> = None;

        for op in self.rewrites.into_iter().chain(self.new_files) {
            match fs.rename(&op.staging, &op.target).await {
                Ok(()) => {
                    merge_log!(
                        log::Level::Debug,
                        "promoted",
                        "staging={} target={}",
                        op.staging,
                        op.target
                    );
                    completed.push((op.staging, op.target));
                }
                Err(err) => {
                    merge_log!(
                        log::Level::Error,
                        "promotion_failed",
                        "staging={} target={} error={}",
                        op.staging,
                        op.target,
                        err
                    );
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    pending.push((op.staging, op.target));
                }
            }
        }

        if let Some(source) = first_error {
            return Err(MergeError::PartialPromotion(PartialPromotionError {
                completed,
                pending,
                staging: self.dir,
                source,
            }));
        }

        if let Err(err) = fs.remove_tree(&self.dir).await {
            merge_log!(
                log::Level::Warn,
                "staging_cleanup_failed",
                "dir={} error={}",
                self.dir,
                err
            );
        }
        Ok(())
    }

    /// Best-effort removal after a failed or cancelled merge.
    pub(crate) async fn cleanup<F: Fs>(&self, fs: &F) {
        if let Err(err) = fs.remove_tree(&self.dir).await {
            merge_log!(
                log::Level::Warn,
                "staging_cleanup_failed",
                "dir={} error={}",
                self.dir,
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::fs::TokioFs;

    async fn stage_file(path: &DatasetPath, contents: &[u8]) {
        let local = path.to_local().unwrap();
        tokio::fs::create_dir_all(local.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(local, contents).await.unwrap();
    }

    #[tokio::test]
    async fn promotion_replaces_and_moves_then_drops_staging() {
        let dir = TempDir::new().unwrap();
        let root = DatasetPath::from(dir.path());
        let fs = TokioFs;

        tokio::fs::write(dir.path().join("old.parquet"), b"old")
            .await
            .unwrap();

        let mut staging = StagingArea::new(&root);
        let rewrite = staging.rewrite_slot(0);
        stage_file(&rewrite, b"rewritten").await;
        staging.record_rewrite(rewrite, root.child("old.parquet"));

        let fresh = staging.new_file_slot("day=2024-01-01/part-00000-aa.parquet");
        stage_file(&fresh, b"fresh").await;
        staging.record_new_file(
            fresh,
            root.child("day=2024-01-01").child("part-00000-aa.parquet"),
        );

        let staging_dir = staging.dir().clone();
        staging.promote(&fs).await.unwrap();

        assert_eq!(
            tokio::fs::read(dir.path().join("old.parquet")).await.unwrap(),
            b"rewritten"
        );
        assert_eq!(
            tokio::fs::read(dir.path().join("day=2024-01-01/part-00000-aa.parquet"))
                .await
                .unwrap(),
            b"fresh"
        );
        assert!(!staging_dir.to_local().unwrap().exists());
    }

    #[tokio::test]
    async fn partial_promotion_reports_completed_and_pending() {
        let dir = TempDir::new().unwrap();
        let root = DatasetPath::from(dir.path());
        let fs = TokioFs;

        // A plain file where a directory is needed makes the second rename
        // fail while the first succeeds.
        tokio::fs::write(dir.path().join("blocker"), b"x").await.unwrap();

        let mut staging = StagingArea::new(&root);
        let first = staging.rewrite_slot(0);
        stage_file(&first, b"one").await;
        staging.record_rewrite(first, root.child("a.parquet"));

        let second = staging.rewrite_slot(1);
        stage_file(&second, b"two").await;
        staging.record_rewrite(second, root.child("blocker").child("b.parquet"));

        let staging_dir = staging.dir().clone();
        let err = staging.promote(&fs).await.unwrap_err();
        let MergeError::PartialPromotion(partial) = err else {
            panic!("expected partial promotion");
        };
        assert_eq!(partial.completed.len(), 1);
        assert_eq!(partial.pending.len(), 1);
        assert_eq!(partial.staging, staging_dir);
        // The completed rename landed, staging survives for reconciliation.
        assert_eq!(
            tokio::fs::read(dir.path().join("a.parquet")).await.unwrap(),
            b"one"
        );
        assert!(staging_dir.to_local().unwrap().exists());
    }
}
