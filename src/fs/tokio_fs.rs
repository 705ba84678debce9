//! Local-filesystem implementation over `tokio::fs`.

use std::{io, path::PathBuf};

use crate::{
    fs::{FileMeta, Fs},
    path::DatasetPath,
};

/// Filesystem collaborator backed by the local disk.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioFs;

impl TokioFs {
    fn resolve(path: &DatasetPath) -> io::Result<PathBuf> {
        path.to_local().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("`{path}` has no local filesystem form"),
            )
        })
    }

    async fn ensure_parent(local: &std::path::Path) -> io::Result<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

impl Fs for TokioFs {
    type File = tokio::fs::File;

    async fn list(&self, path: &DatasetPath) -> io::Result<Vec<FileMeta>> {
        let root = Self::resolve(path)?;
        let mut pending = vec![root];
        let mut out = Vec::new();
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else {
                    out.push(FileMeta {
                        path: DatasetPath::from(entry.path().as_path()),
                        size: Some(meta.len()),
                    });
                }
            }
        }
        Ok(out)
    }

    async fn open_read(&self, path: &DatasetPath) -> io::Result<Self::File> {
        let local = Self::resolve(path)?;
        tokio::fs::File::open(local).await
    }

    async fn open_write(&self, path: &DatasetPath) -> io::Result<Self::File> {
        let local = Self::resolve(path)?;
        Self::ensure_parent(&local).await?;
        tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(local)
            .await
    }

    async fn rename(&self, src: &DatasetPath, dst: &DatasetPath) -> io::Result<()> {
        let src = Self::resolve(src)?;
        let dst = Self::resolve(dst)?;
        Self::ensure_parent(&dst).await?;
        tokio::fs::rename(src, dst).await
    }

    async fn remove(&self, path: &DatasetPath) -> io::Result<()> {
        let local = Self::resolve(path)?;
        tokio::fs::remove_file(local).await
    }

    async fn remove_tree(&self, path: &DatasetPath) -> io::Result<()> {
        let local = Self::resolve(path)?;
        match tokio::fs::remove_dir_all(local).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
