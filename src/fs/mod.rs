//! Filesystem collaborator.
//!
//! The engine consumes storage through this narrow interface: enumerate,
//! read, write, rename, remove. Rename may be realized as copy+delete by an
//! implementation, as long as the copy completes before the delete.

pub mod tokio_fs;

pub use tokio_fs::TokioFs;

use std::{future::Future, io};

use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

use crate::path::DatasetPath;

/// Byte-stream handle returned by [`Fs::open_read`] and [`Fs::open_write`].
///
/// The bounds line up with what the async Parquet reader and writer require,
/// so a handle can be passed to either without adaptation.
pub trait FsFile: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static {}

impl<T> FsFile for T where T: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static {}

/// One entry of a dataset listing.
#[derive(Clone, Debug)]
pub struct FileMeta {
    /// Full path of the file.
    pub path: DatasetPath,
    /// Byte size, when the store reports one.
    pub size: Option<u64>,
}

/// The storage operations the engine needs.
///
/// Exactly one production implementation exists per deployment; the engine
/// never branches on the backend.
pub trait Fs: Send + Sync {
    /// Concrete byte-stream handle.
    type File: FsFile;

    /// Recursively enumerate files under `path`.
    ///
    /// A missing directory is an empty listing, not an error: a merge into a
    /// dataset that does not exist yet starts from zero files.
    fn list(&self, path: &DatasetPath) -> impl Future<Output = io::Result<Vec<FileMeta>>> + Send;

    /// Open `path` for reading.
    fn open_read(&self, path: &DatasetPath) -> impl Future<Output = io::Result<Self::File>> + Send;

    /// Open `path` for writing, creating parent directories on demand.
    fn open_write(&self, path: &DatasetPath)
        -> impl Future<Output = io::Result<Self::File>> + Send;

    /// Move `src` to `dst`, replacing `dst` when it exists. Parent
    /// directories of `dst` are created on demand.
    fn rename(
        &self,
        src: &DatasetPath,
        dst: &DatasetPath,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Remove a single file.
    fn remove(&self, path: &DatasetPath) -> impl Future<Output = io::Result<()>> + Send;

    /// Remove a directory and everything under it.
    fn remove_tree(&self, path: &DatasetPath) -> impl Future<Output = io::Result<()>> + Send;
}
