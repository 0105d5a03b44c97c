//! Error taxonomy shared by every component.

use std::path::PathBuf;

use thiserror::Error;

use crate::manifest::Manifest;
use crate::types::RepoState;

/// Errors returned by revstage operations.
#[derive(Error, Debug)]
pub enum VcsError {
    /// A required file or directory does not exist.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),
    /// The target of a create operation is already present.
    #[error("already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    /// Cloned tree does not match its source.
    #[error(
        "integrity mismatch: {source_files} source, {destination_files} destination, {} differing",
        mismatched.len()
    )]
    IntegrityMismatch {
        source_files: usize,
        destination_files: usize,
        mismatched: Vec<PathBuf>,
    },
    /// The log store could not be opened or written.
    #[error("log store unavailable at {}: {source}", path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    /// Access to the repository could not be granted or revoked.
    #[error("permission denied on {}: {reason}", path.display())]
    PermissionDenied { path: PathBuf, reason: String },
    /// A batch finished with mixed per-item outcomes.
    #[error("partial failure: {0}")]
    PartialFailure(Manifest),
    /// A project entry collides with the repository's own bookkeeping.
    #[error("project entry {} collides with a reserved repository name", .0.display())]
    ReservedPath(PathBuf),
    /// The operation is not valid in the repository's current state.
    #[error("repository is {actual}, expected {expected}")]
    InvalidState {
        expected: RepoState,
        actual: RepoState,
    },
    /// The watched directory went away while the monitor was armed.
    #[error("watch on {} lost: {reason}", path.display())]
    WatchLost { path: PathBuf, reason: String },
    /// The file watcher could not be created or attached.
    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),
    /// An underlying IO operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VcsError {
    /// The per-item manifest, when this error carries one.
    pub fn manifest(&self) -> Option<&Manifest> {
        match self {
            VcsError::PartialFailure(manifest) => Some(manifest),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, VcsError>;
