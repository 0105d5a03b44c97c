//! Repository manager
//!
//! Owns the mapping between a project (working) directory and its local
//! repository directory. The repository layout is:
//!
//! ```text
//! <repository>/
//! ├── #stage/            # hidden staging directory, files named by tick
//! ├── vcsdb.sqlite3      # log store (stagingLog, activityRecordLog)
//! ├── vcs.lock           # lease file (lease access backend only)
//! └── ...                # cloned project tree
//! ```
//!
//! `#stage` is hidden by name only: no platform hidden attribute is set, so
//! directory listings that show every entry will show it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{AccessBackend, Config};
use crate::error::{Result, VcsError};
use crate::fsops::{
    AccessControl, ContentFingerprint, FileStore, LEASE_FILE, LeaseAccess, LocalFileStore,
    PermissionAccess, Sha256Fingerprint, digest_hex,
};
use crate::manifest::{BatchGuard, CancelToken, Manifest, ManifestItem, Outcome};
use crate::store::{DB_FILE, LogStore};
use crate::types::{AccessState, RepoState};

/// Hidden staging directory name inside the repository.
pub const STAGE_DIR: &str = "#stage";

/// Describes one project/repository pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    pub name: String,
    pub description: String,
    pub project_directory: PathBuf,
    pub local_repository_directory: PathBuf,
}

impl RepositoryDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        project_directory: impl Into<PathBuf>,
        local_repository_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            project_directory: project_directory.into(),
            local_repository_directory: local_repository_directory.into(),
        }
    }
}

/// Paths inside a local repository directory.
#[derive(Debug, Clone)]
pub struct RepoPaths {
    root: PathBuf,
}

impl RepoPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the repository root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the staging directory: `{root}/#stage`
    pub fn stage_dir(&self) -> PathBuf {
        self.root.join(STAGE_DIR)
    }

    /// Returns the log store path: `{root}/vcsdb.sqlite3`
    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    /// Returns a staged snapshot path: `{root}/#stage/{tick}`
    pub fn staged_file(&self, tick: i64) -> PathBuf {
        self.stage_dir().join(tick.to_string())
    }

    /// Whether a top-level entry belongs to the repository itself rather than
    /// the cloned project tree.
    pub fn is_reserved(&self, path: &Path) -> bool {
        path.strip_prefix(&self.root)
            .is_ok_and(is_reserved_name)
    }
}

/// Whether a path relative to the repository root names repository
/// bookkeeping (`#stage`, the log store, the lease file).
pub fn is_reserved_name(rel: &Path) -> bool {
    let Some(first) = rel.components().next() else {
        return false;
    };
    let name = first.as_os_str().to_string_lossy();
    name == STAGE_DIR || name == LEASE_FILE || name.starts_with(DB_FILE)
}

/// Options for cloning the project tree into the repository.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloneOptions {
    /// Replace existing destination files and accept existing directories.
    /// Applied identically at every level of the tree.
    pub overwrite: bool,
    pub check_integrity: bool,
}

/// Planned clone: every directory and file to create, parents first.
#[derive(Debug, Clone, Default)]
pub struct ClonePlan {
    pub directories: Vec<(PathBuf, PathBuf)>,
    pub files: Vec<(PathBuf, PathBuf)>,
}

/// Result of comparing the project tree with the repository copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub source_files: usize,
    pub destination_files: usize,
    /// Relative paths whose digests differ or that are missing on one side.
    pub mismatched: Vec<PathBuf>,
}

impl Verification {
    pub fn is_match(&self) -> bool {
        self.source_files == self.destination_files && self.mismatched.is_empty()
    }

    fn into_error(self) -> VcsError {
        VcsError::IntegrityMismatch {
            source_files: self.source_files,
            destination_files: self.destination_files,
            mismatched: self.mismatched,
        }
    }
}

/// A completed clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneReport {
    pub manifest: Manifest,
    pub verification: Option<Verification>,
}

/// Owns a project/repository pair and its open/closed state.
pub struct RepositoryManager {
    descriptor: RepositoryDescriptor,
    paths: RepoPaths,
    config: Config,
    files: Arc<dyn FileStore>,
    fingerprint: Arc<dyn ContentFingerprint>,
    access: Arc<dyn AccessControl>,
    state: Mutex<RepoState>,
}

impl RepositoryManager {
    /// Create a manager with the local filesystem collaborators.
    ///
    /// Fails with `NotFound` if the project directory does not exist. An
    /// existing repository directory is picked up in the `Closed` state.
    pub fn new(descriptor: RepositoryDescriptor, config: Config) -> Result<Self> {
        let access: Arc<dyn AccessControl> = match config.access {
            AccessBackend::Lease => Arc::new(LeaseAccess::new(config.lock_timeout)),
            AccessBackend::Permissions => Arc::new(PermissionAccess),
        };
        Self::with_collaborators(
            descriptor,
            config,
            Arc::new(LocalFileStore),
            Arc::new(Sha256Fingerprint),
            access,
        )
    }

    pub fn with_collaborators(
        descriptor: RepositoryDescriptor,
        config: Config,
        files: Arc<dyn FileStore>,
        fingerprint: Arc<dyn ContentFingerprint>,
        access: Arc<dyn AccessControl>,
    ) -> Result<Self> {
        if !descriptor.project_directory.is_dir() {
            return Err(VcsError::NotFound(descriptor.project_directory.clone()));
        }
        let paths = RepoPaths::new(descriptor.local_repository_directory.clone());
        let state = if files.exists(paths.root()) {
            RepoState::Closed
        } else {
            RepoState::Uninitialized
        };
        Ok(Self {
            descriptor,
            paths,
            config,
            files,
            fingerprint,
            access,
            state: Mutex::new(state),
        })
    }

    pub fn descriptor(&self) -> &RepositoryDescriptor {
        &self.descriptor
    }

    pub fn paths(&self) -> &RepoPaths {
        &self.paths
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn file_store(&self) -> Arc<dyn FileStore> {
        Arc::clone(&self.files)
    }

    pub fn state(&self) -> RepoState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Access state as reported by the backend.
    pub fn access_state(&self) -> Result<AccessState> {
        Ok(self
            .access
            .state(&self.config.identity.qualified(), self.paths.root())?)
    }

    /// Open the repository's log store, creating the database file if needed.
    pub fn log_store(&self) -> Result<Arc<LogStore>> {
        let store = LogStore::open(&self.paths.db_path(), self.config.store_timeout)?;
        Ok(Arc::new(store))
    }

    /// Create the repository directory and its staging directory, leaving the
    /// repository closed.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let root = self.paths.root();
        if self.files.exists(root) {
            return Err(VcsError::AlreadyExists(root.to_path_buf()));
        }

        self.files.create_directory(root)?;
        self.files.create_directory(&self.paths.stage_dir())?;
        self.access
            .deny_full(&self.config.identity.qualified(), root)
            .map_err(|e| self.permission_denied(e))?;

        *state = RepoState::Closed;
        log::info!(
            "initialized repository '{}' at {}",
            self.descriptor.name,
            root.display()
        );
        Ok(())
    }

    /// Grant the current principal full access. Not reentrant.
    pub fn open(&self) -> Result<()> {
        self.transition(RepoState::Closed, RepoState::Opened, |access, principal, root| {
            access.grant_full(principal, root)
        })
    }

    /// Revoke the access granted by `open`.
    pub fn close(&self) -> Result<()> {
        self.transition(RepoState::Opened, RepoState::Closed, |access, principal, root| {
            access.deny_full(principal, root)
        })
    }

    /// The state only changes after the backend call succeeded.
    fn transition<F>(&self, from: RepoState, to: RepoState, apply: F) -> Result<()>
    where
        F: FnOnce(&dyn AccessControl, &str, &Path) -> std::io::Result<()>,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(VcsError::InvalidState {
                expected: from,
                actual: *state,
            });
        }
        apply(
            self.access.as_ref(),
            &self.config.identity.qualified(),
            self.paths.root(),
        )
        .map_err(|e| self.permission_denied(e))?;
        *state = to;
        log::info!("repository '{}' {}", self.descriptor.name, to);
        Ok(())
    }

    fn permission_denied(&self, err: std::io::Error) -> VcsError {
        VcsError::PermissionDenied {
            path: self.paths.root().to_path_buf(),
            reason: err.to_string(),
        }
    }

    /// List what a clone would create.
    ///
    /// Fails with `ReservedPath` if a top-level project entry would land on
    /// repository bookkeeping.
    pub fn plan_clone(&self) -> Result<ClonePlan> {
        let source_root = &self.descriptor.project_directory;
        let entries = self.files.traverse(source_root, true).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VcsError::NotFound(source_root.clone())
            } else {
                VcsError::Io(e)
            }
        })?;

        let mut plan = ClonePlan::default();
        for source in entries {
            let Ok(rel) = source.strip_prefix(source_root) else {
                continue;
            };
            if is_reserved_name(rel) {
                return Err(VcsError::ReservedPath(source.clone()));
            }
            let destination = self.paths.root().join(rel);
            if source.is_dir() {
                plan.directories.push((source, destination));
            } else {
                plan.files.push((source, destination));
            }
        }
        Ok(plan)
    }

    /// Copy the project tree into the repository. Requires `Opened`.
    pub fn clone_project(&self, options: CloneOptions) -> Result<CloneReport> {
        self.clone_with_cancel(options, &CancelToken::new())
    }

    pub fn clone_with_cancel(
        &self,
        options: CloneOptions,
        cancel: &CancelToken,
    ) -> Result<CloneReport> {
        let plan = self.plan_clone()?;
        self.commit_clone(plan, options, cancel)
    }

    /// Execute a clone plan.
    ///
    /// Not atomic: a failed or mismatched clone leaves already copied files in
    /// place. With `check_integrity`, any verification mismatch is reported as
    /// `IntegrityMismatch`; otherwise per-item failures surface as
    /// `PartialFailure`.
    pub fn commit_clone(
        &self,
        plan: ClonePlan,
        options: CloneOptions,
        cancel: &CancelToken,
    ) -> Result<CloneReport> {
        let state = self.state();
        if state != RepoState::Opened {
            return Err(VcsError::InvalidState {
                expected: RepoState::Opened,
                actual: state,
            });
        }

        let guard = BatchGuard::new(cancel.clone(), self.config.batch_timeout);
        let mut manifest = Manifest::new();
        let mut failed_dirs: HashSet<PathBuf> = HashSet::new();

        // Directories are created serially so parents always exist first.
        for (source, destination) in &plan.directories {
            let outcome = if guard.should_stop() {
                Outcome::Skipped
            } else if failed_dirs.iter().any(|d| destination.starts_with(d)) {
                Outcome::Failed("parent directory was not created".to_string())
            } else {
                self.create_clone_dir(destination, options.overwrite)
            };
            if !outcome.is_success() {
                failed_dirs.insert(destination.clone());
            }
            manifest.push(ManifestItem {
                source: source.clone(),
                destination: Some(destination.clone()),
                outcome,
            });
        }

        let copy = |(source, destination): &(PathBuf, PathBuf)| -> ManifestItem {
            let outcome = if guard.should_stop() {
                Outcome::Skipped
            } else {
                match self.files.copy(source, destination, options.overwrite) {
                    Ok(()) => {
                        log::debug!("cloned {}", destination.display());
                        Outcome::Success
                    }
                    Err(e) => {
                        log::warn!("failed to clone {}: {}", source.display(), e);
                        Outcome::Failed(e.to_string())
                    }
                }
            };
            ManifestItem {
                source: source.clone(),
                destination: Some(destination.clone()),
                outcome,
            }
        };
        let copied = run_parallel(self.config.copy_threads, || {
            plan.files.par_iter().map(copy).collect::<Vec<_>>()
        });
        manifest.extend(copied);

        log::info!(
            "clone of '{}' finished: {}",
            self.descriptor.name,
            manifest
        );

        if options.check_integrity {
            let verification = self.verify()?;
            if !verification.is_match() {
                log::warn!(
                    "clone of '{}' failed verification: {} differing",
                    self.descriptor.name,
                    verification.mismatched.len()
                );
                return Err(verification.into_error());
            }
            if !manifest.is_complete() {
                return Err(VcsError::PartialFailure(manifest));
            }
            return Ok(CloneReport {
                manifest,
                verification: Some(verification),
            });
        }

        if !manifest.is_complete() {
            return Err(VcsError::PartialFailure(manifest));
        }
        Ok(CloneReport {
            manifest,
            verification: None,
        })
    }

    fn create_clone_dir(&self, destination: &Path, overwrite: bool) -> Outcome {
        match self.files.create_directory(destination) {
            Ok(()) => Outcome::Success,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && overwrite => {
                Outcome::Success
            }
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    /// Compare every project file with its repository counterpart.
    ///
    /// Counts files on both sides (repository bookkeeping excluded) and
    /// compares digests pairwise.
    pub fn verify(&self) -> Result<Verification> {
        let source_root = &self.descriptor.project_directory;
        let sources: Vec<PathBuf> = self
            .files
            .traverse(source_root, false)?
            .into_iter()
            .filter(|p| !p.strip_prefix(source_root).is_ok_and(is_reserved_name))
            .collect();
        let destinations: Vec<PathBuf> = self
            .files
            .traverse(self.paths.root(), false)?
            .into_iter()
            .filter(|p| !self.paths.is_reserved(p))
            .collect();

        let fingerprint = Arc::clone(&self.fingerprint);
        let root = self.paths.root().to_path_buf();
        let compare = |source: &PathBuf| -> Option<PathBuf> {
            let rel = source.strip_prefix(source_root).ok()?.to_path_buf();
            let destination = root.join(&rel);
            let same = match (fingerprint.digest(source), fingerprint.digest(&destination)) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            };
            if same {
                return None;
            }
            log::debug!(
                "{} differs (source digest {})",
                rel.display(),
                digest_hex(fingerprint.as_ref(), source).unwrap_or_else(|_| "-".to_string())
            );
            Some(rel)
        };
        let mut mismatched = run_parallel(self.config.copy_threads, || {
            sources.par_iter().filter_map(compare).collect::<Vec<_>>()
        });
        mismatched.sort();

        Ok(Verification {
            source_files: sources.len(),
            destination_files: destinations.len(),
            mismatched,
        })
    }
}

/// Run `op` on a dedicated pool of `threads` workers, or the global pool when
/// `threads` is 0 or the pool cannot be built.
pub(crate) fn run_parallel<T, F>(threads: usize, op: F) -> T
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    if threads == 0 {
        return op();
    }
    match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool.install(op),
        Err(e) => {
            log::warn!("falling back to global thread pool: {}", e);
            op()
        }
    }
}
