//! Local file-based revision control.
//!
//! A [`RepositoryManager`] owns a project directory and the repository
//! directory it is cloned into. A [`ChangeMonitor`] watches the project, a
//! [`StagingArea`] drains its records into `#stage/` snapshots, and an
//! [`ActivityRecorder`] logs push/pull/commit events. Both logs live in the
//! repository's `vcsdb.sqlite3`.

pub mod activity;
pub mod config;
pub mod error;
pub mod fsops;
pub mod manifest;
pub mod monitor;
pub mod repository;
pub mod staging;
pub mod store;
pub mod types;

pub use activity::{ActivityRecord, ActivityRecorder};
pub use config::{AccessBackend, Config, RenameNoise};
pub use error::{Result, VcsError};
pub use manifest::{CancelToken, Manifest, ManifestItem, Outcome};
pub use monitor::{ChangeMonitor, ChangeRecord, Filter};
pub use repository::{
    CloneOptions, CloneReport, RepositoryDescriptor, RepositoryManager, Verification,
};
pub use staging::{StagePlan, StageReport, StagedFileEntry, StagingArea};
pub use store::LogStore;
pub use types::{AccessState, ActivityType, ChangeKind, Identity, RepoState, Ticks};
