//! Staging area
//!
//! Drains the change monitor into point-in-time snapshots under
//! `<repository>/#stage/<tick>` and journals each staged file in the
//! `stagingLog` table.
//!
//! Staging is two-phase: `plan` captures the records accumulated since the
//! last successful run, `commit` copies them (fanned out in parallel, each item
//! succeeding or failing on its own) and advances the watermark past every
//! record it attempted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rayon::prelude::*;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Result, VcsError};
use crate::fsops::FileStore;
use crate::manifest::{BatchGuard, CancelToken, Manifest, ManifestItem, Outcome};
use crate::monitor::{ChangeMonitor, ChangeRecord};
use crate::repository::{RepoPaths, RepositoryManager, run_parallel};
use crate::store::{LogStore, STAGING_TABLE, staging_table};
use crate::types::{ChangeKind, Ticks};

/// One row of the staging log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFileEntry {
    /// When the snapshot was written.
    pub storage_time: Ticks,
    /// When the change was observed; also the snapshot's file name.
    pub changed_time: Ticks,
    pub source_path: PathBuf,
}

/// Records captured by `plan`.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub records: Vec<ChangeRecord>,
    /// Sequence number of the last planned record. Once the watermark has
    /// reached it, committing the plan again is a no-op.
    pub through: u64,
}

impl StagePlan {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Outcome of one `commit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub manifest: Manifest,
    /// Watermark after this run.
    pub watermark: u64,
}

impl StageReport {
    /// True iff at least one record was processed.
    pub fn processed(&self) -> bool {
        self.manifest.items().iter().any(|item| item.outcome.attempted())
    }
}

pub struct StagingArea {
    monitor: Arc<ChangeMonitor>,
    paths: RepoPaths,
    files: Arc<dyn FileStore>,
    log: Arc<LogStore>,
    config: Config,
    watermark: AtomicU64,
    /// Snapshots staged but not yet journaled, newest change per path.
    pending: DashMap<PathBuf, StagedFileEntry>,
}

impl StagingArea {
    pub fn new(
        monitor: Arc<ChangeMonitor>,
        paths: RepoPaths,
        files: Arc<dyn FileStore>,
        log: Arc<LogStore>,
        config: Config,
    ) -> Self {
        Self {
            monitor,
            paths,
            files,
            log,
            config,
            watermark: AtomicU64::new(0),
            pending: DashMap::new(),
        }
    }

    /// Staging area for a managed repository.
    pub fn for_repository(
        repository: &RepositoryManager,
        monitor: Arc<ChangeMonitor>,
        log: Arc<LogStore>,
    ) -> Self {
        Self::new(
            monitor,
            repository.paths().clone(),
            repository.file_store(),
            log,
            repository.config().clone(),
        )
    }

    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::SeqCst)
    }

    /// True iff the monitor saw changes after the last successful run.
    pub fn has_changed(&self) -> Result<bool> {
        Ok(self.monitor.counter()? > self.watermark())
    }

    /// Capture the records accumulated since the watermark.
    pub fn plan(&self) -> Result<StagePlan> {
        let records = self.monitor.records_since(self.watermark())?;
        let through = records.last().map(|r| r.seq).unwrap_or(self.watermark());
        Ok(StagePlan { records, through })
    }

    /// Plan and commit in one step.
    pub fn update_stage(&self) -> Result<StageReport> {
        self.update_stage_with_cancel(&CancelToken::new())
    }

    pub fn update_stage_with_cancel(&self, cancel: &CancelToken) -> Result<StageReport> {
        let plan = self.plan()?;
        self.commit(plan, cancel)
    }

    /// Copy every planned record into the staging directory.
    ///
    /// Items that fail are reported in the manifest and the batch continues.
    /// The watermark advances through the longest prefix of attempted
    /// records, so cancelled or timed-out items are picked up by the next run.
    pub fn commit(&self, plan: StagePlan, cancel: &CancelToken) -> Result<StageReport> {
        // An empty plan, or one a previous commit already covered.
        if plan.is_empty() || plan.through <= self.watermark() {
            return Ok(StageReport {
                manifest: Manifest::new(),
                watermark: self.watermark(),
            });
        }

        let stage_dir = self.paths.stage_dir();
        if !self.files.exists(&stage_dir) {
            self.files.create_directory(&stage_dir)?;
        }

        let guard = BatchGuard::new(cancel.clone(), self.config.batch_timeout);
        let items = run_parallel(self.config.copy_threads, || {
            plan.records
                .par_iter()
                .map(|record| self.stage_record(record, &guard))
                .collect::<Vec<_>>()
        });

        let attempted_through = plan
            .records
            .iter()
            .zip(&items)
            .take_while(|(_, item)| item.outcome.attempted())
            .last()
            .map(|(record, _)| record.seq);
        if let Some(seq) = attempted_through {
            self.watermark.fetch_max(seq, Ordering::SeqCst);
        }

        let mut manifest = Manifest::new();
        manifest.extend(items);
        log::info!("staged through #{}: {}", self.watermark(), manifest);

        if !manifest.is_complete() {
            return Err(VcsError::PartialFailure(manifest));
        }
        Ok(StageReport {
            manifest,
            watermark: self.watermark(),
        })
    }

    fn stage_record(&self, record: &ChangeRecord, guard: &BatchGuard) -> ManifestItem {
        let mut item = ManifestItem {
            source: record.path.clone(),
            destination: None,
            outcome: Outcome::Skipped,
        };
        if guard.should_stop() {
            return item;
        }

        // Deletions and directory events have no content to snapshot.
        if record.kind == ChangeKind::Deleted || record.path.is_dir() {
            item.outcome = Outcome::Success;
            return item;
        }

        let destination = self.paths.staged_file(record.timestamp.as_i64());
        // The snapshot name identifies this record, so restaging rewrites it.
        item.outcome = match self.files.copy(&record.path, &destination, true) {
            Ok(()) => {
                log::debug!("staged {} -> {}", record.path.display(), destination.display());
                self.remember(StagedFileEntry {
                    storage_time: Ticks::now(),
                    changed_time: record.timestamp,
                    source_path: record.path.clone(),
                });
                Outcome::Success
            }
            Err(e) => {
                log::warn!("failed to stage {}: {}", record.path.display(), e);
                Outcome::Failed(e.to_string())
            }
        };
        item.destination = Some(destination);
        item
    }

    /// Keep the newest change per path.
    fn remember(&self, entry: StagedFileEntry) {
        match self.pending.entry(entry.source_path.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().changed_time < entry.changed_time {
                    existing.insert(entry);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
    }

    /// Discard monitor records up to the watermark. Idempotent.
    pub fn clear_monitor_records(&self) {
        self.monitor.clear_through(self.watermark());
    }

    /// Journal staged snapshots into `stagingLog`.
    ///
    /// Rows are keyed by source path: an existing row is updated, otherwise a
    /// row is inserted. An update never replaces a newer `changedTime`, so
    /// concurrent writers cannot lose the latest change. Entries whose upsert
    /// fails stay pending and are reported as a partial failure.
    pub fn update_log(&self) -> Result<Manifest> {
        self.log.ensure_table(staging_table())?;

        let mut entries: Vec<StagedFileEntry> =
            self.pending.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.changed_time);

        let outcomes = self.log.transaction(|tx| {
            let mut outcomes = Vec::with_capacity(entries.len());
            for entry in &entries {
                outcomes.push(upsert(tx, entry).map_err(|e| e.to_string()));
            }
            Ok(outcomes)
        })?;

        let mut manifest = Manifest::new();
        for (entry, outcome) in entries.into_iter().zip(outcomes) {
            let outcome = match outcome {
                Ok(()) => {
                    self.pending
                        .remove_if(&entry.source_path, |_, v| v.changed_time == entry.changed_time);
                    Outcome::Success
                }
                Err(reason) => {
                    log::warn!(
                        "failed to journal {}: {}",
                        entry.source_path.display(),
                        reason
                    );
                    Outcome::Failed(reason)
                }
            };
            manifest.push(ManifestItem {
                source: entry.source_path,
                destination: Some(self.paths.staged_file(entry.changed_time.as_i64())),
                outcome,
            });
        }

        if !manifest.is_complete() {
            return Err(VcsError::PartialFailure(manifest));
        }
        Ok(manifest)
    }

    /// Delete every row of the staging log.
    pub fn clear_log(&self) -> Result<usize> {
        if !self.log.table_exists(STAGING_TABLE)? {
            return Ok(0);
        }
        let removed = self.log.execute("DELETE FROM stagingLog", [])?;
        log::info!("cleared {} staging log rows", removed);
        Ok(removed)
    }

    /// Journaled entries, newest change first.
    pub fn staged_entries(&self) -> Result<Vec<StagedFileEntry>> {
        if !self.log.table_exists(STAGING_TABLE)? {
            return Ok(Vec::new());
        }
        self.log.query(
            "SELECT storageTime, changedTime, fileUrl FROM stagingLog ORDER BY changedTime DESC",
            [],
            |row| {
                Ok(StagedFileEntry {
                    storage_time: Ticks(row.get(0)?),
                    changed_time: Ticks(row.get(1)?),
                    source_path: PathBuf::from(row.get::<_, String>(2)?),
                })
            },
        )
    }

    /// Delete every staged snapshot file. Returns how many were removed.
    pub fn purge_stage(&self) -> Result<usize> {
        let stage_dir = self.paths.stage_dir();
        if !self.files.exists(&stage_dir) {
            return Ok(0);
        }
        let snapshots = self.files.traverse(&stage_dir, false)?;
        for snapshot in &snapshots {
            self.files.delete(snapshot)?;
        }
        Ok(snapshots.len())
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.paths.stage_dir()
    }
}

fn upsert(tx: &rusqlite::Transaction<'_>, entry: &StagedFileEntry) -> rusqlite::Result<()> {
    let url = path_url(&entry.source_path);
    let exists = tx
        .prepare_cached("SELECT 1 FROM stagingLog WHERE fileUrl = ?1 LIMIT 1")?
        .exists(params![url])?;
    if exists {
        tx.execute(
            "UPDATE stagingLog SET storageTime = ?1, changedTime = ?2
             WHERE fileUrl = ?3 AND changedTime <= ?2",
            params![entry.storage_time.as_i64(), entry.changed_time.as_i64(), url],
        )?;
    } else {
        tx.execute(
            "INSERT INTO stagingLog (storageTime, changedTime, fileUrl) VALUES (?1, ?2, ?3)",
            params![entry.storage_time.as_i64(), entry.changed_time.as_i64(), url],
        )?;
    }
    Ok(())
}

fn path_url(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsops::LocalFileStore;
    use crate::types::Identity;
    use std::fs;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        project: PathBuf,
        monitor: Arc<ChangeMonitor>,
        stage: StagingArea,
        log: Arc<LogStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let project = dir.path().join("P");
        let repo = dir.path().join("R");
        fs::create_dir(&project).unwrap();
        fs::create_dir(&repo).unwrap();

        let monitor = Arc::new(ChangeMonitor::configure(&project, true).unwrap());
        let log = Arc::new(
            LogStore::open(&repo.join("vcsdb.sqlite3"), Duration::from_secs(1)).unwrap(),
        );
        let config = Config::default().with_identity(Identity::new("tester", "host"));
        let stage = StagingArea::new(
            Arc::clone(&monitor),
            RepoPaths::new(&repo),
            Arc::new(LocalFileStore),
            Arc::clone(&log),
            config,
        );
        Fixture {
            _dir: dir,
            project,
            monitor,
            stage,
            log,
        }
    }

    fn edit(fx: &Fixture, name: &str, contents: &str) -> PathBuf {
        let path = fx.project.join(name);
        fs::write(&path, contents).unwrap();
        fx.monitor.deliver(ChangeKind::Changed, path.clone(), None);
        path
    }

    #[test]
    fn staged_snapshot_is_byte_identical() {
        let fx = fixture();
        edit(&fx, "a.txt", "hello!");
        assert!(fx.stage.has_changed().unwrap());

        let report = fx.stage.update_stage().unwrap();
        assert!(report.processed());
        assert!(!fx.stage.has_changed().unwrap());

        let record = &fx.monitor.records().unwrap()[0];
        let snapshot = fx.stage.stage_dir().join(record.timestamp.to_string());
        assert_eq!(fs::read(&snapshot).unwrap(), b"hello!");
        assert_eq!(report.manifest.items()[0].destination.as_ref(), Some(&snapshot));
    }

    #[test]
    fn second_update_without_changes_copies_nothing() {
        let fx = fixture();
        edit(&fx, "a.txt", "one");
        fx.stage.update_stage().unwrap();

        let report = fx.stage.update_stage().unwrap();
        assert!(!report.processed());
        assert!(report.manifest.is_empty());
        assert_eq!(fs::read_dir(fx.stage.stage_dir()).unwrap().count(), 1);
    }

    #[test]
    fn committing_a_covered_plan_copies_nothing() {
        let fx = fixture();
        edit(&fx, "a.txt", "a");
        let plan = fx.stage.plan().unwrap();
        assert_eq!(plan.through, 1);

        fx.stage.commit(plan.clone(), &CancelToken::new()).unwrap();
        fx.stage.purge_stage().unwrap();

        let again = fx.stage.commit(plan, &CancelToken::new()).unwrap();
        assert!(again.manifest.is_empty());
        assert_eq!(fs::read_dir(fx.stage.stage_dir()).unwrap().count(), 0);
    }

    #[test]
    fn each_edit_gets_its_own_snapshot() {
        let fx = fixture();
        edit(&fx, "a.txt", "v1");
        fx.stage.update_stage().unwrap();
        edit(&fx, "a.txt", "v2");
        edit(&fx, "b.txt", "b");
        let report = fx.stage.update_stage().unwrap();

        assert_eq!(report.manifest.len(), 2);
        assert_eq!(report.watermark, 3);
        assert_eq!(fs::read_dir(fx.stage.stage_dir()).unwrap().count(), 3);
    }

    #[test]
    fn failed_copy_is_reported_and_does_not_abort_batch() {
        let fx = fixture();
        edit(&fx, "good.txt", "ok");
        fx.monitor
            .deliver(ChangeKind::Created, fx.project.join("vanished.txt"), None);
        edit(&fx, "also-good.txt", "ok");

        let err = fx.stage.update_stage().unwrap_err();
        let manifest = err.manifest().unwrap();
        assert_eq!(manifest.succeeded().count(), 2);
        let failed: Vec<_> = manifest.failed().collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].source.ends_with("vanished.txt"));

        // attempted records are not retried
        assert_eq!(fx.stage.watermark(), 3);
        assert!(!fx.stage.has_changed().unwrap());
    }

    #[test]
    fn deletions_are_processed_without_copy() {
        let fx = fixture();
        fx.monitor
            .deliver(ChangeKind::Deleted, fx.project.join("gone.txt"), None);
        let report = fx.stage.update_stage().unwrap();
        assert!(report.processed());
        assert_eq!(report.manifest.items()[0].destination, None);
        assert_eq!(fx.stage.update_log().unwrap().len(), 0);
    }

    #[test]
    fn cancelled_run_leaves_records_for_next_run() {
        let fx = fixture();
        edit(&fx, "a.txt", "a");
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = fx.stage.update_stage_with_cancel(&cancel).unwrap_err();
        assert_eq!(err.manifest().unwrap().skipped().count(), 1);
        assert_eq!(fx.stage.watermark(), 0);
        assert!(fx.stage.has_changed().unwrap());

        fx.stage.update_stage().unwrap();
        assert!(!fx.stage.has_changed().unwrap());
    }

    #[test]
    fn update_log_upserts_latest_change_per_path() {
        let fx = fixture();
        let a = edit(&fx, "a.txt", "1");
        edit(&fx, "a.txt", "2");
        edit(&fx, "b.txt", "b");
        fx.stage.update_stage().unwrap();
        let journaled = fx.stage.update_log().unwrap();
        assert_eq!(journaled.len(), 2);

        let latest_a = fx.monitor.records().unwrap()[1].timestamp;
        edit(&fx, "a.txt", "3");
        fx.stage.update_stage().unwrap();
        fx.stage.update_log().unwrap();

        let entries = fx.stage.staged_entries().unwrap();
        assert_eq!(entries.len(), 2);
        let a_entry = entries.iter().find(|e| e.source_path == a).unwrap();
        assert!(a_entry.changed_time > latest_a);
    }

    #[test]
    fn older_change_never_overwrites_newer_row() {
        let fx = fixture();
        fx.stage.log.ensure_table(staging_table()).unwrap();
        let url = fx.project.join("a.txt");
        fx.log
            .execute(
                "INSERT INTO stagingLog (storageTime, changedTime, fileUrl) VALUES (?1, ?2, ?3)",
                params![100i64, 500i64, url.to_string_lossy()],
            )
            .unwrap();

        fx.log
            .transaction(|tx| {
                upsert(
                    tx,
                    &StagedFileEntry {
                        storage_time: Ticks(200),
                        changed_time: Ticks(400),
                        source_path: url.clone(),
                    },
                )
            })
            .unwrap();

        let entries = fx.stage.staged_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].changed_time, Ticks(500));
    }

    #[test]
    fn clear_log_and_monitor_records() {
        let fx = fixture();
        edit(&fx, "a.txt", "a");
        fx.stage.update_stage().unwrap();
        fx.stage.update_log().unwrap();

        fx.stage.clear_monitor_records();
        fx.stage.clear_monitor_records();
        assert!(fx.monitor.records().unwrap().is_empty());
        assert_eq!(fx.monitor.counter().unwrap(), 1);
        assert!(!fx.stage.has_changed().unwrap());

        assert_eq!(fx.stage.clear_log().unwrap(), 1);
        assert!(fx.stage.staged_entries().unwrap().is_empty());
    }

    #[test]
    fn clear_log_without_table_is_a_no_op() {
        let fx = fixture();
        assert_eq!(fx.stage.clear_log().unwrap(), 0);
    }

    #[test]
    fn purge_stage_removes_snapshots() {
        let fx = fixture();
        edit(&fx, "a.txt", "a");
        edit(&fx, "b.txt", "b");
        fx.stage.update_stage().unwrap();
        assert_eq!(fx.stage.purge_stage().unwrap(), 2);
        assert_eq!(fs::read_dir(fx.stage.stage_dir()).unwrap().count(), 0);
    }

    #[test]
    fn watch_loss_surfaces_through_has_changed() {
        let fx = fixture();
        fx.monitor.inject(
            &crate::monitor::Filter::all(),
            Err(notify::Error::generic("gone")),
        );
        assert!(matches!(
            fx.stage.has_changed(),
            Err(VcsError::WatchLost { .. })
        ));
    }

    #[test]
    fn clone_then_stage_an_observed_edit() {
        use crate::repository::{CloneOptions, RepositoryDescriptor};
        use crate::types::RepoState;
        use std::time::Instant;

        let dir = tempdir().unwrap();
        let project = dir.path().join("P");
        fs::create_dir(&project).unwrap();
        fs::write(project.join("a.txt"), "hello").unwrap();
        let descriptor = RepositoryDescriptor::new("demo", "", &project, dir.path().join("R"));
        let config = Config::default().with_identity(Identity::new("tester", "host"));
        let manager = RepositoryManager::new(descriptor, config).unwrap();

        manager.initialize().unwrap();
        assert_eq!(manager.state(), RepoState::Closed);
        manager.open().unwrap();
        let report = manager
            .clone_project(CloneOptions {
                overwrite: false,
                check_integrity: true,
            })
            .unwrap();
        assert!(report.verification.unwrap().is_match());

        let monitor = Arc::new(ChangeMonitor::configure(&project, true).unwrap());
        let log = manager.log_store().unwrap();
        let stage = StagingArea::for_repository(&manager, Arc::clone(&monitor), log);
        monitor.arm("*").unwrap();
        fs::write(project.join("a.txt"), "hello!").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.counter().unwrap() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        // let the rest of the write's notifications land
        std::thread::sleep(Duration::from_millis(300));
        monitor.disarm();

        assert!(stage.has_changed().unwrap());
        let report = stage.update_stage().unwrap();
        assert!(report.processed());
        assert!(!stage.has_changed().unwrap());

        let record = monitor.records().unwrap().pop().unwrap();
        assert_eq!(record.path, project.join("a.txt"));
        let snapshot = manager.paths().staged_file(record.timestamp.as_i64());
        assert_eq!(fs::read(snapshot).unwrap(), b"hello!");
        manager.close().unwrap();
    }
}
