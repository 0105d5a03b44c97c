//! Change monitor: watches a project tree and journals every change.
//!
//! Notifications arrive on the watcher's callback thread while the staging
//! area drains from its own thread, so the journal lives behind a mutex and
//! the counter is only ever updated together with the record list.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{Config as WatchConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::RenameNoise;
use crate::error::{Result, VcsError};
use crate::types::{ChangeKind, Ticks};

/// One observed filesystem change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// 1-based position in the monitor's stream; equals the counter right
    /// after this record was delivered.
    pub seq: u64,
    pub kind: ChangeKind,
    pub path: PathBuf,
    /// Previous path, for renames.
    pub prior: Option<PathBuf>,
    pub timestamp: Ticks,
}

/// File-name filter in the `*`/`?` wildcard syntax.
///
/// `""`, `"*"` and `"*.*"` match everything.
#[derive(Debug, Clone)]
pub struct Filter {
    pattern: String,
    regex: Option<Regex>,
}

impl Filter {
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if matches!(pattern, "" | "*" | "*.*") {
            return Ok(Self::all());
        }

        let mut expr = String::from("^");
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| {
            VcsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid filter '{}': {}", pattern, e),
            ))
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex: Some(regex),
        })
    }

    pub fn all() -> Self {
        Self {
            pattern: "*".to_string(),
            regex: None,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, path: &Path) -> bool {
        let Some(regex) = &self.regex else {
            return true;
        };
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| regex.is_match(name))
    }
}

#[derive(Debug, Default)]
struct JournalState {
    records: VecDeque<ChangeRecord>,
    /// Records discarded by `clear_through`.
    cleared: u64,
    last_tick: i64,
    last_delivered_at: Option<Instant>,
    fault: Option<String>,
}

impl JournalState {
    fn counter(&self) -> u64 {
        self.cleared + self.records.len() as u64
    }

    /// Strictly increasing tick, so two records never share a snapshot name.
    fn next_tick(&mut self) -> Ticks {
        let now = Ticks::now().0;
        let tick = now.max(self.last_tick + 1);
        self.last_tick = tick;
        Ticks(tick)
    }
}

/// Journal shared between the watcher callback and readers.
#[derive(Debug)]
struct Journal {
    root: PathBuf,
    rename_noise: RenameNoise,
    coalesce_window: Option<Duration>,
    state: Mutex<JournalState>,
}

impl Journal {
    fn lock(&self) -> std::sync::MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one record. Returns false if policy dropped the notification.
    fn deliver(&self, kind: ChangeKind, path: PathBuf, prior: Option<PathBuf>) -> bool {
        let mut state = self.lock();
        let now = Instant::now();

        let tail = state
            .records
            .back()
            .filter(|last| kind == ChangeKind::Changed && last.path == path)
            .map(|last| last.kind);
        match tail {
            Some(ChangeKind::Renamed) if self.rename_noise == RenameNoise::Suppress => {
                log::debug!("suppressing post-rename change for {}", path.display());
                return false;
            }
            Some(ChangeKind::Changed) => {
                let within = match (self.coalesce_window, state.last_delivered_at) {
                    (Some(window), Some(at)) => now.duration_since(at) < window,
                    _ => false,
                };
                if within {
                    state.last_delivered_at = Some(now);
                    return false;
                }
            }
            _ => {}
        }

        let timestamp = state.next_tick();
        let seq = state.counter() + 1;
        log::debug!("{} {} (#{})", kind, path.display(), seq);
        state.records.push_back(ChangeRecord {
            seq,
            kind,
            path,
            prior,
            timestamp,
        });
        state.last_delivered_at = Some(now);
        true
    }

    fn fail(&self, reason: String) {
        let mut state = self.lock();
        if state.fault.is_none() {
            log::warn!("watch on {} lost: {}", self.root.display(), reason);
            state.fault = Some(reason);
        }
    }

    fn handle(&self, filter: &Filter, result: notify::Result<Event>) {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                self.fail(e.to_string());
                return;
            }
        };

        if event.paths.iter().any(|p| p == &self.root) {
            match event.kind {
                EventKind::Remove(_) => {
                    self.fail("watched directory was removed".to_string());
                    return;
                }
                EventKind::Modify(ModifyKind::Name(_)) => {
                    self.fail("watched directory was moved".to_string());
                    return;
                }
                _ => {}
            }
        }

        match classify(&event.kind) {
            Some(ChangeKind::Renamed) => {
                if let [from, to] = event.paths.as_slice() {
                    if filter.matches(to) || filter.matches(from) {
                        self.deliver(ChangeKind::Renamed, to.clone(), Some(from.clone()));
                    }
                }
            }
            Some(kind) => {
                for path in event.paths {
                    if filter.matches(&path) {
                        self.deliver(kind, path, None);
                    }
                }
            }
            None => {}
        }
    }

    fn check(&self) -> Result<std::sync::MutexGuard<'_, JournalState>> {
        let state = self.lock();
        if let Some(reason) = &state.fault {
            return Err(VcsError::WatchLost {
                path: self.root.clone(),
                reason: reason.clone(),
            });
        }
        Ok(state)
    }
}

/// Map a notify event kind onto the journal's change kinds.
///
/// Unpaired rename halves are dropped; backends that can pair them report a
/// single `Both` event.
fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => Some(ChangeKind::Renamed),
        EventKind::Modify(ModifyKind::Name(_)) => None,
        EventKind::Modify(_) => Some(ChangeKind::Changed),
        _ => None,
    }
}

/// Watches a directory and accumulates `ChangeRecord`s in arrival order.
pub struct ChangeMonitor {
    directory: PathBuf,
    recursive: bool,
    journal: Arc<Journal>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ChangeMonitor {
    /// Set up a monitor for `directory`. Fails with `NotFound` if it is absent.
    pub fn configure(directory: impl Into<PathBuf>, recursive: bool) -> Result<Self> {
        Self::configure_with(directory, recursive, RenameNoise::default(), None)
    }

    pub fn configure_with(
        directory: impl Into<PathBuf>,
        recursive: bool,
        rename_noise: RenameNoise,
        coalesce_window: Option<Duration>,
    ) -> Result<Self> {
        let directory = directory.into();
        if !directory.is_dir() {
            return Err(VcsError::NotFound(directory));
        }
        let journal = Arc::new(Journal {
            root: directory.clone(),
            rename_noise,
            coalesce_window,
            state: Mutex::new(JournalState::default()),
        });
        Ok(Self {
            directory,
            recursive,
            journal,
            watcher: Mutex::new(None),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Start delivering events that match `filter`. Re-arming replaces the
    /// previous watcher.
    pub fn arm(&self, filter: &str) -> Result<()> {
        self.live_journal()?;
        if !self.directory.is_dir() {
            return Err(VcsError::NotFound(self.directory.clone()));
        }

        let filter = Filter::parse(filter)?;
        let journal = Arc::clone(&self.journal);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| journal.handle(&filter, res),
            WatchConfig::default(),
        )?;
        let mode = if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&self.directory, mode)?;

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        log::info!("monitor armed on {}", self.directory.display());
        Ok(())
    }

    /// Stop event delivery. Accumulated records are kept.
    pub fn disarm(&self) {
        let previous = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            log::info!("monitor disarmed on {}", self.directory.display());
        }
    }

    pub fn is_armed(&self) -> bool {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Journal state, or `WatchLost` if the watched directory went away.
    ///
    /// An armed monitor whose directory no longer exists is latched as lost
    /// even if the backend never reported it.
    fn live_journal(&self) -> Result<std::sync::MutexGuard<'_, JournalState>> {
        if self.is_armed() && !self.directory.is_dir() {
            self.journal
                .fail("watched directory no longer exists".to_string());
        }
        self.journal.check()
    }

    /// Total number of records ever delivered.
    pub fn counter(&self) -> Result<u64> {
        Ok(self.live_journal()?.counter())
    }

    /// Records not yet cleared, in arrival order.
    pub fn records(&self) -> Result<Vec<ChangeRecord>> {
        Ok(self.live_journal()?.records.iter().cloned().collect())
    }

    /// Records with `seq > watermark`.
    pub fn records_since(&self, watermark: u64) -> Result<Vec<ChangeRecord>> {
        let state = self.live_journal()?;
        Ok(state
            .records
            .iter()
            .filter(|record| record.seq > watermark)
            .cloned()
            .collect())
    }

    /// Discard records with `seq <= watermark`. Idempotent.
    pub fn clear_through(&self, watermark: u64) {
        let mut state = self.journal.lock();
        while state.records.front().is_some_and(|r| r.seq <= watermark) {
            state.records.pop_front();
            state.cleared += 1;
        }
    }

    /// Discard every record. The counter keeps its value.
    pub fn clear(&self) {
        let mut state = self.journal.lock();
        state.cleared += state.records.len() as u64;
        state.records.clear();
    }

    /// Handler entry point: journal one change as if the watcher delivered it.
    pub(crate) fn deliver(&self, kind: ChangeKind, path: PathBuf, prior: Option<PathBuf>) -> bool {
        self.journal.deliver(kind, path, prior)
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, filter: &Filter, result: notify::Result<Event>) {
        self.journal.handle(filter, result);
    }
}

impl Drop for ChangeMonitor {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::sync::Barrier;
    use std::thread;
    use tempfile::tempdir;

    fn monitor() -> (ChangeMonitor, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let monitor = ChangeMonitor::configure(dir.path(), true).unwrap();
        (monitor, dir)
    }

    #[test]
    fn configure_missing_directory_is_not_found() {
        let dir = tempdir().unwrap();
        let err = ChangeMonitor::configure(dir.path().join("missing"), true).err().unwrap();
        assert!(matches!(err, VcsError::NotFound(_)));
    }

    #[test]
    fn counter_equals_record_count() {
        let (monitor, dir) = monitor();
        for i in 0..25 {
            let kind = [ChangeKind::Created, ChangeKind::Changed, ChangeKind::Deleted][i % 3];
            monitor.deliver(kind, dir.path().join(format!("f{}", i)), None);
        }
        assert_eq!(monitor.counter().unwrap(), 25);
        let records = monitor.records().unwrap();
        assert_eq!(records.len(), 25);
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (1..=25).collect::<Vec<_>>());
    }

    #[test]
    fn ticks_strictly_increase() {
        let (monitor, dir) = monitor();
        for _ in 0..100 {
            monitor.deliver(ChangeKind::Changed, dir.path().join("same"), None);
        }
        let records = monitor.records().unwrap();
        assert!(records.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn clearing_keeps_counter_monotonic() {
        let (monitor, dir) = monitor();
        for i in 0..5 {
            monitor.deliver(ChangeKind::Created, dir.path().join(i.to_string()), None);
        }
        monitor.clear_through(3);
        monitor.clear_through(3);
        assert_eq!(monitor.counter().unwrap(), 5);
        assert_eq!(monitor.records().unwrap().len(), 2);
        assert_eq!(monitor.records_since(4).unwrap().len(), 1);

        monitor.deliver(ChangeKind::Created, dir.path().join("late"), None);
        assert_eq!(monitor.records().unwrap().last().unwrap().seq, 6);

        monitor.clear();
        assert_eq!(monitor.counter().unwrap(), 6);
        assert!(monitor.records().unwrap().is_empty());
    }

    #[test]
    fn concurrent_delivery_loses_nothing() {
        let (monitor, dir) = monitor();
        let monitor = Arc::new(monitor);
        let threads = 8;
        let per_thread = 200;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let monitor = Arc::clone(&monitor);
                let barrier = Arc::clone(&barrier);
                let path = dir.path().join(format!("t{}", t));
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..per_thread {
                        monitor.deliver(ChangeKind::Changed, path.clone(), None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(monitor.counter().unwrap(), (threads * per_thread) as u64);
        assert_eq!(monitor.records().unwrap().len(), threads * per_thread);
    }

    #[test]
    fn rename_noise_policy() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("old.txt");
        let to = dir.path().join("new.txt");

        let preserve = ChangeMonitor::configure(dir.path(), true).unwrap();
        preserve.deliver(ChangeKind::Renamed, to.clone(), Some(from.clone()));
        preserve.deliver(ChangeKind::Changed, to.clone(), None);
        assert_eq!(preserve.counter().unwrap(), 2);

        let suppress =
            ChangeMonitor::configure_with(dir.path(), true, RenameNoise::Suppress, None).unwrap();
        suppress.deliver(ChangeKind::Renamed, to.clone(), Some(from));
        assert!(!suppress.deliver(ChangeKind::Changed, to, None));
        assert_eq!(suppress.counter().unwrap(), 1);
    }

    #[test]
    fn coalesce_window_merges_repeated_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("busy.txt");
        let monitor = ChangeMonitor::configure_with(
            dir.path(),
            true,
            RenameNoise::Preserve,
            Some(Duration::from_secs(60)),
        )
        .unwrap();
        monitor.deliver(ChangeKind::Changed, path.clone(), None);
        monitor.deliver(ChangeKind::Changed, path.clone(), None);
        monitor.deliver(ChangeKind::Deleted, path, None);
        assert_eq!(monitor.counter().unwrap(), 2);
    }

    #[test]
    fn events_are_classified_and_filtered() {
        let (monitor, dir) = monitor();
        let filter = Filter::parse("*.txt").unwrap();
        let txt = dir.path().join("a.txt");
        let log = dir.path().join("a.log");

        monitor.inject(
            &filter,
            Ok(Event::new(EventKind::Create(CreateKind::File)).add_path(txt.clone())),
        );
        monitor.inject(
            &filter,
            Ok(Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
                .add_path(log)),
        );
        monitor.inject(
            &filter,
            Ok(Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(txt.clone())
                .add_path(dir.path().join("b.txt"))),
        );
        monitor.inject(
            &filter,
            Ok(
                Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
                    .add_path(txt.clone()),
            ),
        );

        let records = monitor.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, ChangeKind::Created);
        assert_eq!(records[1].kind, ChangeKind::Renamed);
        assert_eq!(records[1].prior.as_deref(), Some(txt.as_path()));
        assert_eq!(records[1].path, dir.path().join("b.txt"));
    }

    #[test]
    fn removed_root_is_a_terminal_error() {
        let (monitor, dir) = monitor();
        monitor.deliver(ChangeKind::Created, dir.path().join("x"), None);
        monitor.inject(
            &Filter::all(),
            Ok(
                Event::new(EventKind::Remove(RemoveKind::Folder))
                    .add_path(dir.path().to_path_buf()),
            ),
        );

        assert!(matches!(monitor.counter(), Err(VcsError::WatchLost { .. })));
        assert!(matches!(monitor.records(), Err(VcsError::WatchLost { .. })));
        assert!(matches!(monitor.arm("*"), Err(VcsError::WatchLost { .. })));
    }

    #[test]
    fn moved_root_event_is_a_terminal_error() {
        let (monitor, dir) = monitor();
        monitor.inject(
            &Filter::all(),
            Ok(Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
                .add_path(dir.path().to_path_buf())),
        );
        assert!(matches!(monitor.counter(), Err(VcsError::WatchLost { .. })));
    }

    #[test]
    fn armed_root_renamed_away_is_a_terminal_error() {
        let dir = tempdir().unwrap();
        let project = dir.path().join("P");
        std::fs::create_dir(&project).unwrap();
        let monitor = ChangeMonitor::configure(&project, true).unwrap();
        monitor.arm("*").unwrap();

        std::fs::rename(&project, dir.path().join("moved")).unwrap();

        assert!(matches!(monitor.counter(), Err(VcsError::WatchLost { .. })));
        // latched: recreating the directory does not revive the watch
        std::fs::create_dir(&project).unwrap();
        assert!(matches!(monitor.records(), Err(VcsError::WatchLost { .. })));
    }

    #[test]
    fn watcher_errors_are_terminal() {
        let (monitor, _dir) = monitor();
        monitor.inject(&Filter::all(), Err(notify::Error::generic("queue overflow")));
        assert!(matches!(monitor.counter(), Err(VcsError::WatchLost { .. })));
    }

    #[test]
    fn wildcard_filters() {
        let all = Filter::parse("*.*").unwrap();
        assert!(all.matches(Path::new("/x/Makefile")));

        let txt = Filter::parse("*.txt").unwrap();
        assert!(txt.matches(Path::new("/x/a.txt")));
        assert!(!txt.matches(Path::new("/x/a.txt.bak")));

        let single = Filter::parse("file?.rs").unwrap();
        assert!(single.matches(Path::new("file1.rs")));
        assert!(!single.matches(Path::new("file10.rs")));

        let literal = Filter::parse("a+b.txt").unwrap();
        assert!(literal.matches(Path::new("a+b.txt")));
        assert!(!literal.matches(Path::new("aab.txt")));
    }

    #[test]
    fn armed_watcher_observes_real_edits() {
        let (monitor, dir) = monitor();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "hello").unwrap();

        monitor.arm("*").unwrap();
        assert!(monitor.is_armed());
        std::fs::write(&file, "hello!").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.counter().unwrap() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        monitor.disarm();
        assert!(!monitor.is_armed());

        let records = monitor.records().unwrap();
        assert!(!records.is_empty());
        assert_eq!(records.len() as u64, monitor.counter().unwrap());
        assert!(records.iter().any(|r| r.path.ends_with("a.txt")));
    }
}
