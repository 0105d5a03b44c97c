//! Activity log
//!
//! Discrete repository actions (push, pull, commit) appended to the
//! `activityRecordLog` table of the repository's log store.

use std::sync::Arc;

use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{ACTIVITY_TABLE, LogStore, activity_table, table_exists_on};
use crate::types::{ActivityType, Identity, Ticks};

pub const DEFAULT_BRANCH: &str = "master";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub record_time: Ticks,
    pub activity_id: i64,
    pub branch: String,
    pub account_id: String,
    pub activity_type: ActivityType,
    pub description: String,
}

impl ActivityRecord {
    /// Build a record, filling blank fields with defaults: branch `master`,
    /// the identity's principal as account, and `{recordTime}--{type}` as the
    /// description.
    pub fn new(
        record_time: Ticks,
        activity_id: i64,
        branch: &str,
        account_id: &str,
        activity_type: ActivityType,
        description: &str,
        identity: &Identity,
    ) -> Self {
        let branch = non_blank(branch).unwrap_or(DEFAULT_BRANCH).to_string();
        let account_id = non_blank(account_id)
            .unwrap_or(identity.principal.as_str())
            .to_string();
        let description = match non_blank(description) {
            Some(d) => d.to_string(),
            None => format!("{}--{}", record_time, activity_type.label()),
        };
        Self {
            record_time,
            activity_id,
            branch,
            account_id,
            activity_type,
            description,
        }
    }
}

fn non_blank(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Writes one activity record to a repository's log store.
pub struct ActivityRecorder {
    record: ActivityRecord,
    log: Arc<LogStore>,
}

impl ActivityRecorder {
    pub fn new(record: ActivityRecord, log: Arc<LogStore>) -> Self {
        Self { record, log }
    }

    pub fn record(&self) -> &ActivityRecord {
        &self.record
    }

    /// Create the table if needed and append the record, as one transaction.
    pub fn update_log(&self) -> Result<()> {
        let spec = activity_table();
        let record = &self.record;
        self.log.transaction(|tx| {
            if !table_exists_on(tx, spec.name)? {
                tx.execute_batch(spec.create_sql)?;
            }
            tx.execute(
                "INSERT INTO activityRecordLog
                 (recordTime, activityId, branch, accountId, activityType, description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.record_time.as_i64(),
                    record.activity_id,
                    record.branch,
                    record.account_id,
                    record.activity_type.code(),
                    record.description,
                ],
            )?;
            Ok(())
        })?;
        log::info!(
            "recorded {} #{} on {} by {}",
            record.activity_type,
            record.activity_id,
            record.branch,
            record.account_id
        );
        Ok(())
    }

    /// Delete every row of the activity log.
    pub fn clear_log(&self) -> Result<usize> {
        clear(&self.log)
    }

    /// Logged activities, newest first.
    pub fn history(&self) -> Result<Vec<ActivityRecord>> {
        history(&self.log)
    }
}

pub fn clear(log: &LogStore) -> Result<usize> {
    if !log.table_exists(ACTIVITY_TABLE)? {
        return Ok(0);
    }
    let removed = log.execute("DELETE FROM activityRecordLog", [])?;
    log::info!("cleared {} activity rows", removed);
    Ok(removed)
}

pub fn history(log: &LogStore) -> Result<Vec<ActivityRecord>> {
    if !log.table_exists(ACTIVITY_TABLE)? {
        return Ok(Vec::new());
    }
    let rows = log.query(
        "SELECT recordTime, activityId, branch, accountId, activityType, description
         FROM activityRecordLog ORDER BY recordTime DESC, rowid DESC",
        [],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        },
    )?;

    let mut records = Vec::with_capacity(rows.len());
    for (time, id, branch, account_id, code, description) in rows {
        match ActivityType::from_code(code) {
            Ok(activity_type) => records.push(ActivityRecord {
                record_time: Ticks(time),
                activity_id: id,
                branch,
                account_id,
                activity_type,
                description,
            }),
            Err(e) => log::warn!("skipping activity #{}: {}", id, e),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VcsError;
    use std::time::Duration;
    use tempfile::tempdir;

    fn identity() -> Identity {
        Identity::new("alice", "box")
    }

    #[test]
    fn blank_fields_take_defaults() {
        let time = Ticks(638_000_000_000_000_000);
        let record = ActivityRecord::new(time, 1, "", "", ActivityType::Commit, "", &identity());
        assert_eq!(record.branch, "master");
        assert_eq!(record.account_id, "alice");
        assert_eq!(record.description, "638000000000000000--Commit");
    }

    #[test]
    fn explicit_fields_are_kept() {
        let record = ActivityRecord::new(
            Ticks(1),
            7,
            "feature",
            "bob",
            ActivityType::Push,
            "shipped",
            &identity(),
        );
        assert_eq!(record.branch, "feature");
        assert_eq!(record.account_id, "bob");
        assert_eq!(record.description, "shipped");
    }

    #[test]
    fn update_log_creates_table_and_appends() {
        let log = Arc::new(LogStore::open_in_memory().unwrap());
        assert!(!log.table_exists(ACTIVITY_TABLE).unwrap());

        for (i, kind) in [ActivityType::Pull, ActivityType::Commit].into_iter().enumerate() {
            let tick = Ticks(100 + i as i64);
            let record = ActivityRecord::new(tick, i as i64, "", "", kind, "", &identity());
            ActivityRecorder::new(record, Arc::clone(&log)).update_log().unwrap();
        }

        let history = history(&log).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].activity_type, ActivityType::Commit);
        assert_eq!(history[1].activity_type, ActivityType::Pull);
        assert_eq!(history[1].description, "100--Pull");
    }

    #[test]
    fn clear_log_removes_rows() {
        let log = Arc::new(LogStore::open_in_memory().unwrap());
        let kind = ActivityType::Commit;
        let record = ActivityRecord::new(Ticks::now(), 1, "", "", kind, "", &identity());
        let recorder = ActivityRecorder::new(record, Arc::clone(&log));
        assert_eq!(recorder.clear_log().unwrap(), 0);

        recorder.update_log().unwrap();
        recorder.update_log().unwrap();
        assert_eq!(recorder.history().unwrap().len(), 2);
        assert_eq!(recorder.clear_log().unwrap(), 2);
        assert!(recorder.history().unwrap().is_empty());
    }

    #[test]
    fn locked_store_is_storage_unavailable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vcsdb.sqlite3");
        let log = Arc::new(LogStore::open(&path, Duration::from_millis(50)).unwrap());
        let blocker = rusqlite::Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        let kind = ActivityType::Push;
        let record = ActivityRecord::new(Ticks::now(), 1, "", "", kind, "", &identity());
        let err = ActivityRecorder::new(record, log).update_log().unwrap_err();
        assert!(matches!(err, VcsError::StorageUnavailable { .. }));
    }
}
