//! Shared types for revstage

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ticks per second (one tick is 100 ns).
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Tick value of 1970-01-01T00:00:00Z, counting from 0001-01-01T00:00:00Z.
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Error type for parsing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("value cannot be empty")]
    Empty,
    #[error("unknown activity type: {0}")]
    UnknownActivity(String),
    #[error("unknown activity code: {0}")]
    UnknownActivityCode(i64),
}

/// Wall-clock timestamp in 100 ns ticks since 0001-01-01 UTC.
///
/// This is the time unit stored in the log store and used to name staged
/// snapshots, so it has to stay stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticks(pub i64);

impl Ticks {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert a UTC timestamp to ticks.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let secs = dt.timestamp();
        let sub = i64::from(dt.timestamp_subsec_nanos()) / 100;
        Ticks(UNIX_EPOCH_TICKS + secs * TICKS_PER_SECOND + sub)
    }

    /// Convert back to a UTC timestamp, if representable.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let since_epoch = self.0 - UNIX_EPOCH_TICKS;
        let secs = since_epoch.div_euclid(TICKS_PER_SECOND);
        let nanos = (since_epoch.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
        Utc.timestamp_opt(secs, nanos).single()
    }

    /// Returns the inner tick count
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of filesystem change observed by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Changed,
    Deleted,
    Renamed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeKind::Created => "Created",
            ChangeKind::Changed => "Changed",
            ChangeKind::Deleted => "Deleted",
            ChangeKind::Renamed => "Renamed",
        };
        f.pad(label)
    }
}

/// High-level repository activity.
///
/// The discriminants are the values persisted in `activityRecordLog.activityType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Push = 0,
    Pull = 1,
    Commit = 2,
}

impl ActivityType {
    /// Human readable label, also used in default descriptions.
    pub fn label(self) -> &'static str {
        match self {
            ActivityType::Push => "Push",
            ActivityType::Pull => "Pull",
            ActivityType::Commit => "Commit",
        }
    }

    /// Integer code stored in the log store.
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Result<Self, ParseError> {
        match code {
            0 => Ok(ActivityType::Push),
            1 => Ok(ActivityType::Pull),
            2 => Ok(ActivityType::Commit),
            other => Err(ParseError::UnknownActivityCode(other)),
        }
    }
}

impl FromStr for ActivityType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(ActivityType::Push),
            "pull" => Ok(ActivityType::Pull),
            "commit" => Ok(ActivityType::Commit),
            _ => Err(ParseError::UnknownActivity(s.to_string())),
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

/// The principal and machine operations run on behalf of.
///
/// Passed explicitly so tests can supply fixed identities instead of relying
/// on whoever happens to run the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub principal: String,
    pub machine: String,
}

impl Identity {
    pub fn new(principal: impl Into<String>, machine: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            machine: machine.into(),
        }
    }

    /// Resolve the identity of the current process from the environment.
    pub fn from_env() -> Self {
        let principal = first_env(&["REVSTAGE_PRINCIPAL", "USER", "USERNAME", "LOGNAME"])
            .unwrap_or_else(|| "unknown".to_string());
        let machine = first_env(&["REVSTAGE_MACHINE", "HOSTNAME", "COMPUTERNAME"])
            .unwrap_or_else(|| "localhost".to_string());
        Self { principal, machine }
    }

    /// `machine\principal`, the holder name the repository manager hands to
    /// its access backend.
    pub fn qualified(&self) -> String {
        format!("{}\\{}", self.machine, self.principal)
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::from_env()
    }
}

fn first_env(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

/// Whether the current principal may write to the repository directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessState {
    Open,
    Closed,
}

/// Lifecycle of a repository as seen by its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoState {
    Uninitialized,
    Closed,
    Opened,
}

impl fmt::Display for RepoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RepoState::Uninitialized => "uninitialized",
            RepoState::Closed => "closed",
            RepoState::Opened => "opened",
        };
        f.pad(label)
    }
}
