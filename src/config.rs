//! Runtime configuration.

use std::time::Duration;

use crate::types::Identity;

/// Default lease acquisition timeout.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default SQLite busy timeout.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for a single staging or clone batch (10 minutes).
const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How the monitor treats the extra `Changed` notification some platforms
/// emit right after a rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenameNoise {
    /// Record every notification the OS delivers.
    #[default]
    Preserve,
    /// Drop a `Changed` that immediately follows a `Renamed` of the same path.
    Suppress,
}

/// Which backend realizes the repository open/closed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessBackend {
    /// Advisory lease file inside the repository.
    #[default]
    Lease,
    /// Toggle the repository directory's read-only bit.
    Permissions,
}

/// Settings shared by the repository manager, staging area and monitor.
#[derive(Debug, Clone)]
pub struct Config {
    pub identity: Identity,
    pub lock_timeout: Duration,
    pub store_timeout: Duration,
    pub batch_timeout: Duration,
    /// Worker threads for copy fan-out. 0 uses the global rayon pool.
    pub copy_threads: usize,
    pub rename_noise: RenameNoise,
    /// Merge repeated `Changed` events on the same path arriving within this window.
    pub coalesce_window: Option<Duration>,
    pub access: AccessBackend,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: Identity::from_env(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            copy_threads: 0,
            rename_noise: RenameNoise::default(),
            coalesce_window: None,
            access: AccessBackend::default(),
        }
    }
}

impl Config {
    /// Defaults, with `REVSTAGE_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_u64("REVSTAGE_LOCK_TIMEOUT_SECS") {
            config.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("REVSTAGE_BATCH_TIMEOUT_SECS") {
            config.batch_timeout = Duration::from_secs(secs);
        }
        if let Some(threads) = env_u64("REVSTAGE_COPY_THREADS") {
            config.copy_threads = threads as usize;
        }
        match std::env::var("REVSTAGE_ACCESS").as_deref() {
            Ok("permissions") => config.access = AccessBackend::Permissions,
            Ok("lease") => config.access = AccessBackend::Lease,
            _ => {}
        }
        if std::env::var("REVSTAGE_RENAME_NOISE").as_deref() == Ok("suppress") {
            config.rename_noise = RenameNoise::Suppress;
        }
        config
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_copy_threads(mut self, threads: usize) -> Self {
        self.copy_threads = threads;
        self
    }

    pub fn with_rename_noise(mut self, policy: RenameNoise) -> Self {
        self.rename_noise = policy;
        self
    }

    pub fn with_coalesce_window(mut self, window: Option<Duration>) -> Self {
        self.coalesce_window = window;
        self
    }

    pub fn with_access(mut self, access: AccessBackend) -> Self {
        self.access = access;
        self
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        let config = Config::default()
            .with_identity(Identity::new("bob", "ci"))
            .with_copy_threads(2)
            .with_rename_noise(RenameNoise::Suppress)
            .with_access(AccessBackend::Permissions);

        assert_eq!(config.identity.principal, "bob");
        assert_eq!(config.copy_threads, 2);
        assert_eq!(config.rename_noise, RenameNoise::Suppress);
        assert_eq!(config.access, AccessBackend::Permissions);
        assert_eq!(config.lock_timeout, DEFAULT_LOCK_TIMEOUT);
    }
}
