//! Repository access control.
//!
//! Opening a repository grants the current principal full access to the
//! repository directory, closing it takes that access away. This is a coarse,
//! machine-local, non-reentrant lock emulation: it does not queue waiters and
//! does not affect file handles opened before the toggle.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::types::AccessState;

/// Name of the lease file inside a repository directory.
pub const LEASE_FILE: &str = "vcs.lock";

/// Grants or revokes a principal's full access to a directory.
pub trait AccessControl: Send + Sync {
    fn grant_full(&self, principal: &str, path: &Path) -> io::Result<()>;

    fn deny_full(&self, principal: &str, path: &Path) -> io::Result<()>;

    /// Current state for `principal` on `path`.
    fn state(&self, principal: &str, path: &Path) -> io::Result<AccessState>;
}

/// A held exclusive lease. Released when dropped.
#[derive(Debug)]
pub struct Lease {
    file: File,
}

impl Lease {
    /// Acquire an exclusive lease, blocking until available or timeout.
    /// Returns an error with `ErrorKind::TimedOut` if the lease is still held
    /// elsewhere when `timeout` elapses.
    pub fn acquire_with_timeout(lock_path: &Path, timeout: Duration) -> io::Result<Self> {
        let file = open_lock_file(lock_path)?;

        let start = Instant::now();
        let mut sleep_duration = Duration::from_millis(10);
        let max_sleep = Duration::from_millis(500);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("lease acquisition timed out after {:?}", timeout),
                        ));
                    }
                    std::thread::sleep(sleep_duration);
                    sleep_duration = (sleep_duration * 2).min(max_sleep);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Try to acquire without blocking. Returns None if held elsewhere.
    pub fn try_acquire(lock_path: &Path) -> io::Result<Option<Self>> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Record who holds the lease, for diagnostics.
    fn stamp(&mut self, holder: &str) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.write_all(holder.as_bytes())?;
        self.file.flush()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}

fn open_lock_file(lock_path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
}

/// Advisory lease backend.
///
/// `grant_full` takes an exclusive lock on `<path>/vcs.lock` and keeps it until
/// `deny_full`. A second opener, in this or another process, waits up to the
/// configured timeout and then fails.
#[derive(Debug)]
pub struct LeaseAccess {
    timeout: Duration,
    held: Mutex<HashMap<PathBuf, Lease>>,
}

impl LeaseAccess {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            held: Mutex::new(HashMap::new()),
        }
    }
}

impl AccessControl for LeaseAccess {
    fn grant_full(&self, principal: &str, path: &Path) -> io::Result<()> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.contains_key(path) {
            return Ok(());
        }
        let lock_path = path.join(LEASE_FILE);
        let mut lease = match Lease::try_acquire(&lock_path)? {
            Some(lease) => lease,
            None => {
                log::debug!("lease on {} is held, waiting", path.display());
                Lease::acquire_with_timeout(&lock_path, self.timeout)?
            }
        };
        lease.stamp(principal)?;
        held.insert(path.to_path_buf(), lease);
        Ok(())
    }

    fn deny_full(&self, _principal: &str, path: &Path) -> io::Result<()> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(path);
        Ok(())
    }

    fn state(&self, _principal: &str, path: &Path) -> io::Result<AccessState> {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(if held.contains_key(path) {
            AccessState::Open
        } else {
            AccessState::Closed
        })
    }
}

/// Permission-bit backend.
///
/// Clears or sets the owner write bit (the read-only flag off Unix). Mode bits
/// cannot express a single principal, so the toggle applies to the owner.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionAccess;

impl PermissionAccess {
    #[cfg(unix)]
    fn set_writable(path: &Path, writable: bool) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let mut permissions = fs::metadata(path)?.permissions();
        let mode = permissions.mode();
        let next = if writable { mode | 0o200 } else { mode & !0o200 };
        if next == mode {
            return Ok(());
        }
        permissions.set_mode(next);
        fs::set_permissions(path, permissions)
    }

    #[cfg(not(unix))]
    fn set_writable(path: &Path, writable: bool) -> io::Result<()> {
        let mut permissions = fs::metadata(path)?.permissions();
        if permissions.readonly() != writable {
            return Ok(());
        }
        permissions.set_readonly(!writable);
        fs::set_permissions(path, permissions)
    }

    #[cfg(unix)]
    fn is_writable(path: &Path) -> io::Result<bool> {
        use std::os::unix::fs::PermissionsExt;

        Ok(fs::metadata(path)?.permissions().mode() & 0o200 != 0)
    }

    #[cfg(not(unix))]
    fn is_writable(path: &Path) -> io::Result<bool> {
        Ok(!fs::metadata(path)?.permissions().readonly())
    }
}

impl AccessControl for PermissionAccess {
    fn grant_full(&self, _principal: &str, path: &Path) -> io::Result<()> {
        Self::set_writable(path, true)
    }

    fn deny_full(&self, _principal: &str, path: &Path) -> io::Result<()> {
        Self::set_writable(path, false)
    }

    fn state(&self, _principal: &str, path: &Path) -> io::Result<AccessState> {
        Ok(if Self::is_writable(path)? {
            AccessState::Open
        } else {
            AccessState::Closed
        })
    }
}
