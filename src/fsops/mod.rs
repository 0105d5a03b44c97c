//! Filesystem collaborators: file store, fingerprints, access control.

mod access;
mod file_store;
mod fingerprint;

pub use access::{AccessControl, LEASE_FILE, Lease, LeaseAccess, PermissionAccess};
pub use file_store::{FileStore, LocalFileStore};
pub use fingerprint::{ContentFingerprint, Sha256Fingerprint, digest_hex};
