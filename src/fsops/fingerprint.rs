//! Content fingerprints for equality testing.
//!
//! Digests are compared, never trusted: they detect accidental divergence
//! between two copies, not tampering.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Computes a fixed-size digest of a file's contents.
pub trait ContentFingerprint: Send + Sync {
    fn digest(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// SHA-256 over the full file contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Fingerprint;

impl ContentFingerprint for Sha256Fingerprint {
    fn digest(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().to_vec())
    }
}

/// Hex digest of a file, for log messages.
pub fn digest_hex(fingerprint: &dyn ContentFingerprint, path: &Path) -> io::Result<String> {
    fingerprint.digest(path).map(hex::encode)
}
