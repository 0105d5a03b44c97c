//! Per-item outcome manifests for batch operations.
//!
//! Staging and cloning process unbounded file sets and are explicitly
//! non-atomic. Instead of collapsing a batch into a single boolean, every item
//! gets an `Outcome`, and the whole set is returned as a `Manifest`.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Result of processing a single batch item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed(String),
    /// Never attempted (cancelled or past the batch deadline).
    Skipped,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Whether the item was attempted at all, successfully or not.
    pub fn attempted(&self) -> bool {
        !matches!(self, Outcome::Skipped)
    }
}

/// One entry in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestItem {
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub outcome: Outcome,
}

/// Ordered collection of per-item outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    items: Vec<ManifestItem>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: ManifestItem) {
        self.items.push(item);
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = ManifestItem>) {
        self.items.extend(items);
    }

    pub fn items(&self) -> &[ManifestItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &ManifestItem> {
        self.items.iter().filter(|item| item.outcome.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ManifestItem> {
        self.items
            .iter()
            .filter(|item| matches!(item.outcome, Outcome::Failed(_)))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &ManifestItem> {
        self.items
            .iter()
            .filter(|item| matches!(item.outcome, Outcome::Skipped))
    }

    /// True when every item succeeded (an empty manifest is complete).
    pub fn is_complete(&self) -> bool {
        self.items.iter().all(|item| item.outcome.is_success())
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} items: {} succeeded, {} failed, {} skipped",
            self.items.len(),
            self.succeeded().count(),
            self.failed().count(),
            self.skipped().count()
        )
    }
}

/// Cooperative cancellation flag shared between a caller and a batch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Point in time after which a batch stops starting new items.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Combined stop condition checked before each batch item starts.
#[derive(Debug, Clone)]
pub(crate) struct BatchGuard {
    pub cancel: CancelToken,
    pub deadline: Deadline,
}

impl BatchGuard {
    pub fn new(cancel: CancelToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Deadline::after(timeout),
        }
    }

    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.expired()
    }
}
