//! Persistence interfaces for results, queue items and configurations.
//!
//! Plain-record stores behind traits so the scheduler is indifferent to the
//! backing storage. Two implementations: an in-memory store for tests and
//! ephemeral runs, and an embedded SQLite store for durable deployments.

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::RecognitionError;
use crate::model::{EngineKind, QueueItem, RecognitionConfig, RecognitionResult};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage for per-engine recognition results, keyed on (document, engine).
pub trait ResultStore: Send + Sync {
    /// Insert or replace the result for (document, engine). Upserts are
    /// serialized by the store, so concurrent retries cannot interleave
    /// partial writes.
    fn upsert(&self, result: &RecognitionResult) -> Result<(), RecognitionError>;

    fn get(
        &self,
        document_id: &str,
        engine: EngineKind,
    ) -> Result<Option<RecognitionResult>, RecognitionError>;

    fn for_document(&self, document_id: &str) -> Result<Vec<RecognitionResult>, RecognitionError>;

    /// Remove failed results last updated before the cutoff. Returns the
    /// number of rows removed.
    fn sweep_failed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RecognitionError>;
}

/// Storage for queue items. Terminal items are immutable: updates that would
/// move an item out of a terminal status are silently dropped.
pub trait QueueStore: Send + Sync {
    fn insert(&self, item: &QueueItem) -> Result<(), RecognitionError>;

    fn update(&self, item: &QueueItem) -> Result<(), RecognitionError>;

    fn get(&self, id: Uuid) -> Result<Option<QueueItem>, RecognitionError>;

    fn for_document(&self, document_id: &str) -> Result<Vec<QueueItem>, RecognitionError>;

    /// Atomically claim up to `limit` dispatchable items: queued, due, in
    /// (priority desc, created asc) order. Claimed items are flipped to
    /// processing with their start time recorded.
    fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, RecognitionError>;

    /// Atomically claim one specific item if it is still queued. Used for
    /// synchronous-eager dispatch of urgent requests.
    fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<QueueItem>, RecognitionError>;

    /// Remove terminal items completed before the cutoff.
    fn sweep_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RecognitionError>;
}

/// Storage for recognition configurations with the singleton-active
/// invariant enforced on write.
pub trait ConfigStore: Send + Sync {
    fn insert(&self, config: &RecognitionConfig) -> Result<(), RecognitionError>;

    fn list(&self) -> Result<Vec<RecognitionConfig>, RecognitionError>;

    fn get(&self, id: &str) -> Result<Option<RecognitionConfig>, RecognitionError>;

    fn active(&self) -> Result<Option<RecognitionConfig>, RecognitionError>;

    /// Mark one configuration active, deactivating all others in the same
    /// write.
    fn activate(&self, id: &str) -> Result<RecognitionConfig, RecognitionError>;
}

/// Claim transition shared by both store implementations.
pub(crate) fn claim_item(item: &mut QueueItem, now: DateTime<Utc>) {
    item.status = crate::model::QueueStatus::Processing;
    item.started_at = Some(now);
}
