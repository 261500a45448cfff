//! Local persistence abstraction.
//!
//! This module defines the [`LocalStore`] trait which abstracts over the
//! durable storage backends beneath the sync engine (SQLite on native, an
//! embedded browser store on web, in-memory for tests).
//!
//! The store covers three durable concerns:
//!
//! 1. **Document snapshots**: full serialized CRDT state per note, loaded
//!    on hydration and overwritten on every local change (offline-first
//!    durability does not depend on connectivity).
//! 2. **Offline update log**: document updates captured while disconnected,
//!    merge-replayed against the remote store on reconnect. Distinct from
//!    the mutation queue because these bytes are *merged*, never replayed
//!    as ordered CRUD.
//! 3. **Queue table**: the offline mutation queue's durable items, in FIFO
//!    order per identity.

mod memory;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteStore;

use uuid::Uuid;

use crate::error::Result;
use crate::types::QueueItem;

/// Trait for local durable storage backends.
///
/// Failures here are *fatal-local*: callers abort the affected operation
/// rather than degrading, since the engine cannot guarantee durability
/// without a working local substrate.
pub trait LocalStore: Send + Sync {
    // ==================== Document Snapshots ====================

    /// Load the persisted CRDT state for a note.
    ///
    /// Returns `None` if the note has never been persisted locally.
    fn load_doc(&self, note_id: Uuid) -> Result<Option<Vec<u8>>>;

    /// Overwrite the persisted CRDT state for a note.
    fn save_doc(&self, note_id: Uuid, state: &[u8]) -> Result<()>;

    /// Delete a note's persisted state and offline update log.
    fn delete_doc(&self, note_id: Uuid) -> Result<()>;

    // ==================== Offline Update Log ====================

    /// Append a document update captured while offline.
    fn append_offline_update(&self, note_id: Uuid, update: &[u8]) -> Result<()>;

    /// Remove and return all pending offline updates for a note, oldest
    /// first.
    fn take_offline_updates(&self, note_id: Uuid) -> Result<Vec<Vec<u8>>>;

    /// Number of pending offline updates for a note.
    fn offline_update_count(&self, note_id: Uuid) -> Result<usize>;

    // ==================== Mutation Queue ====================

    /// Durably record a queue item for an identity.
    fn insert_queue_item(&self, identity: Uuid, item: &QueueItem) -> Result<()>;

    /// All queued items for an identity in enqueue (FIFO) order.
    fn list_queue_items(&self, identity: Uuid) -> Result<Vec<QueueItem>>;

    /// Record a failed attempt: bump the retry count and store the error.
    fn update_queue_item(&self, id: Uuid, retry_count: u32, error: Option<&str>) -> Result<()>;

    /// Remove a single queue item (on success or permanent eviction).
    fn delete_queue_item(&self, id: Uuid) -> Result<()>;

    /// Discard all queued items for an identity (logout path).
    fn clear_queue_items(&self, identity: Uuid) -> Result<()>;

    /// Number of queued items for an identity.
    fn queue_len(&self, identity: Uuid) -> Result<usize>;
}
