//! Remote backend abstraction.
//!
//! The engine talks to the remote service through two object-safe traits:
//! [`RemoteBackend`] for row-level CRUD over the `notes` and `folders`
//! collections plus binary snapshot storage, and [`RealtimeChannel`] for
//! the per-note broadcast/presence channel.
//!
//! ## Object safety
//!
//! Both traits are designed to be used behind `dyn` (the platform shells
//! supply HTTP/WebSocket implementations), so all async methods return
//! boxed futures.

mod memory;

pub use memory::MemoryBackend;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::types::{FolderPatch, FolderRecord, NotePatch, NoteRecord};

/// A boxed future for object-safe async methods.
///
/// On native targets, futures are `Send` for compatibility with
/// multi-threaded runtimes.
#[cfg(not(target_arch = "wasm32"))]
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed future for object-safe async methods.
///
/// WASM version without `Send` requirement - JavaScript is single-threaded.
#[cfg(target_arch = "wasm32")]
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Remote failure classification.
///
/// All variants are *recoverable-remote*: they are recorded into sync
/// state or queue retries, never propagated as crate errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The addressed row does not exist.
    #[error("not found")]
    NotFound,

    /// The backend is unreachable.
    #[error("backend unreachable")]
    Offline,

    /// Any other backend-side failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Presence metadata tracked on a realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    /// Identity id of the subscriber
    pub id: Uuid,

    /// Display name
    pub name: String,

    /// Cursor color (CSS color string)
    pub color: String,
}

/// Callback for incoming broadcast payloads: `(sender identity, payload)`.
pub type ChannelUpdateCallback = Arc<dyn Fn(Uuid, &[u8]) + Send + Sync>;

/// Callback for presence sync events carrying the full subscriber set.
pub type ChannelPresenceCallback = Arc<dyn Fn(Vec<PresenceEntry>) + Send + Sync>;

/// A per-note realtime broadcast channel with presence.
pub trait RealtimeChannel: Send + Sync {
    /// Publish an opaque binary payload to all other subscribers.
    ///
    /// The sender id lets receivers ignore their own echo.
    fn broadcast<'a>(&'a self, sender: Uuid, payload: &'a [u8]) -> BoxFuture<'a, RemoteResult<()>>;

    /// Register the handler for incoming broadcast payloads.
    fn on_update(&self, callback: ChannelUpdateCallback);

    /// Register the handler for presence sync events.
    fn on_presence(&self, callback: ChannelPresenceCallback);

    /// Announce the local identity's presence on this channel.
    fn track(&self, entry: PresenceEntry) -> BoxFuture<'_, RemoteResult<()>>;

    /// Release the subscription. Subsequent broadcasts are not delivered.
    fn close(&self);
}

/// The remote durable store and realtime service.
pub trait RemoteBackend: Send + Sync {
    /// Insert a note row.
    fn insert_note<'a>(&'a self, note: &'a NoteRecord) -> BoxFuture<'a, RemoteResult<()>>;

    /// Patch a note row by id.
    fn update_note<'a>(
        &'a self,
        id: Uuid,
        patch: &'a NotePatch,
    ) -> BoxFuture<'a, RemoteResult<()>>;

    /// Mark a note row deleted (soft delete; the row remains).
    fn soft_delete_note(&self, id: Uuid) -> BoxFuture<'_, RemoteResult<()>>;

    /// Insert a folder row.
    fn insert_folder<'a>(&'a self, folder: &'a FolderRecord) -> BoxFuture<'a, RemoteResult<()>>;

    /// Patch a folder row by id.
    fn update_folder<'a>(
        &'a self,
        id: Uuid,
        patch: &'a FolderPatch,
    ) -> BoxFuture<'a, RemoteResult<()>>;

    /// Remove a folder row (hard delete).
    fn delete_folder(&self, id: Uuid) -> BoxFuture<'_, RemoteResult<()>>;

    /// Fetch the latest durable CRDT snapshot for a note.
    ///
    /// Returns `Ok(None)` when no snapshot has been stored yet; that case
    /// must stay distinguishable from transport failures.
    fn fetch_snapshot(&self, note_id: Uuid) -> BoxFuture<'_, RemoteResult<Option<Vec<u8>>>>;

    /// Store a full CRDT snapshot for a note.
    fn save_snapshot<'a>(
        &'a self,
        note_id: Uuid,
        state: &'a [u8],
    ) -> BoxFuture<'a, RemoteResult<()>>;

    /// Open the realtime channel scoped to a note id.
    fn open_channel(&self, note_id: Uuid) -> Box<dyn RealtimeChannel>;
}
