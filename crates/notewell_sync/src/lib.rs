#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Error (common error types)
pub mod error;

/// Core types shared by both sync subsystems
pub mod types;

/// Per-note CRDT document
pub mod doc;

/// Network connectivity monitor abstraction
pub mod network;

/// Document replication provider (live CRDT sync)
pub mod provider;

/// Offline mutation queue for structural metadata operations
pub mod queue;

/// Remote backend abstraction (row CRUD, snapshots, realtime channels)
pub mod remote;

/// Local persistence abstraction (snapshots, offline updates, queue table)
pub mod store;

pub use doc::NoteDoc;
pub use error::{Result, SyncError};
pub use network::{MonitorSubscription, NetworkMonitor, ToggleMonitor};
pub use provider::{ProviderConfig, ReplicationProvider};
pub use queue::{DrainFailure, DrainReport, MutationQueue, QueueRegistry, MAX_RETRIES};
pub use remote::{
    BoxFuture, MemoryBackend, PresenceEntry, RealtimeChannel, RemoteBackend, RemoteError,
    RemoteResult,
};
pub use store::{LocalStore, MemoryStore};
#[cfg(not(target_arch = "wasm32"))]
pub use store::SqliteStore;
pub use types::{
    Collaborator, EntityKind, FolderPatch, FolderRecord, NotePatch, NoteRecord, QueueItem,
    QueueOperation, SyncState, UpdateOrigin,
};
