//! Core types for CRDT-based synchronization.
//!
//! This module defines the data structures shared by the replication
//! provider and the offline mutation queue: origin tags, sync state,
//! collaborator presence, note/folder records, and durable queue items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Origin of a CRDT update, used to prevent re-broadcast loops.
///
/// An update applied with a non-[`Local`](UpdateOrigin::Local) origin must
/// never be broadcast back to the channel it arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOrigin {
    /// Update originated from a local user edit
    Local,

    /// Update received from a remote peer or the remote snapshot store
    Remote,

    /// Update re-applied from the local offline log or a hydration pass
    Replay,
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote => write!(f, "remote"),
            UpdateOrigin::Replay => write!(f, "replay"),
        }
    }
}

impl std::str::FromStr for UpdateOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(UpdateOrigin::Local),
            "remote" => Ok(UpdateOrigin::Remote),
            "replay" => Ok(UpdateOrigin::Replay),
            _ => Err(format!("Unknown update origin: {}", s)),
        }
    }
}

/// Per-provider sync status, read by the UI layer.
///
/// Mutated only by the owning [`ReplicationProvider`](crate::provider::ReplicationProvider).
/// Never persisted; recomputed each session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncState {
    /// True once the local document has been pushed to the remote store.
    pub synced: bool,

    /// True while a fetch/merge or snapshot push is in flight.
    pub syncing: bool,

    /// Last recoverable remote failure, if any. Cleared on the next
    /// successful sync.
    pub error: Option<String>,

    /// Timestamp of the last successful remote sync.
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// A collaborator currently subscribed to a note's realtime channel.
///
/// Ephemeral: derived from presence sync events and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    /// Identity id of the collaborator
    pub id: Uuid,

    /// Display name
    pub name: String,

    /// Cursor color assigned to this identity (CSS color string)
    pub color: String,
}

/// A row in the remote `notes` collection.
///
/// Note *content* never travels through these records; content lives in the
/// per-note CRDT document and its binary snapshot column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    /// Stable note id
    pub id: Uuid,

    /// Display title
    pub title: String,

    /// Containing folder, or None for root notes
    pub folder_id: Option<Uuid>,

    /// Soft deletion tombstone
    #[serde(default)]
    pub deleted: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

impl NoteRecord {
    /// Create a new note record with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            folder_id: None,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update for a note row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotePatch {
    /// New title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// New containing folder
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<Uuid>,

    /// New tombstone state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,

    /// New modification timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A row in the remote `folders` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderRecord {
    /// Stable folder id
    pub id: Uuid,

    /// Display name
    pub name: String,

    /// Parent folder, or None for root folders
    pub parent_id: Option<Uuid>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl FolderRecord {
    /// Create a new root folder with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            parent_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Partial update for a folder row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FolderPatch {
    /// New name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// New parent folder
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
}

/// Which remote collection a queue item targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// The `notes` collection
    Note,

    /// The `folders` collection
    Folder,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Note => write!(f, "note"),
            EntityKind::Folder => write!(f, "folder"),
        }
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note" => Ok(EntityKind::Note),
            "folder" => Ok(EntityKind::Folder),
            _ => Err(format!("Unknown entity kind: {}", s)),
        }
    }
}

/// Which remote CRUD operation a queue item performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOperation {
    /// Insert a new row
    Create,

    /// Patch an existing row by id
    Update,

    /// Delete a row (soft delete for notes, hard delete for folders)
    Delete,
}

impl std::fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueOperation::Create => write!(f, "create"),
            QueueOperation::Update => write!(f, "update"),
            QueueOperation::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for QueueOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(QueueOperation::Create),
            "update" => Ok(QueueOperation::Update),
            "delete" => Ok(QueueOperation::Delete),
            _ => Err(format!("Unknown queue operation: {}", s)),
        }
    }
}

/// A durably recorded structural mutation awaiting remote application.
///
/// The payload stays untyped JSON in the durable row (so the schema matches
/// across platforms) and is decoded into the concrete record/patch type for
/// its `(entity_type, operation)` combination at the drain boundary.
///
/// Items are owned exclusively by the queue once enqueued: `retry_count`
/// only increases, and an item is removed exactly once, either on success
/// or on exceeding the retry ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique item id
    pub id: Uuid,

    /// Target collection
    #[serde(rename = "entity_type")]
    pub entity: EntityKind,

    /// Target row id
    pub entity_id: Uuid,

    /// CRUD operation to perform
    pub operation: QueueOperation,

    /// Operation payload (record for create, patch for update, ignored for delete)
    pub payload: serde_json::Value,

    /// When the item was enqueued
    pub created_at: DateTime<Utc>,

    /// Number of failed remote attempts so far
    pub retry_count: u32,

    /// Error string from the most recent failed attempt
    pub error: Option<String>,
}

impl QueueItem {
    /// Create a fresh queue item with `retry_count = 0`.
    pub fn new(
        entity: EntityKind,
        entity_id: Uuid,
        operation: QueueOperation,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity,
            entity_id,
            operation,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_origin_display() {
        assert_eq!(UpdateOrigin::Local.to_string(), "local");
        assert_eq!(UpdateOrigin::Remote.to_string(), "remote");
        assert_eq!(UpdateOrigin::Replay.to_string(), "replay");
    }

    #[test]
    fn test_update_origin_from_str() {
        assert_eq!(
            "local".parse::<UpdateOrigin>().unwrap(),
            UpdateOrigin::Local
        );
        assert_eq!(
            "replay".parse::<UpdateOrigin>().unwrap(),
            UpdateOrigin::Replay
        );
        assert!("invalid".parse::<UpdateOrigin>().is_err());
    }

    #[test]
    fn test_sync_state_default() {
        let state = SyncState::default();
        assert!(!state.synced);
        assert!(!state.syncing);
        assert!(state.error.is_none());
        assert!(state.last_sync_at.is_none());
    }

    #[test]
    fn test_entity_kind_round_trip() {
        assert_eq!("note".parse::<EntityKind>().unwrap(), EntityKind::Note);
        assert_eq!("folder".parse::<EntityKind>().unwrap(), EntityKind::Folder);
        assert_eq!(EntityKind::Note.to_string(), "note");
        assert!("workspace".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_queue_item_serde_schema() {
        let item = QueueItem::new(
            EntityKind::Note,
            Uuid::new_v4(),
            QueueOperation::Create,
            serde_json::json!({"title": "Hello"}),
        );

        let json = serde_json::to_value(&item).unwrap();
        // Persisted field names are part of the cross-platform schema
        assert!(json.get("entity_type").is_some());
        assert!(json.get("entity_id").is_some());
        assert!(json.get("retry_count").is_some());
        assert_eq!(json["entity_type"], "note");
        assert_eq!(json["operation"], "create");

        let back: QueueItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_note_patch_skips_unset_fields() {
        let patch = NotePatch {
            title: Some("Renamed".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["title"], "Renamed");
        assert!(json.get("deleted").is_none());
        assert!(json.get("folder_id").is_none());
    }
}
