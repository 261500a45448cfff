//! In-memory remote backend for tests and development.
//!
//! Implements [`RemoteBackend`] with shared in-process tables and a channel
//! hub that fans broadcasts out to the other subscribers of the same note
//! id. Supports deterministic failure injection for retry tests and counts
//! broadcasts per note so tests can assert the no-echo property.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use uuid::Uuid;

use super::{
    BoxFuture, ChannelPresenceCallback, ChannelUpdateCallback, PresenceEntry, RealtimeChannel,
    RemoteBackend, RemoteError, RemoteResult,
};
use crate::types::{FolderPatch, FolderRecord, NotePatch, NoteRecord};

#[derive(Default)]
struct Tables {
    notes: HashMap<Uuid, NoteRecord>,
    folders: HashMap<Uuid, FolderRecord>,
    snapshots: HashMap<Uuid, Vec<u8>>,
}

/// In-memory remote backend.
///
/// Clones share the same tables and channel hub, so two clones act as two
/// clients of the same service.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<RwLock<Tables>>,
    hub: Arc<ChannelHub>,
    pending_failures: Arc<Mutex<u32>>,
    pending_snapshot_failures: Arc<Mutex<u32>>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` mutating CRUD calls fail deterministically.
    ///
    /// Snapshot and channel operations are unaffected.
    pub fn fail_next_ops(&self, n: u32) {
        *self.pending_failures.lock().unwrap() = n;
    }

    fn take_injected_failure(&self) -> RemoteResult<()> {
        let mut pending = self.pending_failures.lock().unwrap();
        if *pending > 0 {
            *pending -= 1;
            return Err(RemoteError::Backend("injected failure".to_string()));
        }
        Ok(())
    }

    /// Make the next `n` snapshot fetch/save calls fail deterministically.
    ///
    /// CRUD and channel operations are unaffected.
    pub fn fail_next_snapshot_ops(&self, n: u32) {
        *self.pending_snapshot_failures.lock().unwrap() = n;
    }

    fn take_injected_snapshot_failure(&self) -> RemoteResult<()> {
        let mut pending = self.pending_snapshot_failures.lock().unwrap();
        if *pending > 0 {
            *pending -= 1;
            return Err(RemoteError::Backend(
                "injected snapshot failure".to_string(),
            ));
        }
        Ok(())
    }

    /// Current state of a note row, if present.
    pub fn note(&self, id: Uuid) -> Option<NoteRecord> {
        self.tables.read().unwrap().notes.get(&id).cloned()
    }

    /// Current state of a folder row, if present.
    pub fn folder(&self, id: Uuid) -> Option<FolderRecord> {
        self.tables.read().unwrap().folders.get(&id).cloned()
    }

    /// Latest stored snapshot bytes for a note, if present.
    pub fn snapshot(&self, note_id: Uuid) -> Option<Vec<u8>> {
        self.tables.read().unwrap().snapshots.get(&note_id).cloned()
    }

    /// Number of broadcasts published on a note's channel so far.
    pub fn broadcast_count(&self, note_id: Uuid) -> usize {
        self.hub.broadcast_count(note_id)
    }
}

impl RemoteBackend for MemoryBackend {
    fn insert_note<'a>(&'a self, note: &'a NoteRecord) -> BoxFuture<'a, RemoteResult<()>> {
        Box::pin(async move {
            self.take_injected_failure()?;
            // Idempotent insert: a retried create overwrites its own row
            let mut tables = self.tables.write().unwrap();
            tables.notes.insert(note.id, note.clone());
            Ok(())
        })
    }

    fn update_note<'a>(
        &'a self,
        id: Uuid,
        patch: &'a NotePatch,
    ) -> BoxFuture<'a, RemoteResult<()>> {
        Box::pin(async move {
            self.take_injected_failure()?;
            let mut tables = self.tables.write().unwrap();
            let note = tables.notes.get_mut(&id).ok_or(RemoteError::NotFound)?;
            if let Some(title) = &patch.title {
                note.title = title.clone();
            }
            if let Some(folder_id) = patch.folder_id {
                note.folder_id = Some(folder_id);
            }
            if let Some(deleted) = patch.deleted {
                note.deleted = deleted;
            }
            if let Some(updated_at) = patch.updated_at {
                note.updated_at = updated_at;
            }
            Ok(())
        })
    }

    fn soft_delete_note(&self, id: Uuid) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            self.take_injected_failure()?;
            let mut tables = self.tables.write().unwrap();
            let note = tables.notes.get_mut(&id).ok_or(RemoteError::NotFound)?;
            note.deleted = true;
            Ok(())
        })
    }

    fn insert_folder<'a>(&'a self, folder: &'a FolderRecord) -> BoxFuture<'a, RemoteResult<()>> {
        Box::pin(async move {
            self.take_injected_failure()?;
            let mut tables = self.tables.write().unwrap();
            tables.folders.insert(folder.id, folder.clone());
            Ok(())
        })
    }

    fn update_folder<'a>(
        &'a self,
        id: Uuid,
        patch: &'a FolderPatch,
    ) -> BoxFuture<'a, RemoteResult<()>> {
        Box::pin(async move {
            self.take_injected_failure()?;
            let mut tables = self.tables.write().unwrap();
            let folder = tables.folders.get_mut(&id).ok_or(RemoteError::NotFound)?;
            if let Some(name) = &patch.name {
                folder.name = name.clone();
            }
            if let Some(parent_id) = patch.parent_id {
                folder.parent_id = Some(parent_id);
            }
            Ok(())
        })
    }

    fn delete_folder(&self, id: Uuid) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            self.take_injected_failure()?;
            let mut tables = self.tables.write().unwrap();
            tables
                .folders
                .remove(&id)
                .map(|_| ())
                .ok_or(RemoteError::NotFound)
        })
    }

    fn fetch_snapshot(&self, note_id: Uuid) -> BoxFuture<'_, RemoteResult<Option<Vec<u8>>>> {
        Box::pin(async move {
            self.take_injected_snapshot_failure()?;
            let tables = self.tables.read().unwrap();
            Ok(tables.snapshots.get(&note_id).cloned())
        })
    }

    fn save_snapshot<'a>(
        &'a self,
        note_id: Uuid,
        state: &'a [u8],
    ) -> BoxFuture<'a, RemoteResult<()>> {
        Box::pin(async move {
            self.take_injected_snapshot_failure()?;
            let mut tables = self.tables.write().unwrap();
            tables.snapshots.insert(note_id, state.to_vec());
            Ok(())
        })
    }

    fn open_channel(&self, note_id: Uuid) -> Box<dyn RealtimeChannel> {
        let state = Arc::new(ChannelState {
            note_id,
            on_update: Mutex::new(None),
            on_presence: Mutex::new(None),
            presence: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.hub.register(Arc::clone(&state));
        Box::new(MemoryChannel {
            state,
            hub: Arc::clone(&self.hub),
        })
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read().unwrap();
        f.debug_struct("MemoryBackend")
            .field("notes", &tables.notes.len())
            .field("folders", &tables.folders.len())
            .field("snapshots", &tables.snapshots.len())
            .finish_non_exhaustive()
    }
}

struct ChannelState {
    note_id: Uuid,
    on_update: Mutex<Option<ChannelUpdateCallback>>,
    on_presence: Mutex<Option<ChannelPresenceCallback>>,
    presence: Mutex<Option<PresenceEntry>>,
    closed: AtomicBool,
}

#[derive(Default)]
struct ChannelHub {
    subscribers: Mutex<HashMap<Uuid, Vec<Arc<ChannelState>>>>,
    broadcast_counts: Mutex<HashMap<Uuid, usize>>,
}

impl ChannelHub {
    fn register(&self, state: Arc<ChannelState>) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.entry(state.note_id).or_default().push(state);
    }

    fn remove(&self, state: &Arc<ChannelState>) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(peers) = subscribers.get_mut(&state.note_id) {
            peers.retain(|peer| !Arc::ptr_eq(peer, state));
        }
    }

    /// Subscribers of a note other than `from`, snapshotted so callbacks
    /// run without the hub lock held.
    fn peers_of(&self, note_id: Uuid, from: &Arc<ChannelState>) -> Vec<Arc<ChannelState>> {
        let subscribers = self.subscribers.lock().unwrap();
        subscribers
            .get(&note_id)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|peer| !Arc::ptr_eq(peer, from))
                    .filter(|peer| !peer.closed.load(Ordering::SeqCst))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn broadcast(&self, from: &Arc<ChannelState>, sender: Uuid, payload: &[u8]) {
        {
            let mut counts = self.broadcast_counts.lock().unwrap();
            *counts.entry(from.note_id).or_default() += 1;
        }
        for peer in self.peers_of(from.note_id, from) {
            let callback = peer.on_update.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(sender, payload);
            }
        }
    }

    fn broadcast_count(&self, note_id: Uuid) -> usize {
        *self
            .broadcast_counts
            .lock()
            .unwrap()
            .get(&note_id)
            .unwrap_or(&0)
    }

    /// Recompute the presence set for a note and notify every subscriber.
    fn sync_presence(&self, note_id: Uuid) {
        let (entries, targets) = {
            let subscribers = self.subscribers.lock().unwrap();
            let peers = subscribers.get(&note_id).cloned().unwrap_or_default();
            let entries: Vec<PresenceEntry> = peers
                .iter()
                .filter(|peer| !peer.closed.load(Ordering::SeqCst))
                .filter_map(|peer| peer.presence.lock().unwrap().clone())
                .collect();
            let targets: Vec<ChannelPresenceCallback> = peers
                .iter()
                .filter(|peer| !peer.closed.load(Ordering::SeqCst))
                .filter_map(|peer| peer.on_presence.lock().unwrap().clone())
                .collect();
            (entries, targets)
        };
        for callback in targets {
            callback(entries.clone());
        }
    }
}

struct MemoryChannel {
    state: Arc<ChannelState>,
    hub: Arc<ChannelHub>,
}

impl RealtimeChannel for MemoryChannel {
    fn broadcast<'a>(&'a self, sender: Uuid, payload: &'a [u8]) -> BoxFuture<'a, RemoteResult<()>> {
        Box::pin(async move {
            if self.state.closed.load(Ordering::SeqCst) {
                return Err(RemoteError::Backend("channel closed".to_string()));
            }
            self.hub.broadcast(&self.state, sender, payload);
            Ok(())
        })
    }

    fn on_update(&self, callback: ChannelUpdateCallback) {
        *self.state.on_update.lock().unwrap() = Some(callback);
    }

    fn on_presence(&self, callback: ChannelPresenceCallback) {
        *self.state.on_presence.lock().unwrap() = Some(callback);
    }

    fn track(&self, entry: PresenceEntry) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            if self.state.closed.load(Ordering::SeqCst) {
                return Err(RemoteError::Backend("channel closed".to_string()));
            }
            *self.state.presence.lock().unwrap() = Some(entry);
            self.hub.sync_presence(self.state.note_id);
            Ok(())
        })
    }

    fn close(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.presence.lock().unwrap() = None;
        self.hub.remove(&self.state);
        self.hub.sync_presence(self.state.note_id);
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_note_crud() {
        let backend = MemoryBackend::new();
        let note = NoteRecord::new("First note");

        backend.insert_note(&note).await.unwrap();
        assert_eq!(backend.note(note.id).unwrap().title, "First note");

        let patch = NotePatch {
            title: Some("Renamed".to_string()),
            ..Default::default()
        };
        backend.update_note(note.id, &patch).await.unwrap();
        assert_eq!(backend.note(note.id).unwrap().title, "Renamed");

        backend.soft_delete_note(note.id).await.unwrap();
        // Soft delete keeps the row
        assert!(backend.note(note.id).unwrap().deleted);
    }

    #[tokio::test]
    async fn test_folder_delete_is_hard() {
        let backend = MemoryBackend::new();
        let folder = FolderRecord::new("Archive");

        backend.insert_folder(&folder).await.unwrap();
        backend.delete_folder(folder.id).await.unwrap();
        assert!(backend.folder(folder.id).is_none());

        assert_eq!(
            backend.delete_folder(folder.id).await,
            Err(RemoteError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_update_missing_note_is_not_found() {
        let backend = MemoryBackend::new();
        let result = backend
            .update_note(Uuid::new_v4(), &NotePatch::default())
            .await;
        assert_eq!(result, Err(RemoteError::NotFound));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let backend = MemoryBackend::new();
        let note_id = Uuid::new_v4();

        assert_eq!(backend.fetch_snapshot(note_id).await.unwrap(), None);

        backend.save_snapshot(note_id, b"snapshot").await.unwrap();
        assert_eq!(
            backend.fetch_snapshot(note_id).await.unwrap(),
            Some(b"snapshot".to_vec())
        );
    }

    #[tokio::test]
    async fn test_failure_injection_is_bounded() {
        let backend = MemoryBackend::new();
        let note = NoteRecord::new("flaky");
        backend.fail_next_ops(2);

        assert!(backend.insert_note(&note).await.is_err());
        assert!(backend.insert_note(&note).await.is_err());
        assert!(backend.insert_note(&note).await.is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_other_subscribers_only() {
        let backend = MemoryBackend::new();
        let note_id = Uuid::new_v4();

        let alice = backend.open_channel(note_id);
        let bob = backend.open_channel(note_id);

        let alice_received = Arc::new(AtomicUsize::new(0));
        let bob_received = Arc::new(AtomicUsize::new(0));

        let alice_count = Arc::clone(&alice_received);
        alice.on_update(Arc::new(move |_, _| {
            alice_count.fetch_add(1, Ordering::SeqCst);
        }));
        let bob_count = Arc::clone(&bob_received);
        bob.on_update(Arc::new(move |_, _| {
            bob_count.fetch_add(1, Ordering::SeqCst);
        }));

        alice.broadcast(Uuid::new_v4(), b"payload").await.unwrap();

        assert_eq!(alice_received.load(Ordering::SeqCst), 0);
        assert_eq!(bob_received.load(Ordering::SeqCst), 1);
        assert_eq!(backend.broadcast_count(note_id), 1);
    }

    #[tokio::test]
    async fn test_presence_appears_and_disappears() {
        let backend = MemoryBackend::new();
        let note_id = Uuid::new_v4();

        let alice = backend.open_channel(note_id);
        let bob = backend.open_channel(note_id);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        alice.on_presence(Arc::new(move |entries| {
            seen_clone.lock().unwrap().push(entries.len());
        }));

        bob.track(PresenceEntry {
            id: Uuid::new_v4(),
            name: "Bob".to_string(),
            color: "#ff0000".to_string(),
        })
        .await
        .unwrap();

        bob.close();

        let seen = seen.lock().unwrap();
        // One sync with Bob present, one after his subscription dropped
        assert_eq!(*seen, vec![1, 0]);
    }

    #[tokio::test]
    async fn test_closed_channel_stops_receiving() {
        let backend = MemoryBackend::new();
        let note_id = Uuid::new_v4();

        let alice = backend.open_channel(note_id);
        let bob = backend.open_channel(note_id);

        let received = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&received);
        bob.on_update(Arc::new(move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
        }));

        bob.close();
        alice.broadcast(Uuid::new_v4(), b"late").await.unwrap();

        assert_eq!(received.load(Ordering::SeqCst), 0);
    }
}
