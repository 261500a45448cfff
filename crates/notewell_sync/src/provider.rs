//! Document replication provider.
//!
//! A [`ReplicationProvider`] owns the live sync session for one open note:
//! it hydrates the note's [`NoteDoc`] from local storage, persists every
//! update locally, and - while online - broadcasts debounced document
//! state over the note's realtime channel, pushes periodic snapshots to
//! the remote store, and tracks collaborator presence.
//!
//! ## Offline-first
//!
//! Local persistence is unconditional: edits always land in the
//! [`LocalStore`] before any remote work is attempted. While offline the
//! provider additionally appends each incremental update to a durable
//! offline log; on reconnect the log is replayed into the document (a
//! no-op merge if the state already contains it), the remote snapshot is
//! merged in, and the combined state is pushed back out.
//!
//! ## Loop prevention
//!
//! Updates are tagged with an [`UpdateOrigin`] as they are applied. Only
//! `Local` updates schedule a broadcast; `Remote` and `Replay` updates are
//! persisted (or not) and never re-broadcast. On the wire, every broadcast
//! carries the sender's identity id so receivers can drop their own echo.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::doc::NoteDoc;
use crate::error::Result;
use crate::network::{MonitorSubscription, NetworkMonitor};
use crate::remote::{PresenceEntry, RealtimeChannel, RemoteBackend};
use crate::store::LocalStore;
use crate::types::{Collaborator, SyncState, UpdateOrigin};

/// Callback fired with the current collaborator set on every presence change.
pub type AwarenessCallback = Arc<dyn Fn(Vec<Collaborator>) + Send + Sync>;

/// Callback fired with a snapshot of [`SyncState`] after every change.
pub type SyncStateCallback = Arc<dyn Fn(SyncState) + Send + Sync>;

/// Tunables for a replication provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Quiet period after the last local edit before pending state is
    /// broadcast and snapshotted.
    pub debounce: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
        }
    }
}

struct ProviderInner {
    note_id: Uuid,
    identity: Collaborator,
    doc: Arc<NoteDoc>,
    store: Arc<dyn LocalStore>,
    backend: Arc<dyn RemoteBackend>,
    monitor: Arc<dyn NetworkMonitor>,
    config: ProviderConfig,
    state: Mutex<SyncState>,
    channel: Mutex<Option<Arc<dyn RealtimeChannel>>>,
    collaborators: Mutex<Vec<Collaborator>>,
    awareness_cb: Mutex<Option<AwarenessCallback>>,
    state_cb: Mutex<Option<SyncStateCallback>>,
    subscription: Mutex<Option<MonitorSubscription>>,
    runtime: Mutex<Option<tokio::runtime::Handle>>,
    /// Set when local edits have not yet reached the remote store.
    dirty: AtomicBool,
    /// Bumped on every local edit; a debounce task only flushes if it still
    /// holds the latest generation when its timer fires.
    flush_generation: AtomicU64,
    connected: AtomicBool,
    destroyed: AtomicBool,
}

/// Live synchronization session for a single note.
///
/// Create one per open note and [`connect`](ReplicationProvider::connect)
/// it; edit through the shared [`NoteDoc`] returned by
/// [`doc`](ReplicationProvider::doc); call
/// [`destroy`](ReplicationProvider::destroy) when the note closes.
pub struct ReplicationProvider {
    inner: Arc<ProviderInner>,
}

impl ReplicationProvider {
    /// Create a provider for the given note. Does no I/O until
    /// [`connect`](ReplicationProvider::connect).
    pub fn new(
        note_id: Uuid,
        identity: Collaborator,
        store: Arc<dyn LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        monitor: Arc<dyn NetworkMonitor>,
        config: ProviderConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                note_id,
                identity,
                doc: Arc::new(NoteDoc::new(note_id)),
                store,
                backend,
                monitor,
                config,
                state: Mutex::new(SyncState::default()),
                channel: Mutex::new(None),
                collaborators: Mutex::new(Vec::new()),
                awareness_cb: Mutex::new(None),
                state_cb: Mutex::new(None),
                subscription: Mutex::new(None),
                runtime: Mutex::new(None),
                dirty: AtomicBool::new(false),
                flush_generation: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// The note this provider replicates.
    pub fn note_id(&self) -> Uuid {
        self.inner.note_id
    }

    /// The document handle. Edits made through it are picked up by the
    /// provider once connected.
    pub fn doc(&self) -> Arc<NoteDoc> {
        Arc::clone(&self.inner.doc)
    }

    /// Snapshot of the current sync status.
    pub fn sync_state(&self) -> SyncState {
        self.inner.state.lock().unwrap().clone()
    }

    /// Collaborators currently present on this note's channel, excluding
    /// the local identity.
    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.inner.collaborators.lock().unwrap().clone()
    }

    /// Register the presence change callback. At most one is registered.
    pub fn on_awareness_change(&self, callback: AwarenessCallback) {
        *self.inner.awareness_cb.lock().unwrap() = Some(callback);
    }

    /// Register the sync state change callback. At most one is registered.
    pub fn on_state_change(&self, callback: SyncStateCallback) {
        *self.inner.state_cb.lock().unwrap() = Some(callback);
    }

    /// Whether [`destroy`](ReplicationProvider::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Start the session.
    ///
    /// Hydrates the document from local storage (works fully offline),
    /// hooks document updates, and subscribes to connectivity transitions.
    /// If currently online, also performs the initial remote sync: snapshot
    /// fetch/merge, offline log replay, channel setup, and a push of the
    /// combined state.
    ///
    /// Only local storage failures are returned; remote failures are
    /// recorded into [`SyncState::error`]. A failed `connect` leaves the
    /// provider disconnected and may be retried. Calling `connect` twice,
    /// or after [`destroy`](ReplicationProvider::destroy), is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) || inner.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        *inner.runtime.lock().unwrap() = tokio::runtime::Handle::try_current().ok();

        if let Err(e) = inner.doc.hydrate(inner.store.as_ref()) {
            // Session never started; let the caller retry connect()
            inner.connected.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let weak = Arc::downgrade(inner);
        inner.doc.set_update_hook(Arc::new(move |update, origin| {
            if let Some(inner) = weak.upgrade() {
                inner.on_doc_update(update, origin);
            }
        }));

        let weak = Arc::downgrade(inner);
        let subscription = inner.monitor.subscribe(Arc::new(move |online| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if online {
                let handle = inner.runtime.lock().unwrap().clone();
                if let Some(handle) = handle {
                    handle.spawn(async move { inner.go_online().await });
                }
            } else {
                inner.go_offline();
            }
        }));
        *inner.subscription.lock().unwrap() = Some(subscription);

        if inner.monitor.is_online() {
            Arc::clone(inner).go_online().await;
        }

        Ok(())
    }

    /// Push pending local state immediately, bypassing the debounce window.
    pub async fn flush(&self) {
        self.inner.flush_now().await;
    }

    /// End the session: push pending state if online, release the channel
    /// and the connectivity subscription. Idempotent; the provider ignores
    /// further document updates afterwards.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("[Provider] Destroying session for note {}", inner.note_id);

        if inner.monitor.is_online() {
            inner.flush_now().await;
        }

        if let Some(channel) = inner.channel.lock().unwrap().take() {
            channel.close();
        }
        if let Some(subscription) = inner.subscription.lock().unwrap().take() {
            subscription.unsubscribe();
        }
        inner.collaborators.lock().unwrap().clear();
    }
}

impl ProviderInner {
    fn set_state(&self, mutate: impl FnOnce(&mut SyncState)) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            mutate(&mut state);
            state.clone()
        };
        let callback = self.state_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(snapshot);
        }
    }

    fn on_doc_update(self: Arc<Self>, update: &[u8], origin: UpdateOrigin) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        match origin {
            UpdateOrigin::Local => {
                self.persist_doc();
                if !self.monitor.is_online()
                    && let Err(e) = self.store.append_offline_update(self.note_id, update)
                {
                    log::error!(
                        "[Provider] Failed to record offline update for {}: {}",
                        self.note_id,
                        e
                    );
                }
                self.dirty.store(true, Ordering::SeqCst);
                if self.monitor.is_online() {
                    self.schedule_flush();
                }
            }
            UpdateOrigin::Remote => self.persist_doc(),
            UpdateOrigin::Replay => {}
        }
    }

    /// Write the full document state to local storage. Local persistence
    /// never depends on connectivity.
    fn persist_doc(&self) {
        let state = self.doc.encode_state_as_update();
        if let Err(e) = self.store.save_doc(self.note_id, &state) {
            log::error!(
                "[Provider] Failed to persist note {} locally: {}",
                self.note_id,
                e
            );
        }
    }

    fn schedule_flush(self: Arc<Self>) {
        let generation = self.flush_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = self.runtime.lock().unwrap().clone();
        let Some(handle) = handle else {
            return;
        };
        let inner = self;
        handle.spawn(async move {
            tokio::time::sleep(inner.config.debounce).await;
            if inner.destroyed.load(Ordering::SeqCst)
                || inner.flush_generation.load(Ordering::SeqCst) != generation
                || !inner.monitor.is_online()
            {
                return;
            }
            inner.flush_now().await;
        });
    }

    /// Broadcast and snapshot the full current state if anything is
    /// pending.
    ///
    /// Full state rather than a diff: CRDT application is idempotent, so
    /// receivers and the snapshot store converge regardless of what they
    /// already hold, and a lost broadcast costs nothing but latency.
    async fn flush_now(&self) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        self.set_state(|s| s.syncing = true);

        let state = self.doc.encode_state_as_update();
        let mut failure = None;

        let channel = self.channel.lock().unwrap().clone();
        if let Some(channel) = channel {
            if let Err(e) = channel.broadcast(self.identity.id, &state).await {
                failure = Some(e.to_string());
            }
        }

        match self.backend.save_snapshot(self.note_id, &state).await {
            Ok(()) => self.set_state(|s| {
                s.synced = true;
                s.error = None;
                s.last_sync_at = Some(Utc::now());
            }),
            Err(e) => failure = Some(e.to_string()),
        }

        if let Some(error) = failure {
            log::warn!(
                "[Provider] Flush for note {} failed: {}",
                self.note_id,
                error
            );
            // Keep the state pending so the next flush retries it
            self.dirty.store(true, Ordering::SeqCst);
            self.set_state(|s| s.error = Some(error));
        }

        self.set_state(|s| s.syncing = false);
    }

    /// Initial sync and every offline-to-online transition.
    async fn go_online(self: Arc<Self>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        log::debug!("[Provider] Going online for note {}", self.note_id);
        self.set_state(|s| s.syncing = true);

        match self.backend.fetch_snapshot(self.note_id).await {
            Ok(Some(snapshot)) => {
                if let Err(e) = self.doc.apply_update(&snapshot, UpdateOrigin::Remote) {
                    log::warn!(
                        "[Provider] Ignoring undecodable remote snapshot for {}: {}",
                        self.note_id,
                        e
                    );
                }
            }
            Ok(None) => {}
            Err(e) => self.set_state(|s| s.error = Some(e.to_string())),
        }

        // Replay the offline log. The local document usually contains these
        // already (they were applied live when edited), making each replay
        // an idempotent merge.
        match self.store.take_offline_updates(self.note_id) {
            Ok(updates) => {
                if !updates.is_empty() {
                    log::info!(
                        "[Provider] Replaying {} offline updates for note {}",
                        updates.len(),
                        self.note_id
                    );
                }
                for update in &updates {
                    if let Err(e) = self.doc.apply_update(update, UpdateOrigin::Replay) {
                        log::warn!(
                            "[Provider] Skipping undecodable offline update for {}: {}",
                            self.note_id,
                            e
                        );
                    }
                }
            }
            Err(e) => log::error!(
                "[Provider] Failed to read offline log for {}: {}",
                self.note_id,
                e
            ),
        }

        Arc::clone(&self).open_channel().await;

        // Push the merged state so the remote catches up with everything
        // that happened while offline.
        self.dirty.store(true, Ordering::SeqCst);
        self.flush_now().await;
        self.set_state(|s| s.syncing = false);
    }

    fn go_offline(&self) {
        log::debug!("[Provider] Going offline for note {}", self.note_id);
        if let Some(channel) = self.channel.lock().unwrap().take() {
            channel.close();
        }
        self.collaborators.lock().unwrap().clear();
        let callback = self.awareness_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(Vec::new());
        }
    }

    async fn open_channel(self: Arc<Self>) {
        let channel: Arc<dyn RealtimeChannel> =
            Arc::from(self.backend.open_channel(self.note_id));

        let weak = Arc::downgrade(&self);
        let own_id = self.identity.id;
        channel.on_update(Arc::new(move |sender, payload| {
            // Drop our own echo
            if sender == own_id {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Err(e) = inner.doc.apply_update(payload, UpdateOrigin::Remote) {
                log::warn!(
                    "[Provider] Dropping undecodable broadcast for {}: {}",
                    inner.note_id,
                    e
                );
            }
        }));

        let weak = Arc::downgrade(&self);
        channel.on_presence(Arc::new(move |entries| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let collaborators: Vec<Collaborator> = entries
                .into_iter()
                .filter(|entry| entry.id != inner.identity.id)
                .map(|entry| Collaborator {
                    id: entry.id,
                    name: entry.name,
                    color: entry.color,
                })
                .collect();
            *inner.collaborators.lock().unwrap() = collaborators.clone();
            let callback = inner.awareness_cb.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(collaborators);
            }
        }));

        if let Err(e) = channel
            .track(PresenceEntry {
                id: self.identity.id,
                name: self.identity.name.clone(),
                color: self.identity.color.clone(),
            })
            .await
        {
            log::warn!(
                "[Provider] Presence track failed for note {}: {}",
                self.note_id,
                e
            );
        }

        let previous = self.channel.lock().unwrap().replace(channel);
        if let Some(previous) = previous {
            previous.close();
        }
    }
}

impl std::fmt::Debug for ReplicationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationProvider")
            .field("note_id", &self.inner.note_id)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}
