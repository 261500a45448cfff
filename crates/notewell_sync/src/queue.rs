//! Offline mutation queue for structural metadata operations.
//!
//! Note and folder CRUD (create, rename, move, delete) does not travel
//! through the CRDT layer; it targets plain remote rows. While offline -
//! or whenever a remote call might fail - those intents are recorded as
//! durable [`QueueItem`]s and drained FIFO once connectivity returns.
//!
//! ## Delivery semantics
//!
//! Each drain pass attempts every queued item once, in enqueue order. A
//! failed item stays queued with its `retry_count` incremented; after
//! [`MAX_RETRIES`] total attempts it is permanently evicted and surfaced
//! in the [`DrainReport`] so the caller can reconcile. Items are therefore
//! delivered at-least-zero, at-most-[`MAX_RETRIES`] times, and removed
//! exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::Result;
use crate::network::{MonitorSubscription, NetworkMonitor};
use crate::remote::RemoteBackend;
use crate::store::LocalStore;
use crate::types::{
    EntityKind, FolderPatch, FolderRecord, NotePatch, NoteRecord, QueueItem, QueueOperation,
};

/// Maximum number of remote attempts per queue item before permanent
/// eviction.
pub const MAX_RETRIES: u32 = 3;

/// An item evicted during a drain after exhausting its retries.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainFailure {
    /// Id of the evicted queue item
    pub item_id: Uuid,

    /// Target collection
    pub entity: EntityKind,

    /// Target row id
    pub entity_id: Uuid,

    /// Operation that could not be applied
    pub operation: QueueOperation,

    /// Error from the final attempt
    pub error: String,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Items applied remotely and removed
    pub processed: usize,

    /// Items permanently evicted this pass
    pub failed: Vec<DrainFailure>,

    /// Items still queued after the pass
    pub remaining: usize,
}

struct QueueInner {
    identity: Uuid,
    store: Arc<dyn LocalStore>,
    backend: Arc<dyn RemoteBackend>,
    monitor: Arc<dyn NetworkMonitor>,
    /// Drain re-entrancy guard: a second drain started while one is in
    /// flight returns immediately with zero progress.
    processing: AtomicBool,
    subscription: Mutex<Option<MonitorSubscription>>,
    runtime: Mutex<Option<tokio::runtime::Handle>>,
    destroyed: AtomicBool,
}

/// Clears the processing flag when a drain pass exits, normally or early.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Durable FIFO queue of structural mutations for one identity.
///
/// Enqueueing always succeeds locally; remote application happens in
/// background drains triggered by enqueueing while online or by an
/// offline-to-online transition, or explicitly via
/// [`drain`](MutationQueue::drain).
pub struct MutationQueue {
    inner: Arc<QueueInner>,
}

impl MutationQueue {
    /// Create a queue for the given identity and hook connectivity
    /// transitions so reconnects drain automatically.
    pub fn new(
        identity: Uuid,
        store: Arc<dyn LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        monitor: Arc<dyn NetworkMonitor>,
    ) -> Arc<Self> {
        let inner = Arc::new(QueueInner {
            identity,
            store,
            backend,
            monitor,
            processing: AtomicBool::new(false),
            subscription: Mutex::new(None),
            runtime: Mutex::new(tokio::runtime::Handle::try_current().ok()),
            destroyed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = inner.monitor.subscribe(Arc::new(move |online| {
            if !online {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.destroyed.load(Ordering::SeqCst) {
                return;
            }
            inner.spawn_drain();
        }));
        *inner.subscription.lock().unwrap() = Some(subscription);

        Arc::new(Self { inner })
    }

    /// The identity this queue belongs to.
    pub fn identity(&self) -> Uuid {
        self.inner.identity
    }

    /// Number of items currently queued.
    pub fn len(&self) -> Result<usize> {
        self.inner.store.queue_len(self.inner.identity)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Queued items in drain order. Intended for inspection and UI.
    pub fn pending(&self) -> Result<Vec<QueueItem>> {
        self.inner.store.list_queue_items(self.inner.identity)
    }

    // ==================== Enqueue ====================

    /// Queue a note creation.
    pub fn create_note(&self, note: &NoteRecord) -> Result<()> {
        self.enqueue_item(QueueItem::new(
            EntityKind::Note,
            note.id,
            QueueOperation::Create,
            serde_json::to_value(note)?,
        ))
    }

    /// Queue a note metadata patch.
    pub fn update_note(&self, id: Uuid, patch: &NotePatch) -> Result<()> {
        self.enqueue_item(QueueItem::new(
            EntityKind::Note,
            id,
            QueueOperation::Update,
            serde_json::to_value(patch)?,
        ))
    }

    /// Queue a note soft deletion.
    pub fn delete_note(&self, id: Uuid) -> Result<()> {
        self.enqueue_item(QueueItem::new(
            EntityKind::Note,
            id,
            QueueOperation::Delete,
            serde_json::Value::Null,
        ))
    }

    /// Queue a folder creation.
    pub fn create_folder(&self, folder: &FolderRecord) -> Result<()> {
        self.enqueue_item(QueueItem::new(
            EntityKind::Folder,
            folder.id,
            QueueOperation::Create,
            serde_json::to_value(folder)?,
        ))
    }

    /// Queue a folder patch.
    pub fn update_folder(&self, id: Uuid, patch: &FolderPatch) -> Result<()> {
        self.enqueue_item(QueueItem::new(
            EntityKind::Folder,
            id,
            QueueOperation::Update,
            serde_json::to_value(patch)?,
        ))
    }

    /// Queue a folder deletion (hard delete).
    pub fn delete_folder(&self, id: Uuid) -> Result<()> {
        self.enqueue_item(QueueItem::new(
            EntityKind::Folder,
            id,
            QueueOperation::Delete,
            serde_json::Value::Null,
        ))
    }

    /// Record an item durably, then kick a background drain if online.
    ///
    /// The durable insert is the commit point: once this returns `Ok`, the
    /// mutation survives process restarts regardless of connectivity.
    pub fn enqueue_item(&self, item: QueueItem) -> Result<()> {
        self.inner.store.insert_queue_item(self.inner.identity, &item)?;
        log::debug!(
            "[Queue] Enqueued {} {} for {} (identity {})",
            item.operation,
            item.entity,
            item.entity_id,
            self.inner.identity
        );

        if self.inner.monitor.is_online() {
            Arc::clone(&self.inner).spawn_drain();
        }
        Ok(())
    }

    // ==================== Drain ====================

    /// Attempt every queued item once, in enqueue order.
    ///
    /// Returns immediately with zero progress while offline or while
    /// another drain is running.
    pub async fn drain(&self) -> Result<DrainReport> {
        Arc::clone(&self.inner).drain().await
    }

    // ==================== Lifecycle ====================

    /// Discard all queued items without applying them.
    pub fn clear(&self) -> Result<()> {
        self.inner.store.clear_queue_items(self.inner.identity)
    }

    /// Detach from the connectivity monitor. Queued items stay durable and
    /// will be picked up by the next queue created for this identity.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(subscription) = self.inner.subscription.lock().unwrap().take() {
            subscription.unsubscribe();
        }
    }
}

impl QueueInner {
    fn spawn_drain(self: Arc<Self>) {
        if self.processing.load(Ordering::SeqCst) {
            return;
        }
        let handle = self.runtime.lock().unwrap().clone();
        let Some(handle) = handle else {
            return;
        };
        handle.spawn(async move {
            if let Err(e) = Arc::clone(&self).drain().await {
                log::error!(
                    "[Queue] Background drain failed for identity {}: {}",
                    self.identity,
                    e
                );
            }
        });
    }

    async fn drain(self: Arc<Self>) -> Result<DrainReport> {
        let zero_progress = |store: &dyn LocalStore, identity| {
            Ok(DrainReport {
                processed: 0,
                failed: Vec::new(),
                remaining: store.queue_len(identity)?,
            })
        };

        if !self.monitor.is_online() {
            return zero_progress(self.store.as_ref(), self.identity);
        }
        if self.processing.swap(true, Ordering::SeqCst) {
            return zero_progress(self.store.as_ref(), self.identity);
        }
        let _guard = DrainGuard(&self.processing);

        let items = self.store.list_queue_items(self.identity)?;
        let mut report = DrainReport::default();

        for item in items {
            // Connectivity can drop mid-drain; leave the rest queued
            if !self.monitor.is_online() {
                break;
            }

            match self.apply_item(&item).await {
                Ok(()) => {
                    self.store.delete_queue_item(item.id)?;
                    report.processed += 1;
                }
                Err(error) => {
                    let attempts = item.retry_count + 1;
                    if attempts >= MAX_RETRIES {
                        // Final attempt spent; evict and surface
                        self.store.delete_queue_item(item.id)?;
                        log::error!(
                            "[Queue] Evicting {} {} for {} after {} attempts: {}",
                            item.operation,
                            item.entity,
                            item.entity_id,
                            attempts,
                            error
                        );
                        report.failed.push(DrainFailure {
                            item_id: item.id,
                            entity: item.entity,
                            entity_id: item.entity_id,
                            operation: item.operation,
                            error,
                        });
                    } else {
                        log::warn!(
                            "[Queue] Attempt {} failed for {} {} {}: {}",
                            attempts,
                            item.operation,
                            item.entity,
                            item.entity_id,
                            error
                        );
                        self.store
                            .update_queue_item(item.id, attempts, Some(&error))?;
                    }
                }
            }
        }

        report.remaining = self.store.queue_len(self.identity)?;
        log::debug!(
            "[Queue] Drain for identity {}: {} applied, {} evicted, {} remaining",
            self.identity,
            report.processed,
            report.failed.len(),
            report.remaining
        );
        Ok(report)
    }

    /// Decode the item's payload for its `(entity, operation)` pair and
    /// apply it remotely. Decode failures count as attempts like remote
    /// failures do, so a poisoned payload is evicted rather than wedging
    /// the queue.
    async fn apply_item(&self, item: &QueueItem) -> std::result::Result<(), String> {
        match (item.entity, item.operation) {
            (EntityKind::Note, QueueOperation::Create) => {
                let note: NoteRecord =
                    serde_json::from_value(item.payload.clone()).map_err(|e| e.to_string())?;
                self.backend
                    .insert_note(&note)
                    .await
                    .map_err(|e| e.to_string())
            }
            (EntityKind::Note, QueueOperation::Update) => {
                let patch: NotePatch =
                    serde_json::from_value(item.payload.clone()).map_err(|e| e.to_string())?;
                self.backend
                    .update_note(item.entity_id, &patch)
                    .await
                    .map_err(|e| e.to_string())
            }
            (EntityKind::Note, QueueOperation::Delete) => self
                .backend
                .soft_delete_note(item.entity_id)
                .await
                .map_err(|e| e.to_string()),
            (EntityKind::Folder, QueueOperation::Create) => {
                let folder: FolderRecord =
                    serde_json::from_value(item.payload.clone()).map_err(|e| e.to_string())?;
                self.backend
                    .insert_folder(&folder)
                    .await
                    .map_err(|e| e.to_string())
            }
            (EntityKind::Folder, QueueOperation::Update) => {
                let patch: FolderPatch =
                    serde_json::from_value(item.payload.clone()).map_err(|e| e.to_string())?;
                self.backend
                    .update_folder(item.entity_id, &patch)
                    .await
                    .map_err(|e| e.to_string())
            }
            (EntityKind::Folder, QueueOperation::Delete) => self
                .backend
                .delete_folder(item.entity_id)
                .await
                .map_err(|e| e.to_string()),
        }
    }
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("identity", &self.inner.identity)
            .finish_non_exhaustive()
    }
}

/// Hands out the mutation queue for the active identity.
///
/// Keeps at most one live queue; asking for a different identity detaches
/// the previous queue (its durable items stay in the store, keyed by their
/// own identity) and creates a fresh one.
pub struct QueueRegistry {
    store: Arc<dyn LocalStore>,
    backend: Arc<dyn RemoteBackend>,
    monitor: Arc<dyn NetworkMonitor>,
    current: Mutex<Option<(Uuid, Arc<MutationQueue>)>>,
}

impl QueueRegistry {
    /// Create a registry over the shared store, backend, and monitor.
    pub fn new(
        store: Arc<dyn LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        monitor: Arc<dyn NetworkMonitor>,
    ) -> Self {
        Self {
            store,
            backend,
            monitor,
            current: Mutex::new(None),
        }
    }

    /// The queue for the given identity, creating or swapping as needed.
    pub fn queue_for(&self, identity: Uuid) -> Arc<MutationQueue> {
        let mut current = self.current.lock().unwrap();
        if let Some((id, queue)) = current.as_ref()
            && *id == identity
        {
            return Arc::clone(queue);
        }

        if let Some((previous_id, previous)) = current.take() {
            log::info!(
                "[Queue] Switching active identity {} -> {}",
                previous_id,
                identity
            );
            previous.destroy();
        }

        let queue = MutationQueue::new(
            identity,
            Arc::clone(&self.store),
            Arc::clone(&self.backend),
            Arc::clone(&self.monitor),
        );
        *current = Some((identity, Arc::clone(&queue)));
        queue
    }

    /// Detach the active queue, if any.
    pub fn reset(&self) {
        if let Some((_, queue)) = self.current.lock().unwrap().take() {
            queue.destroy();
        }
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.current.lock().unwrap();
        f.debug_struct("QueueRegistry")
            .field("active_identity", &current.as_ref().map(|(id, _)| *id))
            .finish_non_exhaustive()
    }
}
