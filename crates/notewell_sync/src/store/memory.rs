//! In-memory storage implementation for testing.
//!
//! This provides a simple in-memory implementation of [`LocalStore`]
//! for use in unit tests and development.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use super::LocalStore;
use crate::error::Result;
use crate::types::QueueItem;

/// In-memory local store for testing.
///
/// Thread-safe via `RwLock`; data is lost when the last clone is dropped.
/// Clones share the same underlying tables, which lets tests recreate a
/// queue or provider over "the same" durable store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    docs: Arc<RwLock<HashMap<Uuid, Vec<u8>>>>,
    offline_updates: Arc<RwLock<HashMap<Uuid, Vec<Vec<u8>>>>>,
    queues: Arc<RwLock<HashMap<Uuid, Vec<QueueItem>>>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn load_doc(&self, note_id: Uuid) -> Result<Option<Vec<u8>>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(&note_id).cloned())
    }

    fn save_doc(&self, note_id: Uuid, state: &[u8]) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        docs.insert(note_id, state.to_vec());
        Ok(())
    }

    fn delete_doc(&self, note_id: Uuid) -> Result<()> {
        self.docs.write().unwrap().remove(&note_id);
        self.offline_updates.write().unwrap().remove(&note_id);
        Ok(())
    }

    fn append_offline_update(&self, note_id: Uuid, update: &[u8]) -> Result<()> {
        let mut updates = self.offline_updates.write().unwrap();
        updates.entry(note_id).or_default().push(update.to_vec());
        Ok(())
    }

    fn take_offline_updates(&self, note_id: Uuid) -> Result<Vec<Vec<u8>>> {
        let mut updates = self.offline_updates.write().unwrap();
        Ok(updates.remove(&note_id).unwrap_or_default())
    }

    fn offline_update_count(&self, note_id: Uuid) -> Result<usize> {
        let updates = self.offline_updates.read().unwrap();
        Ok(updates.get(&note_id).map(Vec::len).unwrap_or(0))
    }

    fn insert_queue_item(&self, identity: Uuid, item: &QueueItem) -> Result<()> {
        let mut queues = self.queues.write().unwrap();
        queues.entry(identity).or_default().push(item.clone());
        Ok(())
    }

    fn list_queue_items(&self, identity: Uuid) -> Result<Vec<QueueItem>> {
        let queues = self.queues.read().unwrap();
        Ok(queues.get(&identity).cloned().unwrap_or_default())
    }

    fn update_queue_item(&self, id: Uuid, retry_count: u32, error: Option<&str>) -> Result<()> {
        let mut queues = self.queues.write().unwrap();
        for items in queues.values_mut() {
            if let Some(item) = items.iter_mut().find(|item| item.id == id) {
                item.retry_count = retry_count;
                item.error = error.map(String::from);
            }
        }
        Ok(())
    }

    fn delete_queue_item(&self, id: Uuid) -> Result<()> {
        let mut queues = self.queues.write().unwrap();
        for items in queues.values_mut() {
            items.retain(|item| item.id != id);
        }
        Ok(())
    }

    fn clear_queue_items(&self, identity: Uuid) -> Result<()> {
        self.queues.write().unwrap().remove(&identity);
        Ok(())
    }

    fn queue_len(&self, identity: Uuid) -> Result<usize> {
        let queues = self.queues.read().unwrap();
        Ok(queues.get(&identity).map(Vec::len).unwrap_or(0))
    }
}
