//! Per-note CRDT document.
//!
//! This module provides `NoteDoc`, a Y.Doc for collaborative editing of a
//! single note's content. Each open note owns exactly one `NoteDoc`; the
//! editor binds to its text, and the replication provider observes its
//! updates through the origin-tagged update hook.

use std::sync::{Arc, Mutex};

use uuid::Uuid;
use yrs::{
    Doc, GetString, Map, ReadTxn, Text, Transact, Update, updates::decoder::Decode,
    updates::encoder::Encode,
};

use crate::error::{Result, SyncError};
use crate::store::LocalStore;
use crate::types::UpdateOrigin;

/// Name of the Y.Text holding the note content.
const CONTENT_TEXT_NAME: &str = "content";

/// Name of the Y.Map holding lightweight document metadata.
const META_MAP_NAME: &str = "meta";

/// Hook invoked with the update bytes and origin after every applied or
/// recorded update.
pub type UpdateHook = Arc<dyn Fn(&[u8], UpdateOrigin) + Send + Sync>;

/// A CRDT document for a single note's content.
///
/// The document contains a Y.Text for the note body and a Y.Map for
/// structured metadata the editor wants co-located with content. Applying
/// the same set of updates in any order, any number of times, converges to
/// the same state.
///
/// # Example
///
/// ```ignore
/// use notewell_sync::NoteDoc;
/// use uuid::Uuid;
///
/// let doc = NoteDoc::new(Uuid::new_v4());
/// doc.set_content("# Hello World");
/// assert_eq!(doc.get_content(), "# Hello World");
/// ```
pub struct NoteDoc {
    doc: Doc,
    content: yrs::TextRef,
    meta: yrs::MapRef,
    note_id: Uuid,
    update_hook: Mutex<Option<UpdateHook>>,
}

impl NoteDoc {
    /// Create a new empty note document.
    pub fn new(note_id: Uuid) -> Self {
        let doc = Doc::new();
        let content = doc.get_or_insert_text(CONTENT_TEXT_NAME);
        let meta = doc.get_or_insert_map(META_MAP_NAME);

        Self {
            doc,
            content,
            meta,
            note_id,
            update_hook: Mutex::new(None),
        }
    }

    /// Hydrate this document from the local store.
    ///
    /// This is the offline-first guarantee: it must complete without any
    /// network access. A missing snapshot yields an empty document; a
    /// storage failure is fatal for the note's session and is propagated.
    pub fn hydrate(&self, store: &dyn LocalStore) -> Result<()> {
        if let Some(state) = store.load_doc(self.note_id)?
            && let Ok(update) = Update::decode_v1(&state)
        {
            let mut txn = self.doc.transact_mut();
            if let Err(e) = txn.apply_update(update) {
                log::warn!(
                    "Failed to apply stored state for note {}: {}",
                    self.note_id,
                    e
                );
            }
        }
        Ok(())
    }

    /// Set the update hook. At most one hook is registered at a time.
    pub fn set_update_hook(&self, hook: UpdateHook) {
        *self.update_hook.lock().unwrap() = Some(hook);
    }

    fn fire_hook(&self, update: &[u8], origin: UpdateOrigin) {
        let hook = self.update_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(update, origin);
        }
    }

    /// The note id this document belongs to.
    pub fn note_id(&self) -> Uuid {
        self.note_id
    }

    // ==================== Content Operations ====================

    /// Get the full content as a string.
    pub fn get_content(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    /// Set the content, using minimal diff operations.
    ///
    /// Instead of delete-all + insert-all (which breaks CRDT merging), this
    /// calculates the minimal diff between current and new content and
    /// applies only the necessary insert/delete operations, preserving
    /// operation identity where content hasn't changed.
    pub fn set_content(&self, content: &str) {
        let (current, sv_before) = {
            let txn = self.doc.transact();
            (self.content.get_string(&txn), txn.state_vector())
        };

        if current == content {
            return;
        }

        // The doc uses byte offsets; walk chars so the split points stay on
        // character boundaries.
        let mut prefix = 0;
        for (a, b) in current.chars().zip(content.chars()) {
            if a != b {
                break;
            }
            prefix += a.len_utf8();
        }

        // Common suffix, not overlapping the prefix
        let max_suffix = (current.len() - prefix).min(content.len() - prefix);
        let mut suffix = 0;
        for (a, b) in current.chars().rev().zip(content.chars().rev()) {
            if a != b || suffix + a.len_utf8() > max_suffix {
                break;
            }
            suffix += a.len_utf8();
        }

        let delete_len = current.len() - prefix - suffix;
        let insert_text = &content[prefix..content.len() - suffix];

        {
            let mut txn = self.doc.transact_mut();

            if delete_len > 0 {
                self.content
                    .remove_range(&mut txn, prefix as u32, delete_len as u32);
            }

            if !insert_text.is_empty() {
                self.content.insert(&mut txn, prefix as u32, insert_text);
            }
        }

        self.record_update(&sv_before);
    }

    /// Insert text at a UTF-8 byte offset (must fall on a character
    /// boundary).
    pub fn insert_at(&self, index: u32, text: &str) {
        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };

        {
            let mut txn = self.doc.transact_mut();
            self.content.insert(&mut txn, index, text);
        }

        self.record_update(&sv_before);
    }

    /// Delete a range of text, addressed in UTF-8 bytes.
    pub fn delete_range(&self, index: u32, length: u32) {
        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };

        {
            let mut txn = self.doc.transact_mut();
            self.content.remove_range(&mut txn, index, length);
        }

        self.record_update(&sv_before);
    }

    /// Fire the update hook with the incremental update since `sv_before`.
    fn record_update(&self, sv_before: &yrs::StateVector) {
        let update = {
            let txn = self.doc.transact();
            txn.encode_state_as_update_v1(sv_before)
        };

        if !update.is_empty() {
            self.fire_hook(&update, UpdateOrigin::Local);
        }
    }

    /// Length of the content in UTF-8 bytes.
    pub fn content_len(&self) -> u32 {
        let txn = self.doc.transact();
        self.content.len(&txn)
    }

    // ==================== Metadata Operations ====================

    /// Get a metadata value as a string.
    pub fn get_meta(&self, key: &str) -> Option<String> {
        let txn = self.doc.transact();
        self.meta
            .get(&txn, key)
            .and_then(|v| v.cast::<String>().ok())
    }

    /// Set a metadata value.
    pub fn set_meta(&self, key: &str, value: &str) {
        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };

        {
            let mut txn = self.doc.transact_mut();
            self.meta.insert(&mut txn, key, value);
        }

        self.record_update(&sv_before);
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full state as an update (a snapshot).
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&Default::default())
    }

    /// Encode the diff between current state and a remote state vector.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = yrs::StateVector::decode_v1(remote_state_vector)
            .map_err(|e| SyncError::Crdt(format!("Failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update with the given origin tag.
    ///
    /// Always a merge, never an overwrite: concurrent local state survives.
    /// The update hook fires with the supplied origin so observers can tell
    /// remote and replayed updates apart from local edits (loop
    /// prevention).
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| SyncError::Crdt(format!("Failed to decode update: {}", e)))?;

        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| SyncError::Crdt(format!("Failed to apply update: {}", e)))?;
        }

        self.fire_hook(update, origin);
        Ok(())
    }
}

impl std::fmt::Debug for NoteDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteDoc")
            .field("note_id", &self.note_id)
            .field("content_len", &self.content_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn create_doc() -> NoteDoc {
        NoteDoc::new(Uuid::new_v4())
    }

    #[test]
    fn test_new_doc_is_empty() {
        let doc = create_doc();
        assert_eq!(doc.get_content(), "");
        assert_eq!(doc.content_len(), 0);
    }

    #[test]
    fn test_set_and_get_content() {
        let doc = create_doc();
        let content = "# Hello World\n\nThis is a note.";
        doc.set_content(content);
        assert_eq!(doc.get_content(), content);
    }

    #[test]
    fn test_insert_and_delete() {
        let doc = create_doc();
        doc.set_content("Hello World");
        doc.insert_at(6, "Beautiful ");
        assert_eq!(doc.get_content(), "Hello Beautiful World");

        doc.delete_range(6, 10);
        assert_eq!(doc.get_content(), "Hello World");
    }

    #[test]
    fn test_set_content_with_multibyte_characters() {
        let doc = create_doc();

        // Replacement inside a run of multi-byte characters
        doc.set_content("ééé");
        doc.set_content("ééx");
        assert_eq!(doc.get_content(), "ééx");

        doc.set_content("naïve café ☕");
        doc.set_content("naïve cafés ☕");
        assert_eq!(doc.get_content(), "naïve cafés ☕");

        doc.set_content("日本語のノート");
        doc.set_content("日本語のメモ");
        assert_eq!(doc.get_content(), "日本語のメモ");
    }

    #[test]
    fn test_multibyte_edits_converge() {
        let note_id = Uuid::new_v4();
        let doc1 = NoteDoc::new(note_id);
        let doc2 = NoteDoc::new(note_id);

        doc1.set_content("café");
        doc2.apply_update(&doc1.encode_state_as_update(), UpdateOrigin::Remote)
            .unwrap();

        doc1.set_content("cafés");
        doc2.set_content("le café");
        doc1.apply_update(&doc2.encode_state_as_update(), UpdateOrigin::Remote)
            .unwrap();
        doc2.apply_update(&doc1.encode_state_as_update(), UpdateOrigin::Remote)
            .unwrap();

        assert_eq!(doc1.get_content(), doc2.get_content());
        assert!(doc1.get_content().contains("café"));
    }

    #[test]
    fn test_meta_operations() {
        let doc = create_doc();
        doc.set_meta("language", "en");
        assert_eq!(doc.get_meta("language"), Some("en".to_string()));
        assert_eq!(doc.get_meta("missing"), None);
    }

    #[test]
    fn test_hydrate_from_store() {
        let store = MemoryStore::new();
        let note_id = Uuid::new_v4();

        {
            let doc = NoteDoc::new(note_id);
            doc.set_content("Persisted content");
            store.save_doc(note_id, &doc.encode_state_as_update()).unwrap();
        }

        let doc = NoteDoc::new(note_id);
        doc.hydrate(&store).unwrap();
        assert_eq!(doc.get_content(), "Persisted content");
    }

    #[test]
    fn test_hydrate_missing_doc_is_empty() {
        let store = MemoryStore::new();
        let doc = create_doc();
        doc.hydrate(&store).unwrap();
        assert_eq!(doc.get_content(), "");
    }

    #[test]
    fn test_apply_update_merges() {
        let note_id = Uuid::new_v4();
        let doc1 = NoteDoc::new(note_id);
        let doc2 = NoteDoc::new(note_id);

        doc1.set_content("Content from doc1");
        doc2.apply_update(&doc1.encode_state_as_update(), UpdateOrigin::Remote)
            .unwrap();

        assert_eq!(doc2.get_content(), "Content from doc1");
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let note_id = Uuid::new_v4();
        let doc1 = NoteDoc::new(note_id);
        let doc2 = NoteDoc::new(note_id);

        doc1.set_content("Hello World");
        doc2.apply_update(&doc1.encode_state_as_update(), UpdateOrigin::Remote)
            .unwrap();

        // Concurrent, disjoint edits
        doc1.insert_at(0, "A: ");
        doc2.insert_at(11, "!");

        let update1 = doc1.encode_state_as_update();
        let update2 = doc2.encode_state_as_update();
        doc1.apply_update(&update2, UpdateOrigin::Remote).unwrap();
        doc2.apply_update(&update1, UpdateOrigin::Remote).unwrap();

        assert_eq!(doc1.get_content(), doc2.get_content());
        let body = doc1.get_content();
        assert!(body.contains("A: "));
        assert!(body.contains("!"));
    }

    #[test]
    fn test_convergence_is_order_independent_and_idempotent() {
        let note_id = Uuid::new_v4();
        let source = NoteDoc::new(note_id);
        source.set_content("base");

        let base = source.encode_state_as_update();
        source.insert_at(4, " one");
        let with_one = source.encode_state_as_update();
        source.insert_at(8, " two");
        let with_two = source.encode_state_as_update();

        // Apply in reverse order, with duplicates
        let replica = NoteDoc::new(note_id);
        for update in [&with_two, &base, &with_one, &with_two, &base] {
            replica.apply_update(update, UpdateOrigin::Remote).unwrap();
        }

        assert_eq!(replica.get_content(), source.get_content());
        assert_eq!(
            replica.encode_state_as_update(),
            source.encode_state_as_update()
        );
    }

    #[test]
    fn test_encode_diff() {
        let note_id = Uuid::new_v4();
        let doc1 = NoteDoc::new(note_id);
        let doc2 = NoteDoc::new(note_id);

        doc1.set_content("Initial content");
        doc2.apply_update(&doc1.encode_state_as_update(), UpdateOrigin::Remote)
            .unwrap();

        let sv2 = doc2.encode_state_vector();
        doc1.insert_at(0, "NEW: ");

        let diff = doc1.encode_diff(&sv2).unwrap();
        doc2.apply_update(&diff, UpdateOrigin::Remote).unwrap();

        assert_eq!(doc2.get_content(), "NEW: Initial content");
    }

    #[test]
    fn test_hook_carries_origin() {
        let doc = create_doc();
        let locals = Arc::new(AtomicUsize::new(0));
        let remotes = Arc::new(AtomicUsize::new(0));

        let locals_clone = Arc::clone(&locals);
        let remotes_clone = Arc::clone(&remotes);
        doc.set_update_hook(Arc::new(move |_update, origin| match origin {
            UpdateOrigin::Local => {
                locals_clone.fetch_add(1, Ordering::SeqCst);
            }
            UpdateOrigin::Remote => {
                remotes_clone.fetch_add(1, Ordering::SeqCst);
            }
            UpdateOrigin::Replay => {}
        }));

        doc.set_content("local edit");
        assert_eq!(locals.load(Ordering::SeqCst), 1);
        assert_eq!(remotes.load(Ordering::SeqCst), 0);

        let other = NoteDoc::new(doc.note_id());
        other.set_content("remote edit");
        doc.apply_update(&other.encode_state_as_update(), UpdateOrigin::Remote)
            .unwrap();
        assert_eq!(remotes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_apply_garbage_update_fails() {
        let doc = create_doc();
        assert!(
            doc.apply_update(&[0xff, 0x13, 0x37], UpdateOrigin::Remote)
                .is_err()
        );
    }
}
