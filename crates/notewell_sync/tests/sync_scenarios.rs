//! End-to-end synchronization scenarios exercising the replication
//! provider and the mutation queue together through the public API.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use notewell_sync::{
    Collaborator, MemoryBackend, MemoryStore, MutationQueue, NoteDoc, NotePatch, NoteRecord,
    ProviderConfig, QueueRegistry, ReplicationProvider, ToggleMonitor, UpdateOrigin,
};

fn identity(name: &str) -> Collaborator {
    Collaborator {
        id: Uuid::new_v4(),
        name: name.to_string(),
        color: "#8844cc".to_string(),
    }
}

fn provider(
    note_id: Uuid,
    name: &str,
    store: &MemoryStore,
    backend: &MemoryBackend,
    monitor: &ToggleMonitor,
) -> ReplicationProvider {
    ReplicationProvider::new(
        note_id,
        identity(name),
        Arc::new(store.clone()),
        Arc::new(backend.clone()),
        Arc::new(monitor.clone()),
        ProviderConfig::default(),
    )
}

fn snapshot_content(backend: &MemoryBackend, note_id: Uuid) -> String {
    let doc = NoteDoc::new(note_id);
    doc.apply_update(&backend.snapshot(note_id).unwrap(), UpdateOrigin::Remote)
        .unwrap();
    doc.get_content()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1500)).await;
}

#[tokio::test(start_paused = true)]
async fn offline_session_catches_up_on_reconnect() {
    let store = MemoryStore::new();
    let backend = MemoryBackend::new();
    let monitor = ToggleMonitor::offline();
    let note_id = Uuid::new_v4();

    let writer = provider(note_id, "Writer", &store, &backend, &monitor);
    writer.connect().await.unwrap();

    writer.doc().set_content("# Travel plans\n\n- pack bags\n");
    let end = writer.doc().content_len();
    writer.doc().insert_at(end, "- book flights\n");

    // Everything stayed local
    assert!(backend.snapshot(note_id).is_none());
    assert!(!writer.sync_state().synced);

    monitor.set_online(true);
    settle().await;

    assert!(writer.sync_state().synced);
    assert_eq!(snapshot_content(&backend, note_id), writer.doc().get_content());

    // A second device starting fresh sees the full note
    let other_store = MemoryStore::new();
    let reader = provider(note_id, "Reader", &other_store, &backend, &ToggleMonitor::online());
    reader.connect().await.unwrap();
    assert_eq!(reader.doc().get_content(), writer.doc().get_content());
}

#[tokio::test(start_paused = true)]
async fn concurrent_editors_converge_over_the_channel() {
    let backend = MemoryBackend::new();
    let monitor = ToggleMonitor::online();
    let note_id = Uuid::new_v4();

    let store_a = MemoryStore::new();
    let store_b = MemoryStore::new();
    let a = provider(note_id, "Alice", &store_a, &backend, &monitor);
    let b = provider(note_id, "Bob", &store_b, &backend, &monitor);
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    a.doc().set_content("Shared outline\n");
    settle().await;
    assert_eq!(b.doc().get_content(), "Shared outline\n");

    // Concurrent edits at both ends within one debounce window
    a.doc().insert_at(0, "A> ");
    b.doc().insert_at(b.doc().content_len(), "B> closing\n");
    settle().await;

    assert_eq!(a.doc().get_content(), b.doc().get_content());
    let content = a.doc().get_content();
    assert!(content.contains("A> "));
    assert!(content.contains("B> closing"));

    // Both saw each other the whole time
    assert_eq!(a.collaborators().len(), 1);
    assert_eq!(a.collaborators()[0].name, "Bob");

    a.destroy().await;
    b.destroy().await;
    assert_eq!(snapshot_content(&backend, note_id), content);
}

#[tokio::test(start_paused = true)]
async fn note_creation_and_content_sync_after_offline_stretch() {
    let store = MemoryStore::new();
    let backend = MemoryBackend::new();
    let monitor = ToggleMonitor::offline();

    let registry = QueueRegistry::new(
        Arc::new(store.clone()),
        Arc::new(backend.clone()),
        Arc::new(monitor.clone()),
    );
    let user = Uuid::new_v4();
    let queue = registry.queue_for(user);

    // Create a note and start writing, all offline
    let note = NoteRecord::new("Meeting notes");
    queue.create_note(&note).unwrap();
    queue
        .update_note(
            note.id,
            &NotePatch {
                title: Some("Meeting notes (2026-08-27)".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    let host = provider(note.id, "Host", &store, &backend, &monitor);
    host.connect().await.unwrap();
    host.doc().set_content("Agenda:\n1. roadmap\n2. hiring\n");

    assert!(backend.note(note.id).is_none());
    assert!(backend.snapshot(note.id).is_none());

    monitor.set_online(true);
    settle().await;

    // Metadata drained in order: the row exists with the patched title
    let row = backend.note(note.id).unwrap();
    assert_eq!(row.title, "Meeting notes (2026-08-27)");
    assert_eq!(queue.len().unwrap(), 0);

    // And the document caught up independently
    assert_eq!(
        snapshot_content(&backend, note.id),
        "Agenda:\n1. roadmap\n2. hiring\n"
    );
}

#[tokio::test(start_paused = true)]
async fn queued_mutations_survive_queue_recreation() {
    let store = MemoryStore::new();
    let backend = MemoryBackend::new();
    let offline = ToggleMonitor::offline();
    let user = Uuid::new_v4();

    let note = NoteRecord::new("Survives restarts");
    {
        let queue = MutationQueue::new(
            user,
            Arc::new(store.clone()),
            Arc::new(backend.clone()),
            Arc::new(offline.clone()),
        );
        queue.create_note(&note).unwrap();
        queue.destroy();
    }

    // "Restart": a new queue over the same durable store, now online
    let queue = MutationQueue::new(
        user,
        Arc::new(store.clone()),
        Arc::new(backend.clone()),
        Arc::new(ToggleMonitor::online()),
    );
    let report = queue.drain().await.unwrap();

    assert_eq!(report.processed, 1);
    assert!(report.failed.is_empty());
    assert_eq!(backend.note(note.id).unwrap().title, "Survives restarts");
}

#[tokio::test(start_paused = true)]
async fn eviction_is_surfaced_while_later_items_proceed() {
    let store = MemoryStore::new();
    let backend = MemoryBackend::new();
    let monitor = ToggleMonitor::offline();
    let queue = MutationQueue::new(
        Uuid::new_v4(),
        Arc::new(store.clone()),
        Arc::new(backend.clone()),
        Arc::new(monitor.clone()),
    );

    // A patch against a row that never made it remotely, then a valid create
    let ghost = Uuid::new_v4();
    queue
        .update_note(
            ghost,
            &NotePatch {
                title: Some("never lands".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    let real = NoteRecord::new("Lands fine");
    queue.create_note(&real).unwrap();

    monitor.set_online(true);
    settle().await;

    let mut evicted = Vec::new();
    for _ in 0..3 {
        let report = queue.drain().await.unwrap();
        evicted.extend(report.failed);
    }

    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].entity_id, ghost);
    assert_eq!(queue.len().unwrap(), 0);
    assert!(backend.note(real.id).is_some());
    assert!(backend.note(ghost).is_none());
}
