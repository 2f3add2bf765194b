//! Integration tests for hub persistence.
//!
//! A hub is fed updates, shut down, and a fresh hub for the same name must
//! come back with the same content, both for the in-memory adapter and for
//! RocksDB.

use logos_sync::{
    CollaborationHub, DocOptions, DocumentActor, DocumentStore, HubConfig, HubManager,
    MemoryPersistence, Message, Origin, Persistence, PersistenceFactory, RocksPersistence,
    StoreConfig,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::{timeout, Duration};
use yrs::{Doc, GetString, Text, Transact};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn manual() -> HubConfig {
    HubConfig {
        auto_exit: false,
        ..HubConfig::default()
    }
}

fn edit(doc: &Doc, s: &str) -> Vec<u8> {
    let text = doc.get_or_insert_text("content");
    let mut txn = doc.transact_mut();
    text.push(&mut txn, s);
    txn.encode_update_v1()
}

async fn hub_content(hub: &CollaborationHub) -> String {
    hub.doc()
        .run_async(|ctx| {
            let text = ctx.doc().get_or_insert_text("content");
            ctx.read(|txn| text.get_string(txn))
        })
        .await
        .unwrap()
        .unwrap()
}

async fn send_edits(hub: &CollaborationHub, peer: &Doc, edits: &[&str]) {
    for s in edits {
        let update = edit(peer, s);
        hub.process_message(&Message::sync_update(update).encode().unwrap(), Origin::new())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_memory_survives_hub_restart() {
    init_logging();
    let memory = MemoryPersistence::new();
    let hub = CollaborationHub::spawn("notes", manual(), Some(Box::new(memory.clone()))).unwrap();
    send_edits(&hub, &Doc::new(), &["one ", "two"]).await;

    hub.stop();
    hub.closed().await;
    assert_eq!(memory.updates("notes").len(), 1);

    let restored = CollaborationHub::spawn("notes", manual(), Some(Box::new(memory))).unwrap();
    assert_eq!(hub_content(&restored).await, "one two");
}

#[tokio::test]
async fn test_corrupt_record_does_not_hide_later_updates() {
    init_logging();
    let memory = MemoryPersistence::new();
    let peer = Doc::new();
    let scratch = DocumentActor::spawn("scratch", DocOptions::default()).unwrap();
    let mut writer = memory.clone();
    writer.persist_update("log", &scratch, &edit(&peer, "head ")).unwrap();
    writer.persist_update("log", &scratch, &[0xFF, 0x00, 0x13]).unwrap();
    writer.persist_update("log", &scratch, &edit(&peer, "tail")).unwrap();

    let hub = CollaborationHub::spawn("log", manual(), Some(Box::new(memory.clone()))).unwrap();
    assert_eq!(hub_content(&hub).await, "head tail");
    assert_eq!(hub.stats().await.unwrap().persistence_errors, 0);
    hub.stop();
    hub.closed().await;

    // Two restarts: the compacted log still carries every good update.
    for _ in 0..2 {
        let hub = CollaborationHub::spawn("log", manual(), Some(Box::new(memory.clone()))).unwrap();
        assert_eq!(hub_content(&hub).await, "head tail");
        hub.stop();
        hub.closed().await;
    }
    assert_eq!(memory.updates("log").len(), 1);
}

#[tokio::test]
async fn test_updates_persisted_without_observers() {
    init_logging();
    let memory = MemoryPersistence::new();
    let hub = CollaborationHub::spawn("lonely", manual(), Some(Box::new(memory.clone()))).unwrap();
    send_edits(&hub, &Doc::new(), &["a", "b", "c"]).await;

    let stats = hub.stats().await.unwrap();
    assert_eq!(stats.observers, 0);
    assert_eq!(stats.persisted_updates, 3);
    assert_eq!(stats.persistence_errors, 0);
    assert_eq!(memory.updates("lonely").len(), 3);
}

#[tokio::test]
async fn test_idle_exit_then_recreate_through_manager() {
    init_logging();
    let memory = MemoryPersistence::new();
    let shared = memory.clone();
    let factory: PersistenceFactory = Arc::new(move |_name: &str| {
        Some(Box::new(shared.clone()) as Box<dyn Persistence>)
    });
    let config = HubConfig {
        idle_timeout: Duration::from_millis(50),
        ..HubConfig::default()
    };
    let manager = HubManager::new(config, Some(factory));

    let hub = manager.get_or_create("draft").await.unwrap();
    send_edits(&hub, &Doc::new(), &["kept"]).await;
    timeout(Duration::from_secs(2), hub.closed())
        .await
        .expect("hub should exit once idle");
    assert_eq!(manager.hub_count().await, 0);

    let revived = manager.get_or_create("draft").await.unwrap();
    assert_eq!(hub_content(&revived).await, "kept");
    assert_eq!(memory.document_names(), vec!["draft".to_string()]);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_rocksdb_survives_hub_restart() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());

    let hub = CollaborationHub::spawn(
        "report",
        manual(),
        Some(Box::new(RocksPersistence::new(store.clone()))),
    )
    .unwrap();
    send_edits(&hub, &Doc::new(), &["alpha ", "beta ", "gamma"]).await;
    assert_eq!(store.load_all_deltas("report").unwrap().len(), 3);

    hub.stop();
    hub.closed().await;

    let meta = store.load_metadata("report").unwrap();
    assert_eq!(meta.snapshot_version, 3);
    assert!(store.load_all_deltas("report").unwrap().is_empty());
    assert_eq!(store.list_documents().unwrap(), vec!["report".to_string()]);

    let restored = CollaborationHub::spawn(
        "report",
        manual(),
        Some(Box::new(RocksPersistence::new(store.clone()))),
    )
    .unwrap();
    assert_eq!(hub_content(&restored).await, "alpha beta gamma");

    // Edits after the restart continue the version sequence.
    send_edits(&restored, &Doc::new(), &["!"]).await;
    let deltas = store.load_all_deltas("report").unwrap();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].0, 4);
}

#[tokio::test]
async fn test_rocksdb_replays_deltas_after_crash() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());

    // Deltas written but no snapshot, as after a crash before unbind.
    let peer = Doc::new();
    store.store_delta("crashed", 1, &edit(&peer, "left ")).unwrap();
    store.store_delta("crashed", 2, &edit(&peer, "behind")).unwrap();

    let hub = CollaborationHub::spawn(
        "crashed",
        manual(),
        Some(Box::new(RocksPersistence::new(store.clone()))),
    )
    .unwrap();
    assert_eq!(hub_content(&hub).await, "left behind");
}
