//! Integration tests for `SqliteEventStore`.
//!
//! Every test runs against its own in-memory database unless it needs a file.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code uses expect for clear failure messages

use event_octopus_core::event::{Event, EventName};
use event_octopus_core::event_store::{EventRecordStore, StoreError};
use event_octopus_sqlite::SqliteEventStore;
use std::sync::Arc;

async fn setup_store() -> SqliteEventStore {
    let store = SqliteEventStore::connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory database");
    store.migrate().await.expect("Failed to run migrations");
    store
}

fn event(id: &str, name: EventName) -> Event {
    Event::new(id, name, r#"{"consent":"payload"}"#)
        .with_external_id(format!("ext-{id}"))
        .with_initiator_legal_entity("urn:oid:1.2.3:legal-entity")
}

#[tokio::test]
async fn save_then_get() {
    let store = setup_store().await;
    let original = event("e-1", EventName::ConsentRequestConstructed)
        .with_consent_id("consent-1")
        .with_transaction_id("tx-1");

    store.save_or_update(&original).await.expect("save failed");

    let loaded = store.get("e-1").await.expect("get failed");
    assert_eq!(loaded, Some(original));
}

#[tokio::test]
async fn get_missing_is_none() {
    let store = setup_store().await;
    assert_eq!(store.get("missing").await.expect("get failed"), None);
    assert_eq!(
        store.get_by_external_id("missing").await.expect("get failed"),
        None
    );
}

#[tokio::test]
async fn save_is_idempotent_and_overwrites_whole_row() {
    let store = setup_store().await;
    let first = event("e-1", EventName::ConsentRequestConstructed);
    store.save_or_update(&first).await.unwrap();
    store.save_or_update(&first).await.unwrap();

    let mut second = first.clone().with_retry_count(3);
    second.mark_errored("downstream refused");
    store.save_or_update(&second).await.unwrap();

    let all = store.list().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0], second);
    assert_eq!(all[0].error.as_deref(), Some("downstream refused"));
}

#[tokio::test]
async fn last_write_wins_even_for_older_state() {
    let store = setup_store().await;
    let later = event("e-1", EventName::Completed).with_retry_count(2);
    let earlier = event("e-1", EventName::ConsentRequestInFlight).with_retry_count(1);

    store.save_or_update(&later).await.unwrap();
    store.save_or_update(&earlier).await.unwrap();

    let loaded = store.get("e-1").await.unwrap().unwrap();
    assert_eq!(loaded.name, EventName::ConsentRequestInFlight);
    assert_eq!(loaded.retry_count, 1);
}

#[tokio::test]
async fn get_by_external_id_returns_latest_write() {
    let store = setup_store().await;
    let a = event("e-1", EventName::ConsentRequestConstructed).with_external_id("shared");
    let b = event("e-2", EventName::ConsentRequestAcked).with_external_id("shared");

    store.save_or_update(&a).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store.save_or_update(&b).await.unwrap();

    let found = store.get_by_external_id("shared").await.unwrap().unwrap();
    assert_eq!(found.id, "e-2");
}

#[tokio::test]
async fn list_excluding_and_delete_by_name() {
    let store = setup_store().await;
    store
        .save_or_update(&event("a", EventName::Completed))
        .await
        .unwrap();
    store
        .save_or_update(&event("b", EventName::ConsentRequestInFlight))
        .await
        .unwrap();
    store
        .save_or_update(&event("c", EventName::Completed))
        .await
        .unwrap();

    let open = store.list_excluding(EventName::Completed).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, "b");

    let deleted = store.delete_by_name(EventName::Completed).await.unwrap();
    assert_eq!(deleted, 2);

    let remaining = store.list().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "b");

    assert_eq!(store.delete_by_name(EventName::Completed).await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_writers_on_same_id_leave_one_row() {
    let store = Arc::new(setup_store().await);

    let mut handles = Vec::new();
    for attempt in 0..10u32 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let e = event("shared", EventName::ConsentRequestInFlight).with_retry_count(attempt);
            store.save_or_update(&e).await
        }));
    }
    for handle in handles {
        handle.await.expect("task panicked").expect("save failed");
    }

    let all = store.list().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, "shared");
}

#[tokio::test]
async fn ping_and_close() {
    let store = setup_store().await;
    store.ping().await.expect("ping failed");

    store.close().await;
    assert!(store.is_closed());
    assert!(matches!(store.ping().await, Err(StoreError::Closed)));
    assert!(matches!(store.list().await, Err(StoreError::Closed)));
}

#[tokio::test]
async fn migrate_twice_is_fine() {
    let store = setup_store().await;
    store.migrate().await.expect("second migration run failed");
}

#[tokio::test]
async fn file_database_survives_reconnect() {
    let path = std::env::temp_dir().join(format!("octopus-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());

    {
        let store = SqliteEventStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        store
            .save_or_update(&event("persisted", EventName::ConsentDistributed))
            .await
            .unwrap();
        store.close().await;
    }

    let reopened = SqliteEventStore::connect(&url).await.unwrap();
    reopened.migrate().await.unwrap();
    let loaded = reopened.get("persisted").await.unwrap();
    assert_eq!(loaded.map(|e| e.name), Some(EventName::ConsentDistributed));
    reopened.close().await;

    let _ = std::fs::remove_file(&path);
}
