//! Tests for the in-memory remote store.

use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use trailbook_sync::{
    ChannelMessage, ChannelSink, ChannelStatus, FailureKind, MemoryStore, RemoteChannel,
    RemoteStore, SyncError,
};
use trailbook_types::{ChangeKind, Collection, RawChange, Record, RecordId};

fn lochs() -> Collection {
    Collection::new(Collection::LOCHS_VISITED).unwrap()
}

fn collecting_sink() -> (Arc<Mutex<Vec<ChannelMessage>>>, ChannelSink) {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    (
        messages,
        Arc::new(move |message: ChannelMessage| sink.lock().unwrap().push(message)),
    )
}

fn loch(name: &str) -> Record {
    Record::new(RecordId::local()).field("name", name)
}

// ── Provisioning ────────────────────────────────────────────────

#[tokio::test]
async fn unprovisioned_collection_is_schema_missing() {
    let store = MemoryStore::new();

    let err = store.fetch_all(&lochs()).await.unwrap_err();
    assert_eq!(err.failure_kind(), FailureKind::Configuration);

    let err = store.insert(&lochs(), loch("Loch Ness")).await.unwrap_err();
    assert!(matches!(err, SyncError::SchemaMissing { .. }));
}

#[tokio::test]
async fn drop_collection_removes_the_table() {
    let store = MemoryStore::with_collections(&[Collection::LOCHS_VISITED]);
    store.drop_collection(&lochs());
    assert!(store.fetch_all(&lochs()).await.is_err());
}

#[test]
fn seeded_rows_are_readable_without_a_runtime() {
    let store = MemoryStore::with_collections(&[Collection::LOCHS_VISITED]);
    store.seed(&lochs(), vec![Record::new(RecordId::new("ness")).field("name", "Loch Ness")]);

    let rows = tokio_test::block_on(store.fetch_all(&lochs())).unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_str("name"), Some("Loch Ness"));
}

// ── CRUD ────────────────────────────────────────────────────────

#[tokio::test]
async fn insert_assigns_ids_and_timestamps() {
    let store = MemoryStore::with_collections(&[Collection::LOCHS_VISITED]);

    let first = store.insert(&lochs(), loch("Loch Ness")).await.unwrap();
    let second = store.insert(&lochs(), loch("Loch Awe")).await.unwrap();

    assert!(!first.id().is_local());
    assert_ne!(first.id(), second.id());
    assert!(first.get_str("created_at").is_some());
    assert_eq!(store.rows(&lochs()).len(), 2);
}

#[tokio::test]
async fn insert_keeps_caller_supplied_ids() {
    let store = MemoryStore::with_collections(&[Collection::LOCHS_VISITED]);
    let record = Record::new(RecordId::new("ness")).field("name", "Loch Ness");

    let canonical = store.insert(&lochs(), record.clone()).await.unwrap();
    assert_eq!(canonical.id().as_str(), "ness");

    let err = store.insert(&lochs(), record).await.unwrap_err();
    assert!(matches!(err, SyncError::Rejected { status: 409, .. }));
}

#[tokio::test]
async fn update_merges_fields() {
    let store = MemoryStore::with_collections(&[Collection::LOCHS_VISITED]);
    let created = store
        .insert(&lochs(), loch("Loch Ness").field("monster_seen", false))
        .await
        .unwrap();

    let patch = Record::new(created.id().clone()).field("monster_seen", true);
    let canonical = store.update(&lochs(), patch).await.unwrap();

    assert_eq!(canonical.get_str("name"), Some("Loch Ness"));
    assert_eq!(canonical.get("monster_seen"), Some(&serde_json::Value::Bool(true)));
}

#[tokio::test]
async fn update_of_missing_row_is_not_found() {
    let store = MemoryStore::with_collections(&[Collection::LOCHS_VISITED]);
    let err = store
        .update(&lochs(), Record::new(RecordId::new("nope")))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

#[tokio::test]
async fn delete_of_missing_row_succeeds() {
    let store = MemoryStore::with_collections(&[Collection::LOCHS_VISITED]);
    store.delete(&lochs(), &RecordId::new("nope")).await.unwrap();
}

#[tokio::test]
async fn unreachable_store_fails_transiently() {
    let store = MemoryStore::with_collections(&[Collection::LOCHS_VISITED]);
    store.set_reachable(false);

    assert!(store.ping().await.unwrap_err().is_transient());
    assert!(store.fetch_all(&lochs()).await.unwrap_err().is_transient());
    let (_messages, sink) = collecting_sink();
    assert!(store.open_channel(&lochs(), sink).is_err());

    store.set_reachable(true);
    store.ping().await.unwrap();
}

// ── Channels ────────────────────────────────────────────────────

#[tokio::test]
async fn channel_reports_subscribed_then_echoes_writes() {
    let store = MemoryStore::with_collections(&[Collection::LOCHS_VISITED]);
    let (messages, sink) = collecting_sink();
    let channel = store.open_channel(&lochs(), sink).unwrap();
    assert_eq!(channel.collection(), &lochs());

    let created = store.insert(&lochs(), loch("Loch Ness")).await.unwrap();
    store.delete(&lochs(), created.id()).await.unwrap();

    let messages = messages.lock().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0], ChannelMessage::Status(ChannelStatus::Subscribed));
    match &messages[1] {
        ChannelMessage::Change(raw) => {
            assert_eq!(raw.event_type, ChangeKind::Insert.as_str());
            assert_eq!(raw.new.as_ref().unwrap()["id"], created.id().as_str());
        }
        other => panic!("expected change, got {other:?}"),
    }
    match &messages[2] {
        ChannelMessage::Change(raw) => {
            assert_eq!(raw.event_type, ChangeKind::Delete.as_str());
            assert!(raw.old.is_some());
        }
        other => panic!("expected change, got {other:?}"),
    }
}

#[tokio::test]
async fn echo_can_be_switched_off() {
    let store = MemoryStore::with_collections(&[Collection::LOCHS_VISITED]);
    store.set_echo(false);
    let (messages, sink) = collecting_sink();
    let _channel = store.open_channel(&lochs(), sink).unwrap();

    store.insert(&lochs(), loch("Loch Ness")).await.unwrap();

    assert_eq!(messages.lock().unwrap().len(), 1);
}

#[test]
fn close_stops_delivery() {
    let store = MemoryStore::with_collections(&[Collection::LOCHS_VISITED]);
    let (messages, sink) = collecting_sink();
    let channel = store.open_channel(&lochs(), sink).unwrap();

    channel.close();
    channel.close();
    store.emit(&lochs(), RawChange::refresh());

    assert_eq!(messages.lock().unwrap().len(), 1);
    assert_eq!(store.open_channels(&lochs()), 0);
    assert_eq!(store.channels_opened(&lochs()), 1);
    assert!(store.live_collections().is_empty());
}

#[test]
fn fail_channels_reports_the_error_and_drops_them() {
    let store = MemoryStore::with_collections(&[Collection::LOCHS_VISITED]);
    let (messages, sink) = collecting_sink();
    let _channel = store.open_channel(&lochs(), sink).unwrap();

    store.fail_channels(&lochs(), "backend restarted");

    assert_eq!(
        messages.lock().unwrap().last(),
        Some(&ChannelMessage::Status(ChannelStatus::Error(
            "backend restarted".into()
        )))
    );
    assert_eq!(store.open_channels(&lochs()), 0);
}
