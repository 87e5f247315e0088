//! Tests for the sync coordinator: channel sharing, dispatch order,
//! re-entrancy, panic isolation, channel failure and health checks.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use trailbook_sync::{
    ChannelSink, ConnectionState, MemoryStore, RemoteChannel, RemoteStore, Subscription,
    SyncConfig, SyncCoordinator, SyncResult,
};
use trailbook_types::{ChangeEvent, ChangeKind, Collection, RawChange, Record, RecordId};

fn pins() -> Collection {
    Collection::new(Collection::MAP_PINS).unwrap()
}

fn milestones() -> Collection {
    Collection::new(Collection::MILESTONES).unwrap()
}

fn setup() -> (MemoryStore, Arc<SyncCoordinator>) {
    let store = MemoryStore::with_collections(&[Collection::MAP_PINS, Collection::MILESTONES]);
    let coordinator = SyncCoordinator::new(Arc::new(store.clone()), SyncConfig::default());
    (store, coordinator)
}

fn insert(id: &str, title: &str) -> RawChange {
    RawChange::new(
        ChangeKind::Insert,
        Some(json!({ "id": id, "title": title })),
        None,
    )
}

type Log = Arc<Mutex<Vec<ChangeEvent>>>;

fn recorder() -> (Log, impl Fn(&ChangeEvent) + Send + Sync + 'static) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    (log, move |event: &ChangeEvent| {
        sink.lock().unwrap().push(event.clone())
    })
}

/// Delegates to a memory store and counts pings.
struct CountingStore {
    inner: MemoryStore,
    pings: AtomicUsize,
}

#[async_trait]
impl RemoteStore for CountingStore {
    fn name(&self) -> &str {
        "counting"
    }

    fn open_channel(
        &self,
        collection: &Collection,
        sink: ChannelSink,
    ) -> SyncResult<Box<dyn RemoteChannel>> {
        self.inner.open_channel(collection, sink)
    }

    async fn fetch_all(&self, collection: &Collection) -> SyncResult<Vec<Record>> {
        self.inner.fetch_all(collection).await
    }

    async fn insert(&self, collection: &Collection, record: Record) -> SyncResult<Record> {
        self.inner.insert(collection, record).await
    }

    async fn update(&self, collection: &Collection, record: Record) -> SyncResult<Record> {
        self.inner.update(collection, record).await
    }

    async fn delete(&self, collection: &Collection, id: &RecordId) -> SyncResult<()> {
        self.inner.delete(collection, id).await
    }

    async fn ping(&self) -> SyncResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.inner.ping().await
    }
}

// ── Channel sharing ─────────────────────────────────────────────

#[test]
fn subscribers_share_one_channel_per_collection() {
    let (store, coordinator) = setup();

    let _a = coordinator.subscribe(pins(), |_| {});
    let _b = coordinator.subscribe(pins(), |_| {});
    let _c = coordinator.subscribe(milestones(), |_| {});

    assert_eq!(store.channels_opened(&pins()), 1);
    assert_eq!(store.open_channels(&pins()), 1);
    assert_eq!(store.channels_opened(&milestones()), 1);
    assert_eq!(coordinator.subscriber_count(&pins()), 2);
    assert_eq!(coordinator.active_collections(), vec![pins(), milestones()]);
}

#[test]
fn channel_closes_only_when_last_subscriber_leaves() {
    let (store, coordinator) = setup();

    let a = coordinator.subscribe(pins(), |_| {});
    let b = coordinator.subscribe(pins(), |_| {});

    drop(a);
    assert_eq!(store.open_channels(&pins()), 1);
    assert_eq!(coordinator.subscriber_count(&pins()), 1);

    b.unsubscribe();
    assert_eq!(store.open_channels(&pins()), 0);
    assert!(coordinator.active_collections().is_empty());
}

#[test]
fn resubscribing_after_teardown_opens_a_fresh_channel() {
    let (store, coordinator) = setup();

    drop(coordinator.subscribe(pins(), |_| {}));
    let _again = coordinator.subscribe(pins(), |_| {});

    assert_eq!(store.channels_opened(&pins()), 2);
    assert_eq!(store.open_channels(&pins()), 1);
}

// ── Dispatch ────────────────────────────────────────────────────

#[test]
fn events_reach_subscribers_in_registration_order() {
    let (store, coordinator) = setup();
    let order = Arc::new(Mutex::new(Vec::new()));

    let subs: Vec<Subscription> = (1..=3)
        .map(|n| {
            let order = order.clone();
            coordinator.subscribe(pins(), move |_| order.lock().unwrap().push(n))
        })
        .collect();

    store.emit(&pins(), insert("1", "Glencoe"));
    store.emit(&pins(), insert("2", "Skye"));

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 1, 2, 3]);
    drop(subs);
}

#[test]
fn raw_changes_are_normalized_before_delivery() {
    let (store, coordinator) = setup();
    let (log, callback) = recorder();
    let _sub = coordinator.subscribe(pins(), callback);

    store.emit(&pins(), insert("7", "Eilean Donan"));

    let events = log.lock().unwrap();
    assert_eq!(events.len(), 1);
    match &events[0] {
        ChangeEvent::Insert { collection, new } => {
            assert_eq!(collection, &pins());
            assert_eq!(new.id().as_str(), "7");
            assert_eq!(new.get_str("title"), Some("Eilean Donan"));
        }
        other => panic!("expected insert, got {other:?}"),
    }
}

#[test]
fn malformed_changes_are_dropped() {
    let (store, coordinator) = setup();
    let (log, callback) = recorder();
    let _sub = coordinator.subscribe(pins(), callback);

    store.emit(&pins(), RawChange::new(ChangeKind::Delete, None, None));
    store.emit(&pins(), RawChange::new(ChangeKind::Insert, Some(json!({})), None));

    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn events_stay_within_their_collection() {
    let (store, coordinator) = setup();
    let (pin_log, pin_cb) = recorder();
    let (milestone_log, milestone_cb) = recorder();
    let _a = coordinator.subscribe(pins(), pin_cb);
    let _b = coordinator.subscribe(milestones(), milestone_cb);

    store.emit(&milestones(), insert("1", "First munro"));

    assert!(pin_log.lock().unwrap().is_empty());
    assert_eq!(milestone_log.lock().unwrap().len(), 1);
}

#[test]
fn panicking_subscriber_does_not_stop_the_others() {
    let (store, coordinator) = setup();
    let (log, callback) = recorder();

    let _bad = coordinator.subscribe(pins(), |_| panic!("render failed"));
    let _good = coordinator.subscribe(pins(), callback);

    store.emit(&pins(), insert("1", "Glencoe"));
    store.emit(&pins(), insert("2", "Skye"));

    assert_eq!(log.lock().unwrap().len(), 2);
    assert_eq!(coordinator.subscriber_count(&pins()), 2);
}

#[test]
fn notify_reports_completed_deliveries() {
    let (_store, coordinator) = setup();
    let _a = coordinator.subscribe(pins(), |_| {});
    let _b = coordinator.subscribe(pins(), |_| panic!("boom"));
    let _c = coordinator.subscribe(pins(), |_| {});

    let delivered = coordinator.notify(&pins(), &ChangeEvent::refresh(pins()));
    assert_eq!(delivered, 2);
    assert_eq!(coordinator.notify(&milestones(), &ChangeEvent::refresh(milestones())), 0);
}

// ── Re-entrancy ─────────────────────────────────────────────────

fn logged_ids(log: &Log) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|e| e.record_id().map(RecordId::to_string))
        .collect()
}

#[test]
fn subscriber_can_unsubscribe_itself_during_delivery() {
    let (store, coordinator) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let (before_log, before) = recorder();
    let (after_log, after) = recorder();

    let first = coordinator.subscribe(pins(), before);
    let sub = {
        let calls = calls.clone();
        let slot = slot.clone();
        coordinator.subscribe(pins(), move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = slot.lock().unwrap().take() {
                me.unsubscribe();
            }
        })
    };
    *slot.lock().unwrap() = Some(sub);
    let last = coordinator.subscribe(pins(), after);

    store.emit(&pins(), insert("1", "Glencoe"));
    store.emit(&pins(), insert("2", "Skye"));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(logged_ids(&before_log), vec!["1", "2"]);
    assert_eq!(logged_ids(&after_log), vec!["1", "2"]);
    assert_eq!(coordinator.subscriber_count(&pins()), 2);
    assert_eq!(store.open_channels(&pins()), 1);

    drop(first);
    drop(last);
    assert_eq!(coordinator.subscriber_count(&pins()), 0);
    assert_eq!(store.open_channels(&pins()), 0);
}

#[test]
fn subscriber_removed_mid_pass_receives_nothing() {
    let (store, coordinator) = setup();
    let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let (log, callback) = recorder();

    let _first = {
        let victim = victim.clone();
        coordinator.subscribe(pins(), move |_| {
            if let Some(sub) = victim.lock().unwrap().take() {
                sub.unsubscribe();
            }
        })
    };
    *victim.lock().unwrap() = Some(coordinator.subscribe(pins(), callback));

    store.emit(&pins(), insert("1", "Glencoe"));

    assert!(log.lock().unwrap().is_empty());
    assert_eq!(coordinator.subscriber_count(&pins()), 1);
}

#[test]
fn subscriber_added_mid_pass_starts_with_the_next_event() {
    let (store, coordinator) = setup();
    let (log, callback) = recorder();
    let callback = Arc::new(callback);
    let added: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

    let _first = {
        let weak = Arc::downgrade(&coordinator);
        let added = added.clone();
        coordinator.subscribe(pins(), move |_| {
            let mut added = added.lock().unwrap();
            if added.is_none() {
                if let Some(coordinator) = weak.upgrade() {
                    let callback = callback.clone();
                    *added = Some(coordinator.subscribe(pins(), move |e| (*callback)(e)));
                }
            }
        })
    };

    store.emit(&pins(), insert("1", "Glencoe"));
    assert!(log.lock().unwrap().is_empty());

    store.emit(&pins(), insert("2", "Skye"));
    let events = log.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].record_id().map(RecordId::as_str), Some("2"));
}

#[test]
fn unsubscribe_is_idempotent() {
    let (_store, coordinator) = setup();
    let a = coordinator.subscribe(pins(), |_| {});
    let _b = coordinator.subscribe(pins(), |_| {});

    a.unsubscribe();
    a.unsubscribe();
    assert!(!a.is_active());
    drop(a);

    assert_eq!(coordinator.subscriber_count(&pins()), 1);
}

#[test]
fn subscription_ids_are_distinct() {
    let (_store, coordinator) = setup();
    let a = coordinator.subscribe(pins(), |_| {});
    let b = coordinator.subscribe(pins(), |_| {});
    assert_ne!(a.id(), b.id());
    assert_eq!(a.collection(), &pins());
    assert!(a.id().to_string().starts_with("sub-"));
}

// ── Dispose ─────────────────────────────────────────────────────

#[test]
fn dispose_closes_channels_and_clears_registries() {
    let (store, coordinator) = setup();
    let (log, callback) = recorder();
    let _a = coordinator.subscribe(pins(), callback);
    let _b = coordinator.subscribe(milestones(), |_| {});
    let _status = coordinator.subscribe_to_status(|_| {});

    coordinator.dispose();

    assert!(coordinator.is_disposed());
    assert_eq!(store.open_channels(&pins()), 0);
    assert_eq!(store.open_channels(&milestones()), 0);
    assert!(coordinator.active_collections().is_empty());
    assert_eq!(coordinator.status_observer_count(), 0);

    store.emit(&pins(), insert("1", "Glencoe"));
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn subscribe_after_dispose_is_inert() {
    let (store, coordinator) = setup();
    coordinator.dispose();

    let sub = coordinator.subscribe(pins(), |_| {});

    assert!(!sub.is_active());
    assert_eq!(store.channels_opened(&pins()), 0);
    assert_eq!(coordinator.subscriber_count(&pins()), 0);
}

#[test]
fn dropping_handles_after_dispose_is_harmless() {
    let (_store, coordinator) = setup();
    let sub = coordinator.subscribe(pins(), |_| {});
    let status = coordinator.subscribe_to_status(|_| {});
    coordinator.dispose();
    coordinator.dispose();
    drop(sub);
    drop(status);
    assert!(coordinator.is_disposed());
}

// ── Channel failure ─────────────────────────────────────────────

#[tokio::test]
async fn channel_error_marks_disconnected_until_force_sync_reopens_it() {
    let (store, coordinator) = setup();
    let (log, callback) = recorder();
    let _sub = coordinator.subscribe(pins(), callback);
    assert!(coordinator.status().connected);

    store.fail_channels(&pins(), "socket closed");

    let status = coordinator.status();
    assert!(!status.connected);
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.last_error.as_deref(), Some("socket closed"));
    assert!(coordinator.has_failed_channels());

    coordinator.force_sync().await;

    assert!(!coordinator.has_failed_channels());
    assert_eq!(store.channels_opened(&pins()), 2);
    assert_eq!(store.open_channels(&pins()), 1);
    assert!(coordinator.status().connected);

    log.lock().unwrap().clear();
    store.emit(&pins(), insert("1", "Glencoe"));
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn failed_open_is_retried_by_the_next_subscriber() {
    let (store, coordinator) = setup();
    store.set_reachable(false);

    let _a = coordinator.subscribe(pins(), |_| {});
    assert!(coordinator.has_failed_channels());
    assert!(!coordinator.status().connected);
    assert_eq!(store.open_channels(&pins()), 0);

    store.set_reachable(true);
    let _b = coordinator.subscribe(pins(), |_| {});

    assert!(!coordinator.has_failed_channels());
    assert_eq!(store.open_channels(&pins()), 1);
    assert_eq!(coordinator.subscriber_count(&pins()), 2);
}

#[tokio::test]
async fn successful_check_reopens_failed_channels() {
    let (store, coordinator) = setup();
    let _sub = coordinator.subscribe(pins(), |_| {});
    store.fail_channels(&pins(), "socket closed");

    assert!(coordinator.check_connection().await);

    assert_eq!(store.open_channels(&pins()), 1);
    assert!(!coordinator.has_failed_channels());
}

// ── Health checks ───────────────────────────────────────────────

#[test]
fn status_starts_out_connecting() {
    let (_store, coordinator) = setup();
    let status = coordinator.status();
    assert!(!status.connected);
    assert_eq!(status.state, ConnectionState::Connecting);
    assert_eq!(status.last_sync, None);
}

#[tokio::test]
async fn check_connection_reports_reachability() {
    let (store, coordinator) = setup();

    assert!(coordinator.check_connection().await);
    assert_eq!(coordinator.status().state, ConnectionState::Connected);

    store.set_reachable(false);
    assert!(!coordinator.check_connection().await);
    let status = coordinator.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(status.last_error.unwrap().contains("unreachable"));
}

#[tokio::test(start_paused = true)]
async fn check_connection_times_out() {
    let store = MemoryStore::new();
    store.set_ping_delay(Some(Duration::from_secs(30)));
    let config = SyncConfig {
        connection_timeout_ms: 200,
        ..SyncConfig::default()
    };
    let coordinator = SyncCoordinator::new(Arc::new(store), config);

    assert!(!coordinator.check_connection().await);

    let status = coordinator.status();
    assert!(!status.connected);
    assert_eq!(status.last_error.as_deref(), Some("operation timed out"));
}

#[tokio::test]
async fn initialize_runs_once_for_concurrent_callers() {
    let store = CountingStore {
        inner: MemoryStore::new(),
        pings: AtomicUsize::new(0),
    };
    let store = Arc::new(store);
    let coordinator = SyncCoordinator::new(store.clone(), SyncConfig::default());

    tokio::join!(
        coordinator.initialize(),
        coordinator.initialize(),
        coordinator.initialize()
    );
    coordinator.initialize().await;

    assert!(coordinator.is_initialized());
    assert_eq!(store.pings.load(Ordering::SeqCst), 1);
    assert!(coordinator.status().connected);
}

#[tokio::test]
async fn initialize_can_skip_the_connection_check() {
    let store = Arc::new(CountingStore {
        inner: MemoryStore::new(),
        pings: AtomicUsize::new(0),
    });
    let config = SyncConfig {
        check_on_initialize: false,
        ..SyncConfig::default()
    };
    let coordinator = SyncCoordinator::new(store.clone(), config);

    coordinator.initialize().await;

    assert!(coordinator.is_initialized());
    assert_eq!(store.pings.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.status().state, ConnectionState::Connecting);
}

// ── Forced refresh ──────────────────────────────────────────────

#[tokio::test]
async fn force_sync_sends_one_refresh_per_active_collection() {
    let (_store, coordinator) = setup();
    let (pin_log, pin_cb) = recorder();
    let (milestone_log, milestone_cb) = recorder();
    let _a = coordinator.subscribe(pins(), pin_cb);
    let _b = coordinator.subscribe(milestones(), milestone_cb);

    coordinator.force_sync().await;

    assert_eq!(*pin_log.lock().unwrap(), vec![ChangeEvent::refresh(pins())]);
    assert_eq!(
        *milestone_log.lock().unwrap(),
        vec![ChangeEvent::refresh(milestones())]
    );
    assert!(coordinator.status().last_sync.is_some());
}

#[tokio::test]
async fn last_sync_never_moves_backwards() {
    let (_store, coordinator) = setup();

    coordinator.force_sync().await;
    let first = coordinator.status().last_sync.unwrap();
    coordinator.force_sync().await;
    let second = coordinator.status().last_sync.unwrap();

    assert!(second >= first);
}

#[tokio::test]
async fn force_sync_while_offline_still_refreshes_subscribers() {
    let (store, coordinator) = setup();
    let (log, callback) = recorder();
    let _sub = coordinator.subscribe(pins(), callback);
    store.set_reachable(false);

    coordinator.force_sync().await;

    let status = coordinator.status();
    assert!(!status.connected);
    assert!(status.last_sync.is_some());
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn force_sync_after_dispose_does_nothing() {
    let (_store, coordinator) = setup();
    coordinator.dispose();
    coordinator.force_sync().await;
    assert_eq!(coordinator.status().last_sync, None);
}
