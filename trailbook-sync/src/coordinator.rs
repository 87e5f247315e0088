//! Sync coordinator: multiplexes remote change channels to local callbacks.
//!
//! One coordinator exists per running app instance; it is constructed
//! explicitly and handed to whatever needs it. It keeps exactly one remote
//! channel per collection that has subscribers, normalizes what arrives on
//! it and fans each event out to the collection's callbacks in
//! registration order.
//!
//! Nothing in here returns errors to subscribers. Transport trouble turns
//! into `SyncStatus` changes; a panicking callback is logged and skipped.

use crate::config::SyncConfig;
use crate::error::{FailureKind, SyncError};
use crate::registry::{ChangeCallback, SubscriberRegistry, SubscriptionId};
use crate::status::{StatusBoard, StatusCallback, SyncStatus};
use crate::store::{ChannelMessage, ChannelSink, ChannelStatus, RemoteStore};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use trailbook_types::{ChangeEvent, Collection};

/// The sync coordinator.
pub struct SyncCoordinator {
    store: Arc<dyn RemoteStore>,
    config: SyncConfig,
    registry: Mutex<SubscriberRegistry>,
    status: StatusBoard,
    initialized: OnceCell<()>,
    disposed: AtomicBool,
    this: Weak<SyncCoordinator>,
}

impl SyncCoordinator {
    /// Creates a coordinator over `store`.
    pub fn new(store: Arc<dyn RemoteStore>, config: SyncConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            config,
            registry: Mutex::new(SubscriberRegistry::default()),
            status: StatusBoard::default(),
            initialized: OnceCell::new(),
            disposed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, SubscriberRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// One-time setup. Later calls, including concurrent ones from several
    /// mounting components, wait for the first and then return.
    pub async fn initialize(&self) {
        self.initialized
            .get_or_init(|| async {
                info!("Initializing sync against {} store", self.store.name());
                if self.config.check_on_initialize {
                    self.check_connection().await;
                }
            })
            .await;
    }

    /// Whether `initialize` has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Closes every channel and drops every subscriber and status observer.
    /// Subscriptions made afterwards are inert.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels = self.registry().drain();
        info!("Disposing sync coordinator, closing {} channels", channels.len());
        for channel in channels {
            channel.close();
        }
        self.status.clear_observers();
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Registers `callback` for every change event of `collection`.
    ///
    /// The first subscriber of a collection opens its remote channel; later
    /// ones share it. Dropping or calling `unsubscribe` on the returned
    /// handle removes only this callback.
    pub fn subscribe<F>(&self, collection: Collection, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe_arc(collection, Arc::new(callback))
    }

    /// `subscribe` for a callback that is already shared.
    pub fn subscribe_arc(&self, collection: Collection, callback: ChangeCallback) -> Subscription {
        if self.is_disposed() {
            warn!("subscribe to {} after dispose ignored", collection);
            return Subscription::inert(collection);
        }

        let (entry, open) = self.registry().add(&collection, callback);
        debug!("{} subscribed to {}", entry.id, collection);
        if let Some(generation) = open {
            self.open_channel(&collection, generation);
        }

        Subscription {
            id: entry.id,
            collection,
            coordinator: self.this.clone(),
            done: AtomicBool::new(false),
        }
    }

    fn unsubscribe(&self, collection: &Collection, id: SubscriptionId) {
        let channel = self.registry().remove(collection, id);
        debug!("{} unsubscribed from {}", id, collection);
        if let Some(channel) = channel {
            info!("Last subscriber left {}, closing channel", collection);
            channel.close();
        }
    }

    /// Delivers `event` to every current subscriber of `collection`, in
    /// registration order. Returns how many callbacks ran to completion.
    ///
    /// Works from a snapshot of the subscriber list, so callbacks may
    /// subscribe or unsubscribe freely. Callbacks added during the pass see
    /// the next event; callbacks removed during the pass are skipped.
    pub fn notify(&self, collection: &Collection, event: &ChangeEvent) -> usize {
        let subscribers = self.registry().snapshot(collection);
        let mut delivered = 0;
        for entry in subscribers {
            if entry.is_active() && entry.deliver(event) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Collections that currently have subscribers.
    pub fn active_collections(&self) -> Vec<Collection> {
        self.registry().collections()
    }

    /// Number of callbacks registered for `collection`.
    pub fn subscriber_count(&self, collection: &Collection) -> usize {
        self.registry().subscriber_count(collection)
    }

    // ── Remote channels ──────────────────────────────────────────

    fn open_channel(&self, collection: &Collection, generation: u64) {
        let sink = self.make_sink(collection.clone(), generation);
        match self.store.open_channel(collection, sink) {
            Ok(channel) => {
                debug!("Opened channel for {} (generation {})", collection, generation);
                let stale = self.registry().install_channel(collection, generation, channel);
                if let Some(stale) = stale {
                    debug!("Channel for {} superseded while opening, closing", collection);
                    stale.close();
                }
            }
            Err(e) => {
                warn!("Failed to open channel for {}: {}", collection, e);
                self.registry().mark_failed(collection, generation);
                self.status.update(|s| s.mark_disconnected(e.to_string()));
            }
        }
    }

    fn make_sink(&self, collection: Collection, generation: u64) -> ChannelSink {
        let coordinator = self.this.clone();
        Arc::new(move |message| {
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.on_channel_message(&collection, generation, message);
            }
        })
    }

    fn on_channel_message(
        &self,
        collection: &Collection,
        generation: u64,
        message: ChannelMessage,
    ) {
        if !self.registry().is_current(collection, generation) {
            debug!("Dropping message from superseded channel for {}", collection);
            return;
        }

        match message {
            ChannelMessage::Change(raw) => match raw.normalize(collection) {
                Ok(event) => {
                    self.notify(collection, &event);
                }
                Err(e) => warn!("Dropping malformed change for {}: {}", collection, e),
            },
            ChannelMessage::Status(ChannelStatus::Subscribed) => {
                self.status.update(SyncStatus::mark_connected);
            }
            ChannelMessage::Status(ChannelStatus::Error(reason)) => {
                warn!("Channel for {} failed: {}", collection, reason);
                self.fail_channel(collection, generation);
                self.status.update(|s| s.mark_disconnected(reason));
            }
            ChannelMessage::Status(ChannelStatus::Closed) => {
                debug!("Channel for {} closed by backend", collection);
                self.fail_channel(collection, generation);
            }
        }
    }

    fn fail_channel(&self, collection: &Collection, generation: u64) {
        let channel = self.registry().mark_failed(collection, generation);
        if let Some(channel) = channel {
            channel.close();
        }
    }

    /// Reopens channels that failed earlier. Returns how many were retried.
    fn reopen_failed(&self) -> usize {
        let reopen = self.registry().take_failed();
        for (collection, generation) in &reopen {
            info!("Reopening channel for {}", collection);
            self.open_channel(collection, *generation);
        }
        reopen.len()
    }

    /// Whether any collection is waiting for its channel to be reopened.
    pub fn has_failed_channels(&self) -> bool {
        self.registry().has_failed_channels()
    }

    // ── Health ───────────────────────────────────────────────────

    /// Round-trips to the backend, bounded by the configured timeout, and
    /// records the outcome in the status. Collection data is untouched.
    /// A successful check also reopens broken channels.
    pub async fn check_connection(&self) -> bool {
        let timeout = self.config.connection_timeout();
        let connected = match tokio::time::timeout(timeout, self.store.ping()).await {
            Ok(Ok(())) => {
                self.status.update(SyncStatus::mark_connected);
                true
            }
            Ok(Err(e)) => {
                warn!("Connection check failed: {}", e);
                match e.failure_kind() {
                    FailureKind::Configuration => self.status.update(|s| {
                        s.mark_disconnected(e.to_string());
                        s.enter_local_only(None, e.to_string());
                    }),
                    _ => self.status.update(|s| s.mark_disconnected(e.to_string())),
                }
                false
            }
            Err(_) => {
                warn!("Connection check timed out after {:?}", timeout);
                self.status
                    .update(|s| s.mark_disconnected(SyncError::Timeout.to_string()));
                false
            }
        };

        if connected && !self.is_disposed() {
            self.reopen_failed();
        }
        connected
    }

    /// Tells every subscriber of every active collection to reload in full,
    /// then stamps `last_sync`. Broken channels are reopened first.
    pub async fn force_sync(&self) {
        if self.is_disposed() {
            return;
        }
        self.check_connection().await;
        self.reopen_failed();

        let collections = self.active_collections();
        for collection in &collections {
            let event = ChangeEvent::refresh(collection.clone());
            self.notify(collection, &event);
        }
        self.status.update(|s| s.record_sync(Utc::now()));
        info!("Forced refresh of {} collections", collections.len());
    }

    // ── Status ───────────────────────────────────────────────────

    /// Current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    /// Observes status changes. The callback runs once right away with the
    /// current status.
    pub fn subscribe_to_status<F>(&self, callback: F) -> StatusSubscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let callback: StatusCallback = Arc::new(callback);
        if self.is_disposed() {
            return StatusSubscription {
                id: 0,
                coordinator: Weak::new(),
                done: AtomicBool::new(true),
            };
        }
        let id = self.status.add_observer(callback);
        StatusSubscription {
            id,
            coordinator: self.this.clone(),
            done: AtomicBool::new(false),
        }
    }

    /// Number of registered status observers.
    pub fn status_observer_count(&self) -> usize {
        self.status.observer_count()
    }

    /// Adjusts the count of local-only changes.
    pub fn record_pending(&self, delta: i64) {
        self.status.update(|s| s.adjust_pending(delta));
    }

    /// Counts local edits lost to remote changes.
    pub fn record_conflicts(&self, count: u32) {
        if count > 0 {
            self.status.update(|s| s.record_conflicts(count));
        }
    }

    /// Converts a write or read failure into status, per its kind.
    pub fn report_failure(&self, collection: &Collection, error: &SyncError) {
        match error.failure_kind() {
            FailureKind::Configuration => {
                warn!("{} unavailable remotely, working locally: {}", collection, error);
                self.status
                    .update(|s| s.enter_local_only(Some(collection), error.to_string()));
            }
            FailureKind::Transient | FailureKind::Fatal => {
                warn!("Sync failure for {}: {}", collection, error);
                self.status.update(|s| s.note_error(error.to_string()));
            }
        }
    }

    /// Clears local-only mode for `collection` after a write to it went
    /// through.
    pub fn report_write_success(&self, collection: &Collection) {
        self.status.update(|s| s.leave_local_only(collection));
    }
}

/// Handle for one registered change callback.
///
/// Unsubscribes on drop. `unsubscribe` may be called any number of times,
/// including from inside the callback itself.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    id: SubscriptionId,
    collection: Collection,
    coordinator: Weak<SyncCoordinator>,
    done: AtomicBool,
}

impl Subscription {
    fn inert(collection: Collection) -> Self {
        Self {
            id: SubscriptionId::new(0),
            collection,
            coordinator: Weak::new(),
            done: AtomicBool::new(true),
        }
    }

    /// This subscription's id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The collection subscribed to.
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Whether the callback is still registered.
    pub fn is_active(&self) -> bool {
        !self.done.load(Ordering::Acquire)
    }

    /// Removes the callback. Later calls do nothing.
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.unsubscribe(&self.collection, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("collection", &self.collection)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Handle for a status observer. Unsubscribes on drop.
#[must_use = "dropping a StatusSubscription unsubscribes it"]
pub struct StatusSubscription {
    id: u64,
    coordinator: Weak<SyncCoordinator>,
    done: AtomicBool,
}

impl StatusSubscription {
    /// Removes the observer. Later calls do nothing.
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.status.remove_observer(self.id);
        }
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
