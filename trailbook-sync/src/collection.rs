//! A local cache bound to the coordinator.
//!
//! `SyncedCollection` is what a page holds: it loads the collection once,
//! keeps itself current from the coordinator's change events, reloads in
//! full when asked to refresh, and carries the write path (see `writer`).

use crate::cache::{CacheOutcome, CachedRecord, LocalCache};
use crate::coordinator::{Subscription, SyncCoordinator};
use crate::error::SyncResult;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use trailbook_types::{ChangeEvent, Collection, Record, RecordId};

/// Records of one collection kept in sync with the backend.
pub struct SyncedCollection {
    pub(crate) coordinator: Arc<SyncCoordinator>,
    pub(crate) collection: Collection,
    cache: Mutex<LocalCache>,
    subscription: Mutex<Option<Subscription>>,
    /// Ids with a write on its way to the backend; their echoes are not
    /// conflicts.
    in_flight: Mutex<HashSet<RecordId>>,
    stale: AtomicBool,
}

impl SyncedCollection {
    /// Subscribes to `collection` and loads it.
    ///
    /// The subscription is registered before the initial load so nothing
    /// that happens during the load is missed. A failed load leaves the
    /// cache empty and marked stale; the failure goes to the status.
    pub async fn attach(coordinator: Arc<SyncCoordinator>, collection: Collection) -> Arc<Self> {
        let synced = Arc::new(Self {
            coordinator: coordinator.clone(),
            collection: collection.clone(),
            cache: Mutex::new(LocalCache::new(collection.clone())),
            subscription: Mutex::new(None),
            in_flight: Mutex::new(HashSet::new()),
            stale: AtomicBool::new(true),
        });

        let weak = Arc::downgrade(&synced);
        let subscription = coordinator.subscribe(collection, move |event| {
            if let Some(synced) = weak.upgrade() {
                synced.on_event(event);
            }
        });
        *synced.subscription() = Some(subscription);

        if let Err(e) = synced.reload().await {
            debug!("Initial load of {} failed: {}", synced.collection, e);
        }
        synced
    }

    fn subscription(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The collection name.
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// The coordinator this collection is bound to.
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Whether a reload is due.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Copy of the cached records, in display order.
    pub fn records(&self) -> Vec<Record> {
        self.read(|cache| cache.records().cloned().collect())
    }

    /// Copy of the cached records with their sync marks.
    pub fn entries(&self) -> Vec<CachedRecord> {
        self.read(|cache| cache.entries().to_vec())
    }

    /// Looks up one record.
    pub fn get(&self, id: &RecordId) -> Option<CachedRecord> {
        self.read(|cache| cache.get(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.read(LocalCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.read(LocalCache::is_empty)
    }

    /// Records that exist only on this device.
    pub fn unsynced(&self) -> Vec<CachedRecord> {
        self.read(|cache| cache.unsynced().into_iter().cloned().collect())
    }

    /// Stops listening for changes. The cached records stay readable.
    pub fn detach(&self) {
        if let Some(subscription) = self.subscription().take() {
            subscription.unsubscribe();
        }
    }

    /// Whether the change subscription is still registered.
    pub fn is_attached(&self) -> bool {
        self.subscription()
            .as_ref()
            .is_some_and(Subscription::is_active)
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&LocalCache) -> T) -> T {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        f(&cache)
    }

    /// Mutates the cache and reports how the number of unsynced changes
    /// moved. Status is updated after the cache lock is released.
    pub(crate) fn mutate<T>(&self, f: impl FnOnce(&mut LocalCache) -> T) -> T {
        let (result, delta) = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            let before = cache.pending_count() as i64;
            let result = f(&mut cache);
            (result, cache.pending_count() as i64 - before)
        };
        if delta != 0 {
            self.coordinator.record_pending(delta);
        }
        result
    }

    pub(crate) fn begin_write(&self, id: &RecordId) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
    }

    pub(crate) fn end_write(&self, id: &RecordId) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn is_in_flight(&self, id: Option<&RecordId>) -> bool {
        id.is_some_and(|id| {
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(id)
        })
    }

    /// Replaces the cache with a fresh read of the whole collection.
    /// Returns the number of records now cached.
    ///
    /// The fetch and the replace are not atomic with respect to channel
    /// events. A change applied while the fetch is outstanding can be
    /// overwritten by the older snapshot, and stays stale until the next
    /// refresh or `force_sync`.
    pub async fn reload(&self) -> SyncResult<usize> {
        match self.coordinator.store().fetch_all(&self.collection).await {
            Ok(records) => {
                let fetched = records.len();
                let (lost, len) = self.mutate(|cache| (cache.replace_all(records), cache.len()));
                self.stale.store(false, Ordering::Release);
                self.coordinator.record_conflicts(lost as u32);
                debug!("Reloaded {}: {} remote, {} cached", self.collection, fetched, len);
                Ok(len)
            }
            Err(e) => {
                self.stale.store(true, Ordering::Release);
                self.coordinator.report_failure(&self.collection, &e);
                Err(e)
            }
        }
    }

    fn on_event(self: &Arc<Self>, event: &ChangeEvent) {
        match self.mutate(|cache| cache.apply(event)) {
            CacheOutcome::Conflict if self.is_in_flight(event.record_id()) => {
                debug!("Echo of own write to {} merged", self.collection);
            }
            CacheOutcome::Conflict => {
                info!(
                    "Remote change to {} {} replaced an unsynced local edit",
                    self.collection,
                    event.record_id().map(RecordId::as_str).unwrap_or("?")
                );
                self.coordinator.record_conflicts(1);
            }
            CacheOutcome::ReloadRequired => {
                self.stale.store(true, Ordering::Release);
                self.spawn_reload();
            }
            _ => {}
        }
    }

    fn spawn_reload(self: &Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let synced = Arc::clone(self);
                handle.spawn(async move {
                    let _ = synced.reload().await;
                });
            }
            Err(_) => warn!(
                "No runtime to reload {}; it stays stale until reload() is called",
                self.collection
            ),
        }
    }
}

impl Drop for SyncedCollection {
    fn drop(&mut self) {
        self.detach();
    }
}
