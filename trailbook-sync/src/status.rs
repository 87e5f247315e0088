//! Sync health tracking.
//!
//! `SyncStatus` is derived, in-memory state: it starts out unknown, is
//! updated by connection checks, channel notifications and write failures,
//! and is never persisted.

use crate::registry::invoke_isolated;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use trailbook_types::Collection;

/// Callback invoked whenever the status changes.
pub type StatusCallback = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

/// Coarse state for the compact sync indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection check has completed yet.
    Connecting,
    /// Backend reachable and every collection usable.
    Connected,
    /// At least one collection is degraded to local-only storage.
    LocalOnly,
    /// Backend unreachable or a change channel broke.
    Disconnected,
}

/// Snapshot of sync health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Whether the backend answered the last check and channels are healthy.
    pub connected: bool,
    /// When the last full refresh completed.
    pub last_sync: Option<DateTime<Utc>>,
    /// Local-only changes not yet written remotely.
    pub pending_changes: u32,
    /// Local edits overwritten by a remote change.
    pub conflict_count: u32,
    /// Human-readable cause of the last failure.
    pub last_error: Option<String>,
    /// Indicator state derived from the fields above.
    pub state: ConnectionState,
    #[serde(skip)]
    checked: bool,
    /// The backend itself rejected our configuration.
    #[serde(skip)]
    unconfigured: bool,
    /// Collections missing on the backend.
    #[serde(skip)]
    degraded: BTreeSet<Collection>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            connected: false,
            last_sync: None,
            pending_changes: 0,
            conflict_count: 0,
            last_error: None,
            state: ConnectionState::Connecting,
            checked: false,
            unconfigured: false,
            degraded: BTreeSet::new(),
        }
    }
}

impl SyncStatus {
    /// One-line summary for a status badge.
    pub fn indicator_label(&self) -> String {
        let base = match self.state {
            ConnectionState::Connecting => "Connecting…",
            ConnectionState::Connected => "Synced",
            ConnectionState::LocalOnly => "Saved on this device",
            ConnectionState::Disconnected => "Offline",
        };
        if self.pending_changes > 0 {
            format!("{base} ({} pending)", self.pending_changes)
        } else {
            base.to_string()
        }
    }

    /// Whether the local-only degradation is in effect.
    pub fn is_local_only(&self) -> bool {
        self.unconfigured || !self.degraded.is_empty()
    }

    /// Collections currently kept on this device only, sorted by name.
    pub fn local_only_collections(&self) -> impl Iterator<Item = &Collection> {
        self.degraded.iter()
    }

    /// A successful round-trip proves the store configuration; missing
    /// collections stay degraded until they take a write.
    pub(crate) fn mark_connected(&mut self) {
        self.checked = true;
        self.connected = true;
        self.unconfigured = false;
        if !self.is_local_only() {
            self.last_error = None;
        }
        self.recompute();
    }

    pub(crate) fn mark_disconnected(&mut self, reason: impl Into<String>) {
        self.checked = true;
        self.connected = false;
        self.last_error = Some(reason.into());
        self.recompute();
    }

    /// Configuration problems leave `connected` alone: the backend is up,
    /// the collection is not. `None` means the whole store is unusable.
    pub(crate) fn enter_local_only(
        &mut self,
        collection: Option<&Collection>,
        reason: impl Into<String>,
    ) {
        match collection {
            Some(collection) => {
                self.degraded.insert(collection.clone());
            }
            None => self.unconfigured = true,
        }
        self.last_error = Some(reason.into());
        self.recompute();
    }

    /// Clears local-only mode for one collection. Other degraded
    /// collections keep the indicator in `LocalOnly`.
    pub(crate) fn leave_local_only(&mut self, collection: &Collection) {
        if self.degraded.remove(collection) {
            if self.connected && !self.is_local_only() {
                self.last_error = None;
            }
            self.recompute();
        }
    }

    pub(crate) fn note_error(&mut self, reason: impl Into<String>) {
        self.last_error = Some(reason.into());
    }

    /// Stamps a completed refresh. Never moves `last_sync` backwards.
    pub(crate) fn record_sync(&mut self, now: DateTime<Utc>) {
        self.last_sync = Some(self.last_sync.map_or(now, |prev| prev.max(now)));
    }

    pub(crate) fn adjust_pending(&mut self, delta: i64) {
        let next = (i64::from(self.pending_changes) + delta).clamp(0, i64::from(u32::MAX));
        self.pending_changes = next as u32;
    }

    pub(crate) fn record_conflicts(&mut self, count: u32) {
        self.conflict_count = self.conflict_count.saturating_add(count);
    }

    fn recompute(&mut self) {
        self.state = if self.is_local_only() {
            ConnectionState::LocalOnly
        } else if !self.checked {
            ConnectionState::Connecting
        } else if self.connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
    }
}

struct StatusObserver {
    id: u64,
    callback: StatusCallback,
    active: AtomicBool,
}

/// Owns the current status and its observers.
#[derive(Default)]
pub(crate) struct StatusBoard {
    status: Mutex<SyncStatus>,
    observers: Mutex<Vec<Arc<StatusObserver>>>,
    next_id: AtomicU64,
}

impl StatusBoard {
    fn status(&self) -> MutexGuard<'_, SyncStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observers(&self) -> MutexGuard<'_, Vec<Arc<StatusObserver>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> SyncStatus {
        self.status().clone()
    }

    /// Applies `f` and notifies observers if anything changed.
    pub(crate) fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        let changed = {
            let mut status = self.status();
            let before = status.clone();
            f(&mut status);
            (*status != before).then(|| status.clone())
        };
        if let Some(status) = changed {
            self.publish(&status);
        }
    }

    /// Registers an observer and immediately hands it the current status.
    pub(crate) fn add_observer(&self, callback: StatusCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let observer = Arc::new(StatusObserver {
            id,
            callback,
            active: AtomicBool::new(true),
        });
        self.observers().push(observer.clone());
        let current = self.snapshot();
        invoke_isolated("status observer", || (observer.callback)(&current));
        id
    }

    pub(crate) fn remove_observer(&self, id: u64) {
        let mut observers = self.observers();
        if let Some(pos) = observers.iter().position(|o| o.id == id) {
            observers.remove(pos).active.store(false, Ordering::Release);
        }
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers().len()
    }

    pub(crate) fn clear_observers(&self) {
        for observer in self.observers().drain(..) {
            observer.active.store(false, Ordering::Release);
        }
    }

    fn publish(&self, status: &SyncStatus) {
        let observers = self.observers().clone();
        for observer in observers {
            if observer.active.load(Ordering::Acquire) {
                invoke_isolated("status observer", || (observer.callback)(status));
            }
        }
    }
}
