//! Staleness watchdog.
//!
//! Realtime channels tend to die quietly while an app sits in the
//! background. The watchdog turns foreground signals into a full refresh
//! so a client never drifts for long. It is fed by whoever owns the
//! platform lifecycle hooks; any number of pages may observe the same
//! transition, and only the first one within the debounce window
//! triggers a refresh.

use crate::coordinator::SyncCoordinator;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Foreground lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// The app was hidden or backgrounded.
    Hidden,
    /// The app became visible again.
    Visible,
    /// The window gained focus.
    Focus,
}

#[derive(Debug)]
struct WatchdogState {
    visible: bool,
    watchers: usize,
    last_refresh: Option<Instant>,
    refreshes: u64,
}

/// Debounced refresh trigger shared by every page of the app.
pub struct StalenessWatchdog {
    coordinator: Arc<SyncCoordinator>,
    debounce: Duration,
    state: Mutex<WatchdogState>,
    this: Weak<StalenessWatchdog>,
}

impl StalenessWatchdog {
    /// Creates a watchdog using the coordinator's debounce setting.
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Arc<Self> {
        let debounce = coordinator.config().refresh_debounce();
        Self::with_debounce(coordinator, debounce)
    }

    /// Creates a watchdog with an explicit debounce window.
    pub fn with_debounce(coordinator: Arc<SyncCoordinator>, debounce: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            coordinator,
            debounce,
            state: Mutex::new(WatchdogState {
                visible: true,
                watchers: 0,
                last_refresh: None,
                refreshes: 0,
            }),
            this: this.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, WatchdogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opts a page in. Signals are ignored while nobody watches.
    pub fn watch(&self) -> WatchGuard {
        self.state().watchers += 1;
        WatchGuard {
            watchdog: self.this.clone(),
        }
    }

    /// Number of pages currently opted in.
    pub fn watchers(&self) -> usize {
        self.state().watchers
    }

    /// Refreshes triggered so far.
    pub fn refresh_count(&self) -> u64 {
        self.state().refreshes
    }

    /// Feeds a lifecycle signal. Returns true if it triggered a refresh.
    pub async fn signal(&self, signal: LifecycleSignal) -> bool {
        if !self.should_refresh(signal, Instant::now()) {
            return false;
        }
        debug!("Staleness watchdog refreshing after {:?}", signal);
        self.coordinator.force_sync().await;
        true
    }

    fn should_refresh(&self, signal: LifecycleSignal, now: Instant) -> bool {
        let mut state = self.state();
        let trigger = match signal {
            LifecycleSignal::Hidden => {
                state.visible = false;
                false
            }
            LifecycleSignal::Visible => {
                let was_hidden = !state.visible;
                state.visible = true;
                was_hidden
            }
            LifecycleSignal::Focus => true,
        };
        if !trigger || state.watchers == 0 {
            return false;
        }
        if let Some(last) = state.last_refresh {
            if now.duration_since(last) < self.debounce {
                debug!("Ignoring {:?}, refreshed {:?} ago", signal, now.duration_since(last));
                return false;
            }
        }
        state.last_refresh = Some(now);
        state.refreshes += 1;
        true
    }
}

/// A page's opt-in to the watchdog. Opts out on drop.
#[must_use = "dropping a WatchGuard opts the page out again"]
pub struct WatchGuard {
    watchdog: Weak<StalenessWatchdog>,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.upgrade() {
            let mut state = watchdog.state();
            state.watchers = state.watchers.saturating_sub(1);
        }
    }
}
