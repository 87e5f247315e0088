//! Client-side sync for Trailbook.
//!
//! Keeps the family journal's collections (entries, map pins, milestones,
//! hill and castle lists) current on every device that has them open, and
//! keeps writes working when the backend is missing or unreachable.
//!
//! # Architecture
//!
//! - **Coordinator**: one per app instance. Owns one remote change channel
//!   per collection with subscribers and fans normalized events out to
//!   local callbacks.
//! - **Status**: derived connection health for the sync indicator.
//! - **Watchdog**: turns foreground/focus signals into a debounced refresh.
//! - **Collection**: a local cache bound to the coordinator, with an
//!   optimistic write path that falls back to local-only storage.
//! - **Stores**: the `RemoteStore` capability, an in-memory store and a
//!   PostgREST-backed one.
//!
//! # Example
//!
//! ```
//! use trailbook_sync::{MemoryStore, SyncConfig, SyncCoordinator};
//! use trailbook_types::Collection;
//! use std::sync::Arc;
//!
//! let store = MemoryStore::with_collections(&[Collection::MAP_PINS]);
//! let coordinator = SyncCoordinator::new(Arc::new(store), SyncConfig::default());
//!
//! let pins = Collection::new(Collection::MAP_PINS).unwrap();
//! let subscription = coordinator.subscribe(pins, |event| {
//!     println!("{:?} on {}", event.kind(), event.collection());
//! });
//! assert!(subscription.is_active());
//! ```

pub mod cache;
pub mod collection;
mod config;
pub mod coordinator;
mod error;
pub mod memory;
mod registry;
pub mod rest;
pub mod status;
pub mod store;
pub mod watchdog;
mod writer;

pub use cache::{CacheOutcome, CachedRecord, LocalCache, SyncMark};
pub use collection::SyncedCollection;
pub use config::SyncConfig;
pub use coordinator::{StatusSubscription, Subscription, SyncCoordinator};
pub use error::{FailureKind, SyncError, SyncResult};
pub use memory::MemoryStore;
pub use registry::{ChangeCallback, SubscriptionId};
pub use rest::{diff_snapshots, RestStore, RestStoreConfig};
pub use status::{ConnectionState, StatusCallback, SyncStatus};
pub use store::{ChannelMessage, ChannelSink, ChannelStatus, RemoteChannel, RemoteStore};
pub use watchdog::{LifecycleSignal, StalenessWatchdog, WatchGuard};
pub use writer::{FallbackReason, RetryReport, WriteOutcome, SAVED_LOCALLY_MESSAGE};
