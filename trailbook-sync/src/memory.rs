//! In-process remote store.
//!
//! Behaves like a hosted backend with realtime channels, minus the network:
//! collections must be provisioned before writes succeed, the whole store can
//! be switched unreachable, and every mutation is fanned out synchronously to
//! the open channels of its collection. Used by the tests and the demos.

use crate::error::{SyncError, SyncResult};
use crate::store::{ChannelMessage, ChannelSink, ChannelStatus, RemoteChannel, RemoteStore};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::debug;
use trailbook_types::{ChangeKind, Collection, RawChange, Record, RecordId};

struct ChannelEntry {
    id: u64,
    collection: Collection,
    sink: ChannelSink,
}

#[derive(Default)]
struct MemoryInner {
    tables: HashMap<Collection, Vec<Record>>,
    channels: Vec<ChannelEntry>,
    opened: HashMap<Collection, usize>,
    next_channel: u64,
    next_row: u64,
    unreachable: bool,
    silent: bool,
    ping_delay: Option<Duration>,
}

/// A remote store that lives in memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Creates an empty store with no provisioned collections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with the given collections provisioned.
    pub fn with_collections(names: &[&str]) -> Self {
        let store = Self::new();
        for name in names {
            if let Ok(c) = Collection::new(*name) {
                store.provision(&c);
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the table for `collection` if missing.
    pub fn provision(&self, collection: &Collection) {
        self.lock().tables.entry(collection.clone()).or_default();
    }

    /// Drops a collection's table, making writes to it fail as schema-missing.
    pub fn drop_collection(&self, collection: &Collection) {
        self.lock().tables.remove(collection);
    }

    /// Inserts rows directly, bypassing channels.
    pub fn seed(&self, collection: &Collection, records: impl IntoIterator<Item = Record>) {
        let mut inner = self.lock();
        inner
            .tables
            .entry(collection.clone())
            .or_default()
            .extend(records);
    }

    /// Current rows of a collection (empty if not provisioned).
    pub fn rows(&self, collection: &Collection) -> Vec<Record> {
        self.lock().tables.get(collection).cloned().unwrap_or_default()
    }

    /// Makes every call fail with a network error (`false`) or succeed again.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Controls whether mutations are echoed on the change channels.
    pub fn set_echo(&self, echo: bool) {
        self.lock().silent = !echo;
    }

    /// Delays every `ping` by `delay`.
    pub fn set_ping_delay(&self, delay: Option<Duration>) {
        self.lock().ping_delay = delay;
    }

    /// How many times a channel was opened for `collection`.
    pub fn channels_opened(&self, collection: &Collection) -> usize {
        self.lock().opened.get(collection).copied().unwrap_or(0)
    }

    /// How many channels for `collection` are currently open.
    pub fn open_channels(&self, collection: &Collection) -> usize {
        self.lock()
            .channels
            .iter()
            .filter(|c| &c.collection == collection)
            .count()
    }

    /// Collections that currently have at least one open channel.
    pub fn live_collections(&self) -> HashSet<Collection> {
        self.lock()
            .channels
            .iter()
            .map(|c| c.collection.clone())
            .collect()
    }

    /// Delivers a raw change to every open channel of `collection`, as if
    /// another client had written it.
    pub fn emit(&self, collection: &Collection, change: RawChange) {
        self.broadcast(collection, ChannelMessage::Change(change));
    }

    /// Breaks every open channel of `collection` with `reason`.
    pub fn fail_channels(&self, collection: &Collection, reason: &str) {
        let sinks = self.take_channels(collection);
        for sink in sinks {
            sink(ChannelMessage::Status(ChannelStatus::Error(reason.to_string())));
        }
    }

    fn take_channels(&self, collection: &Collection) -> Vec<ChannelSink> {
        let mut inner = self.lock();
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.channels)
            .into_iter()
            .partition(|c| &c.collection == collection);
        inner.channels = kept;
        gone.into_iter().map(|c| c.sink).collect()
    }

    fn broadcast(&self, collection: &Collection, message: ChannelMessage) {
        let sinks: Vec<ChannelSink> = self
            .lock()
            .channels
            .iter()
            .filter(|c| &c.collection == collection)
            .map(|c| c.sink.clone())
            .collect();
        for sink in sinks {
            sink(message.clone());
        }
    }

    fn echo(&self, collection: &Collection, change: RawChange) {
        if !self.lock().silent {
            self.emit(collection, change);
        }
    }

    fn check_reachable(&self) -> SyncResult<()> {
        if self.lock().unreachable {
            return Err(SyncError::Network("memory store unreachable".into()));
        }
        Ok(())
    }
}

fn schema_missing(collection: &Collection) -> SyncError {
    SyncError::SchemaMissing {
        collection: collection.to_string(),
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn open_channel(
        &self,
        collection: &Collection,
        sink: ChannelSink,
    ) -> SyncResult<Box<dyn RemoteChannel>> {
        self.check_reachable()?;
        let id = {
            let mut inner = self.lock();
            inner.next_channel += 1;
            let id = inner.next_channel;
            inner.channels.push(ChannelEntry {
                id,
                collection: collection.clone(),
                sink: sink.clone(),
            });
            *inner.opened.entry(collection.clone()).or_default() += 1;
            id
        };
        debug!("memory store opened channel {} for {}", id, collection);
        sink(ChannelMessage::Status(ChannelStatus::Subscribed));
        Ok(Box::new(MemoryChannel {
            id,
            collection: collection.clone(),
            inner: Arc::downgrade(&self.inner),
        }))
    }

    async fn fetch_all(&self, collection: &Collection) -> SyncResult<Vec<Record>> {
        self.check_reachable()?;
        self.lock()
            .tables
            .get(collection)
            .cloned()
            .ok_or_else(|| schema_missing(collection))
    }

    async fn insert(&self, collection: &Collection, record: Record) -> SyncResult<Record> {
        self.check_reachable()?;
        let canonical = {
            let mut inner = self.lock();
            inner.next_row += 1;
            let row_number = inner.next_row;
            let table = inner
                .tables
                .get_mut(collection)
                .ok_or_else(|| schema_missing(collection))?;

            let id = if record.id().is_local() {
                RecordId::new(row_number.to_string())
            } else {
                record.id().clone()
            };
            if table.iter().any(|r| r.id() == &id) {
                return Err(SyncError::Rejected {
                    status: 409,
                    message: format!("duplicate id {id}"),
                });
            }
            let mut canonical = record.with_id(id);
            if canonical.get("created_at").is_none() {
                canonical.set("created_at", Value::String(chrono::Utc::now().to_rfc3339()));
            }
            table.push(canonical.clone());
            canonical
        };
        self.echo(
            collection,
            RawChange::new(ChangeKind::Insert, Some(canonical.clone().into_value()), None),
        );
        Ok(canonical)
    }

    async fn update(&self, collection: &Collection, record: Record) -> SyncResult<Record> {
        self.check_reachable()?;
        let (canonical, previous) = {
            let mut inner = self.lock();
            let table = inner
                .tables
                .get_mut(collection)
                .ok_or_else(|| schema_missing(collection))?;
            let row = table
                .iter_mut()
                .find(|r| r.id() == record.id())
                .ok_or_else(|| SyncError::NotFound(record.id().to_string()))?;
            let previous = row.clone();
            for (key, value) in record.fields() {
                row.set(key.clone(), value.clone());
            }
            (row.clone(), previous)
        };
        self.echo(
            collection,
            RawChange::new(
                ChangeKind::Update,
                Some(canonical.clone().into_value()),
                Some(previous.into_value()),
            ),
        );
        Ok(canonical)
    }

    async fn delete(&self, collection: &Collection, id: &RecordId) -> SyncResult<()> {
        self.check_reachable()?;
        let removed = {
            let mut inner = self.lock();
            let table = inner
                .tables
                .get_mut(collection)
                .ok_or_else(|| schema_missing(collection))?;
            let position = table.iter().position(|r| r.id() == id);
            position.map(|i| table.remove(i))
        };
        if let Some(old) = removed {
            self.echo(
                collection,
                RawChange::new(ChangeKind::Delete, None, Some(old.into_value())),
            );
        }
        Ok(())
    }

    async fn ping(&self) -> SyncResult<()> {
        let delay = self.lock().ping_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable()
    }
}

/// Channel handle returned by `MemoryStore::open_channel`.
struct MemoryChannel {
    id: u64,
    collection: Collection,
    inner: Weak<Mutex<MemoryInner>>,
}

impl RemoteChannel for MemoryChannel {
    fn collection(&self) -> &Collection {
        &self.collection
    }

    fn close(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.channels.retain(|c| c.id != self.id);
        }
    }
}
