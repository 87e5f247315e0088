//! Remote store abstraction.
//!
//! The coordinator only needs a handful of capabilities from a backend:
//! CRUD on named collections, a liveness round-trip, and a per-collection
//! change channel. Anything that can provide those (a hosted Postgres with
//! a REST facade, an in-process store in tests) plugs in here.

use crate::error::SyncResult;
use async_trait::async_trait;
use std::sync::Arc;
use trailbook_types::{Collection, RawChange, Record, RecordId};

/// Lifecycle notifications a change channel reports alongside changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The channel is live and will deliver changes.
    Subscribed,
    /// The channel broke. No further changes will arrive on it.
    Error(String),
    /// The backend closed the channel.
    Closed,
}

/// What a channel pushes into its sink.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Change(RawChange),
    Status(ChannelStatus),
}

/// Callback a store invokes for every channel message.
///
/// A store must call the sink for one channel serially, in the order the
/// backend produced the changes. The sink may be called before
/// `open_channel` returns.
pub type ChannelSink = Arc<dyn Fn(ChannelMessage) + Send + Sync>;

/// An open change channel for one collection.
pub trait RemoteChannel: Send + Sync {
    /// The collection this channel listens to.
    fn collection(&self) -> &Collection;

    /// Stops delivery. Safe to call more than once.
    fn close(&self);
}

/// A backend holding the synced collections.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Opens a change channel for `collection`.
    ///
    /// Opening is not a round-trip: connection progress is reported through
    /// `ChannelStatus` messages on the sink.
    fn open_channel(
        &self,
        collection: &Collection,
        sink: ChannelSink,
    ) -> SyncResult<Box<dyn RemoteChannel>>;

    /// Reads the whole collection.
    async fn fetch_all(&self, collection: &Collection) -> SyncResult<Vec<Record>>;

    /// Creates a record. A locally generated id is replaced by a
    /// backend-assigned one; the canonical record is returned.
    async fn insert(&self, collection: &Collection, record: Record) -> SyncResult<Record>;

    /// Overwrites a record's fields; returns the canonical record.
    async fn update(&self, collection: &Collection, record: Record) -> SyncResult<Record>;

    /// Removes a record.
    async fn delete(&self, collection: &Collection, id: &RecordId) -> SyncResult<()>;

    /// Lightweight round-trip used for connection checks.
    async fn ping(&self) -> SyncResult<()>;
}
