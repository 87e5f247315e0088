//! Subscriber bookkeeping.
//!
//! One slot per collection in use. A slot holds the registered callbacks in
//! registration order and the state of the single remote channel backing
//! them. Channel handles leave the registry by value so they can be closed
//! after the registry lock is released.

use crate::store::RemoteChannel;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;
use trailbook_types::{ChangeEvent, Collection};

/// Callback invoked for every change event of a collection.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Identifies one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw counter value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A registered callback. `active` flips to false the moment it is removed,
/// so a dispatch pass working from an older snapshot skips it.
pub(crate) struct SubscriberEntry {
    pub(crate) id: SubscriptionId,
    callback: ChangeCallback,
    active: AtomicBool,
}

impl SubscriberEntry {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Runs the callback, containing any panic. Returns false if it panicked.
    pub(crate) fn deliver(&self, event: &ChangeEvent) -> bool {
        invoke_isolated(&self.id.to_string(), || (self.callback)(event))
    }
}

/// Runs `f`, turning a panic into a logged warning.
pub(crate) fn invoke_isolated(label: &str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!("subscriber {} panicked: {}", label, reason);
            false
        }
    }
}

/// State of the remote channel behind a collection slot.
pub(crate) enum ChannelState {
    /// `open_channel` is in progress.
    Opening,
    /// Live channel.
    Open(Box<dyn RemoteChannel>),
    /// Opening failed or the channel broke; reopened on the next relevant call.
    Failed,
}

struct CollectionSlot {
    subscribers: Vec<Arc<SubscriberEntry>>,
    channel: ChannelState,
    /// Bumped on every (re)open so messages from a superseded channel can
    /// be told apart.
    generation: u64,
}

/// Registry of all subscribers, keyed by collection.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    next_id: u64,
    next_generation: u64,
    slots: HashMap<Collection, CollectionSlot>,
}

impl SubscriberRegistry {
    /// Registers a callback. Returns the entry and, when the collection has
    /// no usable channel, the generation the caller must open one under.
    pub(crate) fn add(
        &mut self,
        collection: &Collection,
        callback: ChangeCallback,
    ) -> (Arc<SubscriberEntry>, Option<u64>) {
        self.next_id += 1;
        let entry = Arc::new(SubscriberEntry {
            id: SubscriptionId::new(self.next_id),
            callback,
            active: AtomicBool::new(true),
        });

        let open = match self.slots.get_mut(collection) {
            Some(slot) => {
                slot.subscribers.push(entry.clone());
                if matches!(slot.channel, ChannelState::Failed) {
                    self.next_generation += 1;
                    slot.generation = self.next_generation;
                    slot.channel = ChannelState::Opening;
                    Some(slot.generation)
                } else {
                    None
                }
            }
            None => {
                self.next_generation += 1;
                self.slots.insert(
                    collection.clone(),
                    CollectionSlot {
                        subscribers: vec![entry.clone()],
                        channel: ChannelState::Opening,
                        generation: self.next_generation,
                    },
                );
                Some(self.next_generation)
            }
        };
        (entry, open)
    }

    /// Removes a callback. When it was the last one the slot goes away and
    /// its open channel, if any, is handed back for closing.
    pub(crate) fn remove(
        &mut self,
        collection: &Collection,
        id: SubscriptionId,
    ) -> Option<Box<dyn RemoteChannel>> {
        let slot = self.slots.get_mut(collection)?;
        if let Some(pos) = slot.subscribers.iter().position(|e| e.id == id) {
            slot.subscribers.remove(pos).deactivate();
        }
        if !slot.subscribers.is_empty() {
            return None;
        }
        match self.slots.remove(collection).map(|s| s.channel) {
            Some(ChannelState::Open(channel)) => Some(channel),
            _ => None,
        }
    }

    /// Stores a freshly opened channel. If the slot was torn down or
    /// superseded while opening, the channel is handed back for closing.
    pub(crate) fn install_channel(
        &mut self,
        collection: &Collection,
        generation: u64,
        channel: Box<dyn RemoteChannel>,
    ) -> Option<Box<dyn RemoteChannel>> {
        match self.slots.get_mut(collection) {
            Some(slot)
                if slot.generation == generation
                    && matches!(slot.channel, ChannelState::Opening) =>
            {
                slot.channel = ChannelState::Open(channel);
                None
            }
            _ => Some(channel),
        }
    }

    /// Marks the channel of `generation` as failed. Returns the channel if it
    /// was open, so the caller can close it.
    pub(crate) fn mark_failed(
        &mut self,
        collection: &Collection,
        generation: u64,
    ) -> Option<Box<dyn RemoteChannel>> {
        let slot = self.slots.get_mut(collection)?;
        if slot.generation != generation {
            return None;
        }
        match std::mem::replace(&mut slot.channel, ChannelState::Failed) {
            ChannelState::Open(channel) => Some(channel),
            _ => None,
        }
    }

    /// Whether messages from `generation` should still be delivered.
    pub(crate) fn is_current(&self, collection: &Collection, generation: u64) -> bool {
        self.slots.get(collection).is_some_and(|slot| {
            slot.generation == generation && !matches!(slot.channel, ChannelState::Failed)
        })
    }

    /// Moves every failed slot back to `Opening` and returns what to reopen.
    pub(crate) fn take_failed(&mut self) -> Vec<(Collection, u64)> {
        let mut reopen = Vec::new();
        for (collection, slot) in &mut self.slots {
            if matches!(slot.channel, ChannelState::Failed) {
                self.next_generation += 1;
                slot.generation = self.next_generation;
                slot.channel = ChannelState::Opening;
                reopen.push((collection.clone(), slot.generation));
            }
        }
        reopen
    }

    /// Current subscribers of a collection, in registration order.
    pub(crate) fn snapshot(&self, collection: &Collection) -> Vec<Arc<SubscriberEntry>> {
        self.slots
            .get(collection)
            .map(|slot| slot.subscribers.clone())
            .unwrap_or_default()
    }

    /// Collections with at least one subscriber, sorted by name.
    pub(crate) fn collections(&self) -> Vec<Collection> {
        let mut names: Vec<Collection> = self.slots.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn subscriber_count(&self, collection: &Collection) -> usize {
        self.slots
            .get(collection)
            .map_or(0, |slot| slot.subscribers.len())
    }

    pub(crate) fn has_failed_channels(&self) -> bool {
        self.slots
            .values()
            .any(|slot| matches!(slot.channel, ChannelState::Failed))
    }

    /// Empties the registry, deactivating every entry. Returns the open
    /// channels for closing.
    pub(crate) fn drain(&mut self) -> Vec<Box<dyn RemoteChannel>> {
        let mut channels = Vec::new();
        for (_, slot) in self.slots.drain() {
            for entry in &slot.subscribers {
                entry.deactivate();
            }
            if let ChannelState::Open(channel) = slot.channel {
                channels.push(channel);
            }
        }
        channels
    }
}
