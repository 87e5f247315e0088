//! Local entity cache.
//!
//! The records a page renders, in display order. Every record carries a
//! sync mark so a local-only record looks exactly like a synced one apart
//! from an optional "unsynced" badge.

use std::collections::HashSet;
use tracing::debug;
use trailbook_types::{ChangeEvent, Collection, Record, RecordId};

/// Whether a cached record matches the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMark {
    /// Same as the remote copy, as far as we know.
    Synced,
    /// Created or edited here and not yet written remotely.
    LocalOnly,
}

/// A record plus its sync mark.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRecord {
    pub record: Record,
    pub mark: SyncMark,
}

impl CachedRecord {
    /// True when the record has unsynced local changes.
    pub fn is_unsynced(&self) -> bool {
        self.mark == SyncMark::LocalOnly
    }
}

/// What applying a change event did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Inserted,
    Updated,
    Removed,
    /// Nothing to do (duplicate echo, unknown delete, other collection).
    Unchanged,
    /// A remote change replaced a record with unsynced local changes.
    Conflict,
    /// The event was a refresh; the whole collection must be reloaded.
    ReloadRequired,
}

/// In-memory records of one collection.
#[derive(Debug, Clone)]
pub struct LocalCache {
    collection: Collection,
    entries: Vec<CachedRecord>,
    /// Remote records deleted here while the backend was unavailable.
    tombstones: HashSet<RecordId>,
}

impl LocalCache {
    /// Creates an empty cache for `collection`.
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            entries: Vec::new(),
            tombstones: HashSet::new(),
        }
    }

    /// The collection this cache holds.
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    fn position(&self, id: &RecordId) -> Option<usize> {
        self.entries.iter().position(|e| e.record.id() == id)
    }

    /// Looks up a record.
    pub fn get(&self, id: &RecordId) -> Option<&CachedRecord> {
        self.entries.iter().find(|e| e.record.id() == id)
    }

    /// All records, in display order.
    pub fn entries(&self) -> &[CachedRecord] {
        &self.entries
    }

    /// All records without their marks.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.entries.iter().map(|e| &e.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records with unsynced local changes.
    pub fn unsynced(&self) -> Vec<&CachedRecord> {
        self.entries.iter().filter(|e| e.is_unsynced()).collect()
    }

    /// Remote records deleted locally but not yet remotely.
    pub fn tombstones(&self) -> impl Iterator<Item = &RecordId> {
        self.tombstones.iter()
    }

    /// Number of changes waiting to reach the backend.
    pub fn pending_count(&self) -> usize {
        self.unsynced().len() + self.tombstones.len()
    }

    /// Applies a remote change event.
    ///
    /// Inserts and updates are upserts keyed by id, so an echo of a write
    /// that was already merged changes nothing. Remote changes win over
    /// unsynced local edits (last write wins).
    pub fn apply(&mut self, event: &ChangeEvent) -> CacheOutcome {
        if event.collection() != &self.collection {
            debug!(
                "cache for {} ignoring event for {}",
                self.collection,
                event.collection()
            );
            return CacheOutcome::Unchanged;
        }

        match event {
            ChangeEvent::Insert { new, .. } | ChangeEvent::Update { new, .. } => {
                let resurrected = self.tombstones.remove(new.id());
                let outcome = self.upsert(new.clone(), SyncMark::Synced);
                if resurrected {
                    CacheOutcome::Conflict
                } else {
                    outcome
                }
            }
            ChangeEvent::Delete { old, .. } => {
                self.tombstones.remove(old.id());
                match self.position(old.id()) {
                    Some(i) => {
                        let removed = self.entries.remove(i);
                        if removed.is_unsynced() {
                            CacheOutcome::Conflict
                        } else {
                            CacheOutcome::Removed
                        }
                    }
                    None => CacheOutcome::Unchanged,
                }
            }
            ChangeEvent::Refresh { .. } => CacheOutcome::ReloadRequired,
        }
    }

    fn upsert(&mut self, record: Record, mark: SyncMark) -> CacheOutcome {
        match self.position(record.id()) {
            Some(i) => {
                let entry = &mut self.entries[i];
                let lost_local_edit = mark == SyncMark::Synced
                    && entry.is_unsynced()
                    && entry.record != record;
                if entry.record == record && entry.mark == mark {
                    return CacheOutcome::Unchanged;
                }
                entry.record = record;
                entry.mark = mark;
                if lost_local_edit {
                    CacheOutcome::Conflict
                } else {
                    CacheOutcome::Updated
                }
            }
            None => {
                self.entries.push(CachedRecord { record, mark });
                CacheOutcome::Inserted
            }
        }
    }

    /// Stores a record that only exists here. Returns true if the record
    /// was not already counted as unsynced.
    pub fn put_local(&mut self, record: Record) -> bool {
        let newly_unsynced = !self.get(record.id()).is_some_and(CachedRecord::is_unsynced);
        self.upsert(record, SyncMark::LocalOnly);
        newly_unsynced
    }

    /// Stores a record confirmed by the backend. Returns true if it had
    /// been unsynced.
    pub fn put_synced(&mut self, record: Record) -> bool {
        let was_unsynced = self.get(record.id()).is_some_and(CachedRecord::is_unsynced);
        self.upsert(record, SyncMark::Synced);
        was_unsynced
    }

    /// Removes a record. A remote record removed while offline leaves a
    /// tombstone so a reload does not bring it back.
    pub fn remove(&mut self, id: &RecordId) -> Option<CachedRecord> {
        let i = self.position(id)?;
        Some(self.entries.remove(i))
    }

    /// Records that `id` was deleted locally but not remotely.
    pub fn add_tombstone(&mut self, id: RecordId) -> bool {
        self.tombstones.insert(id)
    }

    /// Drops a tombstone once the remote delete went through.
    pub fn clear_tombstone(&mut self, id: &RecordId) -> bool {
        self.tombstones.remove(id)
    }

    /// Swaps a local-only record for its canonical remote version, keeping
    /// the local copy's position. If the canonical record already arrived
    /// through an echo, that duplicate is dropped. Returns true if an
    /// unsynced local copy was replaced.
    pub fn reconcile(&mut self, local_id: &RecordId, canonical: Record) -> bool {
        let local = self.position(local_id);
        let existing = self.position(canonical.id());
        match (local, existing) {
            (Some(l), Some(e)) if l != e => {
                let was_unsynced = self.entries[l].is_unsynced();
                self.entries[l] = CachedRecord {
                    record: canonical,
                    mark: SyncMark::Synced,
                };
                self.entries.remove(e);
                was_unsynced
            }
            (Some(l), _) => {
                let was_unsynced = self.entries[l].is_unsynced();
                self.entries[l] = CachedRecord {
                    record: canonical,
                    mark: SyncMark::Synced,
                };
                was_unsynced
            }
            (None, _) => {
                self.upsert(canonical, SyncMark::Synced);
                false
            }
        }
    }

    /// Replaces the contents with a full remote snapshot.
    ///
    /// Local-only records with local ids survive (they were never sent) and
    /// tombstoned records stay hidden. Unsynced edits of remote records are
    /// overwritten; the return value is how many were lost that way.
    pub fn replace_all(&mut self, records: Vec<Record>) -> usize {
        let previous = std::mem::take(&mut self.entries);
        let mut lost_edits = 0;

        for record in records {
            if self.tombstones.contains(record.id()) {
                continue;
            }
            if let Some(old) = previous.iter().find(|e| e.record.id() == record.id()) {
                if old.is_unsynced() && old.record != record {
                    lost_edits += 1;
                }
            }
            self.entries.push(CachedRecord {
                record,
                mark: SyncMark::Synced,
            });
        }

        for entry in previous {
            if entry.record.id().is_local() && self.position(entry.record.id()).is_none() {
                self.entries.push(entry);
            }
        }
        lost_edits
    }
}
