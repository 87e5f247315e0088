//! Optimistic write path.
//!
//! Every write goes to the backend first. If the backend cannot take it
//! because the collection is not set up there or the network is down, the
//! change is kept on this device, marked unsynced, and counted in
//! `pending_changes`. Nothing retries in the background; `retry_unsynced`
//! replays on request.

use crate::collection::SyncedCollection;
use crate::error::{FailureKind, SyncError, SyncResult};
use tracing::{debug, info, warn};
use trailbook_types::{Record, RecordId};

/// Message shown when a write was kept locally because the network failed.
pub const SAVED_LOCALLY_MESSAGE: &str = "saved locally; will sync when the connection returns";

/// Why a write stayed on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The collection is missing or the store is not configured.
    Configuration,
    /// The backend could not be reached.
    Transient,
}

/// Result of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The backend accepted the write; carries the canonical id.
    Synced(RecordId),
    /// The write was kept locally.
    LocalOnly {
        id: RecordId,
        reason: FallbackReason,
        message: String,
    },
}

impl WriteOutcome {
    /// The id the record now has in the cache.
    pub fn id(&self) -> &RecordId {
        match self {
            Self::Synced(id) | Self::LocalOnly { id, .. } => id,
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced(_))
    }
}

/// Outcome of `retry_unsynced`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub synced: usize,
    pub still_local: usize,
}

impl SyncedCollection {
    /// Creates a record. Give it a `RecordId::local()` id; the backend
    /// replaces it with a canonical one.
    pub async fn create(&self, draft: Record) -> SyncResult<WriteOutcome> {
        let local_id = draft.id().clone();
        match self.store_insert(draft.clone()).await {
            Ok(canonical) => Ok(WriteOutcome::Synced(self.settle_insert(&local_id, canonical))),
            Err(e) => {
                let (reason, message) = self.fall_back(e)?;
                self.mutate(|cache| cache.put_local(draft));
                info!("Kept new {} record {} locally", self.collection, local_id);
                Ok(WriteOutcome::LocalOnly {
                    id: local_id,
                    reason,
                    message,
                })
            }
        }
    }

    /// Overwrites a record. A record that never reached the backend is
    /// created instead.
    pub async fn update(&self, record: Record) -> SyncResult<WriteOutcome> {
        if record.id().is_local() {
            return self.create(record).await;
        }

        let id = record.id().clone();
        self.begin_write(&id);
        let result = self
            .coordinator
            .store()
            .update(&self.collection, record.clone())
            .await;
        let outcome = match result {
            Ok(canonical) => {
                self.mutate(|cache| cache.put_synced(canonical));
                self.coordinator.report_write_success(&self.collection);
                Ok(WriteOutcome::Synced(id.clone()))
            }
            Err(e) => self.fall_back(e).map(|(reason, message)| {
                self.mutate(|cache| cache.put_local(record));
                info!("Kept edit of {} {} locally", self.collection, id);
                WriteOutcome::LocalOnly {
                    id: id.clone(),
                    reason,
                    message,
                }
            }),
        };
        self.end_write(&id);
        outcome
    }

    /// Deletes a record. A record that only exists here is just dropped.
    pub async fn delete(&self, id: &RecordId) -> SyncResult<WriteOutcome> {
        if id.is_local() {
            self.mutate(|cache| cache.remove(id));
            debug!("Dropped local-only {} record {}", self.collection, id);
            return Ok(WriteOutcome::Synced(id.clone()));
        }

        self.begin_write(id);
        let result = self.coordinator.store().delete(&self.collection, id).await;
        self.end_write(id);
        match result {
            Ok(()) => {
                self.mutate(|cache| {
                    cache.remove(id);
                    cache.clear_tombstone(id);
                });
                self.coordinator.report_write_success(&self.collection);
                Ok(WriteOutcome::Synced(id.clone()))
            }
            Err(e) => {
                let (reason, message) = self.fall_back(e)?;
                self.mutate(|cache| {
                    cache.remove(id);
                    cache.add_tombstone(id.clone());
                });
                info!("Kept delete of {} {} locally", self.collection, id);
                Ok(WriteOutcome::LocalOnly {
                    id: id.clone(),
                    reason,
                    message,
                })
            }
        }
    }

    /// Replays every unsynced change against the backend.
    pub async fn retry_unsynced(&self) -> RetryReport {
        let (records, tombstones) = self.read(|cache| {
            (
                cache
                    .unsynced()
                    .into_iter()
                    .map(|entry| entry.record.clone())
                    .collect::<Vec<_>>(),
                cache.tombstones().cloned().collect::<Vec<_>>(),
            )
        });
        let mut report = RetryReport::default();

        for record in records {
            let id = record.id().clone();
            let result = if id.is_local() {
                self.store_insert(record).await.map(|canonical| {
                    self.settle_insert(&id, canonical);
                })
            } else {
                self.begin_write(&id);
                let result = self
                    .coordinator
                    .store()
                    .update(&self.collection, record)
                    .await
                    .map(|canonical| {
                        self.mutate(|cache| cache.put_synced(canonical));
                    });
                self.end_write(&id);
                result
            };
            self.tally(&mut report, &id, result);
        }

        for id in tombstones {
            self.begin_write(&id);
            let result = self
                .coordinator
                .store()
                .delete(&self.collection, &id)
                .await
                .map(|()| {
                    self.mutate(|cache| cache.clear_tombstone(&id));
                });
            self.end_write(&id);
            self.tally(&mut report, &id, result);
        }

        if report.synced > 0 {
            self.coordinator.report_write_success(&self.collection);
        }
        info!(
            "Retried unsynced {}: {} synced, {} still local",
            self.collection, report.synced, report.still_local
        );
        report
    }

    fn tally(&self, report: &mut RetryReport, id: &RecordId, result: SyncResult<()>) {
        match result {
            Ok(()) => report.synced += 1,
            Err(e) => {
                warn!("Retry of {} {} failed: {}", self.collection, id, e);
                self.coordinator.report_failure(&self.collection, &e);
                report.still_local += 1;
            }
        }
    }

    async fn store_insert(&self, record: Record) -> SyncResult<Record> {
        self.coordinator.store().insert(&self.collection, record).await
    }

    /// Merges the canonical record of a successful insert. Returns its id.
    fn settle_insert(&self, local_id: &RecordId, canonical: Record) -> RecordId {
        let id = canonical.id().clone();
        self.mutate(|cache| cache.reconcile(local_id, canonical));
        self.coordinator.report_write_success(&self.collection);
        debug!("{} record {} synced as {}", self.collection, local_id, id);
        id
    }

    /// Classifies a failed write. Fatal errors are returned to the caller.
    fn fall_back(&self, error: SyncError) -> SyncResult<(FallbackReason, String)> {
        match error.failure_kind() {
            FailureKind::Configuration => {
                self.coordinator.report_failure(&self.collection, &error);
                Ok((FallbackReason::Configuration, error.to_string()))
            }
            FailureKind::Transient => {
                self.coordinator.report_failure(&self.collection, &error);
                Ok((FallbackReason::Transient, SAVED_LOCALLY_MESSAGE.to_string()))
            }
            FailureKind::Fatal => {
                warn!("Write to {} rejected: {}", self.collection, error);
                Err(error)
            }
        }
    }
}
