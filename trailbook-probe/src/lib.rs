//! Report types and output formatting for the Trailbook probe.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use trailbook_sync::{SyncCoordinator, SyncStatus};
use trailbook_types::{ChangeEvent, Collection, Record};

/// Result of probing one collection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CollectionReport {
    pub name: String,
    /// Row count, when the collection could be read.
    pub rows: Option<usize>,
    pub error: Option<String>,
    /// True when the failure means the collection needs provisioning.
    pub needs_setup: bool,
}

/// Result of `trailbook-probe check`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProbeReport {
    pub backend: String,
    pub reachable: bool,
    pub indicator: String,
    pub collections: Vec<CollectionReport>,
}

impl ProbeReport {
    /// Collections that could not be read for configuration reasons.
    pub fn needs_setup(&self) -> Vec<&str> {
        self.collections
            .iter()
            .filter(|c| c.needs_setup)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// True when the backend answered and every collection was readable.
    pub fn is_healthy(&self) -> bool {
        self.reachable && self.collections.iter().all(|c| c.error.is_none())
    }
}

/// Checks the backend and reads every collection once.
pub async fn probe(coordinator: &Arc<SyncCoordinator>, collections: &[Collection]) -> ProbeReport {
    let reachable = coordinator.check_connection().await;
    let store = coordinator.store();

    let mut reports = Vec::with_capacity(collections.len());
    for collection in collections {
        let report = match store.fetch_all(collection).await {
            Ok(rows) => CollectionReport {
                name: collection.to_string(),
                rows: Some(rows.len()),
                error: None,
                needs_setup: false,
            },
            Err(e) => {
                coordinator.report_failure(collection, &e);
                CollectionReport {
                    name: collection.to_string(),
                    rows: None,
                    error: Some(e.to_string()),
                    needs_setup: e.is_configuration(),
                }
            }
        };
        reports.push(report);
    }

    ProbeReport {
        backend: store.name().to_string(),
        reachable,
        indicator: coordinator.status().indicator_label(),
        collections: reports,
    }
}

/// One JSON line per change notification.
pub fn event_line(event: &ChangeEvent) -> String {
    let kind = event.kind().map_or("REFRESH", |k| k.as_str());
    let mut line = json!({
        "collection": event.collection().as_str(),
        "kind": kind,
    });
    if let Some(id) = event.record_id() {
        line["id"] = Value::String(id.to_string());
    }
    match event {
        ChangeEvent::Insert { new, .. } | ChangeEvent::Update { new, .. } => {
            line["record"] = Value::Object(new.fields().clone());
        }
        _ => {}
    }
    line.to_string()
}

/// One JSON line per record, id first.
pub fn record_line(record: &Record) -> String {
    record.clone().into_value().to_string()
}

/// Human-readable status block.
pub fn render_status(status: &SyncStatus) -> String {
    let mut out = format!("  Status:    {}\n", status.indicator_label());
    out.push_str(&format!("  Connected: {}\n", if status.connected { "yes" } else { "no" }));
    match status.last_sync {
        Some(at) => out.push_str(&format!("  Last sync: {}\n", at.to_rfc3339())),
        None => out.push_str("  Last sync: never\n"),
    }
    if status.conflict_count > 0 {
        out.push_str(&format!("  Conflicts: {}\n", status.conflict_count));
    }
    if let Some(error) = &status.last_error {
        out.push_str(&format!("  Error:     {error}\n"));
    }
    out
}
