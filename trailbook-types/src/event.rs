//! Change events.
//!
//! Backends emit loosely shaped `{eventType, new, old}` payloads. `RawChange`
//! is that wire shape; `ChangeEvent` is the closed variant type the rest of
//! the system handles. `RawChange::normalize` is the only place the two meet.

use crate::{Collection, Error, Record, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Marker field of the synthetic "reload everything" event.
pub const REFRESH_MARKER: &str = "_refresh";

/// The three mutation kinds a remote store reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Wire name (`INSERT`, `UPDATE`, `DELETE`).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized notification of a remote mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A record was created.
    Insert { collection: Collection, new: Record },

    /// A record was modified. `old` is only present when the backend
    /// reports the previous row.
    Update {
        collection: Collection,
        new: Record,
        old: Option<Record>,
    },

    /// A record was removed.
    Delete { collection: Collection, old: Record },

    /// Incremental state is unreliable; reload the whole collection.
    Refresh { collection: Collection },
}

impl ChangeEvent {
    /// Creates the synthetic reload event for a collection.
    pub fn refresh(collection: Collection) -> Self {
        Self::Refresh { collection }
    }

    /// The collection this event belongs to.
    pub fn collection(&self) -> &Collection {
        match self {
            Self::Insert { collection, .. }
            | Self::Update { collection, .. }
            | Self::Delete { collection, .. }
            | Self::Refresh { collection } => collection,
        }
    }

    /// The mutation kind, or `None` for a refresh.
    pub fn kind(&self) -> Option<ChangeKind> {
        match self {
            Self::Insert { .. } => Some(ChangeKind::Insert),
            Self::Update { .. } => Some(ChangeKind::Update),
            Self::Delete { .. } => Some(ChangeKind::Delete),
            Self::Refresh { .. } => None,
        }
    }

    /// Id of the affected record, or `None` for a refresh.
    pub fn record_id(&self) -> Option<&RecordId> {
        match self {
            Self::Insert { new, .. } | Self::Update { new, .. } => Some(new.id()),
            Self::Delete { old, .. } => Some(old.id()),
            Self::Refresh { .. } => None,
        }
    }

    /// True for the synthetic reload event.
    pub fn is_refresh(&self) -> bool {
        matches!(self, Self::Refresh { .. })
    }

    /// Converts back to the wire shape, for stores that emit raw payloads.
    pub fn to_raw(&self) -> RawChange {
        match self {
            Self::Insert { new, .. } => RawChange {
                event_type: ChangeKind::Insert.as_str().into(),
                new: Some(new.clone().into_value()),
                old: None,
            },
            Self::Update { new, old, .. } => RawChange {
                event_type: ChangeKind::Update.as_str().into(),
                new: Some(new.clone().into_value()),
                old: old.clone().map(Record::into_value),
            },
            Self::Delete { old, .. } => RawChange {
                event_type: ChangeKind::Delete.as_str().into(),
                new: None,
                old: Some(old.clone().into_value()),
            },
            Self::Refresh { .. } => RawChange::refresh(),
        }
    }
}

/// A change payload exactly as the backend delivers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl RawChange {
    /// Builds a raw payload from its parts.
    pub fn new(kind: ChangeKind, new: Option<Value>, old: Option<Value>) -> Self {
        Self {
            event_type: kind.as_str().into(),
            new,
            old,
        }
    }

    /// The synthetic reload payload: `new = {"_refresh": true}` and nothing else.
    pub fn refresh() -> Self {
        let mut marker = Map::new();
        marker.insert(REFRESH_MARKER.into(), Value::Bool(true));
        Self {
            event_type: ChangeKind::Update.as_str().into(),
            new: Some(Value::Object(marker)),
            old: None,
        }
    }

    /// True when `new._refresh` is `true`.
    pub fn is_refresh(&self) -> bool {
        self.new
            .as_ref()
            .and_then(|v| v.get(REFRESH_MARKER))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Validates field presence for the event type and produces the closed
    /// variant. Empty objects and `null` count as absent.
    pub fn normalize(self, collection: &Collection) -> Result<ChangeEvent, Error> {
        if self.is_refresh() {
            return Ok(ChangeEvent::refresh(collection.clone()));
        }

        let new = present(self.new);
        let old = present(self.old);

        match self.event_type.to_ascii_uppercase().as_str() {
            "INSERT" => {
                let new = new.ok_or_else(|| missing("INSERT", "new"))?;
                Ok(ChangeEvent::Insert {
                    collection: collection.clone(),
                    new: Record::from_value(new)?,
                })
            }
            "UPDATE" => {
                let new = new.ok_or_else(|| missing("UPDATE", "new"))?;
                // The previous row is best effort: without full replica
                // identity a backend may send a partial row with no id.
                let old = old.and_then(|v| Record::from_value(v).ok());
                Ok(ChangeEvent::Update {
                    collection: collection.clone(),
                    new: Record::from_value(new)?,
                    old,
                })
            }
            "DELETE" => {
                let old = old.ok_or_else(|| missing("DELETE", "old"))?;
                Ok(ChangeEvent::Delete {
                    collection: collection.clone(),
                    old: Record::from_value(old)?,
                })
            }
            other => Err(Error::InvalidChange(format!("unknown event type {other:?}"))),
        }
    }
}

fn present(value: Option<Value>) -> Option<Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) if map.is_empty() => None,
        Some(v) => Some(v),
    }
}

fn missing(kind: &str, field: &str) -> Error {
    Error::InvalidChange(format!("{kind} event without `{field}` payload"))
}
