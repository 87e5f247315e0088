//! The opaque record shape carried through sync.
//!
//! Sync never interprets record contents beyond the `id` field. Everything
//! else (titles, photos, coordinates, votes) rides along as JSON.

use crate::{Error, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single row of a collection.
///
/// Serializes as a flat JSON object whose `id` member is the record id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Record {
    id: RecordId,
    fields: Map<String, Value>,
}

impl Record {
    /// Creates an empty record with the given id.
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            fields: Map::new(),
        }
    }

    /// Creates a record from an id and a set of fields. A stray `id` member
    /// in `fields` is dropped; the explicit id wins.
    pub fn with_fields(id: RecordId, mut fields: Map<String, Value>) -> Self {
        fields.remove("id");
        Self { id, fields }
    }

    /// Parses a backend row. Numeric ids are accepted and stringified.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let Value::Object(mut fields) = value else {
            return Err(Error::InvalidRecord("record is not a JSON object".into()));
        };
        let id = match fields.remove("id") {
            Some(Value::String(s)) if !s.is_empty() => RecordId::new(s),
            Some(Value::Number(n)) => RecordId::new(n.to_string()),
            Some(other) => {
                return Err(Error::InvalidRecord(format!("unsupported id value: {other}")));
            }
            None => return Err(Error::InvalidRecord("record has no id".into())),
        };
        Ok(Self { id, fields })
    }

    /// Returns the record id.
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    /// Returns every field except `id`.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Looks up a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Looks up a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Sets a field, returning the previous value. Setting `id` is ignored.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        if key == "id" {
            return None;
        }
        self.fields.insert(key, value.into())
    }

    /// Builder-style `set`.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Returns the same contents under a different id.
    #[must_use]
    pub fn with_id(mut self, id: RecordId) -> Self {
        self.id = id;
        self
    }

    /// Converts back into the flat JSON shape.
    pub fn into_value(self) -> Value {
        let mut obj = Map::with_capacity(self.fields.len() + 1);
        obj.insert("id".into(), Value::String(self.id.as_str().to_string()));
        obj.extend(self.fields);
        Value::Object(obj)
    }

    /// The fields as a JSON object, without `id`. Used as an insert body when
    /// the backend assigns ids.
    pub fn fields_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

impl TryFrom<Value> for Record {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}
