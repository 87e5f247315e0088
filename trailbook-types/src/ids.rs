//! Identifier types for records and collections.
//!
//! Remote ids are whatever the backend assigns, so `RecordId` is a string.
//! Ids minted on this device while the backend is unavailable carry the
//! `local-` prefix and a UUID v7 suffix.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix of every locally generated record id.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Stable identifier of a record within its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Wraps an id assigned by the remote store.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh local-only id.
    #[must_use]
    pub fn local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// True when this id was minted on this device and never accepted remotely.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::InvalidRecord("empty record id".into()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of a collection in the remote store (a table, in practice).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Collection(String);

impl Collection {
    pub const JOURNAL_ENTRIES: &'static str = "journal_entries";
    pub const FAMILY_MEMBERS: &'static str = "family_members";
    pub const WISHLIST_ITEMS: &'static str = "wishlist_items";
    pub const MAP_PINS: &'static str = "map_pins";
    pub const MILESTONES: &'static str = "milestones";
    pub const CASTLES_VISITED: &'static str = "castles_visited";
    pub const LOCHS_VISITED: &'static str = "lochs_visited";
    pub const MUNROS_COMPLETED: &'static str = "munros_completed";

    /// Every collection the journal app keeps in sync.
    pub const KNOWN: [&'static str; 8] = [
        Self::JOURNAL_ENTRIES,
        Self::FAMILY_MEMBERS,
        Self::WISHLIST_ITEMS,
        Self::MAP_PINS,
        Self::MILESTONES,
        Self::CASTLES_VISITED,
        Self::LOCHS_VISITED,
        Self::MUNROS_COMPLETED,
    ];

    /// Creates a collection name, rejecting empty or whitespace-only names.
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidCollection(name));
        }
        Ok(Self(name))
    }

    /// Returns the name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for one of the app's built-in collections.
    #[must_use]
    pub fn is_known(&self) -> bool {
        Self::KNOWN.contains(&self.0.as_str())
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Collection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Collection {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Collection> for String {
    fn from(c: Collection) -> Self {
        c.0
    }
}
