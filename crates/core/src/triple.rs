use serde::{Deserialize, Serialize};

use crate::ids::EntityId;
use crate::path::AttributePath;
use crate::timestamp::Timestamp;
use crate::value::Value;

/// Attribute whose presence marks an entity as live in its collection.
pub const COLLECTION_ATTRIBUTE: &str = "_collection";

/// Attribute carrying the entity's local id.
pub const ID_ATTRIBUTE: &str = "id";

/// The atomic fact: `id` had `value` at `attribute` as of `timestamp`.
/// `expired` marks a tombstone for the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triple {
    pub id: EntityId,
    pub attribute: AttributePath,
    pub value: Value,
    pub timestamp: Timestamp,
    pub expired: bool,
}

impl Triple {
    pub fn new(id: EntityId, attribute: AttributePath, value: Value, timestamp: Timestamp) -> Self {
        Self {
            id,
            attribute,
            value,
            timestamp,
            expired: false,
        }
    }

    pub fn tombstone(id: EntityId, attribute: AttributePath, timestamp: Timestamp) -> Self {
        Self {
            id,
            attribute,
            value: Value::Null,
            timestamp,
            expired: true,
        }
    }

    pub fn collection_path() -> AttributePath {
        AttributePath::parse(COLLECTION_ATTRIBUTE)
    }
}
