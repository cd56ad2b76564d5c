use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::CoreError;

const CLIENT_ID_LEN: usize = 16;

/// Identifies one writer. Compared lexicographically when ticks tie.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CLIENT_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// `"<collection>#<localId>"`. Ordered by its string form so index order and
/// storage order agree.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EntityId {
    raw: String,
    split: usize,
}

impl EntityId {
    pub fn new(collection: &str, local_id: &str) -> Self {
        Self {
            raw: format!("{collection}#{local_id}"),
            split: collection.len(),
        }
    }

    /// Fresh id with a time-ordered local part.
    pub fn generate(collection: &str) -> Self {
        Self::new(collection, &Uuid::now_v7().to_string())
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.find('#') {
            Some(split) if split > 0 && split + 1 < s.len() => Ok(Self {
                raw: s.to_string(),
                split,
            }),
            _ => Err(CoreError::InvalidEntityId(s.to_string())),
        }
    }

    pub fn collection(&self) -> &str {
        &self.raw[..self.split]
    }

    pub fn local_id(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Ord for EntityId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl PartialOrd for EntityId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.raw)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        EntityId::parse(&raw).map_err(serde::de::Error::custom)
    }
}
