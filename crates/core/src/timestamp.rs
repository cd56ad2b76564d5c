use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::ClientId;

/// A logical timestamp: `(tick, client_id)`. Tick dominates; the client id
/// breaks ties lexicographically, giving a deterministic total order.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    tick: u64,
    client_id: ClientId,
}

impl Timestamp {
    pub fn new(tick: u64, client_id: ClientId) -> Self {
        Self { tick, client_id }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Compare with ties on tick resolved in favour of the lower client id
    /// instead of the higher one.
    pub fn cmp_lower_client_wins(&self, other: &Self) -> Ordering {
        self.tick
            .cmp(&other.tick)
            .then_with(|| other.client_id.cmp(&self.client_id))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tick
            .cmp(&other.tick)
            .then_with(|| self.client_id.cmp(&other.client_id))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.tick, self.client_id)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.tick, self.client_id)
    }
}
