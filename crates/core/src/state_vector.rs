use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::ClientId;
use crate::timestamp::Timestamp;

/// Highest tick seen per client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    entries: BTreeMap<ClientId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the entry for a client. Keeps the max tick per client.
    pub fn update(&mut self, client_id: ClientId, tick: u64) {
        let entry = self.entries.entry(client_id).or_insert(tick);
        if tick > *entry {
            *entry = tick;
        }
    }

    pub fn observe(&mut self, timestamp: &Timestamp) {
        self.update(timestamp.client_id().clone(), timestamp.tick());
    }

    pub fn get(&self, client_id: &ClientId) -> Option<u64> {
        self.entries.get(client_id).copied()
    }

    /// True when a write at `timestamp` is already reflected by this vector.
    pub fn includes(&self, timestamp: &Timestamp) -> bool {
        self.get(timestamp.client_id())
            .is_some_and(|max| timestamp.tick() <= max)
    }

    /// Merge another vector into this one (take max per client).
    pub fn merge(&mut self, other: &StateVector) {
        for (client_id, tick) in &other.entries {
            self.update(client_id.clone(), *tick);
        }
    }

    /// Clients where `other` is ahead of us, with our current tick if known.
    pub fn diff(&self, other: &StateVector) -> Vec<(ClientId, Option<u64>)> {
        let mut result = Vec::new();
        for (client_id, other_tick) in &other.entries {
            match self.entries.get(client_id) {
                Some(ours) if ours >= other_tick => {}
                Some(ours) => result.push((client_id.clone(), Some(*ours))),
                None => result.push((client_id.clone(), None)),
            }
        }
        result
    }

    pub fn covers(&self, other: &StateVector) -> bool {
        self.diff(other).is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<ClientId, u64> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, crate::CoreError> {
        rmp_serde::to_vec(self).map_err(|e| crate::CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, crate::CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| crate::CoreError::Serialization(e.to_string()))
    }
}

impl FromIterator<(ClientId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ClientId, u64)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (client_id, tick) in iter {
            sv.update(client_id, tick);
        }
        sv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(s: &str) -> ClientId {
        ClientId::from(s)
    }

    #[test]
    fn update_tracks_max() {
        let mut sv = StateVector::new();
        sv.update(client("A"), 3);
        sv.update(client("A"), 1);
        assert_eq!(sv.get(&client("A")), Some(3));
        sv.update(client("A"), 5);
        assert_eq!(sv.get(&client("A")), Some(5));
    }

    #[test]
    fn includes_respects_ceiling() {
        let sv: StateVector = [(client("A"), 3)].into_iter().collect();
        assert!(sv.includes(&Timestamp::new(3, client("A"))));
        assert!(!sv.includes(&Timestamp::new(4, client("A"))));
        assert!(!sv.includes(&Timestamp::new(1, client("B"))));
    }

    #[test]
    fn diff_and_covers() {
        let a: StateVector = [(client("A"), 2), (client("B"), 5)].into_iter().collect();
        let b: StateVector = [(client("A"), 4), (client("B"), 5), (client("C"), 1)]
            .into_iter()
            .collect();
        let diff = a.diff(&b);
        assert_eq!(diff.len(), 2);
        assert!(diff.contains(&(client("A"), Some(2))));
        assert!(diff.contains(&(client("C"), None)));
        assert!(!a.covers(&b));
        let mut merged = a.clone();
        merged.merge(&b);
        assert!(merged.covers(&b));
        assert!(merged.covers(&a));
    }
}
