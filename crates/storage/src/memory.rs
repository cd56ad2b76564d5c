use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use trinity_core::{AttributePath, ClientId, EntityId, Timestamp, Triple, Value};

use crate::error::StorageError;
use crate::traits::{
    MetadataWrite, ScanDirection, TimestampOp, TripleIter, TripleStorage, ValueRange, WriteBatch,
};

type History = BTreeMap<Timestamp, (Value, bool)>;
type AttributeMap = BTreeMap<AttributePath, History>;

/// In-memory shard built from nested ordered maps, one per index.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    eat: BTreeMap<EntityId, AttributeMap>,
    ave: BTreeMap<AttributePath, BTreeMap<Value, BTreeMap<EntityId, Timestamp>>>,
    clients: BTreeMap<ClientId, BTreeSet<(u64, EntityId, AttributePath)>>,
    metadata: BTreeMap<String, BTreeMap<AttributePath, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.eat
            .values()
            .flat_map(|attrs| attrs.values())
            .map(|history| history.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.eat.is_empty()
    }

    fn insert_triple(&mut self, triple: &Triple) {
        let history = self
            .eat
            .entry(triple.id.clone())
            .or_default()
            .entry(triple.attribute.clone())
            .or_default();
        let previous = history
            .last_key_value()
            .map(|(ts, (value, expired))| (ts.clone(), value.clone(), *expired));
        history.insert(
            triple.timestamp.clone(),
            (triple.value.clone(), triple.expired),
        );
        self.clients
            .entry(triple.timestamp.client_id().clone())
            .or_default()
            .insert((
                triple.timestamp.tick(),
                triple.id.clone(),
                triple.attribute.clone(),
            ));

        match previous {
            // history only: a newer write already owns the AVE slot
            Some((ts, _, _)) if ts > triple.timestamp => {}
            Some((_, value, expired)) => {
                if !expired {
                    self.ave_remove(&triple.attribute, &value, &triple.id);
                }
                if !triple.expired {
                    self.ave_insert(triple);
                }
            }
            None if !triple.expired => self.ave_insert(triple),
            None => {}
        }
    }

    fn remove_triple(&mut self, triple: &Triple) {
        let Some(attrs) = self.eat.get_mut(&triple.id) else {
            return;
        };
        let Some(history) = attrs.get_mut(&triple.attribute) else {
            return;
        };
        let was_latest = history
            .last_key_value()
            .is_some_and(|(ts, _)| *ts == triple.timestamp);
        let Some((value, expired)) = history.remove(&triple.timestamp) else {
            return;
        };
        let next = history
            .last_key_value()
            .map(|(ts, (value, expired))| (ts.clone(), value.clone(), *expired));
        if history.is_empty() {
            attrs.remove(&triple.attribute);
            if attrs.is_empty() {
                self.eat.remove(&triple.id);
            }
        }

        if let Some(set) = self.clients.get_mut(triple.timestamp.client_id()) {
            set.remove(&(
                triple.timestamp.tick(),
                triple.id.clone(),
                triple.attribute.clone(),
            ));
            if set.is_empty() {
                self.clients.remove(triple.timestamp.client_id());
            }
        }

        if was_latest {
            if !expired {
                self.ave_remove(&triple.attribute, &value, &triple.id);
            }
            if let Some((ts, value, false)) = next {
                let current = Triple::new(triple.id.clone(), triple.attribute.clone(), value, ts);
                self.ave_insert(&current);
            }
        }
    }

    fn ave_insert(&mut self, triple: &Triple) {
        self.ave
            .entry(triple.attribute.clone())
            .or_default()
            .entry(triple.value.clone())
            .or_default()
            .insert(triple.id.clone(), triple.timestamp.clone());
    }

    fn ave_remove(&mut self, attribute: &AttributePath, value: &Value, id: &EntityId) {
        let Some(values) = self.ave.get_mut(attribute) else {
            return;
        };
        if let Some(entities) = values.get_mut(value) {
            entities.remove(id);
            if entities.is_empty() {
                values.remove(value);
            }
        }
        if values.is_empty() {
            self.ave.remove(attribute);
        }
    }

    fn lookup(&self, attribute: &AttributePath, id: &EntityId, ts: &Timestamp) -> Option<Triple> {
        let (value, expired) = self.eat.get(id)?.get(attribute)?.get(ts)?;
        Some(Triple {
            id: id.clone(),
            attribute: attribute.clone(),
            value: value.clone(),
            timestamp: ts.clone(),
            expired: *expired,
        })
    }

    fn write_metadata(&mut self, write: &MetadataWrite) {
        self.metadata
            .entry(write.entity.clone())
            .or_default()
            .insert(write.attribute.clone(), write.value.clone());
    }
}

fn history_triples<'a>(
    id: &'a EntityId,
    attrs: impl Iterator<Item = (&'a AttributePath, &'a History)> + 'a,
) -> impl Iterator<Item = Triple> + 'a {
    attrs.flat_map(move |(attribute, history)| {
        history.iter().map(move |(ts, (value, expired))| Triple {
            id: id.clone(),
            attribute: attribute.clone(),
            value: value.clone(),
            timestamp: ts.clone(),
            expired: *expired,
        })
    })
}

fn prefixed<'a>(
    attrs: &'a AttributeMap,
    prefix: AttributePath,
) -> impl Iterator<Item = (&'a AttributePath, &'a History)> + 'a {
    attrs
        .range(prefix.clone()..)
        .take_while(move |(attr, _)| attr.starts_with(&prefix))
}

impl TripleStorage for MemoryStorage {
    fn apply(&mut self, batch: &WriteBatch) -> Result<(), StorageError> {
        for triple in &batch.deletes {
            self.remove_triple(triple);
        }
        for triple in &batch.inserts {
            self.insert_triple(triple);
        }
        for write in &batch.metadata {
            self.write_metadata(write);
        }
        Ok(())
    }

    fn scan_eat(
        &self,
        entity: Option<&EntityId>,
        attribute: Option<&AttributePath>,
    ) -> Result<TripleIter<'_>, StorageError> {
        let iter: TripleIter<'_> = match (entity, attribute) {
            (Some(id), Some(prefix)) => match self.eat.get_key_value(id) {
                Some((id, attrs)) => Box::new(history_triples(id, prefixed(attrs, prefix.clone()))),
                None => Box::new(std::iter::empty()),
            },
            (Some(id), None) => match self.eat.get_key_value(id) {
                Some((id, attrs)) => Box::new(history_triples(id, attrs.iter())),
                None => Box::new(std::iter::empty()),
            },
            (None, Some(prefix)) => {
                let prefix = prefix.clone();
                Box::new(
                    self.eat
                        .iter()
                        .flat_map(move |(id, attrs)| history_triples(id, prefixed(attrs, prefix.clone()))),
                )
            }
            (None, None) => Box::new(
                self.eat
                    .iter()
                    .flat_map(|(id, attrs)| history_triples(id, attrs.iter())),
            ),
        };
        Ok(iter)
    }

    fn scan_ave(
        &self,
        attribute: &AttributePath,
        value: Option<&Value>,
        entity: Option<&EntityId>,
        direction: ScanDirection,
    ) -> Result<TripleIter<'_>, StorageError> {
        let Some((attribute, values)) = self.ave.get_key_value(attribute) else {
            return Ok(Box::new(std::iter::empty()));
        };
        let entity = entity.cloned();
        let rows: Box<dyn Iterator<Item = (&EntityId, &Timestamp)> + '_> = match value {
            Some(value) => match values.get(value) {
                Some(entities) => match direction {
                    ScanDirection::Asc => Box::new(entities.iter()),
                    ScanDirection::Desc => Box::new(entities.iter().rev()),
                },
                None => Box::new(std::iter::empty()),
            },
            None => match direction {
                ScanDirection::Asc => Box::new(values.values().flat_map(|e| e.iter())),
                ScanDirection::Desc => Box::new(values.values().rev().flat_map(|e| e.iter().rev())),
            },
        };
        Ok(Box::new(
            rows.filter(move |(id, _)| entity.as_ref().is_none_or(|e| e == *id))
                .filter_map(move |(id, ts)| self.lookup(attribute, id, ts)),
        ))
    }

    fn scan_value_range(
        &self,
        attribute: &AttributePath,
        range: &ValueRange,
    ) -> Result<TripleIter<'_>, StorageError> {
        let Some((attribute, values)) = self.ave.get_key_value(attribute) else {
            return Ok(Box::new(std::iter::empty()));
        };
        if range.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        let bounds: (Bound<&Value>, Bound<&Value>) = (range.lower(), range.upper());
        let scanned = values.range::<Value, _>(bounds);
        let filter = range.clone();
        let rows: Box<dyn Iterator<Item = (&Value, &BTreeMap<EntityId, Timestamp>)> + '_> =
            match range.direction {
                ScanDirection::Asc => Box::new(scanned),
                ScanDirection::Desc => Box::new(scanned.rev()),
            };
        let desc = range.direction == ScanDirection::Desc;
        Ok(Box::new(
            rows.filter(move |(value, _)| filter.contains(value))
                .flat_map(move |(_, entities)| {
                    let ordered: Box<dyn Iterator<Item = (&EntityId, &Timestamp)> + '_> = if desc {
                        Box::new(entities.iter().rev())
                    } else {
                        Box::new(entities.iter())
                    };
                    ordered
                })
                .filter_map(move |(id, ts)| self.lookup(attribute, id, ts)),
        ))
    }

    fn scan_client_timestamp(
        &self,
        client: &ClientId,
        op: TimestampOp,
        tick: u64,
    ) -> Result<TripleIter<'_>, StorageError> {
        let Some((client, rows)) = self.clients.get_key_value(client) else {
            return Ok(Box::new(std::iter::empty()));
        };
        let lower_ok = move |t: u64| match op {
            TimestampOp::Gt => t > tick,
            TimestampOp::Gte | TimestampOp::Eq => t >= tick,
            TimestampOp::Lt | TimestampOp::Lte => true,
        };
        let upper_ok = move |t: u64| match op {
            TimestampOp::Lt => t < tick,
            TimestampOp::Lte | TimestampOp::Eq => t <= tick,
            TimestampOp::Gt | TimestampOp::Gte => true,
        };
        Ok(Box::new(
            rows.iter()
                .skip_while(move |(t, _, _)| !lower_ok(*t))
                .take_while(move |(t, _, _)| upper_ok(*t))
                .filter_map(move |(t, id, attribute)| {
                    self.lookup(attribute, id, &Timestamp::new(*t, client.clone()))
                }),
        ))
    }

    fn client_ids(&self) -> Result<Vec<ClientId>, StorageError> {
        Ok(self.clients.keys().cloned().collect())
    }

    fn get_metadata(
        &self,
        entity: &str,
        attribute: &AttributePath,
    ) -> Result<Option<Value>, StorageError> {
        Ok(self
            .metadata
            .get(entity)
            .and_then(|attrs| attrs.get(attribute))
            .cloned())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        *self = Self::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(tick: u64, client: &str) -> Timestamp {
        Timestamp::new(tick, ClientId::new(client))
    }

    fn triple(id: &EntityId, attr: &str, value: impl Into<Value>, t: Timestamp) -> Triple {
        Triple::new(id.clone(), AttributePath::parse(attr), value.into(), t)
    }

    fn insert(store: &mut MemoryStorage, triples: Vec<Triple>) {
        store
            .apply(&WriteBatch {
                inserts: triples,
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn eat_scan_is_ordered_and_prefix_filtered() {
        let mut store = MemoryStorage::new();
        let a = EntityId::new("users", "a");
        let b = EntityId::new("users", "b");
        insert(
            &mut store,
            vec![
                triple(&b, "name", "Bob", ts(1, "c")),
                triple(&a, "address.city", "Oslo", ts(1, "c")),
                triple(&a, "name", "Alice", ts(1, "c")),
                triple(&a, "address.zip", "0150", ts(2, "c")),
            ],
        );

        let all: Vec<_> = store.scan_eat(None, None).unwrap().collect();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].id, a);
        assert_eq!(all[3].id, b);

        let address: Vec<_> = store
            .scan_eat(Some(&a), Some(&AttributePath::parse("address")))
            .unwrap()
            .map(|t| t.attribute.to_dotted())
            .collect();
        assert_eq!(address, vec!["address.city", "address.zip"]);
    }

    #[test]
    fn ave_tracks_only_the_current_value() {
        let mut store = MemoryStorage::new();
        let a = EntityId::new("scores", "a");
        insert(&mut store, vec![triple(&a, "score", 100, ts(1, "c"))]);
        insert(&mut store, vec![triple(&a, "score", 50, ts(2, "c"))]);
        // stale write arrives late and only lands in history
        insert(&mut store, vec![triple(&a, "score", 75, ts(1, "b"))]);

        let attr = AttributePath::parse("score");
        let values: Vec<_> = store
            .scan_ave(&attr, None, None, ScanDirection::Asc)
            .unwrap()
            .map(|t| t.value)
            .collect();
        assert_eq!(values, vec![Value::Number(50.0)]);
        assert_eq!(store.scan_eat(Some(&a), None).unwrap().count(), 3);
    }

    #[test]
    fn tombstone_removes_ave_entry() {
        let mut store = MemoryStorage::new();
        let a = EntityId::new("scores", "a");
        let attr = AttributePath::parse("score");
        insert(&mut store, vec![triple(&a, "score", 100, ts(1, "c"))]);
        insert(&mut store, vec![Triple::tombstone(a.clone(), attr.clone(), ts(2, "c"))]);

        assert_eq!(store.scan_ave(&attr, None, None, ScanDirection::Asc).unwrap().count(), 0);
        assert_eq!(store.scan_eat(Some(&a), None).unwrap().count(), 2);
    }

    #[test]
    fn deleting_latest_restores_previous_ave_entry() {
        let mut store = MemoryStorage::new();
        let a = EntityId::new("scores", "a");
        let attr = AttributePath::parse("score");
        let newer = triple(&a, "score", 50, ts(2, "c"));
        insert(
            &mut store,
            vec![triple(&a, "score", 100, ts(1, "c")), newer.clone()],
        );
        store
            .apply(&WriteBatch {
                deletes: vec![newer],
                ..Default::default()
            })
            .unwrap();

        let values: Vec<_> = store
            .scan_ave(&attr, None, None, ScanDirection::Asc)
            .unwrap()
            .map(|t| t.value)
            .collect();
        assert_eq!(values, vec![Value::Number(100.0)]);
    }

    #[test]
    fn value_range_is_half_open_and_kind_bound() {
        let mut store = MemoryStorage::new();
        let attr = AttributePath::parse("score");
        let mut triples = Vec::new();
        for (i, score) in [70, 80, 85, 90, 95].into_iter().enumerate() {
            let id = EntityId::new("scores", &format!("s{i}"));
            triples.push(triple(&id, "score", score, ts(1, "c")));
        }
        let odd = EntityId::new("scores", "odd");
        triples.push(triple(&odd, "score", "high", ts(1, "c")));
        insert(&mut store, triples);

        let range = ValueRange {
            gt: Some(Value::from(80)),
            lte: Some(Value::from(90)),
            ..Default::default()
        };
        let values: Vec<_> = store
            .scan_value_range(&attr, &range)
            .unwrap()
            .map(|t| t.value)
            .collect();
        assert_eq!(values, vec![Value::from(85), Value::from(90)]);

        let open = ValueRange {
            gt: Some(Value::from(90)),
            direction: ScanDirection::Desc,
            ..Default::default()
        };
        let values: Vec<_> = store
            .scan_value_range(&attr, &open)
            .unwrap()
            .map(|t| t.value)
            .collect();
        assert_eq!(values, vec![Value::from(95)]);
    }

    #[test]
    fn empty_range_does_not_panic() {
        let mut store = MemoryStorage::new();
        let id = EntityId::new("scores", "a");
        insert(&mut store, vec![triple(&id, "score", 5, ts(1, "c"))]);
        let range = ValueRange {
            gt: Some(Value::from(5)),
            lt: Some(Value::from(5)),
            ..Default::default()
        };
        let attr = AttributePath::parse("score");
        assert_eq!(store.scan_value_range(&attr, &range).unwrap().count(), 0);
    }

    #[test]
    fn client_timestamp_scan() {
        let mut store = MemoryStorage::new();
        let id = EntityId::new("todos", "1");
        insert(
            &mut store,
            vec![
                triple(&id, "title", "a", ts(1, "alice")),
                triple(&id, "done", false, ts(2, "alice")),
                triple(&id, "title", "b", ts(3, "alice")),
                triple(&id, "title", "c", ts(2, "bob")),
            ],
        );
        let alice = ClientId::new("alice");
        let ticks: Vec<_> = store
            .scan_client_timestamp(&alice, TimestampOp::Gt, 1)
            .unwrap()
            .map(|t| t.timestamp.tick())
            .collect();
        assert_eq!(ticks, vec![2, 3]);
        assert_eq!(
            store
                .scan_client_timestamp(&alice, TimestampOp::Eq, 2)
                .unwrap()
                .count(),
            1
        );
        assert_eq!(store.client_ids().unwrap().len(), 2);
    }

    #[test]
    fn metadata_is_independent_of_triples() {
        let mut store = MemoryStorage::new();
        store
            .apply(&WriteBatch {
                metadata: vec![MetadataWrite {
                    entity: "_metadata".into(),
                    attribute: AttributePath::parse("clock.tick"),
                    value: Value::from(4),
                }],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            store
                .get_metadata("_metadata", &AttributePath::parse("clock.tick"))
                .unwrap(),
            Some(Value::from(4))
        );
        assert!(store.scan_eat(None, None).unwrap().next().is_none());
    }
}
