use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use trinity_core::{AttributePath, ClientId, EntityId, Timestamp, Triple, Value, Write};

use crate::error::StorageError;
use crate::store::{StorageScope, TripleStore, directed};
use crate::traits::{
    MetadataWrite, ScanDirection, TimestampOp, TripleIter, TripleReader, ValueRange, WriteBatch,
    ave_order, client_order, eat_order,
};

/// Buffered writes against a store. Reads see committed data overlaid with
/// this transaction's own staged writes.
pub struct StoreTransaction<'s> {
    store: &'s TripleStore,
    scope: StorageScope,
    timestamp: Timestamp,
    inserts: Vec<Triple>,
    deletes: Vec<Triple>,
    metadata: Vec<MetadataWrite>,
    cancelled: bool,
}

impl<'s> StoreTransaction<'s> {
    pub(crate) fn new(store: &'s TripleStore, scope: StorageScope, timestamp: Timestamp) -> Self {
        Self {
            store,
            scope,
            timestamp,
            inserts: Vec::new(),
            deletes: Vec::new(),
            metadata: Vec::new(),
            cancelled: false,
        }
    }

    /// Timestamp stamped on every write made through this transaction.
    pub fn timestamp(&self) -> &Timestamp {
        &self.timestamp
    }

    pub fn scope(&self) -> &StorageScope {
        &self.scope
    }

    pub fn insert_triple(&mut self, triple: Triple) {
        self.inserts.push(triple);
    }

    pub fn insert_triples(&mut self, triples: impl IntoIterator<Item = Triple>) {
        self.inserts.extend(triples);
    }

    /// Stage writes for `id` at the transaction timestamp.
    pub fn write(&mut self, id: &EntityId, writes: impl IntoIterator<Item = Write>) {
        for write in writes {
            self.inserts.push(Triple {
                id: id.clone(),
                attribute: write.attribute,
                value: write.value,
                timestamp: self.timestamp.clone(),
                expired: write.expired,
            });
        }
    }

    pub fn delete_triples(&mut self, triples: impl IntoIterator<Item = Triple>) {
        self.deletes.extend(triples);
    }

    pub fn set_value(&mut self, entity: &str, attribute: AttributePath, value: Value) {
        self.metadata.push(MetadataWrite {
            entity: entity.to_string(),
            attribute,
            value,
        });
    }

    pub fn set_values(&mut self, entity: &str, values: impl IntoIterator<Item = (AttributePath, Value)>) {
        for (attribute, value) in values {
            self.set_value(entity, attribute, value);
        }
    }

    /// Tombstone every attribute the entity carries, `_collection` included.
    pub fn expire_entity(&mut self, id: &EntityId) -> Result<(), StorageError> {
        let mut paths: BTreeSet<AttributePath> =
            self.find_by_entity(id)?.map(|t| t.attribute).collect();
        paths.insert(Triple::collection_path());
        self.expire_entity_attributes(id, paths);
        Ok(())
    }

    pub fn expire_entity_attributes(
        &mut self,
        id: &EntityId,
        attributes: impl IntoIterator<Item = AttributePath>,
    ) {
        for attribute in attributes {
            self.inserts.push(Triple::tombstone(
                id.clone(),
                attribute,
                self.timestamp.clone(),
            ));
        }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn inserts(&self) -> &[Triple] {
        &self.inserts
    }

    pub fn deletes(&self) -> &[Triple] {
        &self.deletes
    }

    pub(crate) fn into_batch(self) -> WriteBatch {
        WriteBatch {
            inserts: self.inserts,
            deletes: self.deletes,
            metadata: self.metadata,
        }
    }

    fn is_clean(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }

    /// History-preserving overlay for EAT and client scans.
    fn overlay<'a>(
        &'a self,
        committed: TripleIter<'a>,
        matches: impl Fn(&Triple) -> bool,
        order: impl Fn(&Triple, &Triple) -> Ordering,
    ) -> TripleIter<'a> {
        if self.is_clean() {
            return committed;
        }
        let mut all: Vec<Triple> = committed.filter(|t| !self.deletes.contains(t)).collect();
        all.extend(self.inserts.iter().filter(|t| matches(t)).cloned());
        all.sort_by(|a, b| order(a, b));
        all.dedup();
        Box::new(all.into_iter())
    }

    /// Current-value overlay for AVE scans: a staged write replaces the committed
    /// entry for its `(entity, attribute)` when it is newer.
    fn overlay_current<'a>(
        &'a self,
        attribute: &AttributePath,
        committed: TripleIter<'a>,
        matches: impl Fn(&Triple) -> bool,
        order: impl Fn(&Triple, &Triple) -> Ordering,
    ) -> Result<TripleIter<'a>, StorageError> {
        let mut latest: BTreeMap<&EntityId, &Triple> = BTreeMap::new();
        for triple in self.inserts.iter().filter(|t| &t.attribute == attribute) {
            latest
                .entry(&triple.id)
                .and_modify(|cur| {
                    if triple.timestamp > cur.timestamp {
                        *cur = triple;
                    }
                })
                .or_insert(triple);
        }
        if latest.is_empty() && self.deletes.is_empty() {
            return Ok(committed);
        }

        let mut all = Vec::new();
        for triple in committed {
            let superseded = latest
                .get(&triple.id)
                .is_some_and(|staged| staged.timestamp > triple.timestamp);
            if !superseded && !self.deletes.contains(&triple) {
                all.push(triple);
            }
        }
        let shards = self.store.shard_set(self.scope.read.as_deref())?;
        for (id, staged) in latest {
            if staged.expired || !matches(staged) {
                continue;
            }
            let committed_max = shards
                .eat(Some(id), Some(attribute))?
                .filter(|t| &t.attribute == attribute)
                .map(|t| t.timestamp)
                .max();
            if committed_max.is_none_or(|max| staged.timestamp >= max) {
                all.push(staged.clone());
            }
        }
        all.sort_by(|a, b| order(a, b));
        all.dedup();
        Ok(Box::new(all.into_iter()))
    }
}

impl TripleReader for StoreTransaction<'_> {
    fn find_by_eat(
        &self,
        entity: Option<&EntityId>,
        attribute: Option<&AttributePath>,
    ) -> Result<TripleIter<'_>, StorageError> {
        let committed = self
            .store
            .shard_set(self.scope.read.as_deref())?
            .eat(entity, attribute)?;
        Ok(self.overlay(
            committed,
            |t| {
                entity.is_none_or(|id| &t.id == id)
                    && attribute.is_none_or(|prefix| t.attribute.starts_with(prefix))
            },
            eat_order,
        ))
    }

    fn find_by_ave(
        &self,
        attribute: &AttributePath,
        value: Option<&Value>,
        entity: Option<&EntityId>,
        direction: ScanDirection,
    ) -> Result<TripleIter<'_>, StorageError> {
        let committed = self
            .store
            .shard_set(self.scope.read.as_deref())?
            .ave(attribute, value, entity, direction)?;
        self.overlay_current(
            attribute,
            committed,
            |t| value.is_none_or(|v| &t.value == v) && entity.is_none_or(|id| &t.id == id),
            directed(direction, ave_order),
        )
    }

    fn find_values_in_range(
        &self,
        attribute: &AttributePath,
        range: &ValueRange,
    ) -> Result<TripleIter<'_>, StorageError> {
        let committed = self
            .store
            .shard_set(self.scope.read.as_deref())?
            .range(attribute, range)?;
        self.overlay_current(
            attribute,
            committed,
            |t| range.contains(&t.value),
            directed(range.direction, ave_order),
        )
    }

    fn find_by_client_timestamp(
        &self,
        client: &ClientId,
        op: TimestampOp,
        tick: u64,
    ) -> Result<TripleIter<'_>, StorageError> {
        let committed = self
            .store
            .shard_set(self.scope.read.as_deref())?
            .client_timestamp(client, op, tick)?;
        Ok(self.overlay(
            committed,
            |t| t.timestamp.client_id() == client && op.matches(t.timestamp.tick(), tick),
            client_order,
        ))
    }

    fn find_all_client_ids(&self) -> Result<Vec<ClientId>, StorageError> {
        let mut ids = self
            .store
            .shard_set(self.scope.read.as_deref())?
            .client_ids()?;
        ids.extend(self.inserts.iter().map(|t| t.timestamp.client_id().clone()));
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn read_metadata(
        &self,
        entity: &str,
        attribute: &AttributePath,
    ) -> Result<Option<Value>, StorageError> {
        let staged = self
            .metadata
            .iter()
            .rev()
            .find(|m| m.entity == entity && &m.attribute == attribute);
        match staged {
            Some(write) => Ok(Some(write.value.clone())),
            None => self
                .store
                .shard_set(self.scope.read.as_deref())?
                .metadata(entity, attribute),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TripleStore {
        let mut store = TripleStore::new();
        store.assign_clock(Some(ClientId::new("alice"))).unwrap();
        store
    }

    fn score(id: &EntityId, value: i32, tick: u64) -> Triple {
        Triple::new(
            id.clone(),
            AttributePath::parse("score"),
            Value::from(value),
            Timestamp::new(tick, ClientId::new("alice")),
        )
    }

    #[test]
    fn reads_see_staged_writes() {
        let mut store = store();
        let a = EntityId::new("scores", "a");
        store.insert_triples(vec![score(&a, 10, 1)]).unwrap();

        store
            .transact(None, |tx| {
                let ts = tx.timestamp().clone();
                tx.write(
                    &a,
                    [Write {
                        attribute: AttributePath::parse("score"),
                        value: Value::from(20),
                        expired: false,
                    }],
                );
                assert!(ts.tick() > 1);

                let history: Vec<_> = tx.find_by_entity(&a)?.map(|t| t.value).collect();
                assert_eq!(history, vec![Value::from(10), Value::from(20)]);

                let attr = AttributePath::parse("score");
                assert_eq!(tx.find_by_entity_attribute(&a, &attr)?.count(), 2);
                let current: Vec<_> = tx
                    .find_by_ave(&attr, None, None, ScanDirection::Asc)?
                    .map(|t| t.value)
                    .collect();
                assert_eq!(current, vec![Value::from(20)]);

                let old = tx
                    .find_by_ave(&attr, Some(&Value::from(10)), None, ScanDirection::Asc)?
                    .count();
                assert_eq!(old, 0);
                Ok::<_, StorageError>(())
            })
            .unwrap();
    }

    #[test]
    fn expire_entity_tombstones_every_path() {
        let mut store = store();
        let a = EntityId::new("scores", "a");
        store
            .insert_triples(vec![
                Triple::new(
                    a.clone(),
                    Triple::collection_path(),
                    Value::from("scores"),
                    Timestamp::new(1, ClientId::new("alice")),
                ),
                score(&a, 10, 1),
            ])
            .unwrap();
        let (_, summary) = store
            .transact(None, |tx| tx.expire_entity(&a))
            .unwrap()
            .unwrap();
        let expired: Vec<_> = summary.inserted().filter(|t| t.expired).collect();
        assert_eq!(expired.len(), 2);
        let attr = AttributePath::parse("score");
        assert_eq!(store.find_by_attribute(&attr).unwrap().count(), 0);
    }

    #[test]
    fn staged_metadata_shadows_committed() {
        let mut store = store();
        let path = AttributePath::parse("schema.version");
        store.set_value("_metadata", path.clone(), Value::from(1)).unwrap();
        store
            .transact(None, |tx| {
                tx.set_value("_metadata", path.clone(), Value::from(2));
                assert_eq!(tx.read_metadata("_metadata", &path)?, Some(Value::from(2)));
                tx.set_values(
                    "_metadata",
                    [(path.clone(), Value::from(3)), (AttributePath::parse("schema.name"), Value::from("v3"))],
                );
                assert_eq!(tx.read_metadata("_metadata", &path)?, Some(Value::from(3)));
                tx.cancel();
                Ok::<_, StorageError>(())
            })
            .unwrap();
        assert_eq!(
            store.read_metadata("_metadata", &path).unwrap(),
            Some(Value::from(1))
        );
    }
}
