use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use trinity_core::{AttributePath, ClientId, EntityId, StateVector, Timestamp, Triple, Value};

use crate::clock::{self, SharedClock};
use crate::error::StorageError;
use crate::hooks::{AfterCommitHook, BeforeCommitHook, BeforeInsertHook, Hooks};
use crate::memory::MemoryStorage;
use crate::traits::{
    MetadataWrite, ScanDirection, TimestampOp, TripleIter, TripleReader, TripleStorage,
    ValueRange, WriteBatch, ave_order, client_order, eat_order,
};
use crate::transaction::StoreTransaction;

pub const DEFAULT_SHARD: &str = "default";

/// Which shards reads and writes touch. `None` means every shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageScope {
    pub read: Option<Vec<String>>,
    pub write: Option<Vec<String>>,
}

impl StorageScope {
    pub fn only(shards: &[&str]) -> Self {
        let names: Vec<String> = shards.iter().map(|s| s.to_string()).collect();
        Self {
            read: Some(names.clone()),
            write: Some(names),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardWrite {
    pub inserts: Vec<Triple>,
    pub deletes: Vec<Triple>,
}

/// What one committed transaction changed, per shard.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitSummary {
    pub timestamp: Timestamp,
    pub writes: BTreeMap<String, ShardWrite>,
}

impl CommitSummary {
    pub fn inserted(&self) -> impl Iterator<Item = &Triple> {
        self.writes.values().flat_map(|w| w.inserts.iter())
    }

    pub fn deleted(&self) -> impl Iterator<Item = &Triple> {
        self.writes.values().flat_map(|w| w.deletes.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.writes
            .values()
            .all(|w| w.inserts.is_empty() && w.deletes.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

type WriteListener = Box<dyn FnMut(&TripleStore, &CommitSummary)>;
type InsertListener = Box<dyn FnMut(&BTreeMap<String, Vec<Triple>>)>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    on_write: Vec<(ListenerId, WriteListener)>,
    on_insert: Vec<(ListenerId, InsertListener)>,
}

impl Listeners {
    fn next(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

/// Sharded triple store with transactions, commit hooks and write listeners.
pub struct TripleStore {
    shards: BTreeMap<String, Box<dyn TripleStorage>>,
    scope: StorageScope,
    hooks: Hooks,
    listeners: Listeners,
    clock: Option<SharedClock>,
}

impl TripleStore {
    /// Store over a single in-memory shard.
    pub fn new() -> Self {
        Self::with_storage(MemoryStorage::new())
    }

    pub fn with_storage(storage: impl TripleStorage + 'static) -> Self {
        let mut shards: BTreeMap<String, Box<dyn TripleStorage>> = BTreeMap::new();
        shards.insert(DEFAULT_SHARD.to_string(), Box::new(storage));
        Self::from_shards(shards)
    }

    pub fn with_shards(
        shards: Vec<(String, Box<dyn TripleStorage>)>,
    ) -> Result<Self, StorageError> {
        if shards.is_empty() {
            return Err(StorageError::UnknownShard("no shards configured".into()));
        }
        Ok(Self::from_shards(shards.into_iter().collect()))
    }

    fn from_shards(shards: BTreeMap<String, Box<dyn TripleStorage>>) -> Self {
        Self {
            shards,
            scope: StorageScope::default(),
            hooks: Hooks::default(),
            listeners: Listeners::default(),
            clock: None,
        }
    }

    pub fn shard_names(&self) -> impl Iterator<Item = &str> {
        self.shards.keys().map(String::as_str)
    }

    pub fn scope(&self) -> &StorageScope {
        &self.scope
    }

    pub fn set_scope(&mut self, scope: StorageScope) -> Result<(), StorageError> {
        self.shard_set(scope.read.as_deref())?;
        self.shard_set(scope.write.as_deref())?;
        self.scope = scope;
        Ok(())
    }

    pub fn add_before_insert(&mut self, hook: Box<dyn BeforeInsertHook>) {
        self.hooks.before_insert.push(hook);
    }

    pub fn add_before_commit(&mut self, hook: Box<dyn BeforeCommitHook>) {
        self.hooks.before_commit.push(hook);
    }

    pub fn add_after_commit(&mut self, hook: Box<dyn AfterCommitHook>) {
        self.hooks.after_commit.push(hook);
    }

    /// Called after every non-empty commit with read access to the committed store.
    pub fn on_write(
        &mut self,
        listener: impl FnMut(&TripleStore, &CommitSummary) + 'static,
    ) -> ListenerId {
        let id = self.listeners.next();
        self.listeners.on_write.push((id, Box::new(listener)));
        id
    }

    pub fn on_insert(
        &mut self,
        listener: impl FnMut(&BTreeMap<String, Vec<Triple>>) + 'static,
    ) -> ListenerId {
        let id = self.listeners.next();
        self.listeners.on_insert.push((id, Box::new(listener)));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.on_write.len() + self.listeners.on_insert.len();
        self.listeners.on_write.retain(|(l, _)| *l != id);
        self.listeners.on_insert.retain(|(l, _)| *l != id);
        before != self.listeners.on_write.len() + self.listeners.on_insert.len()
    }

    pub(crate) fn bind_clock(&mut self, clock: SharedClock) {
        self.clock = Some(clock);
    }

    /// Bind a logical clock, restoring persisted state. See [`clock::assign_to_store`].
    pub fn assign_clock(&mut self, client_id: Option<ClientId>) -> Result<SharedClock, StorageError> {
        clock::assign_to_store(self, client_id)
    }

    pub fn clock(&self) -> Option<&SharedClock> {
        self.clock.as_ref()
    }

    fn next_timestamp(&self) -> Result<Timestamp, StorageError> {
        match &self.clock {
            Some(clock) => clock.next_timestamp(),
            None => Err(StorageError::ClockNotReady(
                "no clock assigned to store".into(),
            )),
        }
    }

    pub(crate) fn shard_set(&self, names: Option<&[String]>) -> Result<ShardSet<'_>, StorageError> {
        let shards: Vec<&dyn TripleStorage> = match names {
            None => self.shards.values().map(|s| &**s).collect(),
            Some(names) => names
                .iter()
                .map(|name| {
                    self.shards
                        .get(name)
                        .map(|s| &**s)
                        .ok_or_else(|| StorageError::UnknownShard(name.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(ShardSet(shards))
    }

    fn write_shard_names(&self, scope: &StorageScope) -> Vec<String> {
        match &scope.write {
            Some(names) => names.clone(),
            None => self.shards.keys().cloned().collect(),
        }
    }

    /// Run `f` inside a transaction and commit what it staged.
    ///
    /// Returns `Ok(None)` when the body cancelled the transaction. An error from
    /// the body or a pre-commit hook discards every staged write.
    pub fn transact<T, E, F>(
        &mut self,
        scope: Option<StorageScope>,
        f: F,
    ) -> Result<Option<(T, CommitSummary)>, E>
    where
        F: FnOnce(&mut StoreTransaction<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let timestamp = self.next_timestamp()?;
        let scope = scope.unwrap_or_else(|| self.scope.clone());

        let mut hooks = std::mem::take(&mut self.hooks);
        let staged = self.stage(&mut hooks, scope.clone(), timestamp.clone(), f);
        self.hooks = hooks;
        let Some((value, batch)) = staged? else {
            return Ok(None);
        };

        let summary = self.commit_batch(&scope, timestamp, batch)?;
        self.run_after_commit(&summary);
        self.notify(&summary);
        Ok(Some((value, summary)))
    }

    fn stage<T, E, F>(
        &self,
        hooks: &mut Hooks,
        scope: StorageScope,
        timestamp: Timestamp,
        f: F,
    ) -> Result<Option<(T, WriteBatch)>, E>
    where
        F: FnOnce(&mut StoreTransaction<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut tx = StoreTransaction::new(self, scope, timestamp);
        let value = f(&mut tx)?;
        if tx.is_cancelled() {
            debug!(timestamp = %tx.timestamp(), "transaction cancelled");
            return Ok(None);
        }
        for hook in hooks.before_insert.iter_mut() {
            hook.before_insert(tx.inserts(), &tx)?;
        }
        for hook in hooks.before_commit.iter_mut() {
            hook.before_commit(&mut tx)?;
        }
        Ok(Some((value, tx.into_batch())))
    }

    /// Apply `batch` to every write shard. A shard that fails leaves no trace:
    /// shards written before it are rolled back and the error is returned
    /// without a summary.
    fn commit_batch(
        &mut self,
        scope: &StorageScope,
        timestamp: Timestamp,
        batch: WriteBatch,
    ) -> Result<CommitSummary, StorageError> {
        let names = self.write_shard_names(scope);
        if let Some(missing) = names.iter().find(|n| !self.shards.contains_key(*n)) {
            return Err(StorageError::UnknownShard(missing.clone()));
        }
        if !batch.is_empty() {
            let mut applied: Vec<(String, WriteBatch)> = Vec::new();
            for name in &names {
                let Some(shard) = self.shards.get_mut(name) else {
                    continue;
                };
                // A lone shard applies atomically on its own.
                let undo = if names.len() > 1 {
                    Some(inverse(&**shard, &batch)?)
                } else {
                    None
                };
                if let Err(e) = shard.apply(&batch) {
                    warn!(shard = %name, error = %e, rolled_back = applied.len(), "commit failed");
                    self.roll_back(applied);
                    return Err(e);
                }
                if let Some(undo) = undo {
                    applied.push((name.clone(), undo));
                }
            }
        }
        let writes = names
            .into_iter()
            .map(|name| {
                let write = ShardWrite {
                    inserts: batch.inserts.clone(),
                    deletes: batch.deletes.clone(),
                };
                (name, write)
            })
            .collect();
        debug!(
            %timestamp,
            inserts = batch.inserts.len(),
            deletes = batch.deletes.len(),
            "transaction committed"
        );
        Ok(CommitSummary { timestamp, writes })
    }

    fn roll_back(&mut self, applied: Vec<(String, WriteBatch)>) {
        for (name, undo) in applied.into_iter().rev() {
            if let Some(shard) = self.shards.get_mut(&name)
                && let Err(e) = shard.apply(&undo)
            {
                warn!(shard = %name, error = %e, "rollback failed");
            }
        }
    }

    fn run_after_commit(&mut self, summary: &CommitSummary) {
        let mut hooks = std::mem::take(&mut self.hooks.after_commit);
        for hook in hooks.iter_mut() {
            if let Err(e) = hook.after_commit(summary) {
                warn!(error = %e, "after-commit hook failed");
            }
        }
        self.hooks.after_commit = hooks;
    }

    fn notify(&mut self, summary: &CommitSummary) {
        if summary.is_empty() {
            return;
        }
        let mut on_write = std::mem::take(&mut self.listeners.on_write);
        for (_, listener) in on_write.iter_mut() {
            listener(self, summary);
        }
        self.listeners.on_write = on_write;
        let inserts: BTreeMap<String, Vec<Triple>> = summary
            .writes
            .iter()
            .filter(|(_, w)| !w.inserts.is_empty())
            .map(|(name, w)| (name.clone(), w.inserts.clone()))
            .collect();
        if inserts.is_empty() {
            return;
        }
        for (_, listener) in self.listeners.on_insert.iter_mut() {
            listener(&inserts);
        }
    }

    /// Apply metadata directly, bypassing hooks and listeners.
    pub fn write_metadata(&mut self, writes: Vec<MetadataWrite>) -> Result<(), StorageError> {
        let batch = WriteBatch {
            metadata: writes,
            ..Default::default()
        };
        for name in self.write_shard_names(&self.scope.clone()) {
            if let Some(shard) = self.shards.get_mut(&name) {
                shard.apply(&batch)?;
            }
        }
        Ok(())
    }

    pub fn insert_triples(&mut self, triples: Vec<Triple>) -> Result<Option<CommitSummary>, StorageError> {
        let committed = self.transact(None, |tx| {
            tx.insert_triples(triples);
            Ok::<_, StorageError>(())
        })?;
        Ok(committed.map(|(_, summary)| summary))
    }

    pub fn delete_triples(&mut self, triples: Vec<Triple>) -> Result<Option<CommitSummary>, StorageError> {
        let committed = self.transact(None, |tx| {
            tx.delete_triples(triples);
            Ok::<_, StorageError>(())
        })?;
        Ok(committed.map(|(_, summary)| summary))
    }

    pub fn set_value(
        &mut self,
        entity: &str,
        attribute: AttributePath,
        value: Value,
    ) -> Result<(), StorageError> {
        self.transact(None, |tx| {
            tx.set_value(entity, attribute, value);
            Ok::<_, StorageError>(())
        })?;
        Ok(())
    }

    pub fn expire_entity(&mut self, id: &EntityId) -> Result<Option<CommitSummary>, StorageError> {
        let committed = self.transact(None, |tx| tx.expire_entity(id))?;
        Ok(committed.map(|(_, summary)| summary))
    }

    /// Wipe every shard. A bound clock restarts with a fresh client id.
    pub fn clear(&mut self) -> Result<(), StorageError> {
        for shard in self.shards.values_mut() {
            shard.clear()?;
        }
        if let Some(clock) = self.clock.clone() {
            clock::reset_after_clear(self, &clock)?;
        }
        Ok(())
    }

    /// Highest tick stored per client.
    pub fn state_vector(&self) -> Result<StateVector, StorageError> {
        let mut vector = StateVector::new();
        for client in self.find_all_client_ids()? {
            let last = self
                .find_by_client_timestamp(&client, TimestampOp::Gte, 0)?
                .map(|t| t.timestamp.tick())
                .max();
            if let Some(tick) = last {
                vector.update(client, tick);
            }
        }
        Ok(vector)
    }

    /// Every triple not covered by `since`, in client/tick order.
    pub fn triples_since(&self, since: &StateVector) -> Result<Vec<Triple>, StorageError> {
        let mut out = Vec::new();
        for client in self.find_all_client_ids()? {
            let iter = match since.get(&client) {
                Some(tick) => self.find_by_client_timestamp(&client, TimestampOp::Gt, tick)?,
                None => self.find_by_client_timestamp(&client, TimestampOp::Gte, 0)?,
            };
            out.extend(iter);
        }
        Ok(out)
    }
}

impl Default for TripleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TripleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TripleStore")
            .field("shards", &self.shards.keys().collect::<Vec<_>>())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl TripleReader for TripleStore {
    fn find_by_eat(
        &self,
        entity: Option<&EntityId>,
        attribute: Option<&AttributePath>,
    ) -> Result<TripleIter<'_>, StorageError> {
        self.shard_set(self.scope.read.as_deref())?.eat(entity, attribute)
    }

    fn find_by_ave(
        &self,
        attribute: &AttributePath,
        value: Option<&Value>,
        entity: Option<&EntityId>,
        direction: ScanDirection,
    ) -> Result<TripleIter<'_>, StorageError> {
        self.shard_set(self.scope.read.as_deref())?
            .ave(attribute, value, entity, direction)
    }

    fn find_values_in_range(
        &self,
        attribute: &AttributePath,
        range: &ValueRange,
    ) -> Result<TripleIter<'_>, StorageError> {
        self.shard_set(self.scope.read.as_deref())?
            .range(attribute, range)
    }

    fn find_by_client_timestamp(
        &self,
        client: &ClientId,
        op: TimestampOp,
        tick: u64,
    ) -> Result<TripleIter<'_>, StorageError> {
        self.shard_set(self.scope.read.as_deref())?
            .client_timestamp(client, op, tick)
    }

    fn find_all_client_ids(&self) -> Result<Vec<ClientId>, StorageError> {
        self.shard_set(self.scope.read.as_deref())?.client_ids()
    }

    fn read_metadata(
        &self,
        entity: &str,
        attribute: &AttributePath,
    ) -> Result<Option<Value>, StorageError> {
        self.shard_set(self.scope.read.as_deref())?
            .metadata(entity, attribute)
    }
}

/// The batch that takes `shard` back to where it stands now once `batch` has
/// been applied. Metadata with no previous value is restored as null.
fn inverse(shard: &dyn TripleStorage, batch: &WriteBatch) -> Result<WriteBatch, StorageError> {
    let mut undo = WriteBatch::default();
    for triple in &batch.inserts {
        if stored(shard, triple)?.is_none() {
            undo.deletes.push(triple.clone());
        }
    }
    for triple in &batch.deletes {
        if let Some(existing) = stored(shard, triple)? {
            undo.inserts.push(existing);
        }
    }
    for write in &batch.metadata {
        let previous = shard.get_metadata(&write.entity, &write.attribute)?;
        undo.metadata.push(MetadataWrite {
            entity: write.entity.clone(),
            attribute: write.attribute.clone(),
            value: previous.unwrap_or(Value::Null),
        });
    }
    Ok(undo)
}

fn stored(shard: &dyn TripleStorage, triple: &Triple) -> Result<Option<Triple>, StorageError> {
    Ok(shard
        .scan_eat(Some(&triple.id), Some(&triple.attribute))?
        .find(|t| t.attribute == triple.attribute && t.timestamp == triple.timestamp))
}

/// The shards one read touches. Multi-shard scans are merged into index order.
pub(crate) struct ShardSet<'a>(Vec<&'a dyn TripleStorage>);

fn merge<'a>(
    mut iters: Vec<TripleIter<'a>>,
    order: impl Fn(&Triple, &Triple) -> Ordering,
) -> TripleIter<'a> {
    if iters.len() == 1 {
        if let Some(iter) = iters.pop() {
            return iter;
        }
    }
    let mut all: Vec<Triple> = iters.into_iter().flatten().collect();
    all.sort_by(|a, b| order(a, b));
    all.dedup();
    Box::new(all.into_iter())
}

impl<'a> ShardSet<'a> {
    pub fn eat(
        &self,
        entity: Option<&EntityId>,
        attribute: Option<&AttributePath>,
    ) -> Result<TripleIter<'a>, StorageError> {
        let iters = self
            .0
            .iter()
            .copied()
            .map(|s| s.scan_eat(entity, attribute))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(merge(iters, eat_order))
    }

    pub fn ave(
        &self,
        attribute: &AttributePath,
        value: Option<&Value>,
        entity: Option<&EntityId>,
        direction: ScanDirection,
    ) -> Result<TripleIter<'a>, StorageError> {
        let iters = self
            .0
            .iter()
            .copied()
            .map(|s| s.scan_ave(attribute, value, entity, direction))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(merge(iters, directed(direction, ave_order)))
    }

    pub fn range(
        &self,
        attribute: &AttributePath,
        range: &ValueRange,
    ) -> Result<TripleIter<'a>, StorageError> {
        let iters = self
            .0
            .iter()
            .copied()
            .map(|s| s.scan_value_range(attribute, range))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(merge(iters, directed(range.direction, ave_order)))
    }

    pub fn client_timestamp(
        &self,
        client: &ClientId,
        op: TimestampOp,
        tick: u64,
    ) -> Result<TripleIter<'a>, StorageError> {
        let iters = self
            .0
            .iter()
            .copied()
            .map(|s| s.scan_client_timestamp(client, op, tick))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(merge(iters, client_order))
    }

    pub fn client_ids(&self) -> Result<Vec<ClientId>, StorageError> {
        let mut ids = Vec::new();
        for shard in &self.0 {
            ids.extend(shard.client_ids()?);
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    pub fn metadata(
        &self,
        entity: &str,
        attribute: &AttributePath,
    ) -> Result<Option<Value>, StorageError> {
        for shard in &self.0 {
            if let Some(value) = shard.get_metadata(entity, attribute)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

pub(crate) fn directed(
    direction: ScanDirection,
    order: fn(&Triple, &Triple) -> Ordering,
) -> impl Fn(&Triple, &Triple) -> Ordering {
    move |a, b| match direction {
        ScanDirection::Asc => order(a, b),
        ScanDirection::Desc => order(b, a),
    }
}
