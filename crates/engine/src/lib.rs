pub mod cache;
pub mod config;
pub mod delta;
pub mod error;
pub mod execution;
pub mod permissions;
pub mod permutation;
pub mod prepare;
pub mod query;
pub mod subscription;

pub use cache::{CacheStats, VariableAwareCache};
pub use config::{DbConfig, ShardConfig, StorageConfig};
pub use delta::fetch_delta_triples;
pub use error::EngineError;
pub use execution::{
    ExecutionContext, ExecutionOptions, QueryResults, Related, SharedSchema, entity_cursor,
    execute_query, load_query,
};
pub use permissions::{PermissionHook, WriteOperation, denied};
pub use permutation::generate_query_root_permutations;
pub use prepare::prepare_query;
pub use query::{
    After, Cursor, FilterStatement, GroupOp, Include, Operator, OrderBy, OrderDirection, Query,
    QueryValue, RelationSubquery, WhereFilter,
};
pub use subscription::{ErrorCallback, ResultsCallback, SubscriptionId, TriplesCallback};

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, instrument};
use trinity_core::triple::{COLLECTION_ATTRIBUTE, ID_ATTRIBUTE};
use trinity_core::{
    AttributePath, ChangeSet, ClientId, Document, Entity, EntityId, SchemaResolver, StateVector,
    Triple, Value,
};
use trinity_storage::{
    CommitSummary, MemoryStorage, SqliteStorage, StoreTransaction, TripleReader, TripleStorage,
    TripleStore,
};

use crate::permissions::{PermissionCommitHook, SchemaValidationHook};
use crate::subscription::{SharedSubscriptions, Subscription, Subscriptions};

/// Per-call read options.
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Bypass permission read filters.
    pub skip_rules: bool,
    pub skip_index: bool,
    /// Read entities as they stood at this vector. For subscriptions only
    /// `subscribe_triples` honours it, as its catch-up point.
    pub state_vector: Option<StateVector>,
    pub session: BTreeMap<String, Value>,
    /// Resolve this call against `schema` instead of the database's.
    pub schema: Option<SharedSchema>,
}

impl FetchOptions {
    pub fn session(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.session.insert(name.to_string(), value.into());
        self
    }

    pub fn at(mut self, state_vector: StateVector) -> Self {
        self.state_vector = Some(state_vector);
        self
    }

    pub fn skip_rules(mut self) -> Self {
        self.skip_rules = true;
        self
    }

    pub fn with_schema(mut self, schema: impl SchemaResolver + Send + Sync + 'static) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }
}

impl std::fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOptions")
            .field("skip_rules", &self.skip_rules)
            .field("skip_index", &self.skip_index)
            .field("state_vector", &self.state_vector)
            .field("session", &self.session)
            .field("schema", &self.schema.is_some())
            .finish()
    }
}

/// A reactive document database over a triple store.
pub struct Database {
    store: TripleStore,
    config: DbConfig,
    schema: Option<SharedSchema>,
    permissions: Option<Arc<dyn PermissionHook>>,
    skip_rules: Arc<AtomicBool>,
    cache: Rc<RefCell<VariableAwareCache>>,
    subscriptions: SharedSubscriptions,
}

impl Database {
    pub fn open(config: DbConfig) -> Result<Self, EngineError> {
        let mut shards: Vec<(String, Box<dyn TripleStorage>)> = Vec::new();
        for shard in config.shard_layout() {
            let storage: Box<dyn TripleStorage> = match &shard.storage {
                StorageConfig::Memory => Box::new(MemoryStorage::new()),
                StorageConfig::Sqlite { path } => Box::new(SqliteStorage::open(&path.to_string_lossy())?),
            };
            shards.push((shard.name, storage));
        }
        let mut store = TripleStore::with_shards(shards)?;
        let clock = store.assign_clock(config.client_id.as_deref().map(ClientId::new))?;
        info!(client = %clock.client_id()?, shards = store.shard_names().count(), "database opened");

        let cache = Rc::new(RefCell::new(VariableAwareCache::new()));
        store.on_write(evict_touched(cache.clone()));
        let subscriptions = Subscriptions::attach(&mut store);

        Ok(Self {
            store,
            config,
            schema: None,
            permissions: None,
            skip_rules: Arc::new(AtomicBool::new(false)),
            cache,
            subscriptions,
        })
    }

    /// In-memory database with default settings.
    pub fn memory() -> Result<Self, EngineError> {
        Self::open(DbConfig::memory())
    }

    /// Validate every inserted triple against `schema` and resolve relations
    /// in queries through it.
    pub fn with_schema(mut self, schema: impl SchemaResolver + Send + Sync + 'static) -> Self {
        let schema: SharedSchema = Arc::new(schema);
        self.store.add_before_insert(Box::new(SchemaValidationHook {
            schema: schema.clone(),
        }));
        self.schema = Some(schema);
        self
    }

    pub fn with_permissions(mut self, hook: impl PermissionHook + 'static) -> Self {
        let hook: Arc<dyn PermissionHook> = Arc::new(hook);
        self.store.add_before_commit(Box::new(PermissionCommitHook {
            hook: hook.clone(),
            skip: self.skip_rules.clone(),
        }));
        self.permissions = Some(hook);
        self
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn schema(&self) -> Option<&dyn SchemaResolver> {
        self.schema.as_deref().map(|s| s as &dyn SchemaResolver)
    }

    pub fn store(&self) -> &TripleStore {
        &self.store
    }

    pub fn client_id(&self) -> Result<ClientId, EngineError> {
        match self.store.clock() {
            Some(clock) => Ok(clock.client_id()?),
            None => Err(EngineError::Config("database has no clock".into())),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.borrow().stats()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Resolve `query` against the schema, with permission read filters merged in.
    pub fn prepare(&self, query: &Query, opts: &FetchOptions) -> Result<Query, EngineError> {
        let mut query = query.clone();
        if !opts.skip_rules
            && let Some(hook) = &self.permissions
        {
            query
                .filters
                .extend(hook.read_filters(&query.collection_name, &opts.session));
        }
        let schema = opts.schema.as_ref().or(self.schema.as_ref());
        prepare_query(&query, schema.map(|s| &**s as &dyn SchemaResolver))
    }

    fn execution_options(&self, opts: &FetchOptions) -> ExecutionOptions {
        ExecutionOptions {
            skip_index: opts.skip_index || self.config.default_skip_index,
            state_vector: opts.state_vector.clone(),
            tie_policy: self.config.state_vector_tie,
            session: opts.session.clone(),
            schema: opts.schema.clone().or_else(|| self.schema.clone()),
        }
    }

    #[instrument(skip_all, fields(collection = %query.collection_name))]
    pub fn fetch(&mut self, query: &Query, opts: FetchOptions) -> Result<QueryResults, EngineError> {
        let prepared = self.prepare(query, &opts)?;
        let exec = self.execution_options(&opts);
        let mut ctx = ExecutionContext::new(self.config.entity_cache);

        let cacheable = self.config.query_cache
            && exec.state_vector.is_none()
            && VariableAwareCache::can_cache(&prepared);
        if !cacheable {
            return execute_query(&self.store, &prepared, &mut ctx, &exec);
        }

        let key = VariableAwareCache::key(&prepared, &exec.session)?;
        let cached = self.cache.borrow_mut().get(&key).map(<[EntityId]>::to_vec);
        let ids = match cached {
            Some(ids) => {
                for id in &ids {
                    ctx.load(&self.store, id, &exec)?;
                }
                ids
            }
            None => {
                let ids = load_query(&self.store, &prepared, &mut ctx, &exec)?;
                self.cache
                    .borrow_mut()
                    .insert(key, &prepared.collection_name, ids.clone());
                ids
            }
        };
        Ok(execution::build_results(&ctx, &prepared, &ids, exec.schema()))
    }

    pub fn fetch_one(
        &mut self,
        query: &Query,
        opts: FetchOptions,
    ) -> Result<Option<(EntityId, Document)>, EngineError> {
        let query = query.clone().limit(1);
        Ok(self.fetch(&query, opts)?.into_first())
    }

    pub fn fetch_by_id(&mut self, collection: &str, id: &str) -> Result<Option<Document>, EngineError> {
        let query = Query::new(collection).id(id);
        Ok(self
            .fetch_one(&query, FetchOptions::default())?
            .map(|(_, doc)| doc))
    }

    /// Cursor positioned at `id` for paging `query` past it.
    pub fn cursor_for(&self, query: &Query, id: &EntityId) -> Result<Option<Cursor>, EngineError> {
        let triples: Vec<Triple> = self.store.find_by_entity(id)?.collect();
        if triples.is_empty() {
            return Ok(None);
        }
        let entity = Entity::from_triples(id.clone(), &triples);
        Ok(Some(entity_cursor(query, &entity)))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Run `f` in one transaction. `Ok(None)` means the body cancelled it.
    pub fn transact<T, F>(&mut self, f: F) -> Result<Option<T>, EngineError>
    where
        F: FnOnce(&mut StoreTransaction<'_>) -> Result<T, EngineError>,
    {
        Ok(self.store.transact(None, f)?.map(|(value, _)| value))
    }

    /// Insert a document. Its `id` field is used when present, otherwise one
    /// is generated.
    #[instrument(skip(self, document))]
    pub fn insert(&mut self, collection: &str, document: Document) -> Result<EntityId, EngineError> {
        let Some(fields) = document.as_object() else {
            return Err(EngineError::Validation {
                collection: collection.to_string(),
                path: String::new(),
                message: "document must be an object".into(),
            });
        };
        let id = match fields.get(ID_ATTRIBUTE) {
            Some(Document::Value(Value::String(local))) => EntityId::new(collection, local),
            Some(_) => {
                return Err(EngineError::Validation {
                    collection: collection.to_string(),
                    path: ID_ATTRIBUTE.to_string(),
                    message: "id must be a string".into(),
                });
            }
            None => EntityId::generate(collection),
        };

        let mut leaves = Vec::new();
        document.flatten(&AttributePath::root(), &mut leaves);
        let mut changes = ChangeSet::new();
        changes.set(COLLECTION_ATTRIBUTE, collection);
        changes.set(ID_ATTRIBUTE, id.local_id());
        for (path, value) in leaves {
            if path.head_key() != Some(ID_ATTRIBUTE) {
                changes.set(path, value);
            }
        }

        let writes = changes.into_writes();
        self.transact(|tx| {
            tx.write(&id, writes);
            Ok(())
        })?;
        debug!(%id, "inserted");
        Ok(id)
    }

    /// Apply the changes `f` records to an existing entity.
    #[instrument(skip(self, f))]
    pub fn update<F>(&mut self, collection: &str, id: &str, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut ChangeSet),
    {
        let id = EntityId::new(collection, id);
        self.transact(|tx| {
            require_live(tx, &id)?;
            let mut changes = ChangeSet::new();
            f(&mut changes);
            if changes.is_empty() {
                tx.cancel();
                return Ok(());
            }
            tx.write(&id, changes.into_writes());
            Ok(())
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn delete(&mut self, collection: &str, id: &str) -> Result<(), EngineError> {
        let id = EntityId::new(collection, id);
        self.transact(|tx| {
            require_live(tx, &id)?;
            tx.expire_entity(&id)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Merge triples written elsewhere. Schema validation still applies;
    /// permission rules do not.
    #[instrument(skip_all, fields(count = triples.len()))]
    pub fn apply_remote(&mut self, triples: Vec<Triple>) -> Result<(), EngineError> {
        if triples.is_empty() {
            return Ok(());
        }
        self.skip_rules.store(true, Ordering::SeqCst);
        let committed = self.store.insert_triples(triples);
        self.skip_rules.store(false, Ordering::SeqCst);
        committed?;
        Ok(())
    }

    /// Drop every triple and restart the clock under a new client id.
    pub fn clear(&mut self) -> Result<(), EngineError> {
        self.store.clear()?;
        self.cache.borrow_mut().clear();
        info!("database cleared");
        Ok(())
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Live results of `query`. Non-relational queries are maintained
    /// incrementally; relational ones re-run on every relevant commit.
    /// The first delivery happens before this returns.
    pub fn subscribe<R, E>(
        &mut self,
        query: &Query,
        opts: FetchOptions,
        on_results: R,
        on_error: E,
    ) -> Result<SubscriptionId, EngineError>
    where
        R: FnMut(&QueryResults, &[Triple]) -> Result<(), EngineError> + 'static,
        E: FnMut(&EngineError) + 'static,
    {
        let prepared = self.prepare(query, &opts)?;
        let exec = self.live_options(&opts);
        let subscription = if prepared.is_relational() {
            Subscription::requery(prepared, exec, Box::new(on_results), Some(Box::new(on_error)))
        } else {
            Subscription::entities(prepared, exec, Box::new(on_results), Some(Box::new(on_error)))?
        };
        Ok(self.subscriptions.borrow_mut().add(&self.store, subscription))
    }

    /// Like [`Database::subscribe`], but refuses relational queries.
    pub fn subscribe_entities<R, E>(
        &mut self,
        query: &Query,
        opts: FetchOptions,
        on_results: R,
        on_error: E,
    ) -> Result<SubscriptionId, EngineError>
    where
        R: FnMut(&QueryResults, &[Triple]) -> Result<(), EngineError> + 'static,
        E: FnMut(&EngineError) + 'static,
    {
        let prepared = self.prepare(query, &opts)?;
        let exec = self.live_options(&opts);
        let subscription =
            Subscription::entities(prepared, exec, Box::new(on_results), Some(Box::new(on_error)))?;
        Ok(self.subscriptions.borrow_mut().add(&self.store, subscription))
    }

    /// Stream the triples a client needs to follow `query`, starting from
    /// `opts.state_vector` when given.
    pub fn subscribe_triples<T, E>(
        &mut self,
        query: &Query,
        opts: FetchOptions,
        on_triples: T,
        on_error: E,
    ) -> Result<SubscriptionId, EngineError>
    where
        T: FnMut(&[Triple]) -> Result<(), EngineError> + 'static,
        E: FnMut(&EngineError) + 'static,
    {
        let prepared = self.prepare(query, &opts)?;
        let exec = self.execution_options(&opts);
        let subscription =
            Subscription::triples(prepared, exec, Box::new(on_triples), Some(Box::new(on_error)));
        Ok(self.subscriptions.borrow_mut().add(&self.store, subscription))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.borrow_mut().remove(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.borrow().len()
    }

    fn live_options(&self, opts: &FetchOptions) -> ExecutionOptions {
        ExecutionOptions {
            state_vector: None,
            ..self.execution_options(opts)
        }
    }

    // ========================================================================
    // Sync
    // ========================================================================

    pub fn state_vector(&self) -> Result<StateVector, EngineError> {
        Ok(self.store.state_vector()?)
    }

    pub fn triples_since(&self, since: &StateVector) -> Result<Vec<Triple>, EngineError> {
        Ok(self.store.triples_since(since)?)
    }

    /// Triples a client at `state_vector` is missing for `query`.
    pub fn delta_triples(
        &self,
        query: &Query,
        state_vector: &StateVector,
        opts: FetchOptions,
    ) -> Result<Vec<Triple>, EngineError> {
        let prepared = self.prepare(query, &opts)?;
        let exec = self.execution_options(&opts);
        fetch_delta_triples(&self.store, &prepared, state_vector, &exec)
    }
}

/// Write listener dropping cached results of every collection a commit touched.
fn evict_touched(
    cache: Rc<RefCell<VariableAwareCache>>,
) -> impl FnMut(&TripleStore, &CommitSummary) + 'static {
    move |_, summary| {
        let touched: BTreeSet<&str> = summary
            .inserted()
            .chain(summary.deleted())
            .map(|t| t.id.collection())
            .collect();
        let mut cache = cache.borrow_mut();
        for collection in touched {
            cache.invalidate(collection);
        }
    }
}

fn require_live(tx: &StoreTransaction<'_>, id: &EntityId) -> Result<(), EngineError> {
    let triples: Vec<Triple> = tx.find_by_entity(id)?.collect();
    if triples.is_empty() || Entity::from_triples(id.clone(), &triples).is_deleted() {
        return Err(EngineError::EntityNotFound(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use trinity_core::{DataType, Schema};

    fn todos() -> Schema {
        Schema::new().collection(
            "todos",
            [
                ("id", DataType::String),
                ("title", DataType::String),
                ("done", DataType::Boolean),
                ("tags", DataType::set_of(DataType::String)),
            ],
        )
    }

    fn todo(id: &str, title: &str, done: bool) -> Document {
        Document::from_pairs([
            ("id", Document::from(Value::from(id))),
            ("title", Document::from(Value::from(title))),
            ("done", Document::from(Value::from(done))),
        ])
    }

    #[test]
    fn insert_then_fetch_by_id() {
        let mut db = Database::memory().unwrap().with_schema(todos());
        let id = db.insert("todos", todo("1", "write tests", false)).unwrap();
        assert_eq!(id, EntityId::new("todos", "1"));

        let doc = db.fetch_by_id("todos", "1").unwrap().unwrap();
        assert_eq!(doc.get_value(&AttributePath::parse("title")), Some(&Value::from("write tests")));
        assert_eq!(doc.get_value(&AttributePath::parse("id")), Some(&Value::from("1")));
    }

    #[test]
    fn generated_ids_are_unique() {
        let mut db = Database::memory().unwrap();
        let doc = Document::from_pairs([("title", Document::from(Value::from("x")))]);
        let a = db.insert("todos", doc.clone()).unwrap();
        let b = db.insert("todos", doc).unwrap();
        assert_ne!(a, b);
        let all = db.fetch(&Query::new("todos"), FetchOptions::default()).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn schema_violation_rolls_back() {
        let mut db = Database::memory().unwrap().with_schema(todos());
        let bad = Document::from_pairs([
            ("id", Document::from(Value::from("1"))),
            ("done", Document::from(Value::from("maybe"))),
        ]);
        let err = db.insert("todos", bad).unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert_eq!(err.status(), 400);
        assert!(db.fetch_by_id("todos", "1").unwrap().is_none());
    }

    #[test]
    fn update_and_delete() {
        let mut db = Database::memory().unwrap().with_schema(todos());
        db.insert("todos", todo("1", "a", false)).unwrap();
        db.update("todos", "1", |c| {
            c.set("done", true);
            c.add("tags", "home");
        })
        .unwrap();
        let doc = db.fetch_by_id("todos", "1").unwrap().unwrap();
        assert_eq!(doc.get_value(&AttributePath::parse("done")), Some(&Value::from(true)));
        let tags = doc.get(&AttributePath::parse("tags")).and_then(Document::as_set).unwrap();
        assert!(tags.contains(&Value::from("home")));

        db.delete("todos", "1").unwrap();
        assert!(db.fetch_by_id("todos", "1").unwrap().is_none());
        assert!(matches!(
            db.update("todos", "1", |c| {
                c.set("done", false);
            }),
            Err(EngineError::EntityNotFound(_))
        ));
        assert!(matches!(db.delete("todos", "1"), Err(EngineError::EntityNotFound(_))));
    }

    #[test]
    fn cancelled_transaction_writes_nothing() {
        let mut db = Database::memory().unwrap();
        let out = db
            .transact(|tx| {
                let mut changes = ChangeSet::new();
                changes.set(COLLECTION_ATTRIBUTE, "todos");
                tx.write(&EntityId::new("todos", "1"), changes.into_writes());
                tx.cancel();
                Ok(7)
            })
            .unwrap();
        assert_eq!(out, None);
        assert!(db.state_vector().unwrap().is_empty());
    }

    #[test]
    fn cache_serves_repeat_reads_and_is_evicted_by_writes() {
        let mut db = Database::memory().unwrap();
        db.insert("todos", todo("1", "a", false)).unwrap();
        let open = Query::new("todos").filter("done", Operator::Eq, false);

        assert_eq!(db.fetch(&open, FetchOptions::default()).unwrap().len(), 1);
        assert_eq!(db.fetch(&open, FetchOptions::default()).unwrap().len(), 1);
        assert_eq!(db.cache_stats().hits, 1);

        db.insert("todos", todo("2", "b", false)).unwrap();
        assert_eq!(db.cache_stats().entries, 0);
        assert_eq!(db.fetch(&open, FetchOptions::default()).unwrap().len(), 2);
    }

    #[test]
    fn raw_transactions_reach_cache_and_subscribers_once() {
        let mut db = Database::memory().unwrap();
        db.insert("todos", todo("1", "a", false)).unwrap();
        let all = Query::new("todos");
        assert_eq!(db.fetch(&all, FetchOptions::default()).unwrap().len(), 1);

        let emitted = Rc::new(RefCell::new(0));
        let counter = emitted.clone();
        db.subscribe(
            &all,
            FetchOptions::default(),
            move |_: &QueryResults, _: &[Triple]| {
                *counter.borrow_mut() += 1;
                Ok(())
            },
            |_: &EngineError| {},
        )
        .unwrap();
        assert_eq!(*emitted.borrow(), 1);

        let id = EntityId::new("todos", "2");
        let mut changes = ChangeSet::new();
        changes.set(COLLECTION_ATTRIBUTE, "todos");
        changes.set(ID_ATTRIBUTE, "2");
        let writes = changes.into_writes();
        db.transact(|tx| {
            tx.write(&id, writes);
            Ok(())
        })
        .unwrap();
        assert_eq!(*emitted.borrow(), 2);
        assert_eq!(db.cache_stats().entries, 0);
        assert_eq!(db.fetch(&all, FetchOptions::default()).unwrap().len(), 2);
    }

    #[test]
    fn session_variables_reach_filters() {
        let mut db = Database::memory().unwrap();
        db.insert("todos", todo("1", "a", false)).unwrap();
        db.insert("todos", todo("2", "b", true)).unwrap();
        let q = Query::new("todos").filter("title", Operator::Eq, QueryValue::var("$wanted"));

        let got = db.fetch(&q, FetchOptions::default().session("wanted", "b")).unwrap();
        assert_eq!(got.local_ids(), vec!["2"]);
        let missing = db.fetch(&q, FetchOptions::default()).unwrap_err();
        assert!(matches!(missing, EngineError::SessionVariableNotFound(_)));
    }

    struct OwnerOnly;

    impl PermissionHook for OwnerOnly {
        fn check_write(
            &self,
            _tx: &dyn TripleReader,
            collection: &str,
            entity: &Entity,
            operation: WriteOperation,
        ) -> Result<(), EngineError> {
            match entity.get(&AttributePath::parse("owner")) {
                Some(Value::String(owner)) if owner == "me" => Ok(()),
                _ => Err(denied(collection, entity.id(), operation)),
            }
        }

        fn read_filters(&self, _collection: &str, _session: &BTreeMap<String, Value>) -> Vec<WhereFilter> {
            vec![WhereFilter::statement("owner", Operator::Eq, "me")]
        }
    }

    fn owned(id: &str, owner: &str) -> Document {
        Document::from_pairs([
            ("id", Document::from(Value::from(id))),
            ("owner", Document::from(Value::from(owner))),
        ])
    }

    #[test]
    fn permission_hook_guards_writes_and_filters_reads() {
        let mut db = Database::memory().unwrap().with_permissions(OwnerOnly);
        db.insert("notes", owned("1", "me")).unwrap();
        let err = db.insert("notes", owned("2", "you")).unwrap_err();
        assert!(matches!(err, EngineError::WritePermission { .. }));
        assert_eq!(err.status(), 403);

        let err = db
            .update("notes", "1", |c| {
                c.set("owner", "you");
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::WritePermission { .. }));

        let id = EntityId::new("notes", "3");
        let ts = trinity_core::Timestamp::new(50, ClientId::from("remote"));
        db.apply_remote(vec![
            Triple::new(id.clone(), Triple::collection_path(), Value::from("notes"), ts.clone()),
            Triple::new(id.clone(), AttributePath::parse("id"), Value::from("3"), ts.clone()),
            Triple::new(id, AttributePath::parse("owner"), Value::from("you"), ts),
        ])
        .unwrap();

        let visible = db.fetch(&Query::new("notes"), FetchOptions::default()).unwrap();
        assert_eq!(visible.local_ids(), vec!["1"]);
        let everything = db
            .fetch(&Query::new("notes"), FetchOptions::default().skip_rules())
            .unwrap();
        assert_eq!(everything.local_ids(), vec!["1", "3"]);
    }

    #[test]
    fn subscription_sees_inserts_and_unsubscribe_stops_it() {
        let mut db = Database::memory().unwrap();
        let seen: Rc<RefCell<Vec<usize>>> = Rc::default();
        let sink = seen.clone();
        let sub = db
            .subscribe(
                &Query::new("todos").filter("done", Operator::Eq, false),
                FetchOptions::default(),
                move |results, _| {
                    sink.borrow_mut().push(results.len());
                    Ok(())
                },
                |_| {},
            )
            .unwrap();
        db.insert("todos", todo("1", "a", false)).unwrap();
        db.insert("todos", todo("2", "b", true)).unwrap();
        db.update("todos", "1", |c| {
            c.set("done", true);
        })
        .unwrap();
        assert_eq!(*seen.borrow(), vec![0, 1, 0]);

        assert!(db.unsubscribe(sub));
        db.insert("todos", todo("3", "c", false)).unwrap();
        assert_eq!(seen.borrow().len(), 3);
        assert_eq!(db.subscription_count(), 0);
    }
}
