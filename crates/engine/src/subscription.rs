//! Live queries.
//!
//! Non-relational queries keep a window of materialized entities and patch
//! it from each commit; relational queries re-run on every commit that
//! touches one of their collections. Triple subscriptions stream the writes
//! a client is missing, starting from an optional state vector.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, warn};
use trinity_core::{Entity, EntityId, StateVector, Triple, Value};
use trinity_storage::{CommitSummary, TripleStore};

use crate::delta::fetch_delta_triples;
use crate::error::EngineError;
use crate::execution::{
    ExecutionContext, ExecutionOptions, QueryResults, build_results, compare_rows, entity_cursor,
    entity_matches, entity_order_keys, load_query, past_cursor,
};
use crate::query::{After, Operator, Query, QueryValue, WhereFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receives the full result set and the triples that changed it.
pub type ResultsCallback = Box<dyn FnMut(&QueryResults, &[Triple]) -> Result<(), EngineError>>;
pub type TriplesCallback = Box<dyn FnMut(&[Triple]) -> Result<(), EngineError>>;
pub type ErrorCallback = Box<dyn FnMut(&EngineError)>;

pub(crate) struct Subscription {
    query: Query,
    opts: ExecutionOptions,
    state: State,
    on_error: Option<ErrorCallback>,
}

enum State {
    Window {
        window: Window,
        on_results: ResultsCallback,
    },
    Requery {
        last: QueryResults,
        on_results: ResultsCallback,
    },
    Triples {
        seen: StateVector,
        on_triples: TriplesCallback,
    },
}

impl Subscription {
    /// Incrementally maintained results. `query` must not be relational.
    pub(crate) fn entities(
        query: Query,
        opts: ExecutionOptions,
        on_results: ResultsCallback,
        on_error: Option<ErrorCallback>,
    ) -> Result<Self, EngineError> {
        if query.is_relational() {
            return Err(EngineError::InvalidQuery(format!(
                "entity subscriptions on '{}' cannot follow relations",
                query.collection_name
            )));
        }
        Ok(Self {
            query,
            opts,
            state: State::Window {
                window: Window::default(),
                on_results,
            },
            on_error,
        })
    }

    /// Results recomputed from scratch whenever a relevant collection changes.
    pub(crate) fn requery(
        query: Query,
        opts: ExecutionOptions,
        on_results: ResultsCallback,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        Self {
            query,
            opts,
            state: State::Requery {
                last: QueryResults::default(),
                on_results,
            },
            on_error,
        }
    }

    /// Raw triples. With `opts.state_vector` set, the first delivery is the
    /// catch-up delta from that vector; otherwise it is every triple of the
    /// current members.
    pub(crate) fn triples(
        query: Query,
        opts: ExecutionOptions,
        on_triples: TriplesCallback,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        let seen = opts.state_vector.clone().unwrap_or_default();
        Self {
            query,
            opts: ExecutionOptions {
                state_vector: None,
                ..opts
            },
            state: State::Triples { seen, on_triples },
            on_error,
        }
    }

    pub(crate) fn query(&self) -> &Query {
        &self.query
    }

    /// Deliver the initial snapshot.
    pub(crate) fn start(&mut self, store: &TripleStore) {
        if let Err(e) = self.try_start(store) {
            self.report(e);
        }
    }

    fn try_start(&mut self, store: &TripleStore) -> Result<(), EngineError> {
        let query = &self.query;
        let opts = &self.opts;
        match &mut self.state {
            State::Window { window, on_results } => {
                let mut ctx = ExecutionContext::new(true);
                let ids = load_query(store, query, &mut ctx, opts)?;
                for id in &ids {
                    if let Some(entity) = ctx.shared(id) {
                        window.insert(entity);
                    }
                }
                window.sort(query);
                let triples = window.triples();
                on_results(&window.results(query, opts), &triples)
            }
            State::Requery { last, on_results } => {
                let mut ctx = ExecutionContext::new(true);
                let ids = load_query(store, query, &mut ctx, opts)?;
                *last = build_results(&ctx, query, &ids, opts.schema());
                let triples: Vec<Triple> = ids
                    .iter()
                    .filter_map(|id| ctx.shared(id))
                    .flat_map(|entity| entity.to_triples())
                    .collect();
                on_results(last, &triples)
            }
            State::Triples { seen, on_triples } => {
                let triples = fetch_delta_triples(store, query, seen, opts)?;
                *seen = store.state_vector()?;
                on_triples(&triples)
            }
        }
    }

    /// React to one committed transaction.
    pub(crate) fn on_commit(&mut self, store: &TripleStore, summary: &CommitSummary) {
        if let Err(e) = self.try_commit(store, summary) {
            self.report(e);
        }
    }

    fn try_commit(&mut self, store: &TripleStore, summary: &CommitSummary) -> Result<(), EngineError> {
        let query = &self.query;
        let opts = &self.opts;
        match &mut self.state {
            State::Window { window, on_results } => {
                if let Some(changes) = tick_window(store, query, opts, window, summary)? {
                    on_results(&window.results(query, opts), &changes)?;
                }
                Ok(())
            }
            State::Requery { last, on_results } => {
                let collections = query.collections();
                let changes: Vec<Triple> = summary
                    .inserted()
                    .chain(summary.deleted())
                    .filter(|t| collections.iter().any(|c| c == t.id.collection()))
                    .cloned()
                    .collect();
                if changes.is_empty() {
                    return Ok(());
                }
                let mut ctx = ExecutionContext::new(true);
                let ids = load_query(store, query, &mut ctx, opts)?;
                let results = build_results(&ctx, query, &ids, opts.schema());
                if results == *last {
                    return Ok(());
                }
                *last = results;
                on_results(last, &changes)
            }
            State::Triples { seen, on_triples } => {
                let triples = fetch_delta_triples(store, query, seen, opts)?;
                for triple in summary.inserted() {
                    seen.observe(&triple.timestamp);
                }
                if triples.is_empty() {
                    return Ok(());
                }
                on_triples(&triples)
            }
        }
    }

    fn report(&mut self, err: EngineError) {
        warn!(collection = %self.query.collection_name, error = %err, "subscription tick failed");
        if let Some(on_error) = self.on_error.as_mut() {
            on_error(&err);
        }
    }
}

// ============================================================================
// Window
// ============================================================================

/// Materialized result rows in emit order.
#[derive(Default)]
struct Window {
    entities: HashMap<EntityId, Arc<Entity>>,
    order: Vec<EntityId>,
}

impl Window {
    fn len(&self) -> usize {
        self.order.len()
    }

    fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    fn insert(&mut self, entity: Arc<Entity>) {
        let id = entity.id().clone();
        if self.entities.insert(id.clone(), entity).is_none() {
            self.order.push(id);
        }
    }

    fn remove(&mut self, id: &EntityId) {
        if self.entities.remove(id).is_some() {
            self.order.retain(|o| o != id);
        }
    }

    fn last(&self) -> Option<&Arc<Entity>> {
        self.order.last().and_then(|id| self.entities.get(id))
    }

    fn keys(&self, query: &Query, id: &EntityId) -> Vec<Option<Value>> {
        self.entities
            .get(id)
            .map(|e| entity_order_keys(query, e))
            .unwrap_or_default()
    }

    fn sort(&mut self, query: &Query) {
        let mut keyed: Vec<(EntityId, Vec<Option<Value>>)> = self
            .order
            .iter()
            .map(|id| (id.clone(), self.keys(query, id)))
            .collect();
        keyed.sort_by(|a, b| compare_rows(&query.order, (&a.0, a.1.as_slice()), (&b.0, b.1.as_slice())));
        self.order = keyed.into_iter().map(|(id, _)| id).collect();
    }

    fn truncate(&mut self, limit: usize) {
        for id in self.order.split_off(limit.min(self.order.len())) {
            self.entities.remove(&id);
        }
    }

    fn triples(&self) -> Vec<Triple> {
        self.order
            .iter()
            .filter_map(|id| self.entities.get(id))
            .flat_map(|e| e.to_triples())
            .collect()
    }

    fn results(&self, query: &Query, opts: &ExecutionOptions) -> QueryResults {
        let mut ctx = ExecutionContext::new(true);
        for entity in self.entities.values() {
            ctx.remember(entity.clone());
        }
        build_results(&ctx, query, &self.order, opts.schema())
    }
}

/// Where newcomers may land in a window.
enum Boundary {
    Open,
    /// Unordered and full: no room for anyone new.
    Closed,
    /// Ordered and full: rows sorting after the last one are outside.
    After(EntityId, Vec<Option<Value>>),
}

fn boundary(query: &Query, window: &Window) -> Boundary {
    let Some(limit) = query.limit else {
        return Boundary::Open;
    };
    if window.len() < limit {
        return Boundary::Open;
    }
    if query.order.is_empty() {
        return Boundary::Closed;
    }
    match window.last() {
        Some(last) => Boundary::After(last.id().clone(), entity_order_keys(query, last)),
        None => Boundary::Open,
    }
}

/// Apply one commit to the window. Returns the changed triples when the
/// visible results moved.
fn tick_window(
    store: &TripleStore,
    query: &Query,
    opts: &ExecutionOptions,
    window: &mut Window,
    summary: &CommitSummary,
) -> Result<Option<Vec<Triple>>, EngineError> {
    let collection = query.collection_name.as_str();
    let mut touched: BTreeMap<EntityId, Vec<&Triple>> = BTreeMap::new();
    let mut purged: BTreeSet<EntityId> = BTreeSet::new();
    for triple in summary.inserted().filter(|t| t.id.collection() == collection) {
        touched.entry(triple.id.clone()).or_default().push(triple);
    }
    for triple in summary.deleted().filter(|t| t.id.collection() == collection) {
        touched.entry(triple.id.clone()).or_default();
        purged.insert(triple.id.clone());
    }
    if touched.is_empty() {
        return Ok(None);
    }

    let edge = boundary(query, window);
    let mut ctx = ExecutionContext::new(true);
    let mut moved = false;
    let mut left = false;
    for (id, triples) in &touched {
        let current = match window.entities.get(id) {
            Some(live) if !purged.contains(id) => {
                let mut entity = Entity::clone(live);
                let mut dirty = false;
                for triple in triples {
                    dirty |= entity.apply_triple(triple);
                }
                if !dirty {
                    continue;
                }
                let entity = Arc::new(entity);
                ctx.remember(entity.clone());
                Some(entity)
            }
            _ => ctx.load(store, id, opts)?,
        };
        let was = window.contains(id);
        let member = match &current {
            Some(entity) => admits(store, query, opts, entity, was, &edge, &mut ctx)?,
            None => false,
        };
        match (was, member, current) {
            (true, false, _) => {
                window.remove(id);
                moved = true;
                left = true;
            }
            (_, true, Some(entity)) => {
                window.insert(entity);
                moved = true;
            }
            _ => {}
        }
    }
    if !moved {
        return Ok(None);
    }

    window.sort(query);
    if let Some(limit) = query.limit {
        window.truncate(limit);
        if left && window.len() < limit {
            backfill(store, query, opts, window, limit - window.len())?;
        }
    }

    let changes: Vec<Triple> = summary
        .inserted()
        .chain(summary.deleted())
        .filter(|t| t.id.collection() == collection)
        .cloned()
        .collect();
    debug!(collection, rows = window.len(), "subscription window updated");
    Ok(Some(changes))
}

fn admits(
    store: &TripleStore,
    query: &Query,
    opts: &ExecutionOptions,
    entity: &Arc<Entity>,
    was: bool,
    edge: &Boundary,
    ctx: &mut ExecutionContext,
) -> Result<bool, EngineError> {
    if !entity_matches(store, query, entity, ctx, opts)? {
        return Ok(false);
    }
    let keys = entity_order_keys(query, entity);
    if let Some(after) = &query.after
        && !past_cursor(&query.order, entity.id(), &keys, after)
    {
        return Ok(false);
    }
    Ok(match edge {
        Boundary::Open => true,
        Boundary::Closed => was,
        Boundary::After(last_id, last_keys) => {
            compare_rows(
                &query.order,
                (entity.id(), keys.as_slice()),
                (last_id, last_keys.as_slice()),
            ) != Ordering::Greater
        }
    })
}

/// Refill a window that lost rows: ordered windows continue after their last
/// survivor, unordered ones take any match not already shown.
fn backfill(
    store: &TripleStore,
    query: &Query,
    opts: &ExecutionOptions,
    window: &mut Window,
    shortfall: usize,
) -> Result<(), EngineError> {
    let mut fill = query.clone();
    fill.limit = Some(shortfall);
    if query.order.is_empty() {
        if !window.order.is_empty() {
            fill.filters.push(WhereFilter::statement(
                "id",
                Operator::Nin,
                QueryValue::list(window.order.iter().map(|id| id.local_id().to_string())),
            ));
        }
    } else if let Some(last) = window.last() {
        fill.after = Some(After {
            cursor: entity_cursor(query, last),
            inclusive: false,
        });
    }

    let mut ctx = ExecutionContext::new(true);
    let ids = load_query(store, &fill, &mut ctx, opts)?;
    let mut added = 0;
    for id in ids {
        if window.contains(&id) {
            continue;
        }
        if let Some(entity) = ctx.shared(&id) {
            window.insert(entity);
            added += 1;
        }
    }
    window.sort(query);
    debug!(collection = %query.collection_name, added, "window backfilled");
    Ok(())
}

// ============================================================================
// Registry
// ============================================================================

/// Live subscriptions of one database, fed from its commits.
#[derive(Default)]
pub(crate) struct Subscriptions {
    next_id: u64,
    active: BTreeMap<SubscriptionId, Subscription>,
}

pub(crate) type SharedSubscriptions = Rc<RefCell<Subscriptions>>;

impl Subscriptions {
    /// Empty registry fed by `store`'s write listener.
    pub(crate) fn attach(store: &mut TripleStore) -> SharedSubscriptions {
        let shared = SharedSubscriptions::default();
        let registry = shared.clone();
        store.on_write(move |store, summary| registry.borrow_mut().dispatch(store, summary));
        shared
    }

    pub(crate) fn add(&mut self, store: &TripleStore, mut subscription: Subscription) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        subscription.start(store);
        debug!(%id, collection = %subscription.query().collection_name, "subscribed");
        self.active.insert(id, subscription);
        id
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let removed = self.active.remove(&id).is_some();
        if removed {
            debug!(%id, "unsubscribed");
        }
        removed
    }

    fn dispatch(&mut self, store: &TripleStore, summary: &CommitSummary) {
        if summary.is_empty() {
            return;
        }
        for subscription in self.active.values_mut() {
            subscription.on_commit(store, summary);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }
}
