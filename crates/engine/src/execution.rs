//! Query execution: candidate selection over the indexes, then the
//! load → filter → order → cursor → limit → include pipeline.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::trace;
use trinity_core::entity::entities_at_state_vector;
use trinity_core::triple::{COLLECTION_ATTRIBUTE, ID_ATTRIBUTE};
use trinity_core::{
    AttributePath, Cardinality, DataType, Document, Entity, EntityId, SchemaResolver, StateVector,
    TiePolicy, Triple, Value,
};
use trinity_storage::{ScanDirection, TripleReader, ValueRange};

use crate::error::EngineError;
use crate::query::{
    After, Cursor, FilterStatement, GroupOp, Include, Operator, OrderBy, OrderDirection, Query,
    QueryValue, RelationSubquery, WhereFilter, bump_scope, scoped_variable,
};

pub type SharedSchema = Arc<dyn SchemaResolver + Send + Sync>;

/// Per-call execution switches.
#[derive(Clone, Default)]
pub struct ExecutionOptions {
    /// Ignore value indexes; candidates come from a collection scan.
    pub skip_index: bool,
    /// Evaluate against entities as they stood at this state vector.
    pub state_vector: Option<StateVector>,
    pub tie_policy: TiePolicy,
    pub session: BTreeMap<String, Value>,
    pub schema: Option<SharedSchema>,
}

impl ExecutionOptions {
    pub fn schema(&self) -> Option<&dyn SchemaResolver> {
        self.schema.as_deref().map(|s| s as &dyn SchemaResolver)
    }

    fn use_index(&self) -> bool {
        !self.skip_index && self.state_vector.is_none()
    }
}

impl fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("skip_index", &self.skip_index)
            .field("state_vector", &self.state_vector)
            .field("tie_policy", &self.tie_policy)
            .field("session", &self.session)
            .field("schema", &self.schema.is_some())
            .finish()
    }
}

/// Rows a relation produced for one parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Related {
    One(Option<EntityId>),
    Many(Vec<EntityId>),
}

/// State shared by one top-level query and all of its subqueries.
#[derive(Debug)]
pub struct ExecutionContext {
    cache_entities: bool,
    entities: HashMap<EntityId, Arc<Entity>>,
    /// `(include path, parent) -> alias -> related rows`
    components: HashMap<(Vec<String>, EntityId), BTreeMap<String, Related>>,
    /// Parent rows of the subqueries currently executing, innermost last.
    stack: Vec<Arc<Entity>>,
    prefix: Vec<String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ExecutionContext {
    pub fn new(cache_entities: bool) -> Self {
        Self {
            cache_entities,
            entities: HashMap::new(),
            components: HashMap::new(),
            stack: Vec::new(),
            prefix: Vec::new(),
        }
    }

    pub fn entity(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id).map(Arc::as_ref)
    }

    pub(crate) fn shared(&self, id: &EntityId) -> Option<Arc<Entity>> {
        self.entities.get(id).cloned()
    }

    pub fn related(&self, path: &[String], parent: &EntityId, alias: &str) -> Option<&Related> {
        self.components
            .get(&(path.to_vec(), parent.clone()))
            .and_then(|c| c.get(alias))
    }

    pub(crate) fn load<R: TripleReader + ?Sized>(
        &mut self,
        reader: &R,
        id: &EntityId,
        opts: &ExecutionOptions,
    ) -> Result<Option<Arc<Entity>>, EngineError> {
        if self.cache_entities
            && let Some(entity) = self.entities.get(id)
        {
            return Ok(Some(entity.clone()));
        }
        let triples: Vec<Triple> = reader.find_by_entity(id)?.collect();
        if triples.is_empty() {
            return Ok(None);
        }
        let entity = match &opts.state_vector {
            Some(sv) => {
                match entities_at_state_vector(&triples, sv, opts.tie_policy).remove(id) {
                    Some(entity) => entity,
                    None => return Ok(None),
                }
            }
            None => Entity::from_triples(id.clone(), &triples),
        };
        let entity = Arc::new(entity);
        self.entities.insert(id.clone(), entity.clone());
        Ok(Some(entity))
    }

    /// Make an entity known to the context without reading the store.
    pub(crate) fn remember(&mut self, entity: Arc<Entity>) {
        self.entities.insert(entity.id().clone(), entity);
    }
}

// ============================================================================
// Results
// ============================================================================

/// Ordered query output: entity id → document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResults {
    entries: Vec<(EntityId, Document)>,
}

impl QueryResults {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &EntityId> {
        self.entries.iter().map(|(id, _)| id)
    }

    /// Local ids in result order.
    pub fn local_ids(&self) -> Vec<String> {
        self.ids().map(|id| id.local_id().to_string()).collect()
    }

    pub fn get(&self, id: &EntityId) -> Option<&Document> {
        self.entries.iter().find(|(e, _)| e == id).map(|(_, d)| d)
    }

    pub fn first(&self) -> Option<(&EntityId, &Document)> {
        self.entries.first().map(|(id, d)| (id, d))
    }

    pub fn last(&self) -> Option<(&EntityId, &Document)> {
        self.entries.last().map(|(id, d)| (id, d))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &Document)> {
        self.entries.iter().map(|(id, d)| (id, d))
    }

    pub fn into_first(self) -> Option<(EntityId, Document)> {
        self.entries.into_iter().next()
    }
}

impl IntoIterator for QueryResults {
    type Item = (EntityId, Document);
    type IntoIter = std::vec::IntoIter<(EntityId, Document)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Render loaded ids as documents, nesting included relations.
pub fn build_results(
    ctx: &ExecutionContext,
    query: &Query,
    ids: &[EntityId],
    schema: Option<&dyn SchemaResolver>,
) -> QueryResults {
    let entries = ids
        .iter()
        .filter_map(|id| document_for(ctx, query, &[], id, schema).map(|doc| (id.clone(), doc)))
        .collect();
    QueryResults { entries }
}

fn document_for(
    ctx: &ExecutionContext,
    query: &Query,
    prefix: &[String],
    id: &EntityId,
    schema: Option<&dyn SchemaResolver>,
) -> Option<Document> {
    let entity = ctx.entity(id)?;
    let mut doc = entity.to_document(schema);
    if let Some(keys) = &query.select {
        doc = doc.project(keys);
    }
    for (alias, include) in &query.include {
        let Include::Subquery(rs) = include else {
            continue;
        };
        let mut path = prefix.to_vec();
        path.push(alias.clone());
        let value = match ctx.related(prefix, id, alias) {
            Some(Related::One(Some(child))) => document_for(ctx, &rs.subquery, &path, child, schema)
                .unwrap_or(Document::Value(Value::Null)),
            Some(Related::Many(children)) => Document::Array(
                children
                    .iter()
                    .filter_map(|c| document_for(ctx, &rs.subquery, &path, c, schema))
                    .collect(),
            ),
            _ => match rs.cardinality {
                Cardinality::One => Document::Value(Value::Null),
                Cardinality::Many => Document::Array(Vec::new()),
            },
        };
        doc.set_at(&AttributePath::parse(alias), value);
    }
    Some(doc)
}

/// Run `query` and render its documents.
pub fn execute_query<R: TripleReader + ?Sized>(
    reader: &R,
    query: &Query,
    ctx: &mut ExecutionContext,
    opts: &ExecutionOptions,
) -> Result<QueryResults, EngineError> {
    let ids = load_query(reader, query, ctx, opts)?;
    Ok(build_results(ctx, query, &ids, opts.schema()))
}

/// Page cursor positioned at `entity` for the order of `query`.
pub fn entity_cursor(query: &Query, entity: &Entity) -> Cursor {
    Cursor {
        values: query
            .order
            .iter()
            .map(|o| entity.get(&o.path).cloned())
            .collect(),
        id: entity.id().clone(),
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Execute `query` and return matching ids in result order.
pub fn load_query<R: TripleReader + ?Sized>(
    reader: &R,
    query: &Query,
    ctx: &mut ExecutionContext,
    opts: &ExecutionOptions,
) -> Result<Vec<EntityId>, EngineError> {
    if let Some(alias) = query
        .include
        .iter()
        .find(|(_, i)| matches!(i, Include::Relation(_)))
        .map(|(alias, _)| alias)
    {
        return Err(EngineError::QueryNotPrepared(format!(
            "include '{alias}' on '{}' was never resolved",
            query.collection_name
        )));
    }

    let vars = merged_vars(query, opts);
    let (candidates, fulfilled) = candidate_ids(reader, query, &vars, ctx, opts)?;

    let mut filters: Vec<&WhereFilter> = query
        .filters
        .iter()
        .enumerate()
        .filter(|(i, _)| !fulfilled.filters.contains(i))
        .map(|(_, f)| f)
        .collect();
    filters.sort_by_key(|f| f.cost());

    // Candidates already arrive in output order: stop as soon as the limit is met.
    let streaming = query.order.is_empty() || fulfilled.order;
    let mut rows: Vec<(EntityId, Vec<Option<Value>>)> = Vec::new();
    for id in candidates {
        if streaming && query.limit.is_some_and(|limit| rows.len() >= limit) {
            break;
        }
        let Some(entity) = ctx.load(reader, &id, opts)? else {
            continue;
        };
        if entity.collection_name() != query.collection_name {
            continue;
        }
        if !matches_filters(reader, &filters, &entity, &vars, ctx, opts)? {
            continue;
        }
        if entity.is_deleted() {
            continue;
        }
        let keys = order_keys(reader, query, &entity, &vars, ctx, opts)?;
        if streaming
            && let Some(after) = &query.after
            && !past_cursor(&query.order, &id, &keys, after)
        {
            continue;
        }
        rows.push((id, keys));
    }

    if !streaming {
        rows.sort_by(|a, b| compare_rows(&query.order, (&a.0, a.1.as_slice()), (&b.0, b.1.as_slice())));
        if let Some(after) = &query.after {
            rows.retain(|(id, keys)| past_cursor(&query.order, id, keys, after));
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
    }

    let ids: Vec<EntityId> = rows.into_iter().map(|(id, _)| id).collect();
    load_includes(reader, query, &ids, &vars, ctx, opts)?;
    trace!(collection = %query.collection_name, rows = ids.len(), "query loaded");
    Ok(ids)
}

fn merged_vars(query: &Query, opts: &ExecutionOptions) -> BTreeMap<String, Value> {
    let mut vars = opts.session.clone();
    vars.extend(query.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars
}

/// Does `entity` satisfy every filter of a non-relational `query`?
pub(crate) fn entity_matches<R: TripleReader + ?Sized>(
    reader: &R,
    query: &Query,
    entity: &Arc<Entity>,
    ctx: &mut ExecutionContext,
    opts: &ExecutionOptions,
) -> Result<bool, EngineError> {
    if entity.is_deleted() || entity.collection_name() != query.collection_name {
        return Ok(false);
    }
    let vars = merged_vars(query, opts);
    let filters: Vec<&WhereFilter> = query.filters.iter().collect();
    matches_filters(reader, &filters, entity, &vars, ctx, opts)
}

fn matches_filters<R: TripleReader + ?Sized>(
    reader: &R,
    filters: &[&WhereFilter],
    entity: &Arc<Entity>,
    vars: &BTreeMap<String, Value>,
    ctx: &mut ExecutionContext,
    opts: &ExecutionOptions,
) -> Result<bool, EngineError> {
    for filter in filters {
        if !matches_filter(reader, filter, entity, vars, ctx, opts)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_filter<R: TripleReader + ?Sized>(
    reader: &R,
    filter: &WhereFilter,
    entity: &Arc<Entity>,
    vars: &BTreeMap<String, Value>,
    ctx: &mut ExecutionContext,
    opts: &ExecutionOptions,
) -> Result<bool, EngineError> {
    match filter {
        WhereFilter::Boolean(b) => Ok(*b),
        WhereFilter::Statement(stmt) => {
            let operand = resolve_operand(&stmt.value, vars, ctx, opts)?;
            Ok(eval_statement(entity, stmt, &operand, opts.schema()))
        }
        WhereFilter::Group { op, filters } => {
            let mut ordered: Vec<&WhereFilter> = filters.iter().collect();
            ordered.sort_by_key(|f| f.cost());
            for child in ordered {
                let hit = matches_filter(reader, child, entity, vars, ctx, opts)?;
                match (op, hit) {
                    (GroupOp::And, false) => return Ok(false),
                    (GroupOp::Or, true) => return Ok(true),
                    _ => {}
                }
            }
            Ok(*op == GroupOp::And)
        }
        WhereFilter::Exists(rs) => {
            let rows = load_subquery(reader, rs, entity, vars, ctx, opts, SubqueryMode::Exists)?;
            Ok(!rows.is_empty())
        }
    }
}

enum SubqueryMode<'a> {
    /// Only existence matters.
    Exists,
    /// The first row is used as an order key source.
    First,
    Rows { alias: &'a str },
}

/// Run a relation subquery for one parent row.
fn load_subquery<R: TripleReader + ?Sized>(
    reader: &R,
    rs: &RelationSubquery,
    parent: &Arc<Entity>,
    parent_vars: &BTreeMap<String, Value>,
    ctx: &mut ExecutionContext,
    opts: &ExecutionOptions,
    mode: SubqueryMode<'_>,
) -> Result<Vec<EntityId>, EngineError> {
    let mut sub = rs.subquery.clone();
    for (key, value) in parent_vars {
        sub.vars
            .entry(bump_scope(key, 1))
            .or_insert_with(|| value.clone());
    }
    let one = rs.cardinality == Cardinality::One;
    if one || matches!(mode, SubqueryMode::Exists | SubqueryMode::First) {
        sub.limit = Some(1);
    }

    ctx.stack.push(parent.clone());
    let rows = load_query(reader, &sub, ctx, opts);
    ctx.stack.pop();
    let rows = rows?;

    if one && rows.len() > 1 {
        let alias = match mode {
            SubqueryMode::Rows { alias } => alias.to_string(),
            _ => sub.collection_name.clone(),
        };
        return Err(EngineError::InvalidResultCardinality {
            alias,
            count: rows.len(),
        });
    }
    Ok(rows)
}

fn load_includes<R: TripleReader + ?Sized>(
    reader: &R,
    query: &Query,
    ids: &[EntityId],
    vars: &BTreeMap<String, Value>,
    ctx: &mut ExecutionContext,
    opts: &ExecutionOptions,
) -> Result<(), EngineError> {
    for (alias, include) in &query.include {
        let Include::Subquery(rs) = include else {
            return Err(EngineError::QueryNotPrepared(alias.clone()));
        };
        for id in ids {
            let Some(parent) = ctx.entities.get(id).cloned() else {
                continue;
            };
            ctx.prefix.push(alias.clone());
            let rows = load_subquery(reader, rs, &parent, vars, ctx, opts, SubqueryMode::Rows { alias });
            ctx.prefix.pop();
            let rows = rows?;
            let related = match rs.cardinality {
                Cardinality::One => Related::One(rows.into_iter().next()),
                Cardinality::Many => Related::Many(rows),
            };
            ctx.components
                .entry((ctx.prefix.clone(), id.clone()))
                .or_default()
                .insert(alias.clone(), related);
        }
    }
    Ok(())
}

// ============================================================================
// Ordering and cursors
// ============================================================================

fn order_keys<R: TripleReader + ?Sized>(
    reader: &R,
    query: &Query,
    entity: &Arc<Entity>,
    vars: &BTreeMap<String, Value>,
    ctx: &mut ExecutionContext,
    opts: &ExecutionOptions,
) -> Result<Vec<Option<Value>>, EngineError> {
    let mut keys = Vec::with_capacity(query.order.len());
    for order in &query.order {
        let key = match &order.relation {
            None => entity.get(&order.path).cloned(),
            Some(rs) => {
                let rows = load_subquery(reader, rs, entity, vars, ctx, opts, SubqueryMode::First)?;
                match rows.first() {
                    Some(id) => ctx
                        .load(reader, id, opts)?
                        .and_then(|related| related.get(&order.path).cloned()),
                    None => None,
                }
            }
        };
        keys.push(key);
    }
    Ok(keys)
}

/// Multi-key row order. Missing values sort below every value, Null included.
/// Equal keys fall back to the entity id in the first key's direction, which is
/// also the order the value index yields.
pub(crate) fn compare_rows(
    order: &[OrderBy],
    a: (&EntityId, &[Option<Value>]),
    b: (&EntityId, &[Option<Value>]),
) -> Ordering {
    for (i, o) in order.iter().enumerate() {
        let left = a.1.get(i).and_then(Option::as_ref);
        let right = b.1.get(i).and_then(Option::as_ref);
        let ord = match o.direction {
            OrderDirection::Asc => left.cmp(&right),
            OrderDirection::Desc => right.cmp(&left),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    match order.first().map(|o| o.direction) {
        Some(OrderDirection::Desc) => b.0.cmp(a.0),
        _ => a.0.cmp(b.0),
    }
}

pub(crate) fn past_cursor(
    order: &[OrderBy],
    id: &EntityId,
    keys: &[Option<Value>],
    after: &After,
) -> bool {
    match compare_rows(order, (id, keys), (&after.cursor.id, after.cursor.values.as_slice())) {
        Ordering::Greater => true,
        Ordering::Equal => after.inclusive,
        Ordering::Less => false,
    }
}

pub(crate) fn entity_order_keys(query: &Query, entity: &Entity) -> Vec<Option<Value>> {
    query
        .order
        .iter()
        .map(|o| entity.get(&o.path).cloned())
        .collect()
}

// ============================================================================
// Candidate selection
// ============================================================================

#[derive(Debug, Default)]
struct Fulfilled {
    /// Indices of top-level filters the index scan already guarantees.
    filters: BTreeSet<usize>,
    order: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexKind {
    Register,
    Set,
}

/// Only top-level scalar attributes are served from the value index.
fn index_kind(collection: &str, path: &AttributePath, opts: &ExecutionOptions) -> Option<IndexKind> {
    if path.len() != 1 || path.head_key() == Some(COLLECTION_ATTRIBUTE) {
        return None;
    }
    match opts.schema().and_then(|s| s.attribute_type(collection, path)) {
        Some(DataType::Query(_)) | Some(DataType::Record(_)) => None,
        Some(DataType::Set(_)) => Some(IndexKind::Set),
        _ => Some(IndexKind::Register),
    }
}

fn candidate_ids<R: TripleReader + ?Sized>(
    reader: &R,
    query: &Query,
    vars: &BTreeMap<String, Value>,
    ctx: &ExecutionContext,
    opts: &ExecutionOptions,
) -> Result<(Vec<EntityId>, Fulfilled), EngineError> {
    let collection = query.collection_name.as_str();
    let mut fulfilled = Fulfilled::default();

    let statements: Vec<(usize, &FilterStatement, Operand)> = query
        .filters
        .iter()
        .enumerate()
        .filter_map(|(i, f)| match f {
            WhereFilter::Statement(stmt) => Some((i, stmt)),
            _ => None,
        })
        .map(|(i, stmt)| -> Result<_, EngineError> {
            Ok((i, stmt, resolve_operand(&stmt.value, vars, ctx, opts)?))
        })
        .collect::<Result<_, _>>()?;

    // 1. id equality
    for (i, stmt, operand) in &statements {
        if stmt.op == Operator::Eq
            && stmt.path.len() == 1
            && stmt.path.head_key() == Some(ID_ATTRIBUTE)
            && let Operand::Scalar(Value::String(local)) = operand
        {
            fulfilled.filters.insert(*i);
            trace!(collection, strategy = "id", "candidate selection");
            return Ok((vec![EntityId::new(collection, local)], fulfilled));
        }
    }

    if opts.use_index() {
        // 2. value equality
        for (i, stmt, operand) in &statements {
            let Operand::Scalar(value) = operand else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let kind = match (stmt.op, index_kind(collection, &stmt.path, opts)) {
                (Operator::Eq, Some(kind)) => kind,
                (Operator::Has, Some(IndexKind::Set)) => IndexKind::Set,
                _ => continue,
            };
            let ids = match kind {
                IndexKind::Register => {
                    fulfilled.filters.insert(*i);
                    ids_in_collection(reader.find_by_ave(&stmt.path, Some(value), None, ScanDirection::Asc)?, collection)
                }
                IndexKind::Set => {
                    let member = stmt.path.child(value.set_key());
                    ids_in_collection(
                        reader.find_by_ave(&member, Some(&Value::Boolean(true)), None, ScanDirection::Asc)?,
                        collection,
                    )
                }
            };
            trace!(collection, strategy = "ave", path = %stmt.path, "candidate selection");
            return Ok((ids, fulfilled));
        }

        // 3. value range
        for (i, stmt, operand) in &statements {
            if !stmt.op.is_range() || index_kind(collection, &stmt.path, opts) != Some(IndexKind::Register) {
                continue;
            }
            let Operand::Scalar(value) = operand else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let mut range = ValueRange::default();
            set_bound(&mut range, stmt.op, value.clone());
            fulfilled.filters.insert(*i);
            let lower = is_lower(stmt.op);
            if let Some((j, other, Operand::Scalar(bound))) = statements.iter().find(|(j, other, o)| {
                j != i
                    && other.path == stmt.path
                    && other.op.is_range()
                    && is_lower(other.op) != lower
                    && matches!(o, Operand::Scalar(v) if !v.is_null())
            }) {
                set_bound(&mut range, other.op, bound.clone());
                fulfilled.filters.insert(*j);
            }
            let ids = ids_in_collection(reader.find_values_in_range(&stmt.path, &range)?, collection);
            trace!(collection, strategy = "range", path = %stmt.path, "candidate selection");
            return Ok((ids, fulfilled));
        }

        // 4. single-key order scan
        if let Some(first) = query.order.first()
            && first.relation.is_none()
            && index_kind(collection, &first.path, opts) == Some(IndexKind::Register)
        {
            let ids = order_scan(reader, collection, first, opts)?;
            fulfilled.order = query.order.len() == 1;
            trace!(collection, strategy = "order", path = %first.path, "candidate selection");
            return Ok((ids, fulfilled));
        }
    }

    // 5. whole collection
    trace!(collection, strategy = "collection", "candidate selection");
    Ok((collection_ids(reader, collection, opts)?, fulfilled))
}

fn is_lower(op: Operator) -> bool {
    matches!(op, Operator::Gt | Operator::Gte)
}

fn set_bound(range: &mut ValueRange, op: Operator, value: Value) {
    match op {
        Operator::Gt => range.gt = Some(value),
        Operator::Gte => range.gte = Some(value),
        Operator::Lt => range.lt = Some(value),
        Operator::Lte => range.lte = Some(value),
        _ => {}
    }
}

/// Distinct ids of `collection` in scan order.
fn ids_in_collection(triples: impl Iterator<Item = Triple>, collection: &str) -> Vec<EntityId> {
    let mut seen = BTreeSet::new();
    triples
        .filter(|t| t.id.collection() == collection)
        .filter_map(|t| seen.insert(t.id.clone()).then_some(t.id))
        .collect()
}

fn collection_ids<R: TripleReader + ?Sized>(
    reader: &R,
    collection: &str,
    opts: &ExecutionOptions,
) -> Result<Vec<EntityId>, EngineError> {
    let marker = Triple::collection_path();
    if opts.state_vector.is_some() {
        // History scan: entities deleted since the vector still have to be seen.
        let ids: BTreeSet<EntityId> = reader
            .find_by_eat(None, Some(&marker))?
            .filter(|t| t.id.collection() == collection)
            .map(|t| t.id)
            .collect();
        return Ok(ids.into_iter().collect());
    }
    let value = Value::from(collection);
    Ok(ids_in_collection(
        reader.find_by_ave(&marker, Some(&value), None, ScanDirection::Asc)?,
        collection,
    ))
}

/// Ids ordered by one attribute. Entities without the attribute sort first
/// ascending and last descending.
fn order_scan<R: TripleReader + ?Sized>(
    reader: &R,
    collection: &str,
    order: &OrderBy,
    opts: &ExecutionOptions,
) -> Result<Vec<EntityId>, EngineError> {
    let direction = match order.direction {
        OrderDirection::Asc => ScanDirection::Asc,
        OrderDirection::Desc => ScanDirection::Desc,
    };
    let present = ids_in_collection(reader.find_by_ave(&order.path, None, None, direction)?, collection);
    let have: BTreeSet<&EntityId> = present.iter().collect();
    let mut missing: Vec<EntityId> = collection_ids(reader, collection, opts)?
        .into_iter()
        .filter(|id| !have.contains(id))
        .collect();
    Ok(match direction {
        ScanDirection::Asc => {
            missing.extend(present);
            missing
        }
        ScanDirection::Desc => {
            missing.reverse();
            let mut ids = present;
            ids.extend(missing);
            ids
        }
    })
}

// ============================================================================
// Filter evaluation
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Scalar(Value),
    List(Vec<Value>),
}

fn resolve_operand(
    value: &QueryValue,
    vars: &BTreeMap<String, Value>,
    ctx: &ExecutionContext,
    opts: &ExecutionOptions,
) -> Result<Operand, EngineError> {
    match value {
        QueryValue::Value(v) => Ok(Operand::Scalar(v.clone())),
        QueryValue::List(vs) => Ok(Operand::List(vs.clone())),
        QueryValue::Variable(name) => {
            if let Some((level, path)) = scoped_variable(name)
                && level >= 1
                && level <= ctx.stack.len()
            {
                let frame = &ctx.stack[ctx.stack.len() - level];
                return Ok(entity_operand(frame, &path, opts.schema()));
            }
            vars.get(name)
                .cloned()
                .map(Operand::Scalar)
                .ok_or_else(|| EngineError::SessionVariableNotFound(name.clone()))
        }
    }
}

/// Value of `path` on a parent row. Sets resolve to their member list.
fn entity_operand(entity: &Entity, path: &AttributePath, schema: Option<&dyn SchemaResolver>) -> Operand {
    let item = schema.and_then(|s| match s.attribute_type(entity.collection_name(), path) {
        Some(DataType::Set(item)) => Some(item.as_ref().clone()),
        _ => None,
    });
    if item.is_none()
        && let Some(value) = entity.get(path)
    {
        return Operand::Scalar(value.clone());
    }
    let keys = entity.set_member_keys(path);
    if item.is_none() && keys.is_empty() {
        return Operand::Scalar(Value::Null);
    }
    let item = item.unwrap_or(DataType::String);
    Operand::List(keys.iter().map(|k| item.convert_db_value(k)).collect())
}

fn eval_statement(
    entity: &Entity,
    stmt: &FilterStatement,
    operand: &Operand,
    schema: Option<&dyn SchemaResolver>,
) -> bool {
    let path = &stmt.path;
    if stmt.op == Operator::IsDefined {
        let want = match operand {
            Operand::Scalar(v) => v.as_bool().unwrap_or(true),
            Operand::List(_) => true,
        };
        return entity.is_defined(path) == want;
    }

    let is_set = matches!(stmt.op, Operator::Has | Operator::NotHas)
        || matches!(
            schema.and_then(|s| s.attribute_type(entity.collection_name(), path)),
            Some(DataType::Set(_))
        );
    if is_set {
        return eval_set(entity, path, stmt.op, operand);
    }

    let missing = Value::Null;
    let lhs = entity.get(path).unwrap_or(&missing);
    match stmt.op {
        Operator::Eq | Operator::In => operand_contains(operand, lhs),
        Operator::Ne | Operator::Nin => !operand_contains(operand, lhs),
        Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => match operand {
            Operand::Scalar(rhs) => compare_scalar(lhs, stmt.op, rhs),
            Operand::List(_) => false,
        },
        Operator::Like | Operator::NotLike => {
            let hit = match (lhs.as_str(), operand) {
                (Some(text), Operand::Scalar(pattern)) => {
                    pattern.as_str().is_some_and(|p| like_matches(text, p))
                }
                _ => false,
            };
            hit == (stmt.op == Operator::Like)
        }
        Operator::Has | Operator::NotHas | Operator::IsDefined => false,
    }
}

fn operand_contains(operand: &Operand, value: &Value) -> bool {
    match operand {
        Operand::Scalar(v) => v == value,
        Operand::List(vs) => vs.contains(value),
    }
}

/// Range comparison never crosses value kinds and never matches Null.
fn compare_scalar(lhs: &Value, op: Operator, rhs: &Value) -> bool {
    if lhs.is_null() || rhs.is_null() || lhs.rank() != rhs.rank() {
        return false;
    }
    let ord = lhs.cmp(rhs);
    match op {
        Operator::Lt => ord == Ordering::Less,
        Operator::Lte => ord != Ordering::Greater,
        Operator::Gt => ord == Ordering::Greater,
        Operator::Gte => ord != Ordering::Less,
        _ => false,
    }
}

fn eval_set(entity: &Entity, path: &AttributePath, op: Operator, operand: &Operand) -> bool {
    let has = |v: &Value| entity.has_set_member(path, &v.set_key());
    match op {
        Operator::Eq | Operator::Has => match operand {
            Operand::Scalar(v) => has(v),
            Operand::List(vs) => vs.iter().all(has),
        },
        Operator::Ne | Operator::NotHas => match operand {
            Operand::Scalar(v) => !has(v),
            Operand::List(vs) => !vs.iter().all(has),
        },
        Operator::In => match operand {
            Operand::Scalar(v) => has(v),
            Operand::List(vs) => vs.iter().any(has),
        },
        Operator::Nin => match operand {
            Operand::Scalar(v) => !has(v),
            Operand::List(vs) => !vs.iter().any(has),
        },
        _ => false,
    }
}

/// SQL-style pattern: `%` matches any run, `_` exactly one character.
pub(crate) fn like_matches(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    // row[j]: pattern prefix matches text[..j]
    let mut row = vec![false; text.len() + 1];
    row[0] = true;
    for p in &pattern {
        let mut next = vec![false; text.len() + 1];
        if *p == '%' {
            next[0] = row[0];
        }
        for j in 1..=text.len() {
            next[j] = match p {
                '%' => row[j] || next[j - 1],
                '_' => row[j - 1],
                c => row[j - 1] && *c == text[j - 1],
            };
        }
        row = next;
    }
    row[text.len()]
}
