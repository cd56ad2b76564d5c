use std::collections::{BTreeMap, HashMap};

use tracing::trace;
use trinity_core::{EntityId, Value};

use crate::error::EngineError;
use crate::query::Query;

/// Memoized result ids of non-relational queries.
///
/// Entries are keyed by the query shape together with the variable values it
/// was resolved against, so the same query under two sessions never shares a
/// result. A write to a collection evicts every entry for that collection.
#[derive(Debug, Default)]
pub struct VariableAwareCache {
    entries: HashMap<blake3::Hash, CacheEntry>,
    hits: u64,
    misses: u64,
}

#[derive(Debug)]
struct CacheEntry {
    collection: String,
    ids: Vec<EntityId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl VariableAwareCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only self-contained queries are cacheable: relations read other collections.
    pub fn can_cache(query: &Query) -> bool {
        !query.is_relational()
    }

    pub fn key(query: &Query, vars: &BTreeMap<String, Value>) -> Result<blake3::Hash, EngineError> {
        let bytes = rmp_serde::to_vec(&(query, vars))
            .map_err(|e| EngineError::InvalidQuery(format!("query is not serializable: {e}")))?;
        Ok(blake3::hash(&bytes))
    }

    pub fn get(&mut self, key: &blake3::Hash) -> Option<&[EntityId]> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits += 1;
                trace!(collection = %entry.collection, "query cache hit");
                Some(entry.ids.as_slice())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: blake3::Hash, collection: &str, ids: Vec<EntityId>) {
        self.entries.insert(
            key,
            CacheEntry {
                collection: collection.to_string(),
                ids,
            },
        );
    }

    pub fn invalidate(&mut self, collection: &str) {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.collection != collection);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            trace!(collection, evicted, "query cache invalidated");
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Operator, QueryValue, WhereFilter};

    #[test]
    fn variables_are_part_of_the_key() {
        let q = Query::new("todos").filter("owner", Operator::Eq, QueryValue::var("user"));
        let alice = BTreeMap::from([("user".to_string(), Value::from("alice"))]);
        let bob = BTreeMap::from([("user".to_string(), Value::from("bob"))]);
        let a = VariableAwareCache::key(&q, &alice).unwrap();
        assert_eq!(a, VariableAwareCache::key(&q, &alice).unwrap());
        assert_ne!(a, VariableAwareCache::key(&q, &bob).unwrap());
    }

    #[test]
    fn writes_evict_their_collection_only() {
        let mut cache = VariableAwareCache::new();
        let todos = Query::new("todos");
        let users = Query::new("users");
        let vars = BTreeMap::new();
        let tk = VariableAwareCache::key(&todos, &vars).unwrap();
        let uk = VariableAwareCache::key(&users, &vars).unwrap();
        cache.insert(tk, "todos", vec![EntityId::new("todos", "1")]);
        cache.insert(uk, "users", vec![]);

        assert_eq!(cache.get(&tk).map(<[EntityId]>::len), Some(1));
        cache.invalidate("todos");
        assert!(cache.get(&tk).is_none());
        assert!(cache.get(&uk).is_some());
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                hits: 2,
                misses: 1
            }
        );
    }

    #[test]
    fn relational_queries_are_not_cached() {
        let q = Query::new("posts").filter_with(WhereFilter::exists(Query::new("users")));
        assert!(!VariableAwareCache::can_cache(&q));
        assert!(VariableAwareCache::can_cache(&Query::new("posts")));
    }
}
