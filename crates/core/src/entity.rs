use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::ids::EntityId;
use crate::path::{AttributePath, PathSegment};
use crate::schema::{DataType, SchemaResolver};
use crate::state_vector::StateVector;
use crate::timestamp::Timestamp;
use crate::triple::{COLLECTION_ATTRIBUTE, Triple};
use crate::value::Value;

/// Current value of one path together with the timestamp that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub value: Value,
    pub timestamp: Timestamp,
    pub expired: bool,
}

/// How equal ticks from different clients are resolved while replaying
/// triples up to a state vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TiePolicy {
    /// Lexicographically higher client wins (the normal comparator).
    #[default]
    Higher,
    /// Lexicographically lower client wins.
    Lower,
}

impl TiePolicy {
    fn compare(self, a: &Timestamp, b: &Timestamp) -> Ordering {
        match self {
            TiePolicy::Higher => a.cmp(b),
            TiePolicy::Lower => a.cmp_lower_client_wins(b),
        }
    }
}

/// Materialized entity: a last-writer-wins fold of its triples, one leaf per path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    id: EntityId,
    leaves: BTreeMap<AttributePath, Leaf>,
}

impl Entity {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            leaves: BTreeMap::new(),
        }
    }

    pub fn from_triples<'a>(id: EntityId, triples: impl IntoIterator<Item = &'a Triple>) -> Self {
        let mut entity = Self::new(id);
        for triple in triples {
            entity.apply_triple(triple);
        }
        entity
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn collection_name(&self) -> &str {
        self.id.collection()
    }

    /// Fold one triple in. Returns true when the materialized state changed:
    /// the triple's timestamp dominates the stored one and it carries a
    /// different value or tombstone flag.
    pub fn apply_triple(&mut self, triple: &Triple) -> bool {
        self.apply_with(triple, TiePolicy::Higher)
    }

    fn apply_with(&mut self, triple: &Triple, policy: TiePolicy) -> bool {
        match self.leaves.get_mut(&triple.attribute) {
            Some(leaf) => {
                if policy.compare(&triple.timestamp, &leaf.timestamp) != Ordering::Greater {
                    return false;
                }
                let changed = leaf.value != triple.value || leaf.expired != triple.expired;
                leaf.value = triple.value.clone();
                leaf.expired = triple.expired;
                leaf.timestamp = triple.timestamp.clone();
                changed
            }
            None => {
                self.leaves.insert(
                    triple.attribute.clone(),
                    Leaf {
                        value: triple.value.clone(),
                        timestamp: triple.timestamp.clone(),
                        expired: triple.expired,
                    },
                );
                true
            }
        }
    }

    /// Deleted when `_collection` is missing or tombstoned.
    pub fn is_deleted(&self) -> bool {
        match self.leaves.get(&Triple::collection_path()) {
            Some(leaf) => leaf.expired,
            None => true,
        }
    }

    pub fn leaf(&self, path: &AttributePath) -> Option<&Leaf> {
        self.leaves.get(path)
    }

    pub fn leaves(&self) -> impl Iterator<Item = (&AttributePath, &Leaf)> {
        self.leaves.iter()
    }

    /// A leaf is hidden when it is a tombstone or a later write on an ancestor
    /// path replaced the whole subtree.
    fn is_visible(&self, path: &AttributePath, leaf: &Leaf) -> bool {
        if leaf.expired {
            return false;
        }
        !path.ancestors().any(|ancestor| {
            self.leaves
                .get(&ancestor)
                .is_some_and(|a| a.timestamp > leaf.timestamp)
        })
    }

    pub fn visible_leaves(&self) -> impl Iterator<Item = (&AttributePath, &Leaf)> {
        self.leaves
            .iter()
            .filter(|(path, leaf)| self.is_visible(path, leaf))
    }

    /// Current scalar at exactly `path`.
    pub fn get(&self, path: &AttributePath) -> Option<&Value> {
        let leaf = self.leaves.get(path)?;
        self.is_visible(path, leaf).then_some(&leaf.value)
    }

    pub fn timestamp_at(&self, path: &AttributePath) -> Option<&Timestamp> {
        self.leaves.get(path).map(|l| &l.timestamp)
    }

    fn descendants<'a>(
        &'a self,
        path: &'a AttributePath,
    ) -> impl Iterator<Item = (&'a AttributePath, &'a Leaf)> + 'a {
        self.leaves
            .range(path.clone()..)
            .skip_while(move |(p, _)| *p == path)
            .take_while(move |(p, _)| path.is_ancestor_of(p))
    }

    /// True when the path or anything beneath it holds a visible value.
    pub fn is_defined(&self, path: &AttributePath) -> bool {
        if self.get(path).is_some() {
            return true;
        }
        self.descendants(path)
            .any(|(p, leaf)| self.is_visible(p, leaf))
    }

    /// Keys of Set members currently flagged `true` under `path`.
    pub fn set_member_keys(&self, path: &AttributePath) -> Vec<String> {
        self.descendants(path)
            .filter(|(p, _)| p.len() == path.len() + 1)
            .filter(|(p, leaf)| self.is_visible(p, leaf) && leaf.value == Value::Boolean(true))
            .filter_map(|(p, _)| p.last().and_then(PathSegment::as_key).map(str::to_string))
            .collect()
    }

    pub fn has_set_member(&self, path: &AttributePath, key: &str) -> bool {
        self.get(&path.child(key)) == Some(&Value::Boolean(true))
    }

    /// The winning triple for every path, tombstones included.
    pub fn to_triples(&self) -> Vec<Triple> {
        self.leaves
            .iter()
            .map(|(path, leaf)| Triple {
                id: self.id.clone(),
                attribute: path.clone(),
                value: leaf.value.clone(),
                timestamp: leaf.timestamp.clone(),
                expired: leaf.expired,
            })
            .collect()
    }

    /// Build the caller-facing tree. With a schema, boolean-flag submaps of Set
    /// attributes are folded back into Sets of typed members.
    pub fn to_document(&self, schema: Option<&dyn SchemaResolver>) -> Document {
        let mut doc = Document::object();
        let collection = self.collection_name();
        for (path, leaf) in self.visible_leaves() {
            if path.head_key() == Some(COLLECTION_ATTRIBUTE) {
                continue;
            }
            let set_parent = schema.and_then(|s| {
                let parent = path.parent()?;
                match s.attribute_type(collection, &parent)? {
                    DataType::Set(item) => Some((parent, item.as_ref().clone())),
                    _ => None,
                }
            });
            match set_parent {
                Some((parent, item)) => {
                    if !matches!(doc.get(&parent), Some(Document::Set(_))) {
                        doc.set_at(&parent, Document::Set(Default::default()));
                    }
                    if leaf.value == Value::Boolean(true)
                        && let Some(PathSegment::Key(key)) = path.last()
                        && let Some(Document::Set(members)) = get_mut(&mut doc, &parent)
                    {
                        members.insert(item.convert_db_value(key));
                    }
                }
                None => doc.set_at(path, Document::Value(leaf.value.clone())),
            }
        }
        doc
    }
}

fn get_mut<'a>(doc: &'a mut Document, path: &AttributePath) -> Option<&'a mut Document> {
    let mut node = doc;
    for segment in path.segments() {
        node = match (node, segment) {
            (Document::Object(map), PathSegment::Key(k)) => map.get_mut(k)?,
            (Document::Array(items), PathSegment::Index(i)) => items.get_mut(*i as usize)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Group triples by entity and fold each group, in arrival order.
pub fn construct_entities<I>(triples: I) -> BTreeMap<EntityId, Entity>
where
    I: IntoIterator<Item = Triple>,
{
    let mut entities: BTreeMap<EntityId, Entity> = BTreeMap::new();
    for triple in triples {
        entities
            .entry(triple.id.clone())
            .or_insert_with(|| Entity::new(triple.id.clone()))
            .apply_triple(&triple);
    }
    entities
}

/// Materialize entities as they stood when the state vector was current:
/// only triples whose `(tick, client)` the vector includes are replayed.
pub fn entities_at_state_vector<'a, I>(
    triples: I,
    state_vector: &StateVector,
    policy: TiePolicy,
) -> BTreeMap<EntityId, Entity>
where
    I: IntoIterator<Item = &'a Triple>,
{
    let mut entities: BTreeMap<EntityId, Entity> = BTreeMap::new();
    for triple in triples {
        if !state_vector.includes(&triple.timestamp) {
            continue;
        }
        entities
            .entry(triple.id.clone())
            .or_insert_with(|| Entity::new(triple.id.clone()))
            .apply_with(triple, policy);
    }
    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ClientId;
    use crate::schema::Schema;
    use proptest::prelude::*;

    fn ts(tick: u64, client: &str) -> Timestamp {
        Timestamp::new(tick, ClientId::from(client))
    }

    fn id() -> EntityId {
        EntityId::new("people", "e")
    }

    fn triple(path: &str, value: impl Into<Value>, t: Timestamp) -> Triple {
        Triple::new(id(), AttributePath::parse(path), value.into(), t)
    }

    #[test]
    fn later_timestamp_wins_in_either_order() {
        let alice = triple("name", "Alice", ts(1, "A"));
        let bob = triple("name", "Bob", ts(2, "A"));

        let forward = Entity::from_triples(id(), [&alice, &bob]);
        let reverse = Entity::from_triples(id(), [&bob, &alice]);
        let name = AttributePath::parse("name");
        assert_eq!(forward.get(&name), Some(&Value::from("Bob")));
        assert_eq!(reverse.get(&name), Some(&Value::from("Bob")));
    }

    #[test]
    fn apply_reports_only_real_changes() {
        let mut e = Entity::new(id());
        assert!(e.apply_triple(&triple("name", "A", ts(1, "A"))));
        // Older write is ignored.
        assert!(!e.apply_triple(&triple("name", "Z", ts(0, "A"))));
        // Newer write of the same value moves the timestamp but changes nothing.
        assert!(!e.apply_triple(&triple("name", "A", ts(2, "A"))));
        assert_eq!(e.timestamp_at(&AttributePath::parse("name")), Some(&ts(2, "A")));
        assert!(e.apply_triple(&triple("name", "B", ts(3, "A"))));
    }

    #[test]
    fn tombstone_on_collection_marks_deleted() {
        let mut e = Entity::new(id());
        assert!(e.is_deleted());
        e.apply_triple(&triple(COLLECTION_ATTRIBUTE, "people", ts(1, "A")));
        assert!(!e.is_deleted());
        e.apply_triple(&Triple::tombstone(id(), Triple::collection_path(), ts(2, "A")));
        assert!(e.is_deleted());
    }

    #[test]
    fn ancestor_write_hides_older_descendants() {
        let mut e = Entity::new(id());
        e.apply_triple(&triple("address.city", "Oslo", ts(1, "A")));
        assert!(e.is_defined(&AttributePath::parse("address")));
        e.apply_triple(&Triple::tombstone(id(), AttributePath::parse("address"), ts(2, "A")));
        assert_eq!(e.get(&AttributePath::parse("address.city")), None);
        assert!(!e.is_defined(&AttributePath::parse("address")));
        e.apply_triple(&triple("address.city", "Bergen", ts(3, "A")));
        assert_eq!(
            e.get(&AttributePath::parse("address.city")),
            Some(&Value::from("Bergen"))
        );
    }

    #[test]
    fn document_rebuilds_sets_and_arrays() {
        let schema = Schema::new().collection(
            "people",
            [
                ("tags", DataType::set_of(DataType::String)),
                ("scores", DataType::Record(Default::default())),
            ],
        );
        let e = Entity::from_triples(
            id(),
            [
                &triple(COLLECTION_ATTRIBUTE, "people", ts(1, "A")),
                &triple("tags.x", true, ts(1, "A")),
                &triple("tags.y", false, ts(1, "A")),
                &triple("list.0", "first", ts(1, "A")),
                &triple("list.1", "second", ts(1, "A")),
            ],
        );
        let doc = e.to_document(Some(&schema));
        assert_eq!(
            doc.get(&AttributePath::parse("tags")),
            Some(&Document::set(["x"]))
        );
        assert_eq!(
            doc.get(&AttributePath::parse("list")),
            Some(&Document::Array(vec![Document::from("first"), Document::from("second")]))
        );
        assert!(doc.get(&AttributePath::parse(COLLECTION_ATTRIBUTE)).is_none());
        assert_eq!(e.set_member_keys(&AttributePath::parse("tags")), vec!["x".to_string()]);
    }

    #[test]
    fn state_vector_replay_excludes_unseen_writes() {
        let triples = vec![
            triple("name", "old", ts(3, "A")),
            triple("name", "new", ts(4, "A")),
            triple("age", 30, ts(1, "B")),
        ];
        let sv: StateVector = [(ClientId::from("A"), 3)].into_iter().collect();
        let before = entities_at_state_vector(&triples, &sv, TiePolicy::Higher);
        let e = &before[&id()];
        assert_eq!(e.get(&AttributePath::parse("name")), Some(&Value::from("old")));
        assert_eq!(e.get(&AttributePath::parse("age")), None);
    }

    #[test]
    fn tie_policy_picks_client_on_equal_ticks() {
        let triples = vec![triple("name", "from-a", ts(2, "A")), triple("name", "from-b", ts(2, "B"))];
        let sv: StateVector = [(ClientId::from("A"), 2), (ClientId::from("B"), 2)]
            .into_iter()
            .collect();
        let name = AttributePath::parse("name");
        let higher = entities_at_state_vector(&triples, &sv, TiePolicy::Higher);
        let lower = entities_at_state_vector(&triples, &sv, TiePolicy::Lower);
        assert_eq!(higher[&id()].get(&name), Some(&Value::from("from-b")));
        assert_eq!(lower[&id()].get(&name), Some(&Value::from("from-a")));
    }

    #[test]
    fn construct_groups_by_entity() {
        let other = EntityId::new("people", "f");
        let triples = vec![
            triple("name", "Ann", ts(1, "A")),
            Triple::new(other.clone(), AttributePath::parse("name"), Value::from("Fay"), ts(1, "A")),
            triple("name", "Anna", ts(2, "A")),
        ];
        let entities = construct_entities(triples);
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[&id()].get(&AttributePath::parse("name")), Some(&Value::from("Anna")));
        assert_eq!(entities[&other].get(&AttributePath::parse("name")), Some(&Value::from("Fay")));
    }

    proptest! {
        #[test]
        fn lww_fold_is_order_independent(
            writes in proptest::collection::vec((0u64..6, "[AB]", 0i64..4), 1..12),
            seed in any::<u64>(),
        ) {
            // One write per timestamp: a client never writes a path twice in one tick.
            let mut seen = std::collections::HashSet::new();
            let triples: Vec<Triple> = writes
                .iter()
                .filter(|(tick, client, _)| seen.insert((*tick, client.clone())))
                .map(|(tick, client, v)| triple("score", *v, ts(*tick, client)))
                .collect();
            let mut shuffled = triples.clone();
            // Deterministic permutation driven by the seed.
            let n = shuffled.len();
            for i in 0..n {
                let j = ((seed.wrapping_mul(i as u64 + 1)) % n as u64) as usize;
                shuffled.swap(i, j);
            }
            let a = Entity::from_triples(id(), &triples);
            let b = Entity::from_triples(id(), &shuffled);
            prop_assert_eq!(
                a.leaf(&AttributePath::parse("score")).map(|l| &l.timestamp),
                b.leaf(&AttributePath::parse("score")).map(|l| &l.timestamp)
            );
            prop_assert_eq!(
                a.get(&AttributePath::parse("score")),
                b.get(&AttributePath::parse("score"))
            );
        }
    }
}
