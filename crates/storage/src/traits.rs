use std::cmp::Ordering;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use trinity_core::{AttributePath, ClientId, EntityId, Triple, Value};

use crate::error::StorageError;

/// Lazy stream of triples. Dropping it abandons the scan.
pub type TripleIter<'a> = Box<dyn Iterator<Item = Triple> + 'a>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDirection {
    #[default]
    Asc,
    Desc,
}

/// Bounds for an ordered value scan over one attribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueRange {
    pub gt: Option<Value>,
    pub gte: Option<Value>,
    pub lt: Option<Value>,
    pub lte: Option<Value>,
    pub direction: ScanDirection,
}

impl ValueRange {
    /// Range membership. A range never crosses value kinds: every bound must share
    /// the value's kind.
    pub fn contains(&self, value: &Value) -> bool {
        self.bounds().all(|b| b.rank() == value.rank())
            && self.gt.as_ref().is_none_or(|b| value > b)
            && self.gte.as_ref().is_none_or(|b| value >= b)
            && self.lt.as_ref().is_none_or(|b| value < b)
            && self.lte.as_ref().is_none_or(|b| value <= b)
    }

    pub fn bounds(&self) -> impl Iterator<Item = &Value> {
        [&self.gt, &self.gte, &self.lt, &self.lte]
            .into_iter()
            .filter_map(Option::as_ref)
    }

    /// Tightest lower bound as a `Bound`, preferring exclusive on ties.
    pub fn lower(&self) -> Bound<&Value> {
        match (&self.gt, &self.gte) {
            (Some(gt), Some(gte)) if gte > gt => Bound::Included(gte),
            (Some(gt), _) => Bound::Excluded(gt),
            (None, Some(gte)) => Bound::Included(gte),
            (None, None) => Bound::Unbounded,
        }
    }

    /// Tightest upper bound as a `Bound`, preferring exclusive on ties.
    pub fn upper(&self) -> Bound<&Value> {
        match (&self.lt, &self.lte) {
            (Some(lt), Some(lte)) if lte < lt => Bound::Included(lte),
            (Some(lt), _) => Bound::Excluded(lt),
            (None, Some(lte)) => Bound::Included(lte),
            (None, None) => Bound::Unbounded,
        }
    }

    /// True when no value can satisfy the bounds.
    pub fn is_empty(&self) -> bool {
        match (self.lower(), self.upper()) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl TimestampOp {
    pub fn matches(self, tick: u64, against: u64) -> bool {
        match self {
            TimestampOp::Lt => tick < against,
            TimestampOp::Lte => tick <= against,
            TimestampOp::Gt => tick > against,
            TimestampOp::Gte => tick >= against,
            TimestampOp::Eq => tick == against,
        }
    }
}

/// Metadata namespace entry, keyed independently of entity triples.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataWrite {
    pub entity: String,
    pub attribute: AttributePath,
    pub value: Value,
}

/// Everything one shard must apply atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub inserts: Vec<Triple>,
    pub deletes: Vec<Triple>,
    pub metadata: Vec<MetadataWrite>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty() && self.metadata.is_empty()
    }
}

/// One physical storage shard holding the EAT, AVE and client-timestamp indexes.
///
/// AVE only ever holds the current, non-expired value of each `(entity, attribute)`:
/// an insert that supersedes the current triple replaces its AVE entry, and a
/// tombstone removes it.
pub trait TripleStorage {
    fn apply(&mut self, batch: &WriteBatch) -> Result<(), StorageError>;

    /// EAT scan. `entity`/`attribute` narrow the scan; the attribute acts as a prefix.
    fn scan_eat(
        &self,
        entity: Option<&EntityId>,
        attribute: Option<&AttributePath>,
    ) -> Result<TripleIter<'_>, StorageError>;

    /// AVE scan over one attribute, ordered by value then entity.
    fn scan_ave(
        &self,
        attribute: &AttributePath,
        value: Option<&Value>,
        entity: Option<&EntityId>,
        direction: ScanDirection,
    ) -> Result<TripleIter<'_>, StorageError>;

    fn scan_value_range(
        &self,
        attribute: &AttributePath,
        range: &ValueRange,
    ) -> Result<TripleIter<'_>, StorageError>;

    /// Triples written by `client` whose tick satisfies `op` against `tick`, in tick order.
    fn scan_client_timestamp(
        &self,
        client: &ClientId,
        op: TimestampOp,
        tick: u64,
    ) -> Result<TripleIter<'_>, StorageError>;

    fn client_ids(&self) -> Result<Vec<ClientId>, StorageError>;

    fn get_metadata(
        &self,
        entity: &str,
        attribute: &AttributePath,
    ) -> Result<Option<Value>, StorageError>;

    fn clear(&mut self) -> Result<(), StorageError>;
}

/// Read surface shared by the committed store and an open transaction.
pub trait TripleReader {
    fn find_by_eat(
        &self,
        entity: Option<&EntityId>,
        attribute: Option<&AttributePath>,
    ) -> Result<TripleIter<'_>, StorageError>;

    fn find_by_ave(
        &self,
        attribute: &AttributePath,
        value: Option<&Value>,
        entity: Option<&EntityId>,
        direction: ScanDirection,
    ) -> Result<TripleIter<'_>, StorageError>;

    fn find_values_in_range(
        &self,
        attribute: &AttributePath,
        range: &ValueRange,
    ) -> Result<TripleIter<'_>, StorageError>;

    fn find_by_client_timestamp(
        &self,
        client: &ClientId,
        op: TimestampOp,
        tick: u64,
    ) -> Result<TripleIter<'_>, StorageError>;

    fn find_all_client_ids(&self) -> Result<Vec<ClientId>, StorageError>;

    fn read_metadata(
        &self,
        entity: &str,
        attribute: &AttributePath,
    ) -> Result<Option<Value>, StorageError>;

    fn find_by_entity(&self, entity: &EntityId) -> Result<TripleIter<'_>, StorageError> {
        self.find_by_eat(Some(entity), None)
    }

    fn find_by_entity_attribute(
        &self,
        entity: &EntityId,
        attribute: &AttributePath,
    ) -> Result<TripleIter<'_>, StorageError> {
        self.find_by_eat(Some(entity), Some(attribute))
    }

    /// Current values of one attribute across all entities.
    fn find_by_attribute(&self, attribute: &AttributePath) -> Result<TripleIter<'_>, StorageError> {
        self.find_by_ave(attribute, None, None, ScanDirection::Asc)
    }
}

/// EAT order: entity, attribute, timestamp.
pub fn eat_order(a: &Triple, b: &Triple) -> Ordering {
    a.id.cmp(&b.id)
        .then_with(|| a.attribute.cmp(&b.attribute))
        .then_with(|| a.timestamp.cmp(&b.timestamp))
}

/// AVE order: value, entity, timestamp.
pub fn ave_order(a: &Triple, b: &Triple) -> Ordering {
    a.value
        .cmp(&b.value)
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| a.timestamp.cmp(&b.timestamp))
}

/// Client-timestamp order.
pub fn client_order(a: &Triple, b: &Triple) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| a.attribute.cmp(&b.attribute))
}
