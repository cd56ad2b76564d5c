use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::path::{AttributePath, PathSegment};
use crate::value::Value;

/// Tree view of an entity as handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Document {
    Value(Value),
    Object(BTreeMap<String, Document>),
    Array(Vec<Document>),
    Set(BTreeSet<Value>),
}

impl Default for Document {
    fn default() -> Self {
        Document::Object(BTreeMap::new())
    }
}

impl Document {
    pub fn object() -> Self {
        Self::default()
    }

    pub fn from_pairs<'a, D: Into<Document>>(pairs: impl IntoIterator<Item = (&'a str, D)>) -> Self {
        Document::Object(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into()))
                .collect(),
        )
    }

    pub fn set<V: Into<Value>>(members: impl IntoIterator<Item = V>) -> Self {
        Document::Set(members.into_iter().map(Into::into).collect())
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Document::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Document>> {
        match self {
            Document::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&BTreeSet<Value>> {
        match self {
            Document::Set(set) => Some(set),
            _ => None,
        }
    }

    pub fn get(&self, path: &AttributePath) -> Option<&Document> {
        let mut node = self;
        for segment in path.segments() {
            node = match (node, segment) {
                (Document::Object(map), PathSegment::Key(k)) => map.get(k)?,
                (Document::Array(items), PathSegment::Index(i)) => items.get(*i as usize)?,
                _ => return None,
            };
        }
        Some(node)
    }

    pub fn get_value(&self, path: &AttributePath) -> Option<&Value> {
        self.get(path).and_then(Document::as_value)
    }

    /// Place `doc` at `path`, creating intermediate objects and arrays as needed.
    /// Numeric segments create arrays, padding skipped slots with null.
    pub fn set_at(&mut self, path: &AttributePath, doc: Document) {
        let mut node = self;
        for segment in path.segments() {
            node = match segment {
                PathSegment::Key(k) => {
                    if !matches!(node, Document::Object(_)) {
                        *node = Document::object();
                    }
                    let Document::Object(map) = node else { unreachable!() };
                    map.entry(k.clone()).or_insert(Document::Value(Value::Null))
                }
                PathSegment::Index(i) => {
                    if !matches!(node, Document::Array(_)) {
                        *node = Document::Array(Vec::new());
                    }
                    let Document::Array(items) = node else { unreachable!() };
                    let i = *i as usize;
                    if items.len() <= i {
                        items.resize(i + 1, Document::Value(Value::Null));
                    }
                    &mut items[i]
                }
            };
        }
        *node = doc;
    }

    /// Keep only the listed top-level keys.
    pub fn project(&self, keys: &[String]) -> Document {
        match self {
            Document::Object(map) => Document::Object(
                map.iter()
                    .filter(|(k, _)| keys.iter().any(|want| want == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Flatten into `(path, value)` leaves. Set members become `[...path, key] = true`.
    pub fn flatten(&self, prefix: &AttributePath, out: &mut Vec<(AttributePath, Value)>) {
        match self {
            Document::Value(v) => out.push((prefix.clone(), v.clone())),
            Document::Object(map) => {
                for (k, child) in map {
                    child.flatten(&prefix.child(k.as_str()), out);
                }
            }
            Document::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    child.flatten(&prefix.child(i as u64), out);
                }
            }
            Document::Set(members) => {
                for member in members {
                    out.push((prefix.child(member.set_key()), Value::Boolean(true)));
                }
            }
        }
    }
}

impl From<Value> for Document {
    fn from(v: Value) -> Self {
        Document::Value(v)
    }
}

impl From<&str> for Document {
    fn from(s: &str) -> Self {
        Document::Value(Value::from(s))
    }
}

impl From<String> for Document {
    fn from(s: String) -> Self {
        Document::Value(Value::from(s))
    }
}

impl From<f64> for Document {
    fn from(n: f64) -> Self {
        Document::Value(Value::from(n))
    }
}

impl From<i64> for Document {
    fn from(n: i64) -> Self {
        Document::Value(Value::from(n))
    }
}

impl From<i32> for Document {
    fn from(n: i32) -> Self {
        Document::Value(Value::from(n))
    }
}

impl From<bool> for Document {
    fn from(b: bool) -> Self {
        Document::Value(Value::from(b))
    }
}
