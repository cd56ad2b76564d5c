use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::path::{AttributePath, PathSegment};
use crate::triple::{COLLECTION_ATTRIBUTE, ID_ATTRIBUTE};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    One,
    Many,
}

/// Join condition between a related collection and its parent:
/// `child <op> $1.parent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationLink {
    pub child: String,
    pub op: String,
    pub parent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    pub collection: String,
    pub links: Vec<RelationLink>,
    pub cardinality: Cardinality,
}

impl RelationDef {
    pub fn new(collection: &str, cardinality: Cardinality) -> Self {
        Self {
            collection: collection.to_string(),
            links: Vec::new(),
            cardinality,
        }
    }

    /// Add a `child <op> $1.parent` join condition.
    pub fn link(mut self, child: &str, op: &str, parent: &str) -> Self {
        self.links.push(RelationLink {
            child: child.to_string(),
            op: op.to_string(),
            parent: parent.to_string(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    String,
    Number,
    Boolean,
    Date,
    Set(Box<DataType>),
    Record(BTreeMap<String, DataType>),
    Query(RelationDef),
}

impl DataType {
    pub fn set_of(item: DataType) -> Self {
        DataType::Set(Box::new(item))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Date => "date",
            DataType::Set(_) => "set",
            DataType::Record(_) => "record",
            DataType::Query(_) => "query",
        }
    }

    pub fn supported_operations(&self) -> &'static [&'static str] {
        match self {
            DataType::String => &[
                "=", "!=", "<", "<=", ">", ">=", "in", "nin", "like", "nlike", "isDefined",
            ],
            DataType::Number | DataType::Date => {
                &["=", "!=", "<", "<=", ">", ">=", "in", "nin", "isDefined"]
            }
            DataType::Boolean => &["=", "!=", "in", "nin", "isDefined"],
            DataType::Set(_) => &["=", "!=", "has", "!has", "isDefined"],
            DataType::Record(_) => &["isDefined"],
            DataType::Query(_) => &[],
        }
    }

    pub fn supports(&self, op: &str) -> bool {
        self.supported_operations().contains(&op)
    }

    pub fn is_relational(&self) -> bool {
        matches!(self, DataType::Query(_))
    }

    pub fn is_set(&self) -> bool {
        matches!(self, DataType::Set(_))
    }

    /// Whether a scalar may be stored at this type's root path. Null is always allowed.
    pub fn validate_value(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => !matches!(self, DataType::Query(_)),
            (DataType::String, Value::String(_)) => true,
            (DataType::Number, Value::Number(_)) => true,
            (DataType::Boolean, Value::Boolean(_)) => true,
            (DataType::Date, Value::Date(_)) => true,
            _ => false,
        }
    }

    /// Recover a Set member from its stored key.
    pub fn convert_db_value(&self, key: &str) -> Value {
        match self {
            DataType::Number => key.parse::<f64>().map(Value::Number).unwrap_or(Value::Null),
            DataType::Boolean => Value::Boolean(key == "true"),
            DataType::Date => Value::Date(key.to_string()),
            _ => Value::String(key.to_string()),
        }
    }

    fn resolve<'a>(&'a self, rest: &[PathSegment]) -> Option<&'a DataType> {
        if rest.is_empty() {
            return Some(self);
        }
        match self {
            DataType::Record(fields) => {
                let key = rest[0].as_key()?;
                fields.get(key)?.resolve(&rest[1..])
            }
            _ => None,
        }
    }
}

/// Attribute-type oracle consulted by validation and query planning.
pub trait SchemaResolver {
    fn attribute_type(&self, collection: &str, path: &AttributePath) -> Option<&DataType>;

    fn has_collection(&self, collection: &str) -> bool;

    /// Check one triple destined for `collection`. Tombstones always pass.
    fn validate_triple(
        &self,
        collection: &str,
        path: &AttributePath,
        value: &Value,
        expired: bool,
    ) -> Result<(), CoreError> {
        if expired {
            return Ok(());
        }
        if matches!(path.head_key(), Some(COLLECTION_ATTRIBUTE) | Some(ID_ATTRIBUTE)) && path.len() == 1 {
            return Ok(());
        }
        if !self.has_collection(collection) {
            return Err(validation(collection, path, "unknown collection"));
        }
        if let Some(data_type) = self.attribute_type(collection, path) {
            return match data_type {
                DataType::Set(_) => Err(validation(collection, path, "sets are written per member")),
                DataType::Query(_) => Err(validation(collection, path, "relations are not stored")),
                DataType::Record(_) if value.is_null() => Ok(()),
                DataType::Record(_) => Err(validation(collection, path, "expected record")),
                scalar if scalar.validate_value(value) => Ok(()),
                scalar => Err(validation(
                    collection,
                    path,
                    &format!("expected {}, got {}", scalar.type_name(), value.type_name()),
                )),
            };
        }
        // A set member slot holds a boolean flag.
        if let Some(parent) = path.parent()
            && let Some(DataType::Set(_)) = self.attribute_type(collection, &parent)
        {
            return if matches!(value, Value::Boolean(_)) {
                Ok(())
            } else {
                Err(validation(collection, path, "set member flag must be boolean"))
            };
        }
        Err(validation(collection, path, "attribute not in schema"))
    }
}

fn validation(collection: &str, path: &AttributePath, message: &str) -> CoreError {
    CoreError::Validation {
        collection: collection.to_string(),
        path: path.to_dotted(),
        message: message.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub attributes: BTreeMap<String, DataType>,
}

/// In-memory schema: collection → attribute → type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    collections: BTreeMap<String, CollectionSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection<'a>(
        mut self,
        name: &str,
        attributes: impl IntoIterator<Item = (&'a str, DataType)>,
    ) -> Self {
        let attributes = attributes
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        self.collections
            .insert(name.to_string(), CollectionSchema { attributes });
        self
    }

    pub fn get_collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }
}

impl SchemaResolver for Schema {
    fn attribute_type(&self, collection: &str, path: &AttributePath) -> Option<&DataType> {
        let attrs = &self.collections.get(collection)?.attributes;
        let head = path.head_key()?;
        attrs.get(head)?.resolve(&path.segments()[1..])
    }

    fn has_collection(&self, collection: &str) -> bool {
        self.collections.contains_key(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new().collection(
            "todos",
            [
                ("title", DataType::String),
                ("done", DataType::Boolean),
                ("tags", DataType::set_of(DataType::String)),
                (
                    "meta",
                    DataType::Record(BTreeMap::from([("rank".to_string(), DataType::Number)])),
                ),
            ],
        )
    }

    #[test]
    fn resolves_nested_record_paths() {
        let s = schema();
        assert_eq!(
            s.attribute_type("todos", &AttributePath::parse("meta.rank")),
            Some(&DataType::Number)
        );
        assert!(s.attribute_type("todos", &AttributePath::parse("meta.nope")).is_none());
        assert!(s.attribute_type("users", &AttributePath::parse("title")).is_none());
        assert!(s.get_collection("todos").is_some_and(|c| c.attributes.contains_key("meta")));
    }

    #[test]
    fn validates_scalars_and_set_flags() {
        let s = schema();
        let title = AttributePath::parse("title");
        assert!(s.validate_triple("todos", &title, &Value::from("x"), false).is_ok());
        assert!(s.validate_triple("todos", &title, &Value::from(3), false).is_err());
        assert!(s.validate_triple("todos", &title, &Value::from(3), true).is_ok());

        let member = AttributePath::parse("tags.urgent");
        assert!(s.validate_triple("todos", &member, &Value::Boolean(true), false).is_ok());
        assert!(s.validate_triple("todos", &member, &Value::from("yes"), false).is_err());

        let unknown = AttributePath::parse("color");
        assert!(matches!(
            s.validate_triple("todos", &unknown, &Value::from("red"), false),
            Err(CoreError::Validation { .. })
        ));
    }

    #[test]
    fn set_items_convert_back_from_keys() {
        assert_eq!(DataType::Number.convert_db_value("2.5"), Value::Number(2.5));
        assert_eq!(DataType::String.convert_db_value("x"), Value::from("x"));
    }
}
