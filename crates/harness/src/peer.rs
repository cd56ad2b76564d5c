use std::path::Path;

use trinity_core::{AttributePath, Document, EntityId, Schema, Value};
use trinity_engine::{Database, DbConfig, EngineError, FetchOptions, Query};

/// One client: a database with a fixed client id.
pub struct TestPeer {
    pub name: String,
    pub db: Database,
}

impl TestPeer {
    pub fn new(name: &str) -> Result<Self, EngineError> {
        Self::open(name, DbConfig::memory())
    }

    pub fn with_schema(name: &str, schema: Schema) -> Result<Self, EngineError> {
        let mut peer = Self::new(name)?;
        peer.db = peer.db.with_schema(schema);
        Ok(peer)
    }

    /// Peer backed by a SQLite file.
    pub fn sqlite(name: &str, path: &Path) -> Result<Self, EngineError> {
        Self::open(name, DbConfig::sqlite(path))
    }

    fn open(name: &str, config: DbConfig) -> Result<Self, EngineError> {
        Ok(Self {
            name: name.to_string(),
            db: Database::open(config.with_client_id(name))?,
        })
    }

    /// Insert a record from `(field, value)` pairs.
    pub fn create_record(
        &mut self,
        collection: &str,
        id: &str,
        fields: Vec<(&str, Value)>,
    ) -> Result<EntityId, EngineError> {
        let mut pairs: Vec<(&str, Document)> = vec![("id", Document::from(Value::from(id)))];
        pairs.extend(fields.into_iter().map(|(k, v)| (k, Document::from(v))));
        self.db.insert(collection, Document::from_pairs(pairs))
    }

    pub fn set_field(
        &mut self,
        collection: &str,
        id: &str,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<(), EngineError> {
        let value = value.into();
        self.db.update(collection, id, |changes| {
            changes.set(field, value);
        })
    }

    pub fn delete_record(&mut self, collection: &str, id: &str) -> Result<(), EngineError> {
        self.db.delete(collection, id)
    }

    pub fn get_field(
        &mut self,
        collection: &str,
        id: &str,
        field: &str,
    ) -> Result<Option<Value>, EngineError> {
        Ok(self
            .db
            .fetch_by_id(collection, id)?
            .and_then(|doc| doc.get_value(&AttributePath::parse(field)).cloned()))
    }

    /// Local ids of `query`'s results, in result order.
    pub fn ids(&mut self, query: &Query) -> Result<Vec<String>, EngineError> {
        Ok(self.db.fetch(query, FetchOptions::default())?.local_ids())
    }
}
