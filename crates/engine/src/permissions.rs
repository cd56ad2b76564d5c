use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;
use trinity_core::{AttributePath, Entity, EntityId, Timestamp, Triple, Value};
use trinity_storage::{
    BeforeCommitHook, BeforeInsertHook, StorageError, StoreTransaction, TripleReader,
};

use crate::error::EngineError;
use crate::execution::SharedSchema;
use crate::query::WhereFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteOperation {
    Insert,
    Update,
    PostUpdate,
    Delete,
}

impl WriteOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteOperation::Insert => "insert",
            WriteOperation::Update => "update",
            WriteOperation::PostUpdate => "postUpdate",
            WriteOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write and read rules for collections.
///
/// `check_write` sees the entity as it stood before the write for `Update`
/// and `Delete`, and as it will stand after for `Insert` and `PostUpdate`.
pub trait PermissionHook {
    fn check_write(
        &self,
        tx: &dyn TripleReader,
        collection: &str,
        entity: &Entity,
        operation: WriteOperation,
    ) -> Result<(), EngineError>;

    /// Extra filters merged into every read of `collection`.
    fn read_filters(
        &self,
        _collection: &str,
        _session: &BTreeMap<String, Value>,
    ) -> Vec<WhereFilter> {
        Vec::new()
    }
}

/// Helper for rules: the standard denial error.
pub fn denied(collection: &str, entity: &EntityId, operation: WriteOperation) -> EngineError {
    EngineError::WritePermission {
        collection: collection.to_string(),
        entity: entity.to_string(),
        operation: operation.to_string(),
    }
}

/// Runs the permission hook over every entity a transaction touches.
pub(crate) struct PermissionCommitHook {
    pub hook: Arc<dyn PermissionHook>,
    pub skip: Arc<AtomicBool>,
}

impl BeforeCommitHook for PermissionCommitHook {
    fn before_commit(&mut self, tx: &mut StoreTransaction<'_>) -> Result<(), StorageError> {
        if self.skip.load(Ordering::Relaxed) {
            return Ok(());
        }
        let staged: BTreeSet<(EntityId, AttributePath, Timestamp)> = tx
            .inserts()
            .iter()
            .map(|t| (t.id.clone(), t.attribute.clone(), t.timestamp.clone()))
            .collect();
        let touched: BTreeSet<EntityId> = staged.iter().map(|(id, _, _)| id.clone()).collect();

        for id in touched {
            let all: Vec<Triple> = tx.find_by_entity(&id)?.collect();
            let before = Entity::from_triples(
                id.clone(),
                all.iter().filter(|t| {
                    !staged.contains(&(t.id.clone(), t.attribute.clone(), t.timestamp.clone()))
                }),
            );
            let after = Entity::from_triples(id.clone(), &all);
            let collection = id.collection();
            let reader: &dyn TripleReader = &*tx;
            let checks: Vec<(WriteOperation, &Entity)> = match (before.is_deleted(), after.is_deleted()) {
                (true, false) => vec![(WriteOperation::Insert, &after)],
                (false, true) => vec![(WriteOperation::Delete, &before)],
                (false, false) => vec![
                    (WriteOperation::Update, &before),
                    (WriteOperation::PostUpdate, &after),
                ],
                (true, true) => Vec::new(),
            };
            for (operation, entity) in checks {
                if let Err(err) = self.hook.check_write(reader, collection, entity, operation) {
                    debug!(entity = %id, %operation, "write rejected");
                    return Err(StorageError::rejected(err));
                }
            }
        }
        Ok(())
    }
}

/// Rejects staged triples the schema does not accept.
pub(crate) struct SchemaValidationHook {
    pub schema: SharedSchema,
}

impl BeforeInsertHook for SchemaValidationHook {
    fn before_insert(
        &mut self,
        triples: &[Triple],
        _tx: &StoreTransaction<'_>,
    ) -> Result<(), StorageError> {
        for triple in triples {
            self.schema.validate_triple(
                triple.id.collection(),
                &triple.attribute,
                &triple.value,
                triple.expired,
            )?;
        }
        Ok(())
    }
}
