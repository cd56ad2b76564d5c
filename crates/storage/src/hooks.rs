use trinity_core::Triple;

use crate::error::StorageError;
use crate::store::CommitSummary;
use crate::transaction::StoreTransaction;

/// Runs before staged triples are committed. Used for validation.
pub trait BeforeInsertHook {
    fn before_insert(
        &mut self,
        triples: &[Triple],
        tx: &StoreTransaction<'_>,
    ) -> Result<(), StorageError>;
}

/// Runs once the transaction body has finished. May read and add writes.
pub trait BeforeCommitHook {
    fn before_commit(&mut self, tx: &mut StoreTransaction<'_>) -> Result<(), StorageError>;
}

/// Runs after the batch has been applied. Failures are logged, never propagated.
pub trait AfterCommitHook {
    fn after_commit(&mut self, commit: &CommitSummary) -> Result<(), StorageError>;
}

#[derive(Default)]
pub(crate) struct Hooks {
    pub before_insert: Vec<Box<dyn BeforeInsertHook>>,
    pub before_commit: Vec<Box<dyn BeforeCommitHook>>,
    pub after_commit: Vec<Box<dyn AfterCommitHook>>,
}
