use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;
use trinity_core::{AttributePath, ClientId, LogicalClock, Timestamp, Value};

use crate::error::StorageError;
use crate::hooks::{AfterCommitHook, BeforeCommitHook};
use crate::store::{CommitSummary, TripleStore};
use crate::traits::{MetadataWrite, TripleReader};
use crate::transaction::StoreTransaction;

/// Metadata entity holding clock state.
pub const METADATA_ENTITY: &str = "_metadata";

pub fn tick_path() -> AttributePath {
    AttributePath::parse("clock.tick")
}

pub fn client_path() -> AttributePath {
    AttributePath::parse("clock.clientId")
}

/// Clock shared between a store and its commit hooks.
#[derive(Debug, Clone)]
pub struct SharedClock(Arc<Mutex<LogicalClock>>);

impl SharedClock {
    pub fn new(clock: LogicalClock) -> Self {
        Self(Arc::new(Mutex::new(clock)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, LogicalClock>, StorageError> {
        self.0.lock().map_err(|_| StorageError::LockPoisoned)
    }

    pub fn snapshot(&self) -> Result<LogicalClock, StorageError> {
        Ok(self.lock()?.clone())
    }

    pub fn client_id(&self) -> Result<ClientId, StorageError> {
        Ok(self.lock()?.client_id().clone())
    }

    pub fn current_timestamp(&self) -> Result<Timestamp, StorageError> {
        Ok(self.lock()?.current_timestamp())
    }

    pub fn next_timestamp(&self) -> Result<Timestamp, StorageError> {
        Ok(self.lock()?.next_timestamp())
    }

    pub fn observe(&self, timestamp: &Timestamp) -> Result<bool, StorageError> {
        Ok(self.lock()?.observe(timestamp))
    }

    pub fn reset(&self, client_id: ClientId) -> Result<(), StorageError> {
        self.lock()?.reset(client_id);
        Ok(())
    }
}

fn clock_metadata(clock: &LogicalClock) -> Vec<MetadataWrite> {
    vec![
        MetadataWrite {
            entity: METADATA_ENTITY.to_string(),
            attribute: client_path(),
            value: Value::String(clock.client_id().as_str().to_string()),
        },
        MetadataWrite {
            entity: METADATA_ENTITY.to_string(),
            attribute: tick_path(),
            value: Value::Number(clock.tick() as f64),
        },
    ]
}

/// Bind a clock to `store`, restoring persisted state when present.
///
/// `client_id` overrides the persisted identity. With neither, a random id is
/// generated and persisted.
pub fn assign_to_store(
    store: &mut TripleStore,
    client_id: Option<ClientId>,
) -> Result<SharedClock, StorageError> {
    let persisted_client = store
        .read_metadata(METADATA_ENTITY, &client_path())?
        .and_then(|v| v.as_str().map(ClientId::new));
    let persisted_tick = store
        .read_metadata(METADATA_ENTITY, &tick_path())?
        .and_then(|v| v.as_number())
        .map(|n| n as u64)
        .unwrap_or(0);

    let client_id = client_id
        .or(persisted_client)
        .unwrap_or_else(ClientId::random);
    let clock = LogicalClock::with_tick(client_id, persisted_tick);
    debug!(client = %clock.client_id(), tick = clock.tick(), "clock assigned");
    store.write_metadata(clock_metadata(&clock))?;

    let shared = SharedClock::new(clock);
    store.add_before_commit(Box::new(ClockHook(shared.clone())));
    store.add_after_commit(Box::new(ClockHook(shared.clone())));
    store.bind_clock(shared.clone());
    Ok(shared)
}

/// Persist a fresh identity after the store has been cleared.
pub(crate) fn reset_after_clear(
    store: &mut TripleStore,
    clock: &SharedClock,
) -> Result<(), StorageError> {
    let client_id = ClientId::random();
    clock.reset(client_id)?;
    let snapshot = clock.snapshot()?;
    debug!(client = %snapshot.client_id(), "clock reset after clear");
    store.write_metadata(clock_metadata(&snapshot))
}

struct ClockHook(SharedClock);

impl BeforeCommitHook for ClockHook {
    fn before_commit(&mut self, tx: &mut StoreTransaction<'_>) -> Result<(), StorageError> {
        let Some(max) = tx.inserts().iter().map(|t| t.timestamp.tick()).max() else {
            return Ok(());
        };
        if max > self.0.snapshot()?.tick() {
            tx.set_value(METADATA_ENTITY, tick_path(), Value::Number(max as f64));
        }
        Ok(())
    }
}

impl AfterCommitHook for ClockHook {
    fn after_commit(&mut self, commit: &CommitSummary) -> Result<(), StorageError> {
        if let Some(max) = commit.inserted().map(|t| &t.timestamp).max() {
            self.0.observe(max)?;
        }
        Ok(())
    }
}
