pub mod clock;
pub mod error;
pub mod hooks;
pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod store;
pub mod traits;
pub mod transaction;

pub use clock::SharedClock;
pub use error::StorageError;
pub use hooks::{AfterCommitHook, BeforeCommitHook, BeforeInsertHook};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use store::{CommitSummary, ListenerId, ShardWrite, StorageScope, TripleStore, DEFAULT_SHARD};
pub use traits::*;
pub use transaction::StoreTransaction;
