use rusqlite::Connection;
use tracing::info;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 2;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    migrate(conn)?;
    conn.execute_batch(INDEX_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, unixepoch())",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

/// Version 1 files predate `eat.path_key`: add it and fill it from the encoded paths.
fn migrate(conn: &Connection) -> Result<(), StorageError> {
    let has_path_key = conn
        .prepare("SELECT 1 FROM pragma_table_info('eat') WHERE name = 'path_key'")?
        .exists([])?;
    if has_path_key {
        return Ok(());
    }
    conn.execute_batch("ALTER TABLE eat ADD COLUMN path_key TEXT NOT NULL DEFAULT ''")?;
    let attributes: Vec<Vec<u8>> = conn
        .prepare("SELECT DISTINCT attribute FROM eat")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    for attribute in &attributes {
        let key = crate::sqlite::path_key(&crate::sqlite::decode_path(attribute)?);
        conn.execute(
            "UPDATE eat SET path_key = ?1 WHERE attribute = ?2",
            rusqlite::params![key, attribute],
        )?;
    }
    info!(attributes = attributes.len(), "sqlite shard migrated to path keys");
    Ok(())
}

// Attributes are stored as msgpack-encoded paths, with `path_key` as their
// sortable text form. Values keep the msgpack blob
// alongside rank/number/text columns so value comparisons can run in SQL.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS eat (
    entity TEXT NOT NULL,
    attribute BLOB NOT NULL,
    tick INTEGER NOT NULL,
    client TEXT NOT NULL,
    value BLOB NOT NULL,
    expired INTEGER NOT NULL DEFAULT 0,
    path_key TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (entity, attribute, tick, client)
);

CREATE TABLE IF NOT EXISTS ave (
    attribute BLOB NOT NULL,
    entity TEXT NOT NULL,
    value_rank INTEGER NOT NULL,
    value_num REAL NOT NULL,
    value_text TEXT NOT NULL,
    tick INTEGER NOT NULL,
    client TEXT NOT NULL,
    PRIMARY KEY (attribute, entity)
);
CREATE INDEX IF NOT EXISTS idx_ave_value ON ave (attribute, value_rank, value_num, value_text, entity);

CREATE TABLE IF NOT EXISTS client_ts (
    client TEXT NOT NULL,
    tick INTEGER NOT NULL,
    entity TEXT NOT NULL,
    attribute BLOB NOT NULL,
    PRIMARY KEY (client, tick, entity, attribute)
);

CREATE TABLE IF NOT EXISTS metadata (
    entity TEXT NOT NULL,
    attribute BLOB NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (entity, attribute)
);
";

const INDEX_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_eat_path ON eat (entity, path_key, tick, client);
CREATE INDEX IF NOT EXISTS idx_eat_path_only ON eat (path_key, entity);
";
