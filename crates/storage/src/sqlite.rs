use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};
use tracing::error;

use trinity_core::{AttributePath, ClientId, EntityId, PathSegment, Timestamp, Triple, Value};

use crate::error::StorageError;
use crate::traits::{ScanDirection, TimestampOp, TripleIter, TripleStorage, ValueRange, WriteBatch};

/// Rows fetched per round trip of a paged scan.
const PAGE_SIZE: usize = 256;

/// Durable shard backed by one SQLite database.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn paged(
        &self,
        select: String,
        params: Vec<SqlValue>,
        keyset: Keyset,
    ) -> Result<PagedScan<'_>, StorageError> {
        PagedScan::start(&self.conn, select, params, keyset)
    }
}

/// Sort key of a paged scan and how to resume after a row.
struct Keyset {
    columns: &'static [&'static str],
    descending: bool,
    after: fn(&Triple) -> Vec<SqlValue>,
}

const EAT_KEYSET: Keyset = Keyset {
    columns: &["e.entity", "e.path_key", "e.tick", "e.client"],
    descending: false,
    after: |t| {
        vec![
            SqlValue::Text(t.id.as_str().to_string()),
            SqlValue::Text(path_key(&t.attribute)),
            SqlValue::Integer(t.timestamp.tick() as i64),
            SqlValue::Text(t.timestamp.client_id().as_str().to_string()),
        ]
    },
};

fn ave_keyset(direction: ScanDirection) -> Keyset {
    Keyset {
        columns: &[
            "a.value_rank",
            "a.value_num",
            "a.value_text",
            "a.entity",
            "a.tick",
            "a.client",
        ],
        descending: direction == ScanDirection::Desc,
        after: |t| {
            let mut key = value_params(&t.value).to_vec();
            key.push(SqlValue::Text(t.id.as_str().to_string()));
            key.push(SqlValue::Integer(t.timestamp.tick() as i64));
            key.push(SqlValue::Text(t.timestamp.client_id().as_str().to_string()));
            key
        },
    }
}

/// One client's writes: tick, then entity, then attribute.
const CLIENT_KEYSET: Keyset = Keyset {
    columns: &["c.tick", "c.entity", "e.path_key"],
    descending: false,
    after: |t| {
        vec![
            SqlValue::Integer(t.timestamp.tick() as i64),
            SqlValue::Text(t.id.as_str().to_string()),
            SqlValue::Text(path_key(&t.attribute)),
        ]
    },
};

/// Lazy scan reading `PAGE_SIZE` rows at a time, resuming after the last row
/// it returned. Dropping it stops further reads. The first page is read up
/// front so a bad query fails at the call site; a later page that fails is
/// logged and ends the scan.
struct PagedScan<'c> {
    conn: &'c Connection,
    select: String,
    params: Vec<SqlValue>,
    keyset: Keyset,
    page: std::vec::IntoIter<Triple>,
    last: Option<Vec<SqlValue>>,
    exhausted: bool,
}

impl<'c> PagedScan<'c> {
    /// `select` must end in a `WHERE` clause; paging appends to it.
    fn start(
        conn: &'c Connection,
        select: String,
        params: Vec<SqlValue>,
        keyset: Keyset,
    ) -> Result<Self, StorageError> {
        let mut scan = Self {
            conn,
            select,
            params,
            keyset,
            page: Vec::new().into_iter(),
            last: None,
            exhausted: false,
        };
        scan.fetch_page()?;
        Ok(scan)
    }

    fn fetch_page(&mut self) -> Result<(), StorageError> {
        let direction = if self.keyset.descending { " DESC" } else { "" };
        let mut sql = self.select.clone();
        let mut params = self.params.clone();
        if let Some(last) = &self.last {
            let op = if self.keyset.descending { "<" } else { ">" };
            let placeholders = vec!["?"; last.len()].join(", ");
            sql.push_str(&format!(
                " AND ({}) {op} ({placeholders})",
                self.keyset.columns.join(", ")
            ));
            params.extend(last.iter().cloned());
        }
        let order: Vec<String> = self
            .keyset
            .columns
            .iter()
            .map(|c| format!("{c}{direction}"))
            .collect();
        sql.push_str(&format!(" ORDER BY {} LIMIT {PAGE_SIZE}", order.join(", ")));

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), read_row)?;
        let mut page = Vec::with_capacity(PAGE_SIZE);
        for row in rows {
            page.push(decode_row(row?)?);
        }
        self.exhausted = page.len() < PAGE_SIZE;
        self.last = page.last().map(self.keyset.after);
        self.page = page.into_iter();
        Ok(())
    }
}

impl Iterator for PagedScan<'_> {
    type Item = Triple;

    fn next(&mut self) -> Option<Triple> {
        loop {
            if let Some(triple) = self.page.next() {
                return Some(triple);
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                error!(error = %e, "sqlite scan aborted");
                self.exhausted = true;
                return None;
            }
        }
    }
}

type RawTriple = (String, Vec<u8>, i64, String, Vec<u8>, bool);

const TRIPLE_COLUMNS: &str = "e.entity, e.attribute, e.tick, e.client, e.value, e.expired";

fn read_row(row: &rusqlite::Row) -> rusqlite::Result<RawTriple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_row(raw: RawTriple) -> Result<Triple, StorageError> {
    let (entity, attribute, tick, client, value, expired) = raw;
    Ok(Triple {
        id: EntityId::parse(&entity)?,
        attribute: decode_path(&attribute)?,
        value: decode_value(&value)?,
        timestamp: Timestamp::new(tick as u64, ClientId::new(client)),
        expired,
    })
}

fn encode_path(path: &AttributePath) -> Result<Vec<u8>, StorageError> {
    rmp_serde::to_vec(path).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub(crate) fn decode_path(bytes: &[u8]) -> Result<AttributePath, StorageError> {
    rmp_serde::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Text form of `path` whose binary order is `AttributePath` order. Each
/// segment is tagged (indices sort before keys), indices are zero-padded and
/// a 0x01 byte closes every segment, so a path sorts directly before its
/// descendants and they all share its key as a prefix.
pub(crate) fn path_key(path: &AttributePath) -> String {
    let mut key = String::new();
    for segment in path.segments() {
        match segment {
            PathSegment::Index(i) => {
                key.push('\u{2}');
                key.push_str(&format!("{i:020}"));
            }
            PathSegment::Key(k) => {
                key.push('\u{3}');
                key.push_str(k);
            }
        }
        key.push('\u{1}');
    }
    key
}

/// Half-open `path_key` range covering `prefix` and everything below it.
fn path_key_range(prefix: &AttributePath) -> Option<(String, String)> {
    let low = path_key(prefix);
    let mut high = low.strip_suffix('\u{1}')?.to_string();
    high.push('\u{2}');
    Some((low, high))
}

fn encode_value(value: &Value) -> Result<Vec<u8>, StorageError> {
    value
        .to_msgpack()
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_value(bytes: &[u8]) -> Result<Value, StorageError> {
    Value::from_msgpack(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Sortable columns for a value: `(rank, number, text)`.
fn value_columns(value: &Value) -> (i64, f64, String) {
    let rank = i64::from(value.rank());
    match value {
        Value::Null => (rank, 0.0, String::new()),
        Value::Boolean(b) => (rank, if *b { 1.0 } else { 0.0 }, String::new()),
        Value::Number(n) => (rank, *n, String::new()),
        Value::Date(s) | Value::String(s) => (rank, 0.0, s.clone()),
    }
}

fn value_params(value: &Value) -> [SqlValue; 3] {
    let (rank, num, text) = value_columns(value);
    [
        SqlValue::Integer(rank),
        SqlValue::Real(num),
        SqlValue::Text(text),
    ]
}

fn insert_triple(tx: &rusqlite::Transaction, triple: &Triple) -> Result<(), StorageError> {
    let attribute = encode_path(&triple.attribute)?;
    tx.execute(
        "INSERT OR REPLACE INTO eat (entity, attribute, tick, client, value, expired, path_key) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            triple.id.as_str(),
            &attribute,
            triple.timestamp.tick() as i64,
            triple.timestamp.client_id().as_str(),
            encode_value(&triple.value)?,
            triple.expired,
            path_key(&triple.attribute),
        ],
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO client_ts (client, tick, entity, attribute) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            triple.timestamp.client_id().as_str(),
            triple.timestamp.tick() as i64,
            triple.id.as_str(),
            &attribute,
        ],
    )?;
    reindex_ave(tx, triple.id.as_str(), &attribute)
}

fn delete_triple(tx: &rusqlite::Transaction, triple: &Triple) -> Result<(), StorageError> {
    let attribute = encode_path(&triple.attribute)?;
    let params = rusqlite::params![
        triple.id.as_str(),
        &attribute,
        triple.timestamp.tick() as i64,
        triple.timestamp.client_id().as_str(),
    ];
    tx.execute(
        "DELETE FROM eat WHERE entity = ?1 AND attribute = ?2 AND tick = ?3 AND client = ?4",
        params,
    )?;
    tx.execute(
        "DELETE FROM client_ts WHERE entity = ?1 AND attribute = ?2 AND tick = ?3 AND client = ?4",
        params,
    )?;
    reindex_ave(tx, triple.id.as_str(), &attribute)
}

/// Point the AVE row for `(entity, attribute)` at the latest live EAT row, or drop it.
fn reindex_ave(
    tx: &rusqlite::Transaction,
    entity: &str,
    attribute: &[u8],
) -> Result<(), StorageError> {
    tx.execute(
        "DELETE FROM ave WHERE attribute = ?1 AND entity = ?2",
        rusqlite::params![attribute, entity],
    )?;
    let latest: Option<(i64, String, Vec<u8>, bool)> = tx
        .query_row(
            "SELECT tick, client, value, expired FROM eat WHERE entity = ?1 AND attribute = ?2 ORDER BY tick DESC, client DESC LIMIT 1",
            rusqlite::params![entity, attribute],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    if let Some((tick, client, value, false)) = latest {
        let (rank, num, text) = value_columns(&decode_value(&value)?);
        tx.execute(
            "INSERT INTO ave (attribute, entity, value_rank, value_num, value_text, tick, client) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![attribute, entity, rank, num, text, tick, client],
        )?;
    }
    Ok(())
}

const AVE_JOIN: &str = "FROM ave a JOIN eat e ON e.entity = a.entity AND e.attribute = a.attribute AND e.tick = a.tick AND e.client = a.client";

impl TripleStorage for SqliteStorage {
    fn apply(&mut self, batch: &WriteBatch) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        for triple in &batch.deletes {
            delete_triple(&tx, triple)?;
        }
        for triple in &batch.inserts {
            insert_triple(&tx, triple)?;
        }
        for write in &batch.metadata {
            tx.execute(
                "INSERT OR REPLACE INTO metadata (entity, attribute, value) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    write.entity,
                    encode_path(&write.attribute)?,
                    encode_value(&write.value)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn scan_eat(
        &self,
        entity: Option<&EntityId>,
        attribute: Option<&AttributePath>,
    ) -> Result<TripleIter<'_>, StorageError> {
        let mut sql = format!("SELECT {TRIPLE_COLUMNS} FROM eat e WHERE 1");
        let mut params = Vec::new();
        if let Some(id) = entity {
            sql.push_str(" AND e.entity = ?");
            params.push(SqlValue::Text(id.as_str().to_string()));
        }
        if let Some((low, high)) = attribute.and_then(path_key_range) {
            sql.push_str(" AND e.path_key >= ? AND e.path_key < ?");
            params.push(SqlValue::Text(low));
            params.push(SqlValue::Text(high));
        }
        Ok(Box::new(self.paged(sql, params, EAT_KEYSET)?))
    }

    fn scan_ave(
        &self,
        attribute: &AttributePath,
        value: Option<&Value>,
        entity: Option<&EntityId>,
        direction: ScanDirection,
    ) -> Result<TripleIter<'_>, StorageError> {
        let mut sql = format!("SELECT {TRIPLE_COLUMNS} {AVE_JOIN} WHERE a.attribute = ?");
        let mut params = vec![SqlValue::Blob(encode_path(attribute)?)];
        if let Some(value) = value {
            sql.push_str(" AND a.value_rank = ? AND a.value_num = ? AND a.value_text = ?");
            params.extend(value_params(value));
        }
        if let Some(id) = entity {
            sql.push_str(" AND a.entity = ?");
            params.push(SqlValue::Text(id.as_str().to_string()));
        }
        Ok(Box::new(self.paged(sql, params, ave_keyset(direction))?))
    }

    fn scan_value_range(
        &self,
        attribute: &AttributePath,
        range: &ValueRange,
    ) -> Result<TripleIter<'_>, StorageError> {
        if range.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        let mut sql = format!("SELECT {TRIPLE_COLUMNS} {AVE_JOIN} WHERE a.attribute = ?");
        let mut params = vec![SqlValue::Blob(encode_path(attribute)?)];
        let bounds = [
            (&range.gt, ">"),
            (&range.gte, ">="),
            (&range.lt, "<"),
            (&range.lte, "<="),
        ];
        for (bound, op) in bounds {
            if let Some(value) = bound {
                sql.push_str(&format!(
                    " AND (a.value_rank, a.value_num, a.value_text) {op} (?, ?, ?) AND a.value_rank = ?"
                ));
                params.extend(value_params(value));
                params.push(SqlValue::Integer(i64::from(value.rank())));
            }
        }
        let filter = range.clone();
        let scan = self.paged(sql, params, ave_keyset(range.direction))?;
        Ok(Box::new(scan.filter(move |t| filter.contains(&t.value))))
    }

    fn scan_client_timestamp(
        &self,
        client: &ClientId,
        op: TimestampOp,
        tick: u64,
    ) -> Result<TripleIter<'_>, StorageError> {
        let cmp = match op {
            TimestampOp::Lt => "<",
            TimestampOp::Lte => "<=",
            TimestampOp::Gt => ">",
            TimestampOp::Gte => ">=",
            TimestampOp::Eq => "=",
        };
        let sql = format!(
            "SELECT {TRIPLE_COLUMNS} FROM client_ts c JOIN eat e ON e.entity = c.entity AND e.attribute = c.attribute AND e.tick = c.tick AND e.client = c.client WHERE c.client = ? AND c.tick {cmp} ?"
        );
        let params = vec![
            SqlValue::Text(client.as_str().to_string()),
            SqlValue::Integer(tick as i64),
        ];
        Ok(Box::new(self.paged(sql, params, CLIENT_KEYSET)?))
    }

    fn client_ids(&self) -> Result<Vec<ClientId>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT client FROM client_ts ORDER BY client")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|r| r.map(ClientId::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn get_metadata(
        &self,
        entity: &str,
        attribute: &AttributePath,
    ) -> Result<Option<Value>, StorageError> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE entity = ?1 AND attribute = ?2",
                rusqlite::params![entity, encode_path(attribute)?],
                |row| row.get(0),
            )
            .optional()?;
        bytes.map(|b| decode_value(&b)).transpose()
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "DELETE FROM eat; DELETE FROM ave; DELETE FROM client_ts; DELETE FROM metadata;",
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MetadataWrite;

    fn ts(tick: u64, client: &str) -> Timestamp {
        Timestamp::new(tick, ClientId::new(client))
    }

    fn insert(store: &mut SqliteStorage, triples: Vec<Triple>) {
        store
            .apply(&WriteBatch {
                inserts: triples,
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.db");
        let path = path.to_str().unwrap();
        let id = EntityId::new("todos", "1");
        {
            let mut store = SqliteStorage::open(path).unwrap();
            insert(
                &mut store,
                vec![Triple::new(
                    id.clone(),
                    AttributePath::parse("title"),
                    Value::from("write tests"),
                    ts(1, "alice"),
                )],
            );
            store
                .apply(&WriteBatch {
                    metadata: vec![MetadataWrite {
                        entity: "_metadata".into(),
                        attribute: AttributePath::parse("clock.tick"),
                        value: Value::from(1),
                    }],
                    ..Default::default()
                })
                .unwrap();
        }
        let store = SqliteStorage::open(path).unwrap();
        let triples: Vec<_> = store.scan_eat(Some(&id), None).unwrap().collect();
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].value, Value::from("write tests"));
        assert_eq!(
            store
                .get_metadata("_metadata", &AttributePath::parse("clock.tick"))
                .unwrap(),
            Some(Value::from(1))
        );
    }

    #[test]
    fn ave_follows_latest_write() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let id = EntityId::new("scores", "a");
        let attr = AttributePath::parse("score");
        insert(
            &mut store,
            vec![
                Triple::new(id.clone(), attr.clone(), Value::from(100), ts(2, "c")),
                Triple::new(id.clone(), attr.clone(), Value::from(10), ts(1, "c")),
            ],
        );
        let values: Vec<_> = store
            .scan_ave(&attr, None, None, ScanDirection::Asc)
            .unwrap()
            .map(|t| t.value)
            .collect();
        assert_eq!(values, vec![Value::from(100)]);

        insert(
            &mut store,
            vec![Triple::tombstone(id.clone(), attr.clone(), ts(3, "c"))],
        );
        assert_eq!(
            store
                .scan_ave(&attr, None, None, ScanDirection::Asc)
                .unwrap()
                .count(),
            0
        );
    }

    #[test]
    fn range_scan_orders_by_value() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let attr = AttributePath::parse("score");
        let mut triples = Vec::new();
        for (i, score) in [95, 70, 85, 90, 80].into_iter().enumerate() {
            let id = EntityId::new("scores", &format!("s{i}"));
            triples.push(Triple::new(id, attr.clone(), Value::from(score), ts(1, "c")));
        }
        insert(&mut store, triples);

        let range = ValueRange {
            gt: Some(Value::from(80)),
            lte: Some(Value::from(90)),
            direction: ScanDirection::Desc,
            ..Default::default()
        };
        let values: Vec<_> = store
            .scan_value_range(&attr, &range)
            .unwrap()
            .map(|t| t.value)
            .collect();
        assert_eq!(values, vec![Value::from(90), Value::from(85)]);
    }

    #[test]
    fn path_keys_sort_like_paths() {
        let paths = ["a", "a.b", "a.b.c", "a.bb", "ab", "items.2", "items.10", "items.x"];
        let mut by_key: Vec<AttributePath> = paths.iter().map(|p| AttributePath::parse(p)).collect();
        let mut by_path = by_key.clone();
        by_key.sort_by_key(path_key);
        by_path.sort();
        assert_eq!(by_key, by_path);
    }

    #[test]
    fn attribute_prefix_scan_stays_in_sql() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let id = EntityId::new("todos", "1");
        let triples = ["author", "author.name", "author.age", "authored", "title"]
            .into_iter()
            .map(|p| Triple::new(id.clone(), AttributePath::parse(p), Value::from(1), ts(1, "c")))
            .collect();
        insert(&mut store, triples);

        let got: Vec<String> = store
            .scan_eat(Some(&id), Some(&AttributePath::parse("author")))
            .unwrap()
            .map(|t| t.attribute.to_dotted())
            .collect();
        assert_eq!(got, vec!["author", "author.age", "author.name"]);

        let everywhere = store
            .scan_eat(None, Some(&AttributePath::parse("author.name")))
            .unwrap()
            .count();
        assert_eq!(everywhere, 1);
    }

    #[test]
    fn scans_page_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.db");
        let path = path.to_str().unwrap();
        let mut writer = SqliteStorage::open(path).unwrap();
        let title = AttributePath::parse("title");
        let rows = |from: usize, to: usize| -> Vec<Triple> {
            (from..to)
                .map(|i| {
                    let id = EntityId::new("todos", &format!("{i:04}"));
                    Triple::new(id, title.clone(), Value::from(i as i64), ts(1, "c"))
                })
                .collect()
        };
        insert(&mut writer, rows(0, PAGE_SIZE + 44));

        let reader = SqliteStorage::open(path).unwrap();
        let mut scan = reader.scan_eat(None, None).unwrap();
        assert_eq!(scan.next().map(|t| t.id.local_id().to_string()), Some("0000".to_string()));

        // Rows past the first page are read only when the scan gets there.
        insert(&mut writer, rows(9000, 9001));
        let rest: Vec<Triple> = scan.collect();
        assert_eq!(rest.len(), PAGE_SIZE + 44);
        assert_eq!(rest.last().map(|t| t.id.local_id()), Some("9000"));
        assert!(rest.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn descending_value_scan_crosses_pages() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let attr = AttributePath::parse("score");
        let triples = (0..PAGE_SIZE * 2 + 3)
            .map(|i| {
                let id = EntityId::new("scores", &format!("s{i}"));
                Triple::new(id, attr.clone(), Value::from((i % 7) as i64), ts(1, "c"))
            })
            .collect();
        insert(&mut store, triples);

        let scores: Vec<Triple> = store
            .scan_ave(&attr, None, None, ScanDirection::Desc)
            .unwrap()
            .collect();
        assert_eq!(scores.len(), PAGE_SIZE * 2 + 3);
        assert!(scores.windows(2).all(|w| (&w[0].value, &w[0].id) > (&w[1].value, &w[1].id)));
    }

    #[test]
    fn clear_empties_every_index() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let id = EntityId::new("todos", "1");
        insert(
            &mut store,
            vec![Triple::new(
                id,
                AttributePath::parse("title"),
                Value::from("x"),
                ts(1, "c"),
            )],
        );
        store.clear().unwrap();
        assert_eq!(store.scan_eat(None, None).unwrap().count(), 0);
        assert!(store.client_ids().unwrap().is_empty());
    }
}
