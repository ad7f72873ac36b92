// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite-backed storage.
//!
//! The [`SqliteStore`] persists documents, oplog, snapshot boundaries and
//! remote peers in a single database file. Comparison and boolean queries
//! are pushed down to SQL via `json_extract`; containment queries fall back
//! to in-memory evaluation because SQLite cannot express them uniformly.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use crate::config::{PeerType, RemotePeerConfiguration};
use crate::document::{Document, DocumentMetadata};
use crate::error::{Error, Result};
use crate::hlc::Hlc;
use crate::oplog::{OpKind, OplogEntry, SnapshotMetadata};
use crate::query::Query;
use crate::resolver::{fold_entries, LwwResolver};
use crate::store::{
    merge_cache_sources, sort_and_page, EventHub, FindOptions, NodeCache, Store, StoreEvent,
};
use crate::vclock::VectorClock;

/// SQL schema for the document store.
pub const SCHEMA: &str = r#"
-- User-visible documents; tombstones keep the row with is_deleted = 1
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    key TEXT NOT NULL,
    content TEXT,
    updated_at TEXT NOT NULL,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (collection, key)
);

-- Sync bookkeeping, separate from the application record
CREATE TABLE IF NOT EXISTS doc_meta (
    collection TEXT NOT NULL,
    key TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (collection, key)
);

-- Hash-chained operation log
CREATE TABLE IF NOT EXISTS oplog (
    hash TEXT PRIMARY KEY,
    collection TEXT NOT NULL,
    key TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT,
    physical_ms INTEGER NOT NULL,
    logical INTEGER NOT NULL,
    node_id TEXT NOT NULL,
    previous_hash TEXT NOT NULL
);

-- Last-truncated entry per node (virtual entry zero)
CREATE TABLE IF NOT EXISTS snapshot_meta (
    node_id TEXT PRIMARY KEY,
    physical_ms INTEGER NOT NULL,
    logical INTEGER NOT NULL,
    hash TEXT NOT NULL
);

-- Configured remote peers
CREATE TABLE IF NOT EXISTS remote_peers (
    node_id TEXT PRIMARY KEY,
    address TEXT NOT NULL,
    peer_type TEXT NOT NULL,
    auth_token TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    collections TEXT
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
CREATE INDEX IF NOT EXISTS idx_oplog_time ON oplog(physical_ms, logical, node_id);
CREATE INDEX IF NOT EXISTS idx_oplog_node_time ON oplog(node_id, physical_ms, logical);
"#;

/// Run schema creation and migrations on a database connection.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Parse a string value from the database, returning a rusqlite error on
/// parse failure.
fn parse_db<T: std::str::FromStr>(
    value: &str,
    column: &str,
) -> std::result::Result<T, rusqlite::Error> {
    value.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(Error::CorruptStore(format!(
                "invalid value '{value}' in column '{column}'"
            ))),
        )
    })
}

fn parse_json_opt(
    value: Option<String>,
    column: &str,
) -> std::result::Result<Option<serde_json::Value>, rusqlite::Error> {
    match value {
        None => Ok(None),
        Some(text) => serde_json::from_str(&text).map(Some).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(Error::CorruptStore(format!("invalid JSON in column '{column}'"))),
            )
        }),
    }
}

fn row_to_document(row: &rusqlite::Row<'_>) -> std::result::Result<Document, rusqlite::Error> {
    let updated_at: String = row.get("updated_at")?;
    Ok(Document {
        collection: row.get("collection")?,
        key: row.get("key")?,
        content: parse_json_opt(row.get("content")?, "content")?,
        updated_at: parse_db(&updated_at, "updated_at")?,
        is_deleted: row.get("is_deleted")?,
    })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> std::result::Result<OplogEntry, rusqlite::Error> {
    let kind: String = row.get("kind")?;
    let kind = match kind.as_str() {
        "put" => OpKind::Put,
        "delete" => OpKind::Delete,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(Error::CorruptStore(format!("invalid op kind '{other}'"))),
            ))
        }
    };
    Ok(OplogEntry {
        collection: row.get("collection")?,
        key: row.get("key")?,
        kind,
        payload: parse_json_opt(row.get("payload")?, "payload")?,
        timestamp: Hlc::new(row.get("physical_ms")?, row.get("logical")?, {
            let node: String = row.get("node_id")?;
            node
        }),
        previous_hash: row.get("previous_hash")?,
        hash: row.get("hash")?,
    })
}

const ENTRY_COLUMNS: &str =
    "hash, collection, key, kind, payload, physical_ms, logical, node_id, previous_hash";

/// Escapes a dotted property path into a JSON path expression.
fn json_path(property_path: &str) -> String {
    let mut out = String::from("$");
    for segment in property_path.split('.') {
        out.push_str(".\"");
        out.push_str(&segment.replace('"', ""));
        out.push('"');
    }
    out
}

/// Translates a query into a SQL predicate over `json_extract`.
///
/// Returns None when the query contains an operator SQLite cannot express
/// (containment); the caller falls back to an in-memory scan.
fn translate_query(query: &Query, params: &mut Vec<SqlValue>) -> Option<String> {
    fn value_param(value: &serde_json::Value, params: &mut Vec<SqlValue>) -> Option<()> {
        match value {
            serde_json::Value::String(s) => params.push(SqlValue::Text(s.clone())),
            serde_json::Value::Bool(b) => params.push(SqlValue::Integer(i64::from(*b))),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    params.push(SqlValue::Integer(i));
                } else {
                    params.push(SqlValue::Real(n.as_f64()?));
                }
            }
            _ => return None,
        }
        Some(())
    }

    fn comparison(
        op: &str,
        path: &str,
        value: &serde_json::Value,
        params: &mut Vec<SqlValue>,
    ) -> Option<String> {
        let extract = format!("json_extract(content, '{}')", json_path(path));
        if value.is_null() {
            return match op {
                "=" => Some(format!("{extract} IS NULL")),
                "!=" => Some(format!("{extract} IS NOT NULL")),
                _ => None,
            };
        }
        value_param(value, params)?;
        if op == "!=" {
            // Missing fields count as "not equal", matching in-memory
            // evaluation where absent values never equal anything.
            let extract2 = extract.clone();
            return Some(format!("({extract} IS NULL OR {extract2} != ?)"));
        }
        Some(format!("{extract} {op} ?"))
    }

    match query {
        Query::And { clauses } | Query::Or { clauses } => {
            if clauses.is_empty() {
                return Some(
                    if matches!(query, Query::And { .. }) { "1=1" } else { "1=0" }.to_string(),
                );
            }
            let glue = if matches!(query, Query::And { .. }) { " AND " } else { " OR " };
            let parts: Option<Vec<String>> =
                clauses.iter().map(|c| translate_query(c, params)).collect();
            Some(format!("({})", parts?.join(glue)))
        }
        Query::Eq { path, value } => comparison("=", path, value, params),
        Query::Neq { path, value } => comparison("!=", path, value, params),
        Query::Gt { path, value } => comparison(">", path, value, params),
        Query::Gte { path, value } => comparison(">=", path, value, params),
        Query::Lt { path, value } => comparison("<", path, value, params),
        Query::Lte { path, value } => comparison("<=", path, value, params),
        Query::Contains { .. } => None,
    }
}

/// A [`Store`] persisted in a SQLite database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    cache: NodeCache,
    events: EventHub,
}

impl SqliteStore {
    /// Opens or creates a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        run_migrations(&conn)?;
        Ok(SqliteStore { conn: Mutex::new(conn), cache: NodeCache::new(), events: EventHub::new() })
    }

    /// Opens an in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(SqliteStore { conn: Mutex::new(conn), cache: NodeCache::new(), events: EventHub::new() })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cache_contents(conn: &Connection) -> Result<HashMap<String, (Hlc, String)>> {
        let mut tips: HashMap<String, (Hlc, String)> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT node_id, physical_ms, logical, hash FROM oplog
                 ORDER BY physical_ms, logical",
            )?;
            let rows = stmt.query_map([], |row| {
                let node: String = row.get(0)?;
                let physical: i64 = row.get(1)?;
                let logical: i32 = row.get(2)?;
                let hash: String = row.get(3)?;
                Ok((node, physical, logical, hash))
            })?;
            for row in rows {
                let (node, physical, logical, hash) = row?;
                tips.insert(node.clone(), (Hlc::new(physical, logical, node), hash));
            }
        }

        let boundaries = {
            let mut stmt =
                conn.prepare("SELECT node_id, physical_ms, logical, hash FROM snapshot_meta")?;
            let rows = stmt.query_map([], |row| {
                Ok(SnapshotMetadata {
                    node_id: row.get(0)?,
                    physical_ms: row.get(1)?,
                    logical: row.get(2)?,
                    hash: row.get(3)?,
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        Ok(merge_cache_sources(tips, boundaries))
    }

    fn scan_collection(
        conn: &Connection,
        collection: &str,
        include_deleted: bool,
    ) -> Result<Vec<Document>> {
        let sql = if include_deleted {
            "SELECT collection, key, content, updated_at, is_deleted FROM documents
             WHERE collection = ?1"
        } else {
            "SELECT collection, key, content, updated_at, is_deleted FROM documents
             WHERE collection = ?1 AND is_deleted = 0"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![collection], row_to_document)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

fn get_document_conn(conn: &Connection, collection: &str, key: &str) -> Result<Option<Document>> {
    Ok(conn
        .query_row(
            "SELECT collection, key, content, updated_at, is_deleted FROM documents
             WHERE collection = ?1 AND key = ?2",
            params![collection, key],
            row_to_document,
        )
        .optional()?)
}

fn save_document_conn(conn: &Connection, doc: &Document) -> Result<()> {
    let content = doc.content.as_ref().map(|v| v.to_string());
    conn.execute(
        "INSERT INTO documents (collection, key, content, updated_at, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (collection, key) DO UPDATE SET
             content = excluded.content,
             updated_at = excluded.updated_at,
             is_deleted = excluded.is_deleted",
        params![doc.collection, doc.key, content, doc.updated_at.canonical(), doc.is_deleted],
    )?;
    Ok(())
}

fn upsert_meta_conn(conn: &Connection, meta: &DocumentMetadata) -> Result<()> {
    conn.execute(
        "INSERT INTO doc_meta (collection, key, updated_at, is_deleted)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (collection, key) DO UPDATE SET
             updated_at = excluded.updated_at,
             is_deleted = excluded.is_deleted",
        params![meta.collection, meta.key, meta.updated_at.canonical(), meta.is_deleted],
    )?;
    Ok(())
}

/// Inserts an entry, ignoring duplicates by hash. Returns true if new.
fn insert_entry_conn(conn: &Connection, entry: &OplogEntry) -> Result<bool> {
    let payload = entry.payload.as_ref().map(|v| v.to_string());
    let changed = conn.execute(
        "INSERT OR IGNORE INTO oplog
             (hash, collection, key, kind, payload, physical_ms, logical, node_id, previous_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.hash,
            entry.collection,
            entry.key,
            entry.kind.as_str(),
            payload,
            entry.timestamp.physical_ms,
            entry.timestamp.logical,
            entry.timestamp.node_id,
            entry.previous_hash,
        ],
    )?;
    Ok(changed > 0)
}

impl Store for SqliteStore {
    fn save_document(&self, doc: &Document) -> Result<()> {
        let event = {
            let conn = self.lock();
            let previous = get_document_conn(&conn, &doc.collection, &doc.key)?;
            save_document_conn(&conn, doc)?;

            if doc.is_deleted {
                StoreEvent::DocumentsDeleted {
                    collection: doc.collection.clone(),
                    keys: vec![doc.key.clone()],
                }
            } else if previous.is_some_and(|p| !p.is_deleted) {
                StoreEvent::DocumentsUpdated {
                    collection: doc.collection.clone(),
                    documents: vec![doc.clone()],
                }
            } else {
                StoreEvent::DocumentsInserted {
                    collection: doc.collection.clone(),
                    documents: vec![doc.clone()],
                }
            }
        };
        self.events.publish(event);
        Ok(())
    }

    fn get_document(&self, collection: &str, key: &str) -> Result<Option<Document>> {
        get_document_conn(&self.lock(), collection, key)
    }

    fn query_documents(
        &self,
        collection: &str,
        query: Option<&Query>,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        let conn = self.lock();

        let translated = match query {
            None => Some((None, Vec::new())),
            Some(q) => {
                let mut params = Vec::new();
                translate_query(q, &mut params).map(|sql| (Some(sql), params))
            }
        };

        let Some((predicate, extra_params)) = translated else {
            // Containment cannot be pushed into SQL; evaluate in memory.
            debug!(collection, "query not translatable to SQL, scanning in memory");
            let docs = Self::scan_collection(&conn, collection, false)?
                .into_iter()
                .filter(|doc| match (&query, &doc.content) {
                    (Some(q), Some(content)) => q.matches(content),
                    (Some(_), None) => false,
                    (None, _) => true,
                })
                .collect();
            return Ok(sort_and_page(docs, options));
        };

        let mut sql = String::from(
            "SELECT collection, key, content, updated_at, is_deleted FROM documents
             WHERE collection = ? AND is_deleted = 0",
        );
        let mut params: Vec<SqlValue> = vec![SqlValue::Text(collection.to_string())];
        if let Some(predicate) = predicate {
            sql.push_str(" AND ");
            sql.push_str(&predicate);
            params.extend(extra_params);
        }
        if let Some(path) = &options.order_by {
            let extract = format!("json_extract(content, '{}')", json_path(path));
            let direction = if options.ascending { "ASC" } else { "DESC" };
            // Missing values sort last in either direction
            sql.push_str(&format!(" ORDER BY {extract} IS NULL, {extract} {direction}"));
        }
        let take = options.take.map(|n| n as i64).unwrap_or(-1);
        sql.push_str(&format!(" LIMIT {take} OFFSET {}", options.skip));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), row_to_document)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn count_documents(&self, collection: &str, query: Option<&Query>) -> Result<usize> {
        let conn = self.lock();

        if let Some(q) = query {
            let mut params = Vec::new();
            if let Some(predicate) = translate_query(q, &mut params) {
                let sql = format!(
                    "SELECT COUNT(*) FROM documents
                     WHERE collection = ? AND is_deleted = 0 AND {predicate}"
                );
                let mut all_params = vec![SqlValue::Text(collection.to_string())];
                all_params.extend(params);
                let count: i64 =
                    conn.query_row(&sql, params_from_iter(all_params), |row| row.get(0))?;
                return Ok(count as usize);
            }
            let docs = Self::scan_collection(&conn, collection, false)?;
            return Ok(docs
                .iter()
                .filter(|doc| doc.content.as_ref().is_some_and(|c| q.matches(c)))
                .count());
        }

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1 AND is_deleted = 0",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn ensure_index(&self, collection: &str, property_path: &str) -> Result<()> {
        let safe: String = property_path
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let safe_collection: String = collection
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS idx_doc_{safe_collection}_{safe}
             ON documents(collection, json_extract(content, '{}'))",
            json_path(property_path)
        );
        self.lock().execute(&sql, [])?;
        Ok(())
    }

    fn collections(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT collection FROM documents ORDER BY collection")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn all_documents(&self) -> Result<Vec<Document>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT collection, key, content, updated_at, is_deleted FROM documents
             ORDER BY collection, key",
        )?;
        let rows = stmt.query_map([], row_to_document)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn import_documents(&self, docs: &[Document]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut applied = 0;
        for doc in docs {
            let keep_local = get_document_conn(&tx, &doc.collection, &doc.key)?
                .is_some_and(|local| local.updated_at >= doc.updated_at);
            if keep_local {
                continue;
            }
            save_document_conn(&tx, doc)?;
            upsert_meta_conn(&tx, &DocumentMetadata::of(doc))?;
            applied += 1;
        }
        tx.commit()?;
        Ok(applied)
    }

    fn document_metadata(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<DocumentMetadata>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT collection, key, updated_at, is_deleted FROM doc_meta
                 WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |row| {
                    let updated_at: String = row.get("updated_at")?;
                    Ok(DocumentMetadata {
                        collection: row.get("collection")?,
                        key: row.get("key")?,
                        updated_at: parse_db(&updated_at, "updated_at")?,
                        is_deleted: row.get("is_deleted")?,
                    })
                },
            )
            .optional()?)
    }

    fn upsert_document_metadata(&self, meta: &DocumentMetadata) -> Result<()> {
        upsert_meta_conn(&self.lock(), meta)
    }

    fn append_oplog_entry(&self, entry: &OplogEntry) -> Result<bool> {
        let inserted = insert_entry_conn(&self.lock(), entry)?;
        if inserted {
            self.cache.record(&entry.timestamp, &entry.hash);
            self.events.publish(StoreEvent::ChangesApplied { entries: vec![entry.clone()] });
        }
        Ok(inserted)
    }

    fn oplog_after(&self, after: &Hlc, collections: Option<&[String]>) -> Result<Vec<OplogEntry>> {
        let conn = self.lock();
        let mut sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM oplog
             WHERE (physical_ms, logical, node_id) > (?, ?, ?)"
        );
        let mut params: Vec<SqlValue> = vec![
            SqlValue::Integer(after.physical_ms),
            SqlValue::Integer(after.logical.into()),
            SqlValue::Text(after.node_id.clone()),
        ];
        if let Some(cols) = collections {
            sql.push_str(&format!(
                " AND collection IN ({})",
                vec!["?"; cols.len()].join(", ")
            ));
            params.extend(cols.iter().map(|c| SqlValue::Text(c.clone())));
        }
        sql.push_str(" ORDER BY physical_ms, logical, node_id");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), row_to_entry)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn oplog_for_node_after(
        &self,
        node_id: &str,
        after: &Hlc,
        collections: Option<&[String]>,
    ) -> Result<Vec<OplogEntry>> {
        let conn = self.lock();
        let mut sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM oplog
             WHERE node_id = ? AND (physical_ms, logical) > (?, ?)"
        );
        let mut params: Vec<SqlValue> = vec![
            SqlValue::Text(node_id.to_string()),
            SqlValue::Integer(after.physical_ms),
            SqlValue::Integer(after.logical.into()),
        ];
        if let Some(cols) = collections {
            sql.push_str(&format!(
                " AND collection IN ({})",
                vec!["?"; cols.len()].join(", ")
            ));
            params.extend(cols.iter().map(|c| SqlValue::Text(c.clone())));
        }
        sql.push_str(" ORDER BY physical_ms, logical");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), row_to_entry)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn entry_by_hash(&self, hash: &str) -> Result<Option<OplogEntry>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM oplog WHERE hash = ?1"),
                params![hash],
                row_to_entry,
            )
            .optional()?)
    }

    fn chain_range(
        &self,
        node_id: &str,
        start_hash: &str,
        end_hash: &str,
    ) -> Result<Option<Vec<OplogEntry>>> {
        let chain = self.oplog_for_node_after(node_id, &Hlc::zero(), None)?;

        let begin = if start_hash.is_empty() {
            0
        } else if let Some(idx) = chain.iter().position(|e| e.hash == start_hash) {
            idx + 1
        } else if self
            .snapshot_metadata(node_id)?
            .is_some_and(|meta| meta.hash == start_hash)
        {
            0
        } else {
            return Ok(None);
        };

        let mut range = Vec::new();
        for entry in &chain[begin..] {
            range.push(entry.clone());
            if entry.hash == end_hash {
                return Ok(Some(range));
            }
        }
        Ok(None)
    }

    fn last_entry_hash(&self, node_id: &str) -> Result<Option<String>> {
        let tip = self.cache.get_or_init(node_id, || Self::cache_contents(&self.lock()))?;
        Ok(tip.map(|(_, hash)| hash))
    }

    fn latest_timestamp(&self) -> Result<Option<Hlc>> {
        let clock = self.vector_clock()?;
        Ok(clock.iter().map(|(_, ts)| ts.clone()).max())
    }

    fn vector_clock(&self) -> Result<VectorClock> {
        self.cache.vector_clock_or_init(|| Self::cache_contents(&self.lock()))
    }

    fn apply_batch(&self, docs: &[Document], entries: &[OplogEntry]) -> Result<usize> {
        let (persisted, events) = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;

            let mut by_key: BTreeMap<(String, String), Vec<&OplogEntry>> = BTreeMap::new();
            for entry in entries {
                by_key
                    .entry((entry.collection.clone(), entry.key.clone()))
                    .or_default()
                    .push(entry);
            }

            let mut persisted: Vec<OplogEntry> = Vec::new();
            let mut inserted: Vec<Document> = Vec::new();
            let mut updated: Vec<Document> = Vec::new();
            let mut deleted: Vec<(String, String)> = Vec::new();

            for ((collection, key), mut run) in by_key {
                run.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
                let local = get_document_conn(&tx, &collection, &key)?;
                let had_live = local.as_ref().is_some_and(|d| !d.is_deleted);

                let (state, accepted) = fold_entries(&LwwResolver, local, run);

                for entry in accepted {
                    if insert_entry_conn(&tx, entry)? {
                        persisted.push(entry.clone());
                    }
                }

                if let Some(doc) = state {
                    save_document_conn(&tx, &doc)?;
                    upsert_meta_conn(&tx, &DocumentMetadata::of(&doc))?;
                    if doc.is_deleted {
                        if had_live {
                            deleted.push((collection, key));
                        }
                    } else if had_live {
                        updated.push(doc);
                    } else {
                        inserted.push(doc);
                    }
                }
            }

            for doc in docs {
                if get_document_conn(&tx, &doc.collection, &doc.key)?.is_none() {
                    save_document_conn(&tx, doc)?;
                    upsert_meta_conn(&tx, &DocumentMetadata::of(doc))?;
                }
            }

            tx.commit()?;

            let mut events = Vec::new();
            for doc in &inserted {
                events.push(StoreEvent::DocumentsInserted {
                    collection: doc.collection.clone(),
                    documents: vec![doc.clone()],
                });
            }
            for doc in &updated {
                events.push(StoreEvent::DocumentsUpdated {
                    collection: doc.collection.clone(),
                    documents: vec![doc.clone()],
                });
            }
            for (collection, key) in deleted {
                events.push(StoreEvent::DocumentsDeleted { collection, keys: vec![key] });
            }
            if !persisted.is_empty() {
                events.push(StoreEvent::ChangesApplied { entries: persisted.clone() });
            }

            (persisted, events)
        };

        // Outside the connection lock: the cache loader takes the locks in
        // the opposite order.
        for entry in &persisted {
            self.cache.record(&entry.timestamp, &entry.hash);
        }
        for event in events {
            self.events.publish(event);
        }
        Ok(persisted.len())
    }

    fn prune_oplog(&self, cutoff: &Hlc) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let pruned = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM oplog
                 WHERE (physical_ms, logical, node_id) < (?1, ?2, ?3)
                 ORDER BY physical_ms, logical"
            ))?;
            let rows = stmt.query_map(
                params![cutoff.physical_ms, cutoff.logical, cutoff.node_id],
                row_to_entry,
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut boundaries: HashMap<String, SnapshotMetadata> = HashMap::new();
        for entry in &pruned {
            boundaries.insert(entry.node_id().to_string(), SnapshotMetadata::of_entry(entry));
        }

        let removed = tx.execute(
            "DELETE FROM oplog WHERE (physical_ms, logical, node_id) < (?1, ?2, ?3)",
            params![cutoff.physical_ms, cutoff.logical, cutoff.node_id],
        )?;

        for meta in boundaries.values() {
            let existing: Option<(i64, i32)> = tx
                .query_row(
                    "SELECT physical_ms, logical FROM snapshot_meta WHERE node_id = ?1",
                    params![meta.node_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let newer_exists = existing
                .is_some_and(|(p, l)| (p, l) > (meta.physical_ms, meta.logical));
            if !newer_exists {
                tx.execute(
                    "INSERT INTO snapshot_meta (node_id, physical_ms, logical, hash)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (node_id) DO UPDATE SET
                         physical_ms = excluded.physical_ms,
                         logical = excluded.logical,
                         hash = excluded.hash",
                    params![meta.node_id, meta.physical_ms, meta.logical, meta.hash],
                )?;
            }
        }

        tx.commit()?;
        debug!(removed, "pruned oplog");
        Ok(removed)
    }

    fn snapshot_metadata(&self, node_id: &str) -> Result<Option<SnapshotMetadata>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT node_id, physical_ms, logical, hash FROM snapshot_meta WHERE node_id = ?1",
                params![node_id],
                |row| {
                    Ok(SnapshotMetadata {
                        node_id: row.get(0)?,
                        physical_ms: row.get(1)?,
                        logical: row.get(2)?,
                        hash: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    fn all_snapshot_metadata(&self) -> Result<Vec<SnapshotMetadata>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT node_id, physical_ms, logical, hash FROM snapshot_meta")?;
        let rows = stmt.query_map([], |row| {
            Ok(SnapshotMetadata {
                node_id: row.get(0)?,
                physical_ms: row.get(1)?,
                logical: row.get(2)?,
                hash: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn update_snapshot_metadata(&self, meta: &SnapshotMetadata) -> Result<()> {
        self.lock().execute(
            "INSERT INTO snapshot_meta (node_id, physical_ms, logical, hash)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (node_id) DO UPDATE SET
                 physical_ms = excluded.physical_ms,
                 logical = excluded.logical,
                 hash = excluded.hash",
            params![meta.node_id, meta.physical_ms, meta.logical, meta.hash],
        )?;
        self.cache.clear();
        Ok(())
    }

    fn save_remote_peer(&self, peer: &RemotePeerConfiguration) -> Result<()> {
        let collections = if peer.interested_collections.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&peer.interested_collections)?)
        };
        self.lock().execute(
            "INSERT INTO remote_peers (node_id, address, peer_type, auth_token, enabled, collections)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (node_id) DO UPDATE SET
                 address = excluded.address,
                 peer_type = excluded.peer_type,
                 auth_token = excluded.auth_token,
                 enabled = excluded.enabled,
                 collections = excluded.collections",
            params![
                peer.node_id,
                peer.address,
                peer.peer_type.as_str(),
                peer.auth_token,
                peer.enabled,
                collections,
            ],
        )?;
        Ok(())
    }

    fn remote_peers(&self) -> Result<Vec<RemotePeerConfiguration>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id, address, peer_type, auth_token, enabled, collections
             FROM remote_peers ORDER BY node_id",
        )?;
        let rows = stmt.query_map([], row_to_peer)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn remote_peer(&self, node_id: &str) -> Result<Option<RemotePeerConfiguration>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT node_id, address, peer_type, auth_token, enabled, collections
                 FROM remote_peers WHERE node_id = ?1",
                params![node_id],
                row_to_peer,
            )
            .optional()?)
    }

    fn remove_remote_peer(&self, node_id: &str) -> Result<()> {
        self.lock().execute("DELETE FROM remote_peers WHERE node_id = ?1", params![node_id])?;
        Ok(())
    }

    fn events(&self) -> &EventHub {
        &self.events
    }

    fn clear(&self) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM documents", [])?;
        tx.execute("DELETE FROM doc_meta", [])?;
        tx.execute("DELETE FROM oplog", [])?;
        tx.execute("DELETE FROM snapshot_meta", [])?;
        tx.execute("DELETE FROM remote_peers", [])?;
        tx.commit()?;
        self.cache.clear();
        Ok(())
    }
}

fn row_to_peer(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<RemotePeerConfiguration, rusqlite::Error> {
    let peer_type: String = row.get("peer_type")?;
    let collections: Option<String> = row.get("collections")?;
    let interested_collections = match collections {
        None => Default::default(),
        Some(text) => serde_json::from_str(&text).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(Error::CorruptStore("invalid collections JSON".into())),
            )
        })?,
    };
    Ok(RemotePeerConfiguration {
        node_id: row.get("node_id")?,
        address: row.get("address")?,
        peer_type: parse_db::<PeerType>(&peer_type, "peer_type")?,
        auth_token: row.get("auth_token")?,
        enabled: row.get("enabled")?,
        interested_collections,
    })
}

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;
