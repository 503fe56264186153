//! SQLite database layer

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use half::f16;
use rusqlite::{Connection, OpenFlags, Row, params};
use serde::{Deserialize, Serialize};

use crate::error::{FerretError, Result};
use crate::storage::migrations;

pub type ItemId = i64;

const ITEM_COLUMNS: &str = "id, guid, feed, title, summary, author, link, published_at, \
                            is_read, is_saved, embedding IS NOT NULL";

const HISTORY_COLUMNS: &str = "id, normalized_query, raw_query, backend, duration_ms, \
                               result_count, pinned, use_count, created_at, last_used_at, \
                               query_embedding, query_embedding_dims";

/// SQLite database wrapper for items and search history
pub struct Database {
    conn: Connection,
    schema_version: u32,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("schema_version", &self.schema_version)
            .finish_non_exhaustive()
    }
}

/// A stored feed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub guid: String,
    pub feed: String,
    pub title: String,
    pub summary: String,
    pub author: Option<String>,
    pub link: Option<String>,
    pub published_at: String,
    pub is_read: bool,
    pub is_saved: bool,
    pub has_embedding: bool,
}

impl ItemRecord {
    /// Text handed to embedders and rerankers.
    pub fn document_text(&self) -> String {
        if self.summary.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n{}", self.title, self.summary)
        }
    }
}

/// Item as delivered by ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    pub guid: String,
    #[serde(default)]
    pub feed: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    pub published_at: String,
}

/// Item paired with its stored embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedItem {
    pub item: ItemRecord,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexicalHit {
    pub item: ItemRecord,
    /// Negated bm25, so larger is better.
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub normalized_query: String,
    pub raw_query: String,
    pub backend: String,
    pub duration_ms: i64,
    pub result_count: i64,
    pub pinned: bool,
    pub use_count: i64,
    pub created_at: String,
    pub last_used_at: String,
    #[serde(skip)]
    pub query_embedding: Option<Vec<f32>>,
}

/// One ranked row of a history snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryResult {
    pub session_id: u64,
    pub rank: u32,
    pub item_id: ItemId,
    pub lexical_score: Option<f32>,
    pub cosine_score: Option<f32>,
    pub rerank_score: Option<f32>,
    pub provenance: u8,
}

/// Input for [`Database::upsert_history`].
#[derive(Debug, Clone)]
pub struct NewHistory<'a> {
    pub normalized_query: &'a str,
    pub raw_query: &'a str,
    pub backend: &'a str,
    pub duration_ms: i64,
    pub query_embedding: Option<&'a [f32]>,
    pub used_at: DateTime<Utc>,
}

impl Database {
    /// Open database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::configure_pragmas(&conn)?;
        let schema_version = migrations::run_migrations(&conn)?;

        Ok(Self {
            conn,
            schema_version,
        })
    }

    /// Open a private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let schema_version = migrations::run_migrations(&conn)?;
        Ok(Self {
            conn,
            schema_version,
        })
    }

    /// Open a read-only connection to an already migrated database.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA temp_store = MEMORY;",
        )?;
        let schema_version = migrations::current_version(&conn)?;
        Ok(Self {
            conn,
            schema_version,
        })
    }

    /// Get a reference to the connection
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Current schema version after migrations.
    pub const fn schema_version(&self) -> u32 {
        self.schema_version
    }

    // ---------------------------------------------------------------------
    // Items
    // ---------------------------------------------------------------------

    /// Insert or update an item by guid, returning its id.
    pub fn upsert_item(&self, item: &NewItem) -> Result<ItemId> {
        let id = self.conn.query_row(
            "INSERT INTO items (guid, feed, title, summary, author, link, published_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(guid) DO UPDATE SET
                feed=excluded.feed,
                title=excluded.title,
                summary=excluded.summary,
                author=excluded.author,
                link=excluded.link,
                published_at=excluded.published_at
             RETURNING id",
            params![
                item.guid,
                item.feed,
                item.title,
                item.summary,
                item.author,
                item.link,
                item.published_at,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Upsert a batch in one transaction.
    pub fn upsert_items(&self, items: &[NewItem]) -> Result<Vec<ItemId>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            ids.push(self.upsert_item(item)?);
        }
        tx.commit()?;
        Ok(ids)
    }

    pub fn get_item(&self, id: ItemId) -> Result<Option<ItemRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"))?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(item_from_row(row)?));
        }
        Ok(None)
    }

    /// Items newest first.
    pub fn list_items(&self, limit: usize, offset: usize) -> Result<Vec<ItemRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items ORDER BY published_at DESC, id DESC LIMIT ? OFFSET ?"
        ))?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], item_from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    pub fn get_items(&self, ids: &[ItemId]) -> Result<Vec<ItemRecord>> {
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = self.get_item(*id)? {
                items.push(item);
            }
        }
        Ok(items)
    }

    pub fn count_items(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn count_missing_embeddings(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM items WHERE embedding IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn set_read(&self, id: ItemId, read: bool) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE items SET is_read = ? WHERE id = ?",
            params![i64::from(read), id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_saved(&self, id: ItemId, saved: bool) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE items SET is_saved = ? WHERE id = ?",
            params![i64::from(saved), id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_item(&self, id: ItemId) -> Result<bool> {
        let changed = self.conn.execute("DELETE FROM items WHERE id = ?", [id])?;
        Ok(changed > 0)
    }

    /// Attach an embedding to an item. Embeddings are never cleared.
    pub fn set_item_embedding(&self, id: ItemId, embedding: &[f32]) -> Result<()> {
        if embedding.is_empty() {
            return Err(FerretError::Serialization(
                "refusing to store an empty embedding".to_string(),
            ));
        }
        let changed = self.conn.execute(
            "UPDATE items SET embedding = ?, embedding_dims = ?, embedded_at = ? WHERE id = ?",
            params![
                encode_embedding_f16(embedding),
                embedding.len() as i64,
                now_rfc3339(),
                id
            ],
        )?;
        if changed == 0 {
            return Err(FerretError::NotFound(format!("item {id}")));
        }
        Ok(())
    }

    pub fn get_item_embedding(&self, id: ItemId) -> Result<Option<Vec<f32>>> {
        let row: Option<(Option<Vec<u8>>, Option<i64>)> = self
            .conn
            .query_row(
                "SELECT embedding, embedding_dims FROM items WHERE id = ?",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        match row {
            Some((Some(blob), Some(dims))) => Ok(Some(decode_embedding_f16(&blob, dims as usize)?)),
            _ => Ok(None),
        }
    }

    pub fn items_missing_embedding(&self, limit: usize) -> Result<Vec<ItemRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE embedding IS NULL
             ORDER BY published_at DESC, id DESC LIMIT ?"
        ))?;
        let rows = stmt.query_map([limit as i64], item_from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// Every item that has an embedding, for the cosine stage.
    pub fn load_corpus(&self) -> Result<Vec<EmbeddedItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS}, embedding, embedding_dims FROM items
             WHERE embedding IS NOT NULL ORDER BY id"
        ))?;
        let mut rows = stmt.query([])?;
        let mut corpus = Vec::new();
        while let Some(row) = rows.next()? {
            let item = item_from_row(row)?;
            let blob: Vec<u8> = row.get(11)?;
            let dims: i64 = row.get(12)?;
            corpus.push(EmbeddedItem {
                item,
                embedding: decode_embedding_f16(&blob, dims as usize)?,
            });
        }
        Ok(corpus)
    }

    // ---------------------------------------------------------------------
    // Lexical index
    // ---------------------------------------------------------------------

    /// Full-text search. Input that is not valid FTS5 syntax is retried as a
    /// literal phrase.
    pub fn search_lexical(&self, query: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        let trimmed = query.trim();
        if trimmed.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        match self.run_fts(trimmed, limit) {
            Err(FerretError::Database(err)) if is_fts_query_error(&err) => {
                tracing::debug!(query = trimmed, error = %err, "fts syntax rejected, retrying as phrase");
                self.run_fts(&literal_phrase(trimmed), limit)
            }
            other => other,
        }
    }

    fn run_fts(&self, fts_query: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.id, i.guid, i.feed, i.title, i.summary, i.author, i.link, i.published_at,
                    i.is_read, i.is_saved, i.embedding IS NOT NULL,
                    bm25(items_fts, 4.0, 1.0, 0.5, 0.5) AS rank
             FROM items_fts
             JOIN items i ON i.id = items_fts.rowid
             WHERE items_fts MATCH ?
             ORDER BY rank, i.id
             LIMIT ?",
        )?;
        let rows = stmt.query_map(params![fts_query, limit as i64], |row| {
            let item = item_from_row(row)?;
            let rank: f64 = row.get(11)?;
            Ok(LexicalHit {
                item,
                score: -rank as f32,
            })
        })?;
        let mut hits = Vec::new();
        for row in rows {
            hits.push(row?);
        }
        Ok(hits)
    }

    // ---------------------------------------------------------------------
    // Search history
    // ---------------------------------------------------------------------

    /// Upsert a history entry keyed by normalized query and replace its
    /// result snapshot, evicting least-recently-used unpinned entries beyond
    /// `max_unpinned`. One transaction.
    pub fn upsert_history(
        &self,
        entry: &NewHistory<'_>,
        session_id: u64,
        results: &[HistoryResult],
        max_unpinned: usize,
    ) -> Result<i64> {
        let used_at = entry.used_at.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let (embedding_blob, embedding_dims) = match entry.query_embedding {
            Some(values) if !values.is_empty() => {
                (Some(encode_embedding_f16(values)), Some(values.len() as i64))
            }
            _ => (None, None),
        };

        let tx = self.conn.unchecked_transaction()?;
        let id: i64 = tx.query_row(
            "INSERT INTO search_history (
                normalized_query, raw_query, backend, duration_ms, result_count,
                pinned, use_count, created_at, last_used_at,
                query_embedding, query_embedding_dims
             ) VALUES (?1, ?2, ?3, ?4, ?5, 0, 1, ?6, ?6, ?7, ?8)
             ON CONFLICT(normalized_query) DO UPDATE SET
                raw_query=excluded.raw_query,
                backend=excluded.backend,
                duration_ms=excluded.duration_ms,
                result_count=excluded.result_count,
                use_count=search_history.use_count + 1,
                last_used_at=excluded.last_used_at,
                query_embedding=coalesce(excluded.query_embedding, search_history.query_embedding),
                query_embedding_dims=coalesce(excluded.query_embedding_dims, search_history.query_embedding_dims)
             RETURNING id",
            params![
                entry.normalized_query,
                entry.raw_query,
                entry.backend,
                entry.duration_ms,
                results.len() as i64,
                used_at,
                embedding_blob,
                embedding_dims,
            ],
            |row| row.get(0),
        )?;
        write_results(&tx, id, session_id, results)?;
        let evicted = tx.execute(
            "DELETE FROM search_history
             WHERE pinned = 0 AND id NOT IN (
                SELECT id FROM search_history WHERE pinned = 0
                ORDER BY last_used_at DESC, id DESC LIMIT ?
             )",
            [max_unpinned as i64],
        )?;
        tx.commit()?;

        if evicted > 0 {
            tracing::debug!(evicted, "evicted unpinned history entries");
        }
        Ok(id)
    }

    /// Replace the snapshot of an existing entry without counting a new use.
    pub fn replace_history_results(
        &self,
        history_id: i64,
        session_id: u64,
        results: &[HistoryResult],
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE search_history SET result_count = ? WHERE id = ?",
            params![results.len() as i64, history_id],
        )?;
        if changed == 0 {
            return Err(FerretError::NotFound(format!("history entry {history_id}")));
        }
        write_results(&tx, history_id, session_id, results)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_history(&self, id: i64) -> Result<Option<HistoryEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {HISTORY_COLUMNS} FROM search_history WHERE id = ?"))?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(history_from_row(row)?));
        }
        Ok(None)
    }

    pub fn get_history_by_query(&self, normalized_query: &str) -> Result<Option<HistoryEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM search_history WHERE normalized_query = ?"
        ))?;
        let mut rows = stmt.query([normalized_query])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(history_from_row(row)?));
        }
        Ok(None)
    }

    /// Pinned entries first, then most recently used.
    pub fn list_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM search_history
             ORDER BY pinned DESC, last_used_at DESC, id DESC LIMIT ?"
        ))?;
        let mut rows = stmt.query([limit as i64])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(history_from_row(row)?);
        }
        Ok(entries)
    }

    pub fn pinned_history(&self) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM search_history WHERE pinned = 1
             ORDER BY last_used_at DESC, id DESC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(history_from_row(row)?);
        }
        Ok(entries)
    }

    /// Most recently used entries that carry a query embedding.
    pub fn recent_query_embeddings(&self, window: usize) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM search_history
             WHERE query_embedding IS NOT NULL
             ORDER BY last_used_at DESC, id DESC LIMIT ?"
        ))?;
        let mut rows = stmt.query([window as i64])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(history_from_row(row)?);
        }
        Ok(entries)
    }

    pub fn history_results(&self, history_id: i64) -> Result<Vec<HistoryResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, rank, item_id, lexical_score, cosine_score, rerank_score, provenance
             FROM search_results WHERE history_id = ? ORDER BY rank",
        )?;
        let rows = stmt.query_map([history_id], |row| {
            Ok(HistoryResult {
                session_id: row.get::<_, i64>(0)? as u64,
                rank: row.get::<_, i64>(1)? as u32,
                item_id: row.get(2)?,
                lexical_score: row.get::<_, Option<f64>>(3)?.map(|v| v as f32),
                cosine_score: row.get::<_, Option<f64>>(4)?.map(|v| v as f32),
                rerank_score: row.get::<_, Option<f64>>(5)?.map(|v| v as f32),
                provenance: row.get::<_, i64>(6)? as u8,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn set_pinned(&self, id: i64, pinned: bool) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE search_history SET pinned = ? WHERE id = ?",
            params![i64::from(pinned), id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_history(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM search_history WHERE id = ?", [id])?;
        Ok(changed > 0)
    }

    pub fn count_history(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM search_history", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn integrity_check(&self) -> Result<bool> {
        let result: String = self
            .conn
            .query_row("PRAGMA integrity_check;", [], |row| row.get(0))?;
        Ok(result == "ok")
    }

    fn configure_pragmas(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA busy_timeout = 5000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(())
    }
}

fn write_results(
    conn: &Connection,
    history_id: i64,
    session_id: u64,
    results: &[HistoryResult],
) -> Result<()> {
    conn.execute("DELETE FROM search_results WHERE history_id = ?", [history_id])?;
    let mut stmt = conn.prepare(
        "INSERT INTO search_results (
            history_id, session_id, rank, item_id,
            lexical_score, cosine_score, rerank_score, provenance
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for result in results {
        stmt.execute(params![
            history_id,
            session_id as i64,
            i64::from(result.rank),
            result.item_id,
            result.lexical_score.map(f64::from),
            result.cosine_score.map(f64::from),
            result.rerank_score.map(f64::from),
            i64::from(result.provenance),
        ])?;
    }
    Ok(())
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ItemRecord> {
    Ok(ItemRecord {
        id: row.get(0)?,
        guid: row.get(1)?,
        feed: row.get(2)?,
        title: row.get(3)?,
        summary: row.get(4)?,
        author: row.get(5)?,
        link: row.get(6)?,
        published_at: row.get(7)?,
        is_read: row.get::<_, i64>(8)? != 0,
        is_saved: row.get::<_, i64>(9)? != 0,
        has_embedding: row.get::<_, i64>(10)? != 0,
    })
}

fn history_from_row(row: &Row<'_>) -> Result<HistoryEntry> {
    let blob: Option<Vec<u8>> = row.get(10)?;
    let dims: Option<i64> = row.get(11)?;
    let query_embedding = match (blob, dims) {
        (Some(blob), Some(dims)) => Some(decode_embedding_f16(&blob, dims as usize)?),
        _ => None,
    };

    Ok(HistoryEntry {
        id: row.get(0)?,
        normalized_query: row.get(1)?,
        raw_query: row.get(2)?,
        backend: row.get(3)?,
        duration_ms: row.get(4)?,
        result_count: row.get(5)?,
        pinned: row.get::<_, i64>(6)? != 0,
        use_count: row.get(7)?,
        created_at: row.get(8)?,
        last_used_at: row.get(9)?,
        query_embedding,
    })
}

fn is_fts_query_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => {
            message.contains("fts5")
                || message.contains("syntax error")
                || message.contains("no such column")
                || message.contains("unterminated")
        }
        _ => false,
    }
}

/// Quote input so FTS5 treats it as a single phrase.
pub fn literal_phrase(query: &str) -> String {
    format!("\"{}\"", query.replace('"', "\"\""))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn encode_embedding_f16(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 2);
    for value in values {
        let bits = f16::from_f32(*value).to_bits();
        out.extend_from_slice(&bits.to_le_bytes());
    }
    out
}

fn decode_embedding_f16(bytes: &[u8], dims: usize) -> Result<Vec<f32>> {
    let expected = dims.saturating_mul(2);
    if bytes.len() != expected {
        return Err(FerretError::Serialization(format!(
            "embedding blob length mismatch: expected {}, got {}",
            expected,
            bytes.len()
        )));
    }

    let mut out = Vec::with_capacity(dims);
    for chunk in bytes.chunks_exact(2) {
        let bits = u16::from_le_bytes([chunk[0], chunk[1]]);
        out.push(f16::from_bits(bits).to_f32());
    }
    Ok(out)
}
