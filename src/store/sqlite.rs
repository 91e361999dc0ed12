//! Embedded SQLite store (bundled, no system dependencies).
//!
//! Records are flat rows; list-valued fields (pages, engine sets, handles,
//! metadata) are stored as JSON text columns. The single connection mutex
//! serializes all writes, which also covers the per-document upsert
//! serialization requirement.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::error::RecognitionError;
use crate::model::{
    EngineKind, JobPriority, QueueItem, QueueStatus, RecognitionConfig, RecognitionResult,
    ResultStatus,
};

use super::{claim_item, ConfigStore, QueueStore, ResultStore};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, RecognitionError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory database, handy for tests.
    pub fn open_in_memory() -> Result<Self, RecognitionError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, RecognitionError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS recognition_results (
                document_id TEXT NOT NULL,
                engine      TEXT NOT NULL,
                text        TEXT NOT NULL,
                confidence  REAL,
                duration_ms INTEGER NOT NULL,
                metadata    TEXT NOT NULL,
                pages       TEXT NOT NULL,
                status      TEXT NOT NULL,
                error       TEXT,
                config_id   TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (document_id, engine)
            );
            CREATE TABLE IF NOT EXISTS queue_items (
                id            TEXT PRIMARY KEY,
                document_id   TEXT NOT NULL,
                engines       TEXT NOT NULL,
                priority      INTEGER NOT NULL,
                status        TEXT NOT NULL,
                retry_count   INTEGER NOT NULL,
                max_retries   INTEGER NOT NULL,
                requested_by  TEXT,
                job_handles   TEXT NOT NULL,
                force_replace INTEGER NOT NULL,
                error         TEXT,
                scheduled_for TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                started_at    TEXT,
                completed_at  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_dispatch
                ON queue_items (status, priority DESC, created_at ASC);
            CREATE TABLE IF NOT EXISTS recognition_configs (
                id     TEXT PRIMARY KEY,
                active INTEGER NOT NULL,
                body   TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RecognitionError> {
        self.conn
            .lock()
            .map_err(|_| RecognitionError::Storage("sqlite connection lock poisoned".to_string()))
    }
}

fn priority_rank(priority: JobPriority) -> i64 {
    match priority {
        JobPriority::Low => 0,
        JobPriority::Normal => 1,
        JobPriority::High => 2,
        JobPriority::Urgent => 3,
    }
}

fn priority_from_rank(rank: i64) -> JobPriority {
    match rank {
        0 => JobPriority::Low,
        2 => JobPriority::High,
        3 => JobPriority::Urgent,
        _ => JobPriority::Normal,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RecognitionError> {
    serde_json::to_string(value)
        .map_err(|e| RecognitionError::Storage(format!("serialize: {}", e)))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, RecognitionError> {
    serde_json::from_str(text)
        .map_err(|e| RecognitionError::Storage(format!("deserialize: {}", e)))
}

fn parse_datetime(text: &str) -> Result<DateTime<Utc>, RecognitionError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RecognitionError::Storage(format!("bad timestamp {}: {}", text, e)))
}

fn parse_optional_datetime(text: Option<String>) -> Result<Option<DateTime<Utc>>, RecognitionError> {
    text.map(|t| parse_datetime(&t)).transpose()
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<(RecognitionResult, String, String)> {
    let engine: String = row.get(1)?;
    let status: String = row.get(7)?;
    let result = RecognitionResult {
        document_id: row.get(0)?,
        engine: EngineKind::parse(&engine).unwrap_or(EngineKind::Fast),
        text: row.get(2)?,
        confidence: row.get(3)?,
        duration_ms: row.get::<_, i64>(4)? as u64,
        metadata: serde_json::Value::Null,
        pages: Vec::new(),
        status: ResultStatus::parse(&status).unwrap_or(ResultStatus::Failed),
        error: row.get(8)?,
        config_id: row.get(9)?,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let metadata: String = row.get(5)?;
    let pages: String = row.get(6)?;
    Ok((result, metadata, pages))
}

const RESULT_COLUMNS: &str = "document_id, engine, text, confidence, duration_ms, metadata, \
                              pages, status, error, config_id, created_at, updated_at";

fn finish_result(
    row: &Row<'_>,
    parsed: (RecognitionResult, String, String),
) -> Result<RecognitionResult, RecognitionError> {
    let (mut result, metadata, pages) = parsed;
    result.metadata = from_json(&metadata)?;
    result.pages = from_json(&pages)?;
    let created: String = row
        .get(10)
        .map_err(|e| RecognitionError::Storage(e.to_string()))?;
    let updated: String = row
        .get(11)
        .map_err(|e| RecognitionError::Storage(e.to_string()))?;
    result.created_at = parse_datetime(&created)?;
    result.updated_at = parse_datetime(&updated)?;
    Ok(result)
}

fn read_result(row: &Row<'_>) -> Result<RecognitionResult, RecognitionError> {
    let parsed = result_from_row(row).map_err(|e| RecognitionError::Storage(e.to_string()))?;
    finish_result(row, parsed)
}

const QUEUE_COLUMNS: &str = "id, document_id, engines, priority, status, retry_count, \
                             max_retries, requested_by, job_handles, force_replace, error, \
                             scheduled_for, created_at, started_at, completed_at";

fn read_queue_item(row: &Row<'_>) -> Result<QueueItem, RecognitionError> {
    let storage = |e: rusqlite::Error| RecognitionError::Storage(e.to_string());

    let id: String = row.get(0).map_err(storage)?;
    let engines: String = row.get(2).map_err(storage)?;
    let status: String = row.get(4).map_err(storage)?;
    let handles: String = row.get(8).map_err(storage)?;
    let scheduled: String = row.get(11).map_err(storage)?;
    let created: String = row.get(12).map_err(storage)?;

    Ok(QueueItem {
        id: Uuid::parse_str(&id)
            .map_err(|e| RecognitionError::Storage(format!("bad queue item id: {}", e)))?,
        document_id: row.get(1).map_err(storage)?,
        engines: from_json(&engines)?,
        priority: priority_from_rank(row.get(3).map_err(storage)?),
        status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Failed),
        retry_count: row.get::<_, i64>(5).map_err(storage)? as u32,
        max_retries: row.get::<_, i64>(6).map_err(storage)? as u32,
        requested_by: row.get(7).map_err(storage)?,
        job_handles: from_json(&handles)?,
        force: row.get::<_, i64>(9).map_err(storage)? != 0,
        error: row.get(10).map_err(storage)?,
        scheduled_for: parse_datetime(&scheduled)?,
        created_at: parse_datetime(&created)?,
        started_at: parse_optional_datetime(row.get(13).map_err(storage)?)?,
        completed_at: parse_optional_datetime(row.get(14).map_err(storage)?)?,
    })
}

impl ResultStore for SqliteStore {
    fn upsert(&self, result: &RecognitionResult) -> Result<(), RecognitionError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO recognition_results
                 (document_id, engine, text, confidence, duration_ms, metadata, pages,
                  status, error, config_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT (document_id, engine) DO UPDATE SET
                 text = excluded.text,
                 confidence = excluded.confidence,
                 duration_ms = excluded.duration_ms,
                 metadata = excluded.metadata,
                 pages = excluded.pages,
                 status = excluded.status,
                 error = excluded.error,
                 config_id = excluded.config_id,
                 updated_at = excluded.updated_at",
            params![
                result.document_id,
                result.engine.as_str(),
                result.text,
                result.confidence,
                result.duration_ms as i64,
                to_json(&result.metadata)?,
                to_json(&result.pages)?,
                result.status.as_str(),
                result.error,
                result.config_id,
                result.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get(
        &self,
        document_id: &str,
        engine: EngineKind,
    ) -> Result<Option<RecognitionResult>, RecognitionError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM recognition_results WHERE document_id = ?1 AND engine = ?2",
            RESULT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![document_id, engine.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_result(row)?)),
            None => Ok(None),
        }
    }

    fn for_document(&self, document_id: &str) -> Result<Vec<RecognitionResult>, RecognitionError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM recognition_results WHERE document_id = ?1 ORDER BY engine",
            RESULT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![document_id])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(read_result(row)?);
        }
        Ok(results)
    }

    fn sweep_failed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RecognitionError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM recognition_results WHERE status = 'failed' AND updated_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(removed)
    }
}

impl QueueStore for SqliteStore {
    fn insert(&self, item: &QueueItem) -> Result<(), RecognitionError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO queue_items
                 (id, document_id, engines, priority, status, retry_count, max_retries,
                  requested_by, job_handles, force_replace, error, scheduled_for,
                  created_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                item.id.to_string(),
                item.document_id,
                to_json(&item.engines)?,
                priority_rank(item.priority),
                item.status.as_str(),
                item.retry_count as i64,
                item.max_retries as i64,
                item.requested_by,
                to_json(&item.job_handles)?,
                item.force as i64,
                item.error,
                item.scheduled_for.to_rfc3339(),
                item.created_at.to_rfc3339(),
                item.started_at.map(|t| t.to_rfc3339()),
                item.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn update(&self, item: &QueueItem) -> Result<(), RecognitionError> {
        let conn = self.lock()?;
        // Terminal statuses never transition; the WHERE clause drops any
        // update that would move an item out of one.
        conn.execute(
            "UPDATE queue_items SET
                 engines = ?2, priority = ?3, status = ?4, retry_count = ?5,
                 max_retries = ?6, requested_by = ?7, job_handles = ?8,
                 force_replace = ?9, error = ?10, scheduled_for = ?11,
                 started_at = ?12, completed_at = ?13
             WHERE id = ?1
               AND (status NOT IN ('completed', 'failed', 'cancelled') OR status = ?4)",
            params![
                item.id.to_string(),
                to_json(&item.engines)?,
                priority_rank(item.priority),
                item.status.as_str(),
                item.retry_count as i64,
                item.max_retries as i64,
                item.requested_by,
                to_json(&item.job_handles)?,
                item.force as i64,
                item.error,
                item.scheduled_for.to_rfc3339(),
                item.started_at.map(|t| t.to_rfc3339()),
                item.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<QueueItem>, RecognitionError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM queue_items WHERE id = ?1", QUEUE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_queue_item(row)?)),
            None => Ok(None),
        }
    }

    fn for_document(&self, document_id: &str) -> Result<Vec<QueueItem>, RecognitionError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM queue_items WHERE document_id = ?1 ORDER BY created_at",
            QUEUE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![document_id])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(read_queue_item(row)?);
        }
        Ok(items)
    }

    fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, RecognitionError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut claimed = Vec::new();
        {
            let sql = format!(
                "SELECT {} FROM queue_items
                 WHERE status = 'queued' AND scheduled_for <= ?1
                 ORDER BY priority DESC, created_at ASC
                 LIMIT ?2",
                QUEUE_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            let mut rows = stmt.query(params![now.to_rfc3339(), limit as i64])?;
            while let Some(row) = rows.next()? {
                claimed.push(read_queue_item(row)?);
            }
        }
        for item in &mut claimed {
            claim_item(item, now);
            tx.execute(
                "UPDATE queue_items SET status = 'processing', started_at = ?2 WHERE id = ?1",
                params![item.id.to_string(), now.to_rfc3339()],
            )?;
        }
        tx.commit()?;
        Ok(claimed)
    }

    fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<QueueItem>, RecognitionError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE queue_items SET status = 'processing', started_at = ?2
             WHERE id = ?1 AND status = 'queued'",
            params![id.to_string(), now.to_rfc3339()],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        drop(conn);
        QueueStore::get(self, id)
    }

    fn sweep_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RecognitionError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM queue_items
             WHERE status IN ('completed', 'failed', 'cancelled') AND completed_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(removed)
    }
}

impl ConfigStore for SqliteStore {
    fn insert(&self, config: &RecognitionConfig) -> Result<(), RecognitionError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if config.active {
            tx.execute("UPDATE recognition_configs SET active = 0", [])?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO recognition_configs (id, active, body) VALUES (?1, ?2, ?3)",
            params![config.id, config.active as i64, to_json(config)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<RecognitionConfig>, RecognitionError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT body, active FROM recognition_configs ORDER BY id")?;
        let mut rows = stmt.query([])?;
        let mut configs = Vec::new();
        while let Some(row) = rows.next()? {
            let body: String = row.get(0)?;
            let active: i64 = row.get(1)?;
            let mut config: RecognitionConfig = from_json(&body)?;
            config.active = active != 0;
            configs.push(config);
        }
        Ok(configs)
    }

    fn get(&self, id: &str) -> Result<Option<RecognitionConfig>, RecognitionError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT body, active FROM recognition_configs WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => {
                let body: String = row.get(0)?;
                let active: i64 = row.get(1)?;
                let mut config: RecognitionConfig = from_json(&body)?;
                config.active = active != 0;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    fn active(&self) -> Result<Option<RecognitionConfig>, RecognitionError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT body FROM recognition_configs WHERE active = 1 LIMIT 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => {
                let body: String = row.get(0)?;
                let mut config: RecognitionConfig = from_json(&body)?;
                config.active = true;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    fn activate(&self, id: &str) -> Result<RecognitionConfig, RecognitionError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("UPDATE recognition_configs SET active = 0", [])?;
        let changed = tx.execute(
            "UPDATE recognition_configs SET active = 1 WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(RecognitionError::NotFound(format!("configuration {}", id)));
        }
        tx.commit()?;
        drop(conn);
        ConfigStore::get(self, id)?
            .ok_or_else(|| RecognitionError::NotFound(format!("configuration {}", id)))
    }
}
