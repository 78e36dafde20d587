use crate::error::LogStoreError;
use crate::types::{HistoryRecord, ProcessingLogEntry};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

/// Append-only destination for processing log entries. Must tolerate concurrent appends.
pub trait ProcessingLogSink: Send + Sync {
    fn append(&self, entry: &ProcessingLogEntry) -> Result<(), LogStoreError>;
}

/// SQLite-backed processing history.
pub struct LogStore {
    conn: Mutex<Connection>,
}

const SCHEMA_VERSION: i64 = 1;

impl LogStore {
    pub fn open(db_path: &Path) -> Result<Self, LogStoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self, LogStoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LogStoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS ocr_processing_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                input_image_name TEXT NOT NULL,
                processing_time_ms INTEGER NOT NULL,
                engine TEXT NOT NULL,
                detected_text TEXT,
                confidence REAL,
                is_successful INTEGER NOT NULL,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_ocr_logs_created ON ocr_processing_logs(created_at);
            ",
        )?;
        conn.execute(
            "INSERT INTO schema_version (version)
             SELECT ?1 WHERE NOT EXISTS (SELECT 1 FROM schema_version LIMIT 1)",
            params![SCHEMA_VERSION],
        )?;
        Ok(LogStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn schema_version(&self) -> Result<i64, LogStoreError> {
        let conn = self.conn.lock().map_err(|_| LogStoreError::Poisoned)?;
        Ok(conn.query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))?)
    }

    pub fn insert(&self, entry: &ProcessingLogEntry) -> Result<i64, LogStoreError> {
        let conn = self.conn.lock().map_err(|_| LogStoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO ocr_processing_logs
             (created_at, input_image_name, processing_time_ms, engine,
              detected_text, confidence, is_successful, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.created_at,
                entry.input_image_name,
                entry.processing_time_ms as i64,
                entry.engine,
                entry.detected_text,
                entry.confidence,
                entry.successful,
                entry.error_message,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, LogStoreError> {
        let conn = self.conn.lock().map_err(|_| LogStoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, input_image_name, processing_time_ms, engine,
                    detected_text, confidence, is_successful, error_message
             FROM ocr_processing_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], history_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get(&self, id: i64) -> Result<Option<HistoryRecord>, LogStoreError> {
        let conn = self.conn.lock().map_err(|_| LogStoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, input_image_name, processing_time_ms, engine,
                    detected_text, confidence, is_successful, error_message
             FROM ocr_processing_logs WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], history_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn count(&self) -> Result<u64, LogStoreError> {
        let conn = self.conn.lock().map_err(|_| LogStoreError::Poisoned)?;
        let n: i64 =
            conn.query_row("SELECT COUNT(*) FROM ocr_processing_logs", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

impl ProcessingLogSink for LogStore {
    fn append(&self, entry: &ProcessingLogEntry) -> Result<(), LogStoreError> {
        self.insert(entry).map(|_| ())
    }
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.get(0)?,
        entry: ProcessingLogEntry {
            created_at: row.get(1)?,
            input_image_name: row.get(2)?,
            processing_time_ms: row.get::<_, i64>(3)?.max(0) as u64,
            engine: row.get(4)?,
            detected_text: row.get(5)?,
            confidence: row.get(6)?,
            successful: row.get(7)?,
            error_message: row.get(8)?,
        },
    })
}

/// Keeps entries in process memory; for embedding callers and tests.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<ProcessingLogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ProcessingLogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProcessingLogSink for MemoryLogSink {
    fn append(&self, entry: &ProcessingLogEntry) -> Result<(), LogStoreError> {
        self.entries
            .lock()
            .map_err(|_| LogStoreError::Poisoned)?
            .push(entry.clone());
        Ok(())
    }
}
