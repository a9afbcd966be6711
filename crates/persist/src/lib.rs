//! Skipper persistence: SQLite history of operations and the event records
//! they emitted, so a past rollout can be replayed verbatim.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use skipper_core::{EventRecord, EventStatus};
use tracing::debug;

/// Operations kept per database; older ones are pruned with their events.
const KEEP_OPERATIONS: i64 = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    /// `deploy`, `upgrade`, `delete`...
    pub action: String,
    pub namespace: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    /// Status of the last recorded event.
    pub last_status: Option<EventStatus>,
    pub events: usize,
}

impl Operation {
    pub fn new(action: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: new_operation_id(),
            action: action.into(),
            namespace: namespace.into(),
            name: name.into(),
            started_at: Utc::now(),
            last_status: None,
            events: 0,
        }
    }
}

pub fn new_operation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub trait HistoryStore {
    fn begin(&self, op: &Operation) -> Result<()>;
    fn put(&self, op_id: &str, seq: u32, record: &EventRecord) -> Result<()>;
    /// Records of one operation in emission order.
    fn events(&self, op_id: &str) -> Result<Vec<EventRecord>>;
    /// Most recent operations first.
    fn operations(&self, limit: usize) -> Result<Vec<Operation>>;
}

/// SQLite-backed history. Synchronous; writes are small and infrequent.
pub struct SqliteHistory {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteHistory {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("SKIPPER_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS operations (
                id         TEXT PRIMARY KEY,
                action     TEXT NOT NULL,
                namespace  TEXT NOT NULL,
                name       TEXT NOT NULL,
                started_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS events (
                op     TEXT NOT NULL,
                seq    INTEGER NOT NULL,
                ts_ms  INTEGER NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL,
                PRIMARY KEY (op, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_operations_started ON operations(started_ms DESC);",
        )
        .context("creating history tables")?;
        debug!(path = %path, "history store opened");
        histogram!("history_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("history db lock poisoned"))
    }
}

impl HistoryStore for SqliteHistory {
    fn begin(&self, op: &Operation) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO operations(id, action, namespace, name, started_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
            (&op.id, &op.action, &op.namespace, &op.name, op.started_at.timestamp_millis()),
        )?;
        tx.execute(
            "DELETE FROM events WHERE op IN (
                 SELECT id FROM operations ORDER BY started_ms DESC, rowid DESC LIMIT -1 OFFSET ?1
             )",
            [KEEP_OPERATIONS],
        )?;
        tx.execute(
            "DELETE FROM operations WHERE id IN (
                 SELECT id FROM operations ORDER BY started_ms DESC, rowid DESC LIMIT -1 OFFSET ?1
             )",
            [KEEP_OPERATIONS],
        )?;
        tx.commit()?;
        counter!("history_operations_total", 1u64);
        Ok(())
    }

    fn put(&self, op_id: &str, seq: u32, record: &EventRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let json = serde_json::to_string(record).context("encoding event record")?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO events(op, seq, ts_ms, status, record) VALUES (?1, ?2, ?3, ?4, ?5)",
            (op_id, seq, record.timestamp.timestamp_millis(), record.status.as_str(), &json),
        )?;
        histogram!("history_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn events(&self, op_id: &str) -> Result<Vec<EventRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT record FROM events WHERE op = ?1 ORDER BY seq ASC")?;
        let mut rows = stmt.query([op_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            out.push(serde_json::from_str(&raw).with_context(|| format!("decoding event record of {}", op_id))?);
        }
        Ok(out)
    }

    fn operations(&self, limit: usize) -> Result<Vec<Operation>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT o.id, o.action, o.namespace, o.name, o.started_ms,
                    (SELECT status FROM events e WHERE e.op = o.id ORDER BY seq DESC LIMIT 1),
                    (SELECT COUNT(*) FROM events e WHERE e.op = o.id)
             FROM operations o
             ORDER BY o.started_ms DESC, o.rowid DESC
             LIMIT ?1",
        )?;
        let mut rows = stmt.query([limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let started_ms: i64 = row.get(4)?;
            let status: Option<String> = row.get(5)?;
            let count: i64 = row.get(6)?;
            out.push(Operation {
                id: row.get(0)?,
                action: row.get(1)?,
                namespace: row.get(2)?,
                name: row.get(3)?,
                started_at: Utc.timestamp_millis_opt(started_ms).single().unwrap_or_default(),
                last_status: status.and_then(|s| serde_json::from_value(serde_json::Value::String(s)).ok()),
                events: count.max(0) as usize,
            });
        }
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".skipper");
        let _ = std::fs::create_dir_all(&p);
        p.push("skipper.db");
        return p.to_string_lossy().to_string();
    }
    "skipper.db".to_string()
}
