// src/core/telemetry/queue.rs

//! SQLite-backed persistent FIFO queue for telemetry snapshots.
//!
//! The queue file is the single source of durability for snapshots: entries
//! survive agent restarts and network outages. Size is bounded; enqueueing
//! at the cap drops the single oldest entry first. Corrupted payloads found
//! on dequeue are deleted inline.

use crate::core::errors::AgentError;
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// One queued snapshot as returned by `dequeue`.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub payload: Value,
    pub retry_count: u32,
}

/// Queue statistics, exposed through `/api/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub by_retry_count: IndexMap<u32, u64>,
    pub oldest_timestamp: Option<String>,
}

/// The persistent queue. All operations are short transactions on the
/// underlying connection; callers must not hold other locks across them.
#[derive(Debug)]
pub struct TelemetryQueue {
    conn: Mutex<Connection>,
    max_size: u64,
}

impl TelemetryQueue {
    pub fn open(path: &Path, max_size: u64) -> Result<Self, AgentError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let queue = Self {
            conn: Mutex::new(conn),
            max_size,
        };
        queue.init_schema()?;
        info!(
            "telemetry queue initialized (max_size={max_size}, db={})",
            path.display()
        );
        Ok(queue)
    }

    fn init_schema(&self) -> Result<(), AgentError> {
        self.conn.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS telemetry_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                payload TEXT NOT NULL,
                retry_count INTEGER DEFAULT 0,
                created_at TEXT NOT NULL,
                last_attempt_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_timestamp ON telemetry_queue(timestamp);
            CREATE INDEX IF NOT EXISTS idx_retry_count ON telemetry_queue(retry_count);",
        )?;
        Ok(())
    }

    /// Adds a snapshot to the queue, dropping the oldest entry first when the
    /// queue is at capacity. Returns the new entry's id.
    pub fn enqueue(&self, payload: &Value) -> Result<i64, AgentError> {
        let conn = self.conn.lock();

        let count: u64 =
            conn.query_row("SELECT COUNT(*) FROM telemetry_queue", [], |row| row.get(0))?;
        if count >= self.max_size {
            conn.execute(
                "DELETE FROM telemetry_queue WHERE id IN (
                    SELECT id FROM telemetry_queue ORDER BY timestamp ASC, id ASC LIMIT 1
                )",
                [],
            )?;
            warn!("telemetry queue full ({count}), dropped oldest entry");
        }

        let timestamp = payload
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().to_rfc3339());
        conn.execute(
            "INSERT INTO telemetry_queue (timestamp, payload, created_at) VALUES (?1, ?2, ?3)",
            params![timestamp, payload.to_string(), Utc::now().to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        debug!("enqueued snapshot (id={id})");
        Ok(id)
    }

    /// Returns the next batch of snapshots, oldest first. Entries whose
    /// payload no longer parses are deleted and skipped.
    pub fn dequeue(&self, limit: u64) -> Result<Vec<QueueEntry>, AgentError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, payload, retry_count FROM telemetry_queue
             ORDER BY timestamp ASC, id ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut entries = Vec::with_capacity(rows.len());
        for (id, raw, retry_count) in rows {
            match serde_json::from_str::<Value>(&raw) {
                Ok(payload) => entries.push(QueueEntry {
                    id,
                    payload,
                    retry_count,
                }),
                Err(e) => {
                    error!("invalid JSON in queue (id={id}): {e}; removing entry");
                    conn.execute("DELETE FROM telemetry_queue WHERE id = ?1", params![id])?;
                }
            }
        }
        Ok(entries)
    }

    /// Removes a successfully sent snapshot.
    pub fn mark_sent(&self, id: i64) -> Result<(), AgentError> {
        self.conn
            .lock()
            .execute("DELETE FROM telemetry_queue WHERE id = ?1", params![id])?;
        debug!("marked sent (id={id})");
        Ok(())
    }

    /// Increments an entry's retry count, removing it once `max_retries` is
    /// reached. Returns whether the entry is still queued.
    pub fn mark_failed(&self, id: i64, max_retries: u32) -> Result<bool, AgentError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE telemetry_queue SET retry_count = retry_count + 1, last_attempt_at = ?1
             WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        let retry_count: Option<u32> = conn
            .query_row(
                "SELECT retry_count FROM telemetry_queue WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match retry_count {
            Some(count) if count >= max_retries => {
                conn.execute("DELETE FROM telemetry_queue WHERE id = ?1", params![id])?;
                warn!("dropped snapshot after {max_retries} retries (id={id})");
                Ok(false)
            }
            Some(count) => {
                debug!("marked failed (id={id}, retries={count})");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn len(&self) -> u64 {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM telemetry_queue", [], |row| row.get(0))
            .unwrap_or_else(|e| {
                error!("failed to read queue size: {e}");
                0
            })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let conn = self.conn.lock();
        let total: u64 = conn
            .query_row("SELECT COUNT(*) FROM telemetry_queue", [], |row| row.get(0))
            .unwrap_or(0);

        let mut by_retry_count = IndexMap::new();
        if let Ok(mut stmt) = conn.prepare(
            "SELECT retry_count, COUNT(*) FROM telemetry_queue
             GROUP BY retry_count ORDER BY retry_count",
        ) {
            let counts = stmt.query_map([], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, u64>(1)?))
            });
            if let Ok(rows) = counts {
                for (retries, count) in rows.flatten() {
                    by_retry_count.insert(retries, count);
                }
            }
        }

        let oldest_timestamp = conn
            .query_row(
                "SELECT timestamp FROM telemetry_queue ORDER BY timestamp ASC, id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or(None);

        QueueStats {
            total,
            by_retry_count,
            oldest_timestamp,
        }
    }
}
