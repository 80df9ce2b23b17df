// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use crate::Result;

/// A persisted schedule row.
///
/// `payload` carries the full serialized schedule (callback name, kind
/// parameters, callback payload); `kind` and `next_run` are denormalized into
/// columns so the alarm pointer query and the by-kind listing stay plain SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRow {
    pub id: String,
    pub kind: String,
    /// Next fire time, epoch milliseconds.
    pub next_run: i64,
    pub payload: Value,
}

/// Handle to one instance's SQLite database.
pub struct InstanceStore {
    conn: Connection,
}

impl InstanceStore {
    /// Open (creating if needed) the database at `path` and ensure the schema
    /// exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "instance store opened");
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id      TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS streams (
                id        TEXT PRIMARY KEY,
                completed INTEGER NOT NULL DEFAULT 0,
                canceled  INTEGER NOT NULL DEFAULT 0,
                chunks    TEXT NOT NULL DEFAULT '[]'
            );
            CREATE TABLE IF NOT EXISTS schedules (
                id       TEXT PRIMARY KEY,
                kind     TEXT NOT NULL,
                next_run INTEGER NOT NULL,
                payload  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules(next_run);
            CREATE TABLE IF NOT EXISTS connections_attach (
                conn_id TEXT PRIMARY KEY,
                attach  TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Key/value ─────────────────────────────────────────────────────────────

    pub fn kv_put(&self, key: &str, value: &Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value.to_string()],
        )?;
        Ok(())
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }

    pub fn kv_delete(&self, key: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    /// Insert or overwrite a message row.  The upsert keeps the original
    /// rowid, so the stored ordering is insertion order regardless of how
    /// many times a message is re-persisted.
    pub fn upsert_message(&self, id: &str, payload: &Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO messages (id, payload) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
            params![id, payload.to_string()],
        )?;
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM messages WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }

    /// All messages in insertion order.
    pub fn list_messages(&self) -> Result<Vec<Value>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM messages ORDER BY rowid ASC")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn message_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    pub fn delete_all_messages(&self) -> Result<()> {
        self.conn.execute("DELETE FROM messages", [])?;
        Ok(())
    }

    // ── Schedules ─────────────────────────────────────────────────────────────

    pub fn put_schedule(&self, row: &ScheduleRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO schedules (id, kind, next_run, payload) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 kind = excluded.kind,
                 next_run = excluded.next_run,
                 payload = excluded.payload",
            params![row.id, row.kind, row.next_run, row.payload.to_string()],
        )?;
        Ok(())
    }

    pub fn get_schedule(&self, id: &str) -> Result<Option<ScheduleRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, kind, next_run, payload FROM schedules WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, i64>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(match row {
            Some((id, kind, next_run, payload)) => Some(ScheduleRow {
                id,
                kind,
                next_run,
                payload: serde_json::from_str(&payload)?,
            }),
            None => None,
        })
    }

    /// Returns `true` only if a matching schedule existed.
    pub fn delete_schedule(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn list_schedules(&self) -> Result<Vec<ScheduleRow>> {
        self.query_schedules("SELECT id, kind, next_run, payload FROM schedules ORDER BY next_run ASC", [])
    }

    pub fn schedules_by_kind(&self, kind: &str) -> Result<Vec<ScheduleRow>> {
        self.query_schedules(
            "SELECT id, kind, next_run, payload FROM schedules WHERE kind = ?1 ORDER BY next_run ASC",
            params![kind],
        )
    }

    /// Schedules due at or before `now_ms`, soonest first.
    pub fn due_schedules(&self, now_ms: i64) -> Result<Vec<ScheduleRow>> {
        self.query_schedules(
            "SELECT id, kind, next_run, payload FROM schedules WHERE next_run <= ?1 ORDER BY next_run ASC",
            params![now_ms],
        )
    }

    fn query_schedules(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ScheduleRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, kind, next_run, payload) = row?;
            out.push(ScheduleRow {
                id,
                kind,
                next_run,
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(out)
    }

    /// The alarm pointer: smallest `next_run` over all schedules, or `None`
    /// iff there are none.
    pub fn min_next_run(&self) -> Result<Option<i64>> {
        let min: Option<i64> =
            self.conn
                .query_row("SELECT MIN(next_run) FROM schedules", [], |r| r.get(0))?;
        Ok(min)
    }

    // ── Connection attachments ────────────────────────────────────────────────

    pub fn put_attachment(&self, conn_id: &str, attach: &Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO connections_attach (conn_id, attach) VALUES (?1, ?2)
             ON CONFLICT(conn_id) DO UPDATE SET attach = excluded.attach",
            params![conn_id, attach.to_string()],
        )?;
        Ok(())
    }

    pub fn get_attachment(&self, conn_id: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT attach FROM connections_attach WHERE conn_id = ?1",
                params![conn_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }

    pub fn delete_attachment(&self, conn_id: &str) -> Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM connections_attach WHERE conn_id = ?1",
            params![conn_id],
        )?;
        Ok(n > 0)
    }

    pub fn list_attachments(&self) -> Result<Vec<(String, Value)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT conn_id, attach FROM connections_attach")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, attach) = row?;
            out.push((id, serde_json::from_str(&attach)?));
        }
        Ok(out)
    }

    // ── Whole-instance wipe ───────────────────────────────────────────────────

    /// Drop everything this instance has persisted.  Used by callbacks that
    /// reset the instance; must be safe to call mid-handler.
    pub fn clear_all(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM kv;
             DELETE FROM messages;
             DELETE FROM streams;
             DELETE FROM schedules;
             DELETE FROM connections_attach;",
        )?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
