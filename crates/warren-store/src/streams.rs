// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Append-only stream logs.
//!
//! A stream is an ordered list of text deltas plus two terminal flags.  The
//! whole chunk list is stored as one JSON array per row; appends rewrite the
//! row inside a transaction, so a reader never observes a torn write.  The
//! byte `position` of a stream is the UTF-8 length sum of all persisted
//! chunks, which gives resuming clients a stable offset.

use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::{InstanceStore, Result};

/// A fully loaded stream row.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub id: String,
    pub chunks: Vec<String>,
    pub completed: bool,
    pub canceled: bool,
}

impl StreamRecord {
    /// Total persisted bytes across all chunks.
    pub fn position(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    /// A stream is terminal once completed or canceled; terminal streams
    /// accept no further chunks.
    pub fn is_terminal(&self) -> bool {
        self.completed || self.canceled
    }
}

impl InstanceStore {
    /// Create an empty stream.  Returns `false` when the id already exists.
    pub fn create_stream(&self, id: &str) -> Result<bool> {
        let n = self.conn().execute(
            "INSERT OR IGNORE INTO streams (id) VALUES (?1)",
            params![id],
        )?;
        Ok(n > 0)
    }

    pub fn get_stream(&self, id: &str) -> Result<Option<StreamRecord>> {
        let row = self
            .conn()
            .query_row(
                "SELECT completed, canceled, chunks FROM streams WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(match row {
            Some((completed, canceled, chunks)) => {
                let chunks: Vec<String> = serde_json::from_str(&chunks)?;
                Some(StreamRecord {
                    id: id.to_string(),
                    chunks,
                    completed: completed != 0,
                    canceled: canceled != 0,
                })
            }
            None => None,
        })
    }

    /// Append one delta and return the new byte position.
    ///
    /// Appending to a terminal or unknown stream is a silent no-op returning
    /// the current position — a canceled stream may still have a producer
    /// in flight, and that producer must not be able to grow the log.
    pub fn append_stream_chunk(&self, id: &str, delta: &str) -> Result<u64> {
        let Some(mut rec) = self.get_stream(id)? else {
            return Ok(0);
        };
        if rec.is_terminal() {
            return Ok(rec.position());
        }
        rec.chunks.push(delta.to_string());
        let chunks = Value::from(rec.chunks.clone());
        self.conn().execute(
            "UPDATE streams SET chunks = ?2 WHERE id = ?1",
            params![id, chunks.to_string()],
        )?;
        Ok(rec.position())
    }

    /// Mark a stream complete.  Returns `false` for an unknown id.
    pub fn complete_stream(&self, id: &str) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE streams SET completed = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(n > 0)
    }

    /// Mark a stream canceled (terminal, no further appends).
    pub fn cancel_stream(&self, id: &str) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE streams SET canceled = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(n > 0)
    }

    /// `(position, terminal)` for the status endpoint, or `None` if unknown.
    pub fn stream_status(&self, id: &str) -> Result<Option<(u64, bool)>> {
        Ok(self
            .get_stream(id)?
            .map(|rec| (rec.position(), rec.is_terminal())))
    }

    /// Delete every stream for this instance.  All-or-nothing: follows chat
    /// history clears.
    pub fn delete_all_streams(&self) -> Result<()> {
        self.conn().execute("DELETE FROM streams", [])?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::InstanceStore;

    #[test]
    fn create_append_read_in_order() {
        let s = InstanceStore::open_in_memory().unwrap();
        assert!(s.create_stream("st").unwrap());
        assert!(!s.create_stream("st").unwrap(), "duplicate id rejected");

        s.append_stream_chunk("st", "hello ").unwrap();
        let pos = s.append_stream_chunk("st", "world").unwrap();
        assert_eq!(pos, 11);

        let rec = s.get_stream("st").unwrap().unwrap();
        assert_eq!(rec.chunks, vec!["hello ", "world"]);
        assert_eq!(rec.position(), 11);
        assert!(!rec.is_terminal());
    }

    #[test]
    fn shorter_read_is_prefix_of_longer() {
        let s = InstanceStore::open_in_memory().unwrap();
        s.create_stream("st").unwrap();
        s.append_stream_chunk("st", "abc").unwrap();
        let early: String = s.get_stream("st").unwrap().unwrap().chunks.concat();
        s.append_stream_chunk("st", "def").unwrap();
        let late: String = s.get_stream("st").unwrap().unwrap().chunks.concat();
        assert!(late.starts_with(&early));
    }

    #[test]
    fn append_after_cancel_is_noop() {
        let s = InstanceStore::open_in_memory().unwrap();
        s.create_stream("st").unwrap();
        s.append_stream_chunk("st", "kept").unwrap();
        assert!(s.cancel_stream("st").unwrap());
        let pos = s.append_stream_chunk("st", "dropped").unwrap();
        assert_eq!(pos, 4);
        let rec = s.get_stream("st").unwrap().unwrap();
        assert_eq!(rec.chunks, vec!["kept"]);
        assert!(rec.is_terminal());
    }

    #[test]
    fn status_reports_position_and_terminal() {
        let s = InstanceStore::open_in_memory().unwrap();
        s.create_stream("st").unwrap();
        s.append_stream_chunk("st", "1234").unwrap();
        assert_eq!(s.stream_status("st").unwrap(), Some((4, false)));
        s.complete_stream("st").unwrap();
        assert_eq!(s.stream_status("st").unwrap(), Some((4, true)));
        assert_eq!(s.stream_status("nope").unwrap(), None);
    }

    #[test]
    fn delete_all_streams_makes_ids_unknown() {
        let s = InstanceStore::open_in_memory().unwrap();
        s.create_stream("a").unwrap();
        s.create_stream("b").unwrap();
        s.delete_all_streams().unwrap();
        assert!(s.get_stream("a").unwrap().is_none());
        assert!(s.get_stream("b").unwrap().is_none());
    }

    #[test]
    fn multibyte_deltas_count_utf8_bytes() {
        let s = InstanceStore::open_in_memory().unwrap();
        s.create_stream("st").unwrap();
        let pos = s.append_stream_chunk("st", "héllo").unwrap();
        assert_eq!(pos, 6);
    }
}
