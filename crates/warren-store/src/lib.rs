// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Durable per-instance storage.
//!
//! Each agent instance owns exactly one SQLite database file holding five
//! tables:
//!
//! | table | contents |
//! |---|---|
//! | `kv` | small JSON blobs keyed by name (the `persist` checkpoint lives here) |
//! | `messages` | chat history, one JSON payload per message id |
//! | `streams` | append-only delta logs with completed/canceled flags |
//! | `schedules` | pending callbacks with their next fire time |
//! | `connections_attach` | per-connection capability attachments |
//!
//! The store is only ever touched from the instance's own handler task
//! (single-writer discipline), so the connection is owned directly and all
//! calls are synchronous.  Every statement commits before returning, which is
//! what makes hibernation safe: an instance can be dropped from memory at any
//! point between handler invocations without losing state.

mod store;
mod streams;

pub use store::{InstanceStore, ScheduleRow};
pub use streams::StreamRecord;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
