// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The single-alarm supervisor.
//!
//! Each instance gets at most one pending timer, always at its smallest
//! `next_run`.  Rewriting the pointer aborts the previous timer and arms a
//! new one; clearing it (no schedules left) just aborts.  On fire the entry
//! is removed *before* the waker runs, so the waker dispatching callbacks and
//! re-arming the alarm never races a stale entry.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::schedule::now_ms;

struct AlarmEntry {
    at: i64,
    handle: JoinHandle<()>,
}

/// Owns the one-timer-per-instance invariant across all instances of a node.
pub struct AlarmSupervisor<K> {
    alarms: Arc<Mutex<HashMap<K, AlarmEntry>>>,
    waker: Arc<dyn Fn(K) + Send + Sync>,
}

impl<K> AlarmSupervisor<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Display + 'static,
{
    /// `waker` is invoked (off the timer task) whenever an alarm fires; it
    /// must be cheap — typically an `mpsc::Sender::try_send` into the host.
    pub fn new(waker: impl Fn(K) + Send + Sync + 'static) -> Self {
        Self {
            alarms: Arc::new(Mutex::new(HashMap::new())),
            waker: Arc::new(waker),
        }
    }

    /// Rewrite the alarm pointer for `key`.
    ///
    /// `None` clears the alarm.  `Some(at)` arms (or re-arms) it; an
    /// already-armed identical pointer is left untouched.  Fire times in the
    /// past fire immediately.
    pub fn set(&self, key: K, at: Option<i64>) {
        let mut alarms = self.alarms.lock().unwrap();
        match at {
            None => {
                if let Some(entry) = alarms.remove(&key) {
                    entry.handle.abort();
                    debug!(instance = %key, "alarm cleared");
                }
            }
            Some(at) => {
                if let Some(existing) = alarms.get(&key) {
                    if existing.at == at {
                        return;
                    }
                }
                if let Some(old) = alarms.remove(&key) {
                    old.handle.abort();
                }
                let delay_ms = (at - now_ms()).max(0) as u64;
                debug!(instance = %key, at, delay_ms, "alarm armed");
                let map = Arc::clone(&self.alarms);
                let waker = Arc::clone(&self.waker);
                let task_key = key.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    map.lock().unwrap().remove(&task_key);
                    waker(task_key);
                });
                alarms.insert(key, AlarmEntry { at, handle });
            }
        }
    }

    /// The currently armed fire time for `key`, if any.
    pub fn current(&self, key: &K) -> Option<i64> {
        self.alarms.lock().unwrap().get(key).map(|e| e.at)
    }

    /// Abort every timer.  Used on node shutdown.
    pub fn clear_all(&self) {
        let mut alarms = self.alarms.lock().unwrap();
        for (_, entry) in alarms.drain() {
            entry.handle.abort();
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
