// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Enumerated lifecycle events of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.tick")]
    RunTick,
    #[serde(rename = "run.paused")]
    RunPaused,
    #[serde(rename = "run.resumed")]
    RunResumed,
    #[serde(rename = "run.canceled")]
    RunCanceled,
    #[serde(rename = "agent.completed")]
    AgentCompleted,
    #[serde(rename = "agent.error")]
    AgentError,
    #[serde(rename = "checkpoint.saved")]
    CheckpointSaved,
    #[serde(rename = "model.started")]
    ModelStarted,
    #[serde(rename = "model.delta")]
    ModelDelta,
    #[serde(rename = "model.completed")]
    ModelCompleted,
    #[serde(rename = "tool.started")]
    ToolStarted,
    #[serde(rename = "tool.output")]
    ToolOutput,
    #[serde(rename = "tool.error")]
    ToolError,
    #[serde(rename = "hitl.interrupt")]
    HitlInterrupt,
    #[serde(rename = "hitl.resume")]
    HitlResume,
    #[serde(rename = "subagent.spawned")]
    SubagentSpawned,
    #[serde(rename = "subagent.completed")]
    SubagentCompleted,
}

/// One retained event.  `seq` is strictly increasing per instance, even
/// across ring evictions and hibernation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
    #[serde(rename = "threadId", skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub ts: i64,
    pub seq: u64,
}

/// Bounded ring of the last N events.
#[derive(Debug)]
pub struct EventRing {
    capacity: usize,
    next_seq: u64,
    events: VecDeque<EventRecord>,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 0,
            events: VecDeque::new(),
        }
    }

    /// Rebuild the ring from persisted state.  `next_seq` is restored from
    /// the stored counter (NOT from the retained slice) so `seq` stays
    /// strictly increasing after evictions and wakes.
    pub fn restore(capacity: usize, events: Vec<EventRecord>, next_seq: u64) -> Self {
        let mut ring = Self::new(capacity);
        ring.events = events.into();
        while ring.events.len() > ring.capacity {
            ring.events.pop_front();
        }
        ring.next_seq = next_seq;
        ring
    }

    /// Append an event, returning a clone for broadcast.
    pub fn push(
        &mut self,
        kind: EventKind,
        data: Value,
        thread_id: Option<String>,
    ) -> EventRecord {
        let record = EventRecord {
            kind,
            data,
            thread_id,
            ts: Utc::now().timestamp_millis(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.events.push_back(record.clone());
        if self.events.len() > self.capacity {
            self.events.pop_front();
        }
        record
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seq_is_strictly_increasing() {
        let mut ring = EventRing::new(10);
        let a = ring.push(EventKind::RunStarted, json!({}), None);
        let b = ring.push(EventKind::RunTick, json!({"step": 1}), None);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn ring_is_bounded_and_drops_oldest() {
        let mut ring = EventRing::new(3);
        for i in 0..5 {
            ring.push(EventKind::RunTick, json!({"step": i}), None);
        }
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].data["step"], 2);
        assert_eq!(snap[2].data["step"], 4);
    }

    #[test]
    fn seq_survives_eviction() {
        let mut ring = EventRing::new(2);
        for _ in 0..4 {
            ring.push(EventKind::RunTick, json!({}), None);
        }
        assert_eq!(ring.next_seq(), 4);
        let last = ring.snapshot().last().unwrap().seq;
        assert_eq!(last, 3);
    }

    #[test]
    fn restore_continues_sequence() {
        let mut ring = EventRing::new(10);
        ring.push(EventKind::RunStarted, json!({}), None);
        ring.push(EventKind::AgentCompleted, json!({}), None);

        let restored = EventRing::restore(10, ring.snapshot(), ring.next_seq());
        let mut restored = restored;
        let next = restored.push(EventKind::RunStarted, json!({}), None);
        assert_eq!(next.seq, 2);
    }

    #[test]
    fn event_kind_serializes_with_dotted_names() {
        let v = serde_json::to_value(EventKind::CheckpointSaved).unwrap();
        assert_eq!(v, "checkpoint.saved");
        let v = serde_json::to_value(EventKind::SubagentSpawned).unwrap();
        assert_eq!(v, "subagent.spawned");
    }

    #[test]
    fn record_json_uses_type_and_thread_id_keys() {
        let mut ring = EventRing::new(4);
        let rec = ring.push(EventKind::ToolOutput, json!({"x": 1}), Some("t1".into()));
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["type"], "tool.output");
        assert_eq!(v["threadId"], "t1");
        assert_eq!(v["seq"], 0);
    }
}
