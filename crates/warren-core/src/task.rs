// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Auxiliary task records: long-running work an instance tracks on behalf of
//! clients, with monotonic status transitions, non-decreasing progress, and
//! an optional deadline enforced through the scheduler.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Aborted,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    /// Percentage in `[0, 100]`; non-decreasing while running.
    pub progress: u8,
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Epoch-ms deadline; expiry aborts the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, deadline: Option<i64>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            progress: 0,
            events: Vec::new(),
            result: None,
            error: None,
            deadline,
            created_at: Utc::now().timestamp_millis(),
        }
    }

    fn ensure_not_terminal(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::InvalidRequest(format!(
                "task {} already {:?}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.ensure_not_terminal()?;
        if self.status != TaskStatus::Pending {
            return Err(Error::InvalidRequest(format!(
                "task {} is not pending",
                self.id
            )));
        }
        self.status = TaskStatus::Running;
        Ok(())
    }

    /// Progress may only move forward while running.
    pub fn set_progress(&mut self, progress: u8) -> Result<()> {
        self.ensure_not_terminal()?;
        if self.status != TaskStatus::Running {
            return Err(Error::InvalidRequest(format!(
                "task {} is not running",
                self.id
            )));
        }
        let clamped = progress.min(100);
        if clamped < self.progress {
            return Err(Error::InvalidRequest(format!(
                "task {} progress may not decrease ({} -> {clamped})",
                self.id, self.progress
            )));
        }
        self.progress = clamped;
        Ok(())
    }

    pub fn record_event(&mut self, event: Value) {
        self.events.push(event);
    }

    pub fn complete(&mut self, result: Value) -> Result<()> {
        self.ensure_not_terminal()?;
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.ensure_not_terminal()?;
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        Ok(())
    }

    /// Deadline expiry: aborted with the canonical timeout error.  A no-op on
    /// already-terminal tasks, so a stale deadline firing late is harmless.
    pub fn abort_timed_out(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Aborted;
            self.error = Some("timed out".to_string());
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_pending_running_completed() {
        let mut t = TaskRecord::new("t1", None);
        t.start().unwrap();
        t.set_progress(40).unwrap();
        t.set_progress(80).unwrap();
        t.complete(json!({"answer": 42})).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.progress, 100);
    }

    #[test]
    fn progress_may_not_decrease() {
        let mut t = TaskRecord::new("t1", None);
        t.start().unwrap();
        t.set_progress(50).unwrap();
        assert!(t.set_progress(30).is_err());
        assert_eq!(t.progress, 50);
    }

    #[test]
    fn progress_requires_running() {
        let mut t = TaskRecord::new("t1", None);
        assert!(t.set_progress(10).is_err());
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut t = TaskRecord::new("t1", None);
        t.start().unwrap();
        t.fail("boom").unwrap();
        assert!(t.start().is_err());
        assert!(t.complete(json!(null)).is_err());
        assert!(t.set_progress(99).is_err());
    }

    #[test]
    fn deadline_expiry_aborts_with_timed_out() {
        let mut t = TaskRecord::new("t1", Some(12345));
        t.start().unwrap();
        t.abort_timed_out();
        assert_eq!(t.status, TaskStatus::Aborted);
        assert_eq!(t.error.as_deref(), Some("timed out"));
    }

    #[test]
    fn late_deadline_fire_on_completed_task_is_harmless() {
        let mut t = TaskRecord::new("t1", Some(12345));
        t.start().unwrap();
        t.complete(json!(1)).unwrap();
        t.abort_timed_out();
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.error.is_none());
    }
}
