// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::str::FromStr;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use warren_store::ScheduleRow;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("fire time is not representable: {0}")]
    InvalidWhen(String),

    #[error("malformed schedule payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// How a schedule computes its fire times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleKind {
    /// One-shot, relative to creation time.
    Delayed { delay_ms: u64 },
    /// One-shot at a fixed epoch-ms instant.
    Absolute { at: i64 },
    /// Recurring on a cron expression (5-field, minute resolution).
    Cron { expr: String },
    /// Recurring every `period_ms` from the previous fire.
    Interval { period_ms: u64 },
}

impl ScheduleKind {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Delayed { .. } => "delayed",
            Self::Absolute { .. } => "absolute",
            Self::Cron { .. } => "cron",
            Self::Interval { .. } => "interval",
        }
    }

    /// First fire time for a schedule created at `now` (epoch ms).
    pub fn first_fire(&self, now: i64) -> Result<i64, ScheduleError> {
        match self {
            Self::Delayed { delay_ms } => Ok(now + *delay_ms as i64),
            Self::Absolute { at } => Ok(*at),
            Self::Interval { period_ms } => Ok(now + *period_ms as i64),
            Self::Cron { expr } => next_cron_match(expr, now),
        }
    }

    /// Fire time after a fire at `now`; `None` means the schedule is spent
    /// and must be deleted.
    pub fn reschedule_after_fire(&self, now: i64) -> Result<Option<i64>, ScheduleError> {
        match self {
            Self::Delayed { .. } | Self::Absolute { .. } => Ok(None),
            Self::Interval { period_ms } => Ok(Some(now + *period_ms as i64)),
            Self::Cron { expr } => Ok(Some(next_cron_match(expr, now)?)),
        }
    }
}

/// Compute the next cron match strictly after `now` (epoch ms).
///
/// Accepts the classic 5-field form (minute resolution); a seconds field of
/// `0` is prepended so the `cron` crate's 6/7-field parser accepts it.
fn next_cron_match(expr: &str, now: i64) -> Result<i64, ScheduleError> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    let schedule = cron::Schedule::from_str(&normalized)
        .map_err(|e| ScheduleError::InvalidCron(format!("{expr}: {e}")))?;
    let after = Utc
        .timestamp_millis_opt(now)
        .single()
        .ok_or_else(|| ScheduleError::InvalidWhen(format!("{now}")))?;
    schedule
        .after(&after)
        .next()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| ScheduleError::InvalidWhen(format!("cron has no future match: {expr}")))
}

/// A persisted schedule: callback name, payload, kind, and the next fire time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    /// Name of the registered instance callback invoked on fire.
    pub callback: String,
    pub payload: Value,
    pub kind: ScheduleKind,
    /// Next absolute fire time, epoch ms.
    pub next_run: i64,
}

impl Schedule {
    /// Create a schedule whose first fire time is computed from `now`.
    pub fn new(
        callback: impl Into<String>,
        kind: ScheduleKind,
        payload: Value,
        now: i64,
    ) -> Result<Self, ScheduleError> {
        let next_run = kind.first_fire(now)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            callback: callback.into(),
            payload,
            kind,
            next_run,
        })
    }

    /// Convert to the storage row shape.  The row denormalizes `kind` and
    /// `next_run` into columns; everything else rides in the payload JSON.
    pub fn to_row(&self) -> ScheduleRow {
        ScheduleRow {
            id: self.id.clone(),
            kind: self.kind.kind_str().to_string(),
            next_run: self.next_run,
            payload: serde_json::json!({
                "callback": self.callback,
                "payload": self.payload,
                "kind": self.kind,
            }),
        }
    }

    pub fn from_row(row: &ScheduleRow) -> Result<Self, ScheduleError> {
        let callback = row.payload["callback"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let kind: ScheduleKind = serde_json::from_value(row.payload["kind"].clone())?;
        Ok(Self {
            id: row.id.clone(),
            callback,
            payload: row.payload["payload"].clone(),
            kind,
            next_run: row.next_run,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delayed_fires_after_delta_then_deletes() {
        let kind = ScheduleKind::Delayed { delay_ms: 1_500 };
        assert_eq!(kind.first_fire(10_000).unwrap(), 11_500);
        assert_eq!(kind.reschedule_after_fire(11_500).unwrap(), None);
    }

    #[test]
    fn absolute_fires_at_fixed_instant() {
        let kind = ScheduleKind::Absolute { at: 42_000 };
        assert_eq!(kind.first_fire(10_000).unwrap(), 42_000);
        assert_eq!(kind.reschedule_after_fire(42_000).unwrap(), None);
    }

    #[test]
    fn interval_reschedules_one_period_from_fire() {
        let kind = ScheduleKind::Interval { period_ms: 60_000 };
        assert_eq!(kind.first_fire(0).unwrap(), 60_000);
        assert_eq!(kind.reschedule_after_fire(61_234).unwrap(), Some(121_234));
    }

    #[test]
    fn five_field_cron_is_accepted() {
        // Every minute: next match is the next whole minute boundary.
        let kind = ScheduleKind::Cron {
            expr: "* * * * *".into(),
        };
        let now = 90_000; // 00:01:30
        let fire = kind.first_fire(now).unwrap();
        assert_eq!(fire, 120_000);
    }

    #[test]
    fn cron_reschedules_to_next_match() {
        let kind = ScheduleKind::Cron {
            expr: "* * * * *".into(),
        };
        let next = kind.reschedule_after_fire(120_000).unwrap().unwrap();
        assert_eq!(next, 180_000);
    }

    #[test]
    fn invalid_cron_is_an_error() {
        let kind = ScheduleKind::Cron {
            expr: "not a cron".into(),
        };
        assert!(matches!(
            kind.first_fire(0),
            Err(ScheduleError::InvalidCron(_))
        ));
    }

    #[test]
    fn schedule_row_roundtrip() {
        let s = Schedule::new(
            "run_tick",
            ScheduleKind::Interval { period_ms: 1000 },
            json!({"n": 7}),
            0,
        )
        .unwrap();
        let row = s.to_row();
        assert_eq!(row.kind, "interval");
        let back = Schedule::from_row(&row).unwrap();
        assert_eq!(back.callback, "run_tick");
        assert_eq!(back.payload, json!({"n": 7}));
        assert_eq!(back.kind, s.kind);
        assert_eq!(back.next_run, s.next_run);
    }
}
