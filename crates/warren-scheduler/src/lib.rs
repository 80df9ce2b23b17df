// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Durable schedules for agent instances.
//!
//! Four schedule kinds share one table and one alarm:
//!
//! | kind | fires at | after fire |
//! |---|---|---|
//! | delayed | `now + Δ` | delete |
//! | absolute | fixed epoch-ms | delete |
//! | cron | next match of the expression | reschedule to next match |
//! | interval | `now + n·period` | reschedule to `now + period` |
//!
//! An instance keeps at most **one** physical alarm, always pointing at
//! `min(next_run)` across its schedules.  The [`AlarmSupervisor`] owns those
//! timers for every loaded *and hibernated* instance, so a schedule fires
//! even when its instance has been evicted from memory — firing is what
//! wakes it.

mod alarm;
mod schedule;

pub use alarm::AlarmSupervisor;
pub use schedule::{now_ms, Schedule, ScheduleError, ScheduleKind};
