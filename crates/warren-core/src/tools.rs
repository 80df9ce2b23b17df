// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Built-in tools.
//!
//! Both built-ins return *intent markers* rather than plain results: the
//! handler runs inside a tick that holds the instance write lock, so the
//! effect (spawning a child instance, writing a schedule) is applied by the
//! engine after the handler returns.
//!
//! - `task` → `{"__spawn": {...}}` — spawn a sub-agent and pause until its
//!   report arrives.
//! - `schedule` → `{"__schedule": {...}}` — enqueue a future prompt for this
//!   instance.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use warren_scheduler::ScheduleKind;

use crate::middleware::{ToolCtx, ToolDef, ToolFuture};

/// A sub-agent spawn requested by the `task` tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnIntent {
    pub description: String,
    #[serde(rename = "subagent_type")]
    pub subagent_type: String,
    #[serde(rename = "timeoutMs", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// A future prompt requested by the `schedule` tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleIntent {
    pub kind: ScheduleKind,
    pub prompt: String,
}

/// Extract a spawn intent from a tool handler's output.
pub fn parse_spawn_intent(output: &Value) -> Option<SpawnIntent> {
    serde_json::from_value(output.get("__spawn")?.clone()).ok()
}

/// Extract a schedule intent from a tool handler's output.
pub fn parse_schedule_intent(output: &Value) -> Option<ScheduleIntent> {
    let v = output.get("__schedule")?;
    let prompt = v["prompt"].as_str()?.to_string();
    let kind = serde_json::from_value(v["kind"].clone()).ok()?;
    Some(ScheduleIntent { kind, prompt })
}

/// The `task` tool: delegate a focused task to a sub-agent.  The parent run
/// pauses until every spawned child reports back.
pub fn task_tool() -> ToolDef {
    ToolDef::new(
        "task",
        "Spawn a sub-agent to complete a focused task and return its final report. \
         Useful for delegating isolated sub-tasks that need their own conversation.",
        json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "The task description for the sub-agent"
                },
                "subagent_type": {
                    "type": "string",
                    "description": "Which configured sub-agent descriptor to use (default: general)"
                },
                "timeoutMs": {
                    "type": "integer",
                    "description": "Optional join timeout in milliseconds"
                }
            },
            "required": ["description"]
        }),
        |args: Value, _ctx: ToolCtx| -> ToolFuture {
            Box::pin(async move {
                let description = args["description"]
                    .as_str()
                    .ok_or_else(|| "missing 'description'".to_string())?
                    .to_string();
                let subagent_type = args["subagent_type"]
                    .as_str()
                    .unwrap_or("general")
                    .to_string();
                let timeout_ms = args["timeoutMs"].as_u64();
                Ok(json!({
                    "__spawn": SpawnIntent { description, subagent_type, timeout_ms }
                }))
            })
        },
    )
}

/// The `schedule` tool: have a prompt delivered back to this instance in the
/// future — once after a delay, at an absolute time, or on a cron expression.
pub fn schedule_tool() -> ToolDef {
    ToolDef::new(
        "schedule",
        "Schedule a prompt to be sent back to yourself later. Provide exactly one of \
         delay_seconds (one-shot), at (epoch milliseconds, one-shot), cron (recurring), \
         or every_seconds (recurring).",
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The prompt to deliver when the schedule fires"
                },
                "delay_seconds": { "type": "integer" },
                "at": { "type": "integer" },
                "cron": { "type": "string" },
                "every_seconds": { "type": "integer" }
            },
            "required": ["prompt"]
        }),
        |args: Value, _ctx: ToolCtx| -> ToolFuture {
            Box::pin(async move {
                let prompt = args["prompt"]
                    .as_str()
                    .ok_or_else(|| "missing 'prompt'".to_string())?
                    .to_string();
                let kind = schedule_kind_from_args(&args)?;
                Ok(json!({
                    "__schedule": { "prompt": prompt, "kind": kind }
                }))
            })
        },
    )
}

fn schedule_kind_from_args(args: &Value) -> Result<ScheduleKind, String> {
    if let Some(secs) = args["delay_seconds"].as_u64() {
        return Ok(ScheduleKind::Delayed {
            delay_ms: secs * 1000,
        });
    }
    if let Some(at) = args["at"].as_i64() {
        return Ok(ScheduleKind::Absolute { at });
    }
    if let Some(expr) = args["cron"].as_str() {
        return Ok(ScheduleKind::Cron {
            expr: expr.to_string(),
        });
    }
    if let Some(secs) = args["every_seconds"].as_u64() {
        return Ok(ScheduleKind::Interval {
            period_ms: secs * 1000,
        });
    }
    Err("provide one of delay_seconds, at, cron, every_seconds".to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ToolCtx {
        ToolCtx {
            tool_call_id: "call_0".into(),
            thread_id: "t".into(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn task_tool_emits_spawn_intent() {
        let def = task_tool();
        let out = def
            .handler
            .call(
                json!({"description": "summarize the report", "subagent_type": "researcher"}),
                ctx(),
            )
            .await
            .unwrap();
        let intent = parse_spawn_intent(&out).unwrap();
        assert_eq!(intent.description, "summarize the report");
        assert_eq!(intent.subagent_type, "researcher");
        assert_eq!(intent.timeout_ms, None);
    }

    #[tokio::test]
    async fn task_tool_defaults_subagent_type() {
        let def = task_tool();
        let out = def
            .handler
            .call(json!({"description": "x"}), ctx())
            .await
            .unwrap();
        assert_eq!(parse_spawn_intent(&out).unwrap().subagent_type, "general");
    }

    #[tokio::test]
    async fn task_tool_requires_description() {
        let def = task_tool();
        let err = def.handler.call(json!({}), ctx()).await.unwrap_err();
        assert!(err.contains("description"));
    }

    #[tokio::test]
    async fn schedule_tool_builds_delayed_kind() {
        let def = schedule_tool();
        let out = def
            .handler
            .call(json!({"prompt": "check in", "delay_seconds": 60}), ctx())
            .await
            .unwrap();
        let intent = parse_schedule_intent(&out).unwrap();
        assert_eq!(intent.prompt, "check in");
        assert_eq!(intent.kind, ScheduleKind::Delayed { delay_ms: 60_000 });
    }

    #[tokio::test]
    async fn schedule_tool_builds_cron_kind() {
        let def = schedule_tool();
        let out = def
            .handler
            .call(json!({"prompt": "daily", "cron": "0 9 * * *"}), ctx())
            .await
            .unwrap();
        let intent = parse_schedule_intent(&out).unwrap();
        assert_eq!(
            intent.kind,
            ScheduleKind::Cron { expr: "0 9 * * *".into() }
        );
    }

    #[tokio::test]
    async fn schedule_tool_rejects_missing_when() {
        let def = schedule_tool();
        let err = def
            .handler
            .call(json!({"prompt": "x"}), ctx())
            .await
            .unwrap_err();
        assert!(err.contains("delay_seconds"));
    }

    #[test]
    fn ordinary_output_is_not_an_intent() {
        assert!(parse_spawn_intent(&json!({"ok": true})).is_none());
        assert!(parse_schedule_intent(&json!({"ok": true})).is_none());
    }
}
