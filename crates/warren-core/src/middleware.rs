// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Middleware: typed extension points around each model call.
//!
//! A middleware is a record of optional hooks.  Per tick the engine runs
//! `before_model` chains in declared order, `modify_model_request` in
//! declared order, and `after_model` in **reverse** order.  Middlewares also
//! contribute tool definitions; two middlewares declaring the same tool name
//! is a conflict error, not an override.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use warren_model::CompletionRequest;

use crate::error::{Error, Result};
use crate::persist::ToolCallRequest;

/// Context handed to tool handlers.
#[derive(Clone)]
pub struct ToolCtx {
    pub tool_call_id: String,
    pub thread_id: String,
    /// Signaled when the run is canceled; handlers should release resources
    /// promptly but need not interrupt mid-syscall.
    pub cancel: CancellationToken,
}

pub type ToolFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, String>> + Send>>;

/// A tool implementation.  Errors are plain strings — they become
/// `tool.error` events and error-bodied tool messages, never run failures.
pub trait ToolHandler: Send + Sync {
    fn call(&self, args: Value, ctx: ToolCtx) -> ToolFuture;
}

impl<F> ToolHandler for F
where
    F: Fn(Value, ToolCtx) -> ToolFuture + Send + Sync,
{
    fn call(&self, args: Value, ctx: ToolCtx) -> ToolFuture {
        self(args, ctx)
    }
}

/// A tool the model can invoke.
#[derive(Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
    /// When set, a proposed call pauses the run for human approval.
    pub needs_approval: bool,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            needs_approval: false,
            handler: Arc::new(handler),
        }
    }

    pub fn with_approval(mut self) -> Self {
        self.needs_approval = true;
        self
    }

    pub fn schema(&self) -> warren_model::ToolSchema {
        warren_model::ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

impl std::fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDef")
            .field("name", &self.name)
            .field("needs_approval", &self.needs_approval)
            .finish()
    }
}

/// Mutable view of the tick handed to hooks.
pub struct TickContext {
    /// The instance-wide state document.  Writes are persisted with the
    /// tick's checkpoint.
    pub state: Value,
    pub thread_id: String,
    pub step: u32,
}

/// What the model produced this tick, as seen by `after_model` hooks.
#[derive(Debug, Default)]
pub struct ModelOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    /// Set by a middleware to demand a HITL pause before the proposed calls
    /// execute.
    pub interrupt: bool,
}

/// Short-circuit verdict from a `before_model` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jump {
    /// Skip the model call; go straight to executing pending tools.
    Tools,
    /// Skip the model call; complete the run.
    End,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Tools contributed by this middleware.
    fn tools(&self) -> Vec<ToolDef> {
        Vec::new()
    }

    /// Runs before the request is composed.  May mutate state or
    /// short-circuit the tick.
    async fn before_model(&self, _cx: &mut TickContext) -> Result<Option<Jump>> {
        Ok(None)
    }

    /// Transforms the composed model request.
    async fn modify_model_request(
        &self,
        _cx: &TickContext,
        _req: &mut CompletionRequest,
    ) -> Result<()> {
        Ok(())
    }

    /// Runs (in reverse declaration order) on the model's output.
    async fn after_model(&self, _cx: &mut TickContext, _outcome: &mut ModelOutcome) -> Result<()> {
        Ok(())
    }
}

/// Collect tool definitions across the chain.  A duplicate tool name is a
/// conflict error — first-declared does NOT silently win.
pub fn collect_tools(middlewares: &[Arc<dyn Middleware>]) -> Result<Vec<ToolDef>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut defs = Vec::new();
    for mw in middlewares {
        for def in mw.tools() {
            if !seen.insert(def.name.clone()) {
                return Err(Error::Conflict(format!(
                    "duplicate tool name across middlewares: {}",
                    def.name
                )));
            }
            defs.push(def);
        }
    }
    Ok(defs)
}

/// A middleware that only contributes tools.
pub struct Toolbox {
    name: String,
    defs: Vec<ToolDef>,
}

impl Toolbox {
    pub fn new(name: impl Into<String>, defs: Vec<ToolDef>) -> Self {
        Self {
            name: name.into(),
            defs,
        }
    }
}

#[async_trait]
impl Middleware for Toolbox {
    fn name(&self) -> &str {
        &self.name
    }

    fn tools(&self) -> Vec<ToolDef> {
        self.defs.clone()
    }
}

/// Flags proposed calls to approval-gated tools, pausing the run for a human
/// decision before they execute.
pub struct ApprovalGate {
    gated: HashSet<String>,
}

impl ApprovalGate {
    pub fn new(gated: impl IntoIterator<Item = String>) -> Self {
        Self {
            gated: gated.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Middleware for ApprovalGate {
    fn name(&self) -> &str {
        "approval-gate"
    }

    async fn after_model(&self, _cx: &mut TickContext, outcome: &mut ModelOutcome) -> Result<()> {
        if outcome
            .tool_calls
            .iter()
            .any(|tc| self.gated.contains(&tc.name))
        {
            outcome.interrupt = true;
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool(name: &str) -> ToolDef {
        ToolDef::new(
            name,
            "echoes args",
            json!({"type": "object"}),
            |args: Value, _ctx: ToolCtx| -> ToolFuture { Box::pin(async move { Ok(args) }) },
        )
    }

    #[tokio::test]
    async fn closure_tool_handler_runs() {
        let def = echo_tool("echo");
        let ctx = ToolCtx {
            tool_call_id: "call_0".into(),
            thread_id: "t".into(),
            cancel: CancellationToken::new(),
        };
        let out = def.handler.call(json!({"x": 1}), ctx).await.unwrap();
        assert_eq!(out["x"], 1);
    }

    #[test]
    fn duplicate_tool_name_is_a_conflict() {
        let a: Arc<dyn Middleware> = Arc::new(Toolbox::new("a", vec![echo_tool("dup")]));
        let b: Arc<dyn Middleware> = Arc::new(Toolbox::new("b", vec![echo_tool("dup")]));
        let err = collect_tools(&[a, b]).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn distinct_tools_collect_in_declared_order() {
        let a: Arc<dyn Middleware> = Arc::new(Toolbox::new("a", vec![echo_tool("one")]));
        let b: Arc<dyn Middleware> = Arc::new(Toolbox::new("b", vec![echo_tool("two")]));
        let defs = collect_tools(&[a, b]).unwrap();
        assert_eq!(defs[0].name, "one");
        assert_eq!(defs[1].name, "two");
    }

    #[tokio::test]
    async fn approval_gate_interrupts_on_gated_tool() {
        let gate = ApprovalGate::new(["risky".to_string()]);
        let mut cx = TickContext {
            state: json!({}),
            thread_id: "t".into(),
            step: 1,
        };
        let mut outcome = ModelOutcome {
            tool_calls: vec![ToolCallRequest {
                tool_call_id: "call_0".into(),
                name: "risky".into(),
                args: json!({}),
            }],
            ..Default::default()
        };
        gate.after_model(&mut cx, &mut outcome).await.unwrap();
        assert!(outcome.interrupt);
    }

    #[tokio::test]
    async fn approval_gate_ignores_ungated_tools() {
        let gate = ApprovalGate::new(["risky".to_string()]);
        let mut cx = TickContext {
            state: json!({}),
            thread_id: "t".into(),
            step: 1,
        };
        let mut outcome = ModelOutcome {
            tool_calls: vec![ToolCallRequest {
                tool_call_id: "call_0".into(),
                name: "safe".into(),
                args: json!({}),
            }],
            ..Default::default()
        };
        gate.after_model(&mut cx, &mut outcome).await.unwrap();
        assert!(!outcome.interrupt);
    }
}
