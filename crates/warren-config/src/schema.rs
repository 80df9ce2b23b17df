// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so a named function is required for enabled-by-default
/// fields.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    /// Named agent classes.  An instance address is `(class, name)`; the
    /// class entry supplies the default system prompt, model override and
    /// sub-agent descriptors for every instance of that class.
    ///
    /// ```yaml
    /// agents:
    ///   support:
    ///     system_prompt: "You are a support agent."
    ///     subagents:
    ///       researcher:
    ///         system_prompt: "You research one question and report back."
    /// ```
    #[serde(default)]
    pub agents: HashMap<String, AgentClassConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address for the HTTP/WebSocket edge.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum accepted request body, in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
    /// Allow cross-origin browser clients.
    #[serde(default = "default_true")]
    pub cors: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_body_limit() -> usize {
    2 * 1024 * 1024
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            body_limit: default_body_limit(),
            cors: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding one SQLite database per agent instance.
    /// Defaults to `~/.local/share/warren`.
    pub data_dir: Option<PathBuf>,
    /// Seconds an instance may sit idle (no handler invocations, no active
    /// run) before it is evicted from memory.  Durable state survives; the
    /// next reference reloads it.
    #[serde(default = "default_idle_secs")]
    pub hibernate_after_secs: u64,
    /// Capacity of the per-instance lifecycle event ring.
    #[serde(default = "default_event_ring")]
    pub event_ring_capacity: usize,
}

fn default_idle_secs() -> u64 {
    300
}

fn default_event_ring() -> usize {
    500
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            hibernate_after_secs: default_idle_secs(),
            event_ring_capacity: default_event_ring(),
        }
    }
}

/// Knobs for the bounded-tick run engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum tool executions dispatched within one tick.
    #[serde(default = "default_tools_per_tick")]
    pub tools_per_tick: usize,
    /// Hard ceiling on ticks per run.  A run that reaches it transitions to
    /// the error state rather than rescheduling forever.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Maximum sub-agent nesting depth.
    #[serde(default = "default_subagent_depth")]
    pub max_subagent_depth: u32,
}

fn default_tools_per_tick() -> usize {
    5
}

fn default_max_steps() -> u32 {
    64
}

fn default_subagent_depth() -> u32 {
    3
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tools_per_tick: default_tools_per_tick(),
            max_steps: default_max_steps(),
            max_subagent_depth: default_subagent_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai_compat" | "mock".
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model name forwarded to the provider API.
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Base URL override.  Useful for local servers, LiteLLM, or proxies.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
}

fn default_provider() -> String {
    "openai_compat".to_string()
}

fn default_model_name() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            name: default_model_name(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            base_url: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Per-class agent definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentClassConfig {
    /// System prompt used when a run does not carry its own.
    pub system_prompt: Option<String>,
    /// Model name override for this class.
    pub model: Option<String>,
    /// Tools in this class that require human approval before execution.
    #[serde(default)]
    pub confirm_tools: Vec<String>,
    /// Sub-agent descriptors addressable from the `task` tool by
    /// `subagent_type`.
    #[serde(default)]
    pub subagents: HashMap<String, SubagentDescriptor>,
}

/// Descriptor for a spawnable sub-agent type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubagentDescriptor {
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    /// Default join timeout for this sub-agent type, e.g. `"10m"`.
    pub timeout: Option<String>,
}

impl SubagentDescriptor {
    /// Parse the configured timeout into milliseconds, if any.
    pub fn timeout_ms(&self) -> Option<u64> {
        let raw = self.timeout.as_deref()?;
        humantime::parse_duration(raw).ok().map(|d| d.as_millis() as u64)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_runner_limits() {
        let cfg = Config::default();
        assert_eq!(cfg.runner.tools_per_tick, 5);
        assert_eq!(cfg.runner.max_steps, 64);
        assert_eq!(cfg.runtime.event_ring_capacity, 500);
    }

    #[test]
    fn empty_yaml_deserializes_to_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.http.bind, "127.0.0.1:8787");
        assert!(cfg.agents.is_empty());
    }

    #[test]
    fn partial_yaml_keeps_unset_defaults() {
        let cfg: Config = serde_yaml::from_str("http:\n  bind: 0.0.0.0:9000\n").unwrap();
        assert_eq!(cfg.http.bind, "0.0.0.0:9000");
        assert_eq!(cfg.http.body_limit, 2 * 1024 * 1024);
        assert!(cfg.http.cors);
    }

    #[test]
    fn agent_class_with_subagents_parses() {
        let yaml = r#"
agents:
  support:
    system_prompt: "You are a support agent."
    confirm_tools: [risky]
    subagents:
      researcher:
        system_prompt: "Research and report."
        timeout: 5m
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let class = cfg.agents.get("support").unwrap();
        assert_eq!(class.confirm_tools, vec!["risky"]);
        let sub = class.subagents.get("researcher").unwrap();
        assert_eq!(sub.timeout_ms(), Some(300_000));
    }

    #[test]
    fn subagent_timeout_invalid_string_is_none() {
        let sub = SubagentDescriptor {
            timeout: Some("not-a-duration".to_string()),
            ..Default::default()
        };
        assert_eq!(sub.timeout_ms(), None);
    }
}
