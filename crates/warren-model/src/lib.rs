// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod mock;
mod openai_compat;
mod provider;
mod types;

pub use mock::{MockProvider, ScriptedMockProvider};
pub use openai_compat::OpenAICompatProvider;
pub use provider::{ModelProvider, ResponseStream};
pub use types::{
    CompletionRequest, FunctionCall, Message, MessageContent, ResponseEvent, Role, ToolSchema,
    Usage,
};

use std::sync::Arc;

/// Build a provider from runtime configuration.
///
/// `"mock"` is accepted so that a node can run entirely offline (tests,
/// demos).  Anything else is treated as an OpenAI-compatible endpoint.
pub fn from_config(cfg: &warren_config::ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "mock" => Ok(Arc::new(MockProvider)),
        _ => {
            let api_key = cfg
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok());
            let base_url = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
            Ok(Arc::new(OpenAICompatProvider::new(
                cfg.name.clone(),
                api_key,
                &base_url,
                cfg.max_tokens,
                cfg.temperature,
            )))
        }
    }
}
