// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Configuration for the warren runtime: schema structs and the YAML loader.

mod loader;
mod schema;

pub use loader::{default_data_dir, load};
pub use schema::{
    AgentClassConfig, Config, HttpConfig, ModelConfig, RunnerConfig, RuntimeConfig,
    SubagentDescriptor,
};
