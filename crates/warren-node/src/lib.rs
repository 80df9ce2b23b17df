// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! HTTP/WebSocket edge and instance host for warren agents.

pub mod error;
pub mod host;
pub mod http;
pub mod node;

pub use host::{InstanceCmd, InstanceHandle, NodeState};
pub use node::{run, spawn, spawn_with_model};
