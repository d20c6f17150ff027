// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-server supervisor: a resilient connection to the external process
//! that implements the tool primitives.
//!
//! Two transports, transparent to callers: remote JSON-over-HTTP when the
//! configured URL answers its health probe, otherwise a supervised child
//! process speaking line-delimited JSON-RPC 2.0 on stdin/stdout.  Transport
//! loss fails all in-flight calls, then a single capped-back-off reconnect
//! loop restores whichever transport comes back first.

mod error;
mod rpc;
mod supervisor;

use std::time::Duration;

use serde_json::Value;

pub use error::{ConnectError, ToolServerError};
pub use supervisor::ToolServerSupervisor;

/// One advertised tool.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// What the agentic loop needs from a tool backend.
///
/// The supervisor is the production implementation; tests drive the loop
/// with scripted implementations of this trait.
#[async_trait::async_trait]
pub trait ToolDispatch: Send + Sync {
    /// Run one tool call to completion within `deadline`.
    async fn execute(
        &self,
        name: &str,
        args: &Value,
        deadline: Duration,
    ) -> Result<String, ToolServerError>;

    /// The current tool advertisement (cached between reconnects).
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolServerError>;

    /// Canonical tool name for a possibly model-specific alias.
    /// Idempotent: resolving a canonical name returns it unchanged.
    fn resolve_alias(&self, model_id: &str, name: &str) -> String;

    /// Whether a transport is currently established.
    fn connected(&self) -> bool;
}
