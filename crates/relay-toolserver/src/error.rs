// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Failure modes a tool call can surface to the agentic loop.
///
/// All of these are tool-scope errors: the loop converts them to error
/// tool-results and keeps going; they never abort the request by
/// themselves.
#[derive(Debug, Error)]
pub enum ToolServerError {
    /// The call did not complete within its deadline.  The rpc id stays in
    /// the pending table so a late response can be recognised and
    /// discarded.
    #[error("tool call timed out")]
    Timeout,

    /// No transport is currently established.
    #[error("tool server not connected")]
    NotConnected,

    /// The transport failed mid-call (process died, HTTP error, protocol
    /// violation).
    #[error("tool server transport error: {0}")]
    Transport(String),
}

impl ToolServerError {
    /// Stable reason string recorded in error tool-results so the model
    /// (and the turn record) can distinguish failure classes.
    pub fn reason(&self) -> &'static str {
        match self {
            ToolServerError::Timeout => "timeout",
            ToolServerError::NotConnected => "not-connected",
            ToolServerError::Transport(_) => "transport-error",
        }
    }
}

/// Why the supervisor could not establish any transport at startup.
///
/// `NoTransport` maps to process exit code 2: the subprocess could not be
/// started and no remote was configured.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("tool server subprocess could not be started: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("no tool server transport configured")]
    NoTransport,
}
