// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events published during request processing.
///
/// Payloads are plain serde types so this crate stays a leaf: the richer
/// domain types (messages, plans, tool outcomes) are flattened into strings
/// and JSON values at the publish site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A request has been accepted and normalized.
    RequestStarted {
        model: String,
        strategy: String,
        /// The normalized incoming request (OpenAI shape) for the recorder.
        request: Value,
    },
    /// One iteration of the agentic loop has begun.
    StepStarted { step: u32 },
    /// A text chunk streamed from the architect (or executor) model.
    ModelChunk { step: u32, text: String },
    /// The intent parser classified the model response.
    IntentParsed {
        step: u32,
        kind: String,
        /// Tool names for call-tool intents; empty otherwise.
        tools: Vec<String>,
    },
    ToolCallStarted {
        step: u32,
        call_id: String,
        tool: String,
        arguments: Value,
    },
    ToolCallFinished {
        step: u32,
        call_id: String,
        tool: String,
        ok: bool,
        content: String,
        duration_ms: u64,
    },
    StepFinished { step: u32, elapsed_ms: u64 },
    /// Terminal: the request produced a response.
    RequestFinished {
        outcome: String,
        assistant_text: String,
        /// Step records assembled by the loop, for the recorder.
        steps: Value,
    },
    /// Terminal: the request failed before producing a response.
    RequestFailed { kind: String, error: String },
    ToolServerConnected { transport: String },
    ToolServerDisconnected { reason: String },
    /// Capability-profile store must be reloaded.
    ProfilesInvalidated,
    /// Advisory: the router detected a user correction pattern.
    /// Never influences the execution path.
    LearningSignal { pattern: String },
    /// Non-fatal condition observers may care about (e.g. a profile tool
    /// missing from the live advertisement).
    Warning { message: String },
}

impl Event {
    /// Short tag used in logs and subscriber filters.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::RequestStarted { .. } => "request_started",
            Event::StepStarted { .. } => "step_started",
            Event::ModelChunk { .. } => "model_chunk",
            Event::IntentParsed { .. } => "intent_parsed",
            Event::ToolCallStarted { .. } => "tool_call_started",
            Event::ToolCallFinished { .. } => "tool_call_finished",
            Event::StepFinished { .. } => "step_finished",
            Event::RequestFinished { .. } => "request_finished",
            Event::RequestFailed { .. } => "request_failed",
            Event::ToolServerConnected { .. } => "tool_server_connected",
            Event::ToolServerDisconnected { .. } => "tool_server_disconnected",
            Event::ProfilesInvalidated => "profiles_invalidated",
            Event::LearningSignal { .. } => "learning_signal",
            Event::Warning { .. } => "warning",
        }
    }

    /// True for the two variants that end a request's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::RequestFinished { .. } | Event::RequestFailed { .. }
        )
    }
}

/// A published event with its delivery metadata.
///
/// `seq` increases monotonically per request id; subscribers observe events
/// for one request in strictly increasing `seq` order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub request_id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}
