// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_model::{Message, ToolSchema};
use relay_registry::WireFormat;

/// A normalized incoming chat request, ready for routing.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Model id named by the client.
    pub model: String,
    /// Normalized transcript (exactly one leading system message).
    pub messages: Vec<Message>,
    /// Tools declared by the client alongside the request.
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

/// How a request will be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Proxy straight to the provider of the named model.
    Direct,
    /// Single-model agentic loop.
    Agentic,
    /// Architect plans, executor emits the structured tool call.
    DualModel,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Direct => "direct",
            Strategy::Agentic => "agentic",
            Strategy::DualModel => "dual_model",
        }
    }
}

/// Everything the agentic loop needs to run one request.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub strategy: Strategy,
    pub architect: String,
    pub executor: Option<String>,
    /// Tool schemas the architect will see; already the intersection of the
    /// capability profile and the live advertisement.
    pub tools: Vec<ToolSchema>,
    pub wire_format: WireFormat,
    /// Prosthetic system-prompt fragment from the architect's profile.
    pub prosthetic: Option<String>,
    pub max_steps: u32,
    pub total_deadline: Duration,
    pub step_deadline: Duration,
    pub tool_deadline: Duration,
}

/// Terminal state of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Completed,
    IterationLimit,
    Deadline,
    ModelError,
    ToolErrorTerminal,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::IterationLimit => "iteration-limit",
            Outcome::Deadline => "deadline",
            Outcome::ModelError => "model-error",
            Outcome::ToolErrorTerminal => "tool-error-terminal",
        }
    }
}

/// One executed tool call inside a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool: String,
    pub arguments: Value,
    pub ok: bool,
    pub content: String,
    pub duration_ms: u64,
}

/// One iteration of the agentic loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: u32,
    /// Full architect response text for this step.
    pub response_text: String,
    pub intent: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub elapsed_ms: u64,
    pub terminal: bool,
}

/// The result of running a plan to completion.
#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub assistant_text: String,
    pub outcome: Outcome,
    pub steps: Vec<StepRecord>,
    /// The model-visible transcript as of the end of the turn.
    pub transcript: Vec<Message>,
    /// Detail for `model-error` outcomes, surfaced in the error envelope.
    pub error: Option<String>,
}
