// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The request router and agentic execution loop.
//!
//! A normalized request is classified into an execution plan (direct
//! pass-through, single-model agentic, or architect + executor), then the
//! engine drives the bounded plan → model → intent → tool cycle, publishing
//! events for every observable transition.

mod engine;
mod intent;
mod normalize;
mod plan;
mod router;

#[cfg(test)]
mod tests;

pub use engine::Engine;
pub use intent::{parse_response, Intent, ParsedResponse, ToolCallRequest};
pub use normalize::{normalize, DEFAULT_SYSTEM_PROMPT};
pub use plan::{
    ExecutionPlan, IncomingRequest, Outcome, StepRecord, Strategy, ToolCallRecord, TurnOutput,
};
pub use router::Router;
