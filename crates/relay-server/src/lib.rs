// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Proxy front-end and session recorder.
//!
//! Terminates HTTP, normalizes incoming OpenAI-format requests, hands them
//! to the router/engine, and relays streaming responses.  The recorder
//! subscribes to the event bus and persists one JSON turn record per
//! completed request.

mod error;
mod http;
mod openai;
mod recorder;

pub use error::ApiError;
pub use http::{app, serve, AppState};
pub use openai::ChatCompletionRequest;
pub use recorder::{SessionRecorder, TurnRecord};
