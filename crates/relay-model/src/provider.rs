// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// One upstream model endpoint, hidden behind a single call shape.
///
/// Implementations translate between the internal transcript types and the
/// provider's wire format, and surface streaming responses as a uniform
/// event stream regardless of whether the caller asked for streaming.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable provider name for logs and status display.
    fn name(&self) -> &str;

    /// Model identifier forwarded to the upstream API.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;
}
