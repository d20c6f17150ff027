// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared implementation for OpenAI-compatible chat completion endpoints.
//!
//! Every provider kind in the closed set (local inference server, hosted
//! API, tenant-scoped deployment, aggregator) speaks the same
//! `/chat/completions` SSE wire format; they differ only in URL shape, auth
//! style, and attribution headers.  One `OpenAiCompatProvider` covers all
//! four, configured by `from_config`.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, warn};

use relay_registry::WireFormat;

use crate::{
    provider::ResponseStream, CompletionRequest, Message, MessageContent, ResponseEvent, Role,
    ToolSchema,
};

/// How the API key is attached to requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`: hosted APIs and aggregators.
    Bearer,
    /// `api-key: <key>`: tenant-scoped deployments.
    ApiKeyHeader,
    /// No authentication header: local inference servers.
    None,
}

/// Base delay before the single transient-failure retry.
const RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct OpenAiCompatProvider {
    /// Stable id returned by `ModelProvider::name()`.
    driver_name: &'static str,
    /// Model id forwarded to the API.
    model: String,
    api_key: Option<String>,
    /// Full chat completions URL.
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
    /// Additional headers sent on every request (aggregator attribution).
    extra_headers: Vec<(String, String)>,
    auth_style: AuthStyle,
}

impl OpenAiCompatProvider {
    /// Construct from an API base that ends before `/chat/completions`.
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self::with_full_chat_url(
            driver_name,
            model,
            api_key,
            format!("{base}/chat/completions"),
            max_tokens,
            temperature,
            extra_headers,
            auth_style,
        )
    }

    /// Construct from a pre-built chat completions URL.
    ///
    /// Needed for tenant-scoped deployments, which encode the deployment
    /// name and API version as path/query segments rather than a plain base.
    pub fn with_full_chat_url(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        chat_url: impl Into<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
    ) -> Self {
        Self {
            driver_name,
            model,
            api_key,
            chat_url: chat_url.into(),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
            extra_headers,
            auth_style,
        }
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> anyhow::Result<reqwest::RequestBuilder> {
        let req = match self.auth_style {
            AuthStyle::Bearer => {
                let key = self
                    .api_key
                    .as_deref()
                    .context("API key not set; provide api_key or api_key_env in config")?;
                req.bearer_auth(key)
            }
            AuthStyle::ApiKeyHeader => {
                let key = self
                    .api_key
                    .as_deref()
                    .context("API key not set; provide api_key or api_key_env in config")?;
                req.header("api-key", key)
            }
            AuthStyle::None => req,
        };
        Ok(req)
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let structured_tools = req.tool_format.is_structured() && !req.tools.is_empty();

        // Text-dialect models never see the structured `tools` field: their
        // tool catalog is rendered into the system message so the prompt
        // carries everything the dialect needs.
        let messages: Vec<Value> = if !structured_tools && !req.tools.is_empty() {
            let catalog = render_tool_catalog(&req.tools);
            build_wire_messages(&with_system_suffix(&req.messages, &catalog))
        } else {
            build_wire_messages(&req.messages)
        };

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "temperature": req.temperature.unwrap_or(self.temperature),
        });
        if req.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if structured_tools {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = req.tools.len(),
            message_count = messages.len(),
            "sending completion request"
        );

        let resp = self.send_with_retry(&body).await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.driver_name);
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

impl OpenAiCompatProvider {
    /// Send the request, retrying exactly once on a transient failure
    /// (connection error or HTTP 429/502/503) after a jittered delay.
    /// Permanent 4xx responses are returned to the caller untouched.
    async fn send_with_retry(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let first = self.send_once(body).await;
        match &first {
            Ok(resp) if !is_transient_status(resp.status()) => return first,
            Ok(resp) => {
                warn!(
                    driver = %self.driver_name,
                    status = %resp.status(),
                    "transient upstream status; retrying once"
                );
            }
            Err(e) => {
                warn!(driver = %self.driver_name, "upstream connection failed; retrying once: {e:#}");
            }
        }

        let jitter = rand::thread_rng().gen_range(0..250);
        tokio::time::sleep(RETRY_DELAY + Duration::from_millis(jitter)).await;
        self.send_once(body).await
    }

    async fn send_once(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let mut req = self.client.post(&self.chat_url).json(body);
        req = self.apply_auth(req)?;
        for (name, val) in &self.extra_headers {
            req = req.header(name.as_str(), val.as_str());
        }
        req.send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))
    }
}

pub(crate) fn is_transient_status(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 502 | 503)
}

/// Render tool schemas as a textual catalog for dialects that cannot
/// receive a structured `tools` field.
pub(crate) fn render_tool_catalog(tools: &[ToolSchema]) -> String {
    let mut out = String::from("# Available tools\n");
    for t in tools {
        out.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            t.name, t.description, t.parameters
        ));
    }
    out
}

/// Append `suffix` to the leading system message, inserting one if absent.
fn with_system_suffix(messages: &[Message], suffix: &str) -> Vec<Message> {
    let mut msgs = messages.to_vec();
    match msgs.first_mut() {
        Some(first) if first.role == Role::System => {
            if let MessageContent::Text(t) = &first.content {
                first.content = MessageContent::Text(format!("{t}\n\n{suffix}"));
            }
        }
        _ => msgs.insert(0, Message::system(suffix)),
    }
    msgs
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Convert a transcript into the OpenAI wire-format JSON array.
///
/// **Parallel tool-call coalescing**: the wire format requires all tool
/// calls from one assistant turn inside a single assistant message as a
/// `tool_calls` array.  The transcript stores each call as its own
/// `MessageContent::ToolCall` entry, so consecutive entries are merged here.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    fn tool_call_to_json(tool_call_id: &str, function: &crate::FunctionCall) -> Value {
        json!({
            "id": tool_call_id,
            "type": "function",
            "function": {
                "name": function.name,
                "arguments": function.arguments,
            }
        })
    }

    let mut result: Vec<Value> = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let m = &messages[i];

        if let MessageContent::ToolCall {
            tool_call_id,
            function,
        } = &m.content
        {
            let mut calls = vec![tool_call_to_json(tool_call_id, function)];
            i += 1;
            while i < messages.len() {
                if let MessageContent::ToolCall {
                    tool_call_id,
                    function,
                } = &messages[i].content
                {
                    calls.push(tool_call_to_json(tool_call_id, function));
                    i += 1;
                } else {
                    break;
                }
            }
            result.push(json!({ "role": "assistant", "tool_calls": calls }));
            continue;
        }

        let v = match &m.content {
            MessageContent::Text(t) => json!({
                "role": role_str(&m.role),
                "content": t,
            }),
            MessageContent::ToolCall { .. } => unreachable!("handled above"),
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            }),
        };
        result.push(v);
        i += 1;
    }

    result
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(Ok(parse_sse_chunk(&v)))
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

pub(crate) fn parse_sse_chunk(v: &Value) -> ResponseEvent {
    // Usage-only chunk (emitted when stream_options.include_usage = true)
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };
    }

    let delta = &v["choices"][0]["delta"];

    // Tool call delta: each SSE chunk carries one tool-call delta; the
    // index routes accumulation for parallel calls.
    if let Some(tc) = delta.get("tool_calls").and_then(|a| a.get(0)) {
        return ResponseEvent::ToolCall {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"]
                .as_str()
                .unwrap_or("")
                .to_string(),
        };
    }

    // Reasoning delta: `reasoning_content` (llama.cpp, Qwen, DeepSeek)
    // or `reasoning` (aggregators).
    let thinking = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(t) = thinking {
        if !t.is_empty() {
            return ResponseEvent::ThinkingDelta(t.to_string());
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return ResponseEvent::TextDelta(text.to_string());
    }

    ResponseEvent::TextDelta(String::new())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
