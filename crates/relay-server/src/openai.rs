// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI chat-completion wire types and their mapping onto the internal
//! transcript representation.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use relay_core::Outcome;
use relay_model::{Message, MessageContent, ToolSchema};

/// Incoming `POST /v1/chat/completions` body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub tools: Vec<WireTool>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    pub role: String,
    /// Either a plain string or an array of `{type:"text", text}` parts.
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    pub function: WireFunction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireTool {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub function: WireToolSchema,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
}

fn default_parameters() -> Value {
    json!({ "type": "object" })
}

impl ChatCompletionRequest {
    /// Convert the wire messages into the internal transcript.
    ///
    /// Tool messages must reference the call they answer; an assistant
    /// message with a `tool_calls` array becomes one internal `ToolCall`
    /// message per entry.
    pub fn to_messages(&self) -> Result<Vec<Message>, String> {
        if self.messages.is_empty() {
            return Err("messages must not be empty".into());
        }
        let mut out = Vec::with_capacity(self.messages.len());
        for (i, m) in self.messages.iter().enumerate() {
            match m.role.as_str() {
                "system" => out.push(Message::system(content_text(&m.content))),
                "user" => out.push(Message::user(content_text(&m.content))),
                "assistant" => {
                    if let Some(calls) = &m.tool_calls {
                        for c in calls {
                            out.push(Message::tool_call(
                                &c.id,
                                &c.function.name,
                                &c.function.arguments,
                            ));
                        }
                    } else {
                        out.push(Message::assistant(content_text(&m.content)));
                    }
                }
                "tool" => {
                    let id = m
                        .tool_call_id
                        .as_deref()
                        .ok_or_else(|| format!("messages[{i}]: tool message without tool_call_id"))?;
                    let answered = out.iter().any(|prev| {
                        matches!(&prev.content, MessageContent::ToolCall { tool_call_id, .. }
                            if tool_call_id == id)
                    });
                    if !answered {
                        return Err(format!(
                            "messages[{i}]: tool message references unknown call id '{id}'"
                        ));
                    }
                    out.push(Message::tool_result(id, content_text(&m.content)));
                }
                other => return Err(format!("messages[{i}]: unknown role '{other}'")),
            }
        }
        Ok(out)
    }

    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|t| ToolSchema {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                parameters: t.function.parameters.clone(),
            })
            .collect()
    }
}

/// Flatten a wire content value (string or text-part array) to plain text.
fn content_text(content: &Option<Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Map a terminal outcome to the wire finish reason.
pub fn finish_reason(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Completed => "stop",
        Outcome::IterationLimit | Outcome::Deadline => "length",
        Outcome::ModelError | Outcome::ToolErrorTerminal => "stop",
    }
}

/// 4-chars-per-token estimate used for the usage block; providers that
/// report exact counts are not consulted again at this layer.
pub fn approx_tokens(text: &str) -> u32 {
    (text.len() / 4).max(1) as u32
}

/// Build the non-streaming completion response body.
pub fn completion_response(
    request_id: &str,
    model: &str,
    assistant_text: &str,
    outcome: Outcome,
    prompt_chars: usize,
) -> Value {
    let prompt_tokens = (prompt_chars / 4).max(1) as u32;
    let completion_tokens = approx_tokens(assistant_text);
    json!({
        "id": format!("chatcmpl-{request_id}"),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": assistant_text },
            "finish_reason": finish_reason(outcome),
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    })
}

/// Build one streaming chunk frame.
pub fn chunk_frame(
    request_id: &str,
    model: &str,
    delta_text: Option<&str>,
    finish: Option<&str>,
) -> Value {
    let delta = match delta_text {
        Some(t) => json!({ "content": t }),
        None => json!({}),
    };
    json!({
        "id": format!("chatcmpl-{request_id}"),
        "object": "chat.completion.chunk",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }],
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
