// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Dialect-tolerant extraction of structured intents from model text.
//!
//! Model families emit tool calls in incompatible syntaxes: Hermes/Qwen
//! XML tags, bracket markup, fenced JSON, bare JSON objects, or prose with
//! an embedded directive.  This parser is the permissive front-end that
//! turns all of them into one internal representation; everything past it
//! sees only [`Intent`].
//!
//! Parsing is pure: the same text always yields the same result.

use serde_json::Value;

/// One requested tool invocation, arguments already JSON-decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: Value,
}

/// The normalised outcome of a model response.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Answer the user with this text.
    Respond(String),
    /// Invoke these tools (in issue order; may be several in one response).
    CallTools(Vec<ToolCallRequest>),
    /// Put a question back to the user.
    AskUser(String),
}

impl Intent {
    pub fn kind(&self) -> &'static str {
        match self {
            Intent::Respond(_) => "respond",
            Intent::CallTools(_) => "call_tool",
            Intent::AskUser(_) => "ask_user",
        }
    }
}

/// A parsed response: the intent plus any natural-language prose that
/// surrounded the directive.  The prose is retained as the assistant's
/// reasoning message preceding a tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub reasoning: Option<String>,
    pub intent: Intent,
}

enum Directive {
    Call(ToolCallRequest),
    Respond(String),
    AskUser(String),
}

/// Delimiter pairs around a JSON payload, tried in order.  The set covers
/// the tool-call wire dialects the capability registry knows about.
const DELIMITED: &[(&str, &str)] = &[
    ("<tool_call>", "</tool_call>"),
    ("[TOOL_REQUEST]", "[END_TOOL_REQUEST]"),
    ("[TOOL_REQUEST]", "[END_TOOL_RESULT]"),
    ("```json", "```"),
];

const NAME_KEYS: &[&str] = &["name", "tool", "function", "tool_name", "function_name"];
const ARG_KEYS: &[&str] = &["arguments", "parameters", "params", "args", "input"];

/// Parse a raw model response into reasoning prose plus an intent.
pub fn parse_response(raw: &str) -> ParsedResponse {
    let text = strip_reasoning_spans(raw);

    let mut working = text.clone();
    let mut directives: Vec<Directive> = Vec::new();

    // Pass 1: delimited payloads.
    for (open, close) in DELIMITED {
        extract_delimited(&mut working, open, close, &mut directives);
    }

    // Pass 2: bare balanced JSON objects, only when no delimited payload
    // produced anything (a respond directive embedded in prose must not be
    // shadowed by stray braces elsewhere).
    if directives.is_empty() {
        extract_bare_objects(&mut working, &mut directives);
    }

    let calls: Vec<ToolCallRequest> = directives
        .iter()
        .filter_map(|d| match d {
            Directive::Call(c) => Some(c.clone()),
            _ => None,
        })
        .collect();

    let prose = tidy(&working);

    if !calls.is_empty() {
        return ParsedResponse {
            reasoning: if prose.is_empty() { None } else { Some(prose) },
            intent: Intent::CallTools(calls),
        };
    }

    for d in &directives {
        if let Directive::AskUser(q) = d {
            return ParsedResponse {
                reasoning: if prose.is_empty() {
                    None
                } else {
                    Some(prose)
                },
                intent: Intent::AskUser(q.clone()),
            };
        }
    }

    for d in &directives {
        if let Directive::Respond(t) = d {
            let answer = if t.is_empty() { prose.clone() } else { t.clone() };
            return ParsedResponse {
                reasoning: None,
                intent: Intent::Respond(answer),
            };
        }
    }

    // Nothing parsed: strip any tool-call-looking fragments that failed to
    // decode and answer with what remains.
    let cleaned = tidy(&strip_tool_fragments(&working));
    ParsedResponse {
        reasoning: None,
        intent: Intent::Respond(cleaned),
    }
}

/// Remove `<think>…</think>` / `<reasoning>…</reasoning>` spans (an
/// unclosed trailing span is stripped to the end of the text).
fn strip_reasoning_spans(text: &str) -> String {
    let mut out = text.to_string();
    for (open, close) in [("<think>", "</think>"), ("<reasoning>", "</reasoning>")] {
        loop {
            let Some(start) = out.find(open) else { break };
            match out[start..].find(close) {
                Some(rel_end) => {
                    out.replace_range(start..start + rel_end + close.len(), "");
                }
                None => {
                    out.truncate(start);
                    break;
                }
            }
        }
    }
    out
}

/// Pull every `open`…`close` span whose payload decodes into directives out
/// of `working`, removing the consumed spans from the text.
fn extract_delimited(
    working: &mut String,
    open: &str,
    close: &str,
    directives: &mut Vec<Directive>,
) {
    let mut search_from = 0;
    loop {
        let Some(rel_start) = working[search_from..].find(open) else {
            return;
        };
        let start = search_from + rel_start;
        let payload_start = start + open.len();
        let Some(rel_end) = working[payload_start..].find(close) else {
            return;
        };
        let end = payload_start + rel_end;

        let payload = working[payload_start..end].trim();
        match serde_json::from_str::<Value>(payload) {
            Ok(v) => {
                let found = directives_from_payload(&v);
                if found.is_empty() {
                    // Valid JSON but no directive; leave the span alone.
                    search_from = end + close.len();
                } else {
                    directives.extend(found);
                    working.replace_range(start..end + close.len(), "");
                    search_from = start;
                }
            }
            Err(_) => {
                search_from = end + close.len();
            }
        }
        if search_from >= working.len() {
            return;
        }
    }
}

/// Scan for balanced top-level JSON objects in free text and consume those
/// that carry a directive.
fn extract_bare_objects(working: &mut String, directives: &mut Vec<Directive>) {
    let mut search_from = 0;
    while let Some(range) = find_balanced_object(working, search_from) {
        let payload = &working[range.clone()];
        match serde_json::from_str::<Value>(payload) {
            Ok(v) => {
                let found = directives_from_payload(&v);
                if found.is_empty() {
                    search_from = range.end;
                } else {
                    directives.extend(found);
                    working.replace_range(range.clone(), "");
                    search_from = range.start;
                }
            }
            Err(_) => search_from = range.end,
        }
        if search_from >= working.len() {
            break;
        }
    }
}

/// Find the next balanced `{…}` span starting at or after `from`, honouring
/// JSON string and escape rules.
fn find_balanced_object(text: &str, from: usize) -> Option<std::ops::Range<usize>> {
    let bytes = text.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;
            let start = i;
            let mut j = i;
            while j < bytes.len() {
                let c = bytes[j];
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if c == b'\\' {
                        escaped = true;
                    } else if c == b'"' {
                        in_string = false;
                    }
                } else {
                    match c {
                        b'"' => in_string = true,
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                return Some(start..j + 1);
                            }
                        }
                        _ => {}
                    }
                }
                j += 1;
            }
            // Unbalanced; no further object can start inside it.
            return None;
        }
        i += 1;
    }
    None
}

/// Interpret one decoded payload.  Arrays fan out per element; an `action`
/// field is honoured directly; an embedded OpenAI `tool_calls` array and
/// plain name/arguments objects are both recognised.
fn directives_from_payload(v: &Value) -> Vec<Directive> {
    if let Some(items) = v.as_array() {
        return items.iter().flat_map(directives_from_payload).collect();
    }
    let Some(obj) = v.as_object() else {
        return Vec::new();
    };

    if let Some(action) = obj.get("action").and_then(|a| a.as_str()) {
        match action {
            "respond" => {
                let text = first_string(obj, &["text", "content", "message", "response"])
                    .unwrap_or_default();
                return vec![Directive::Respond(text)];
            }
            "ask_user" => {
                let q = first_string(obj, &["question", "text", "message"]).unwrap_or_default();
                return vec![Directive::AskUser(q)];
            }
            "call_tool" => {
                return extract_call(v).map(Directive::Call).into_iter().collect();
            }
            _ => return Vec::new(),
        }
    }

    if let Some(tool_calls) = obj.get("tool_calls").and_then(|t| t.as_array()) {
        return tool_calls
            .iter()
            .filter_map(|tc| extract_call(tc.get("function").unwrap_or(tc)))
            .map(Directive::Call)
            .collect();
    }

    extract_call(v).map(Directive::Call).into_iter().collect()
}

/// Extract `(name, arguments)` from an object using the known key sets.
fn extract_call(v: &Value) -> Option<ToolCallRequest> {
    let obj = v.as_object()?;

    let mut name: Option<String> = None;
    for key in NAME_KEYS {
        match obj.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => {
                name = Some(s.clone());
                break;
            }
            // OpenAI nests the call under a `function` object.
            Some(nested @ Value::Object(_)) if *key == "function" => {
                return extract_call(nested);
            }
            _ => {}
        }
    }
    let name = name?;

    let arguments = ARG_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .map(decode_arguments)
        .unwrap_or_else(|| Value::Object(Default::default()));

    Some(ToolCallRequest { name, arguments })
}

/// JSON-decode string-encoded arguments, recursively: a call whose
/// arguments are a string is treated identically to the same call with
/// that string parsed as JSON.
fn decode_arguments(v: &Value) -> Value {
    let mut current = v.clone();
    while let Value::String(s) = &current {
        match serde_json::from_str::<Value>(s) {
            Ok(decoded) => current = decoded,
            Err(_) => break,
        }
    }
    current
}

fn first_string(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(|v| v.as_str()).map(str::to_string))
}

/// Remove leftover tool-call markup that failed to decode: any remaining
/// delimited spans and stray delimiter tokens.
fn strip_tool_fragments(text: &str) -> String {
    let mut out = text.to_string();
    for (open, close) in DELIMITED {
        loop {
            let Some(start) = out.find(open) else { break };
            match out[start + open.len()..].find(close) {
                Some(rel_end) => {
                    out.replace_range(start..start + open.len() + rel_end + close.len(), "");
                }
                None => {
                    out.truncate(start);
                    break;
                }
            }
        }
    }
    out
}

fn tidy(text: &str) -> String {
    text.trim().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
