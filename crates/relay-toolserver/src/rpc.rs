// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Line-delimited JSON-RPC 2.0 framing for the subprocess transport.
//!
//! One request per line on stdin, one response per line on stdout, matched
//! by id.  The tool server speaks two methods: `tools/list` and
//! `tools/call`.

use serde_json::{json, Value};

use crate::{ToolDescriptor, ToolServerError};

/// Serialize one request as a single line (no interior newlines).
pub(crate) fn request_line(id: u64, method: &str, params: Value) -> String {
    let msg = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    });
    let mut line = msg.to_string();
    line.push('\n');
    line
}

pub(crate) fn call_params(name: &str, arguments: &Value) -> Value {
    json!({ "name": name, "arguments": arguments })
}

/// Parse one stdout line; returns `(id, outcome)` or `None` for lines that
/// are not id-bearing responses (notifications, stray logs on stdout).
pub(crate) fn parse_response_line(line: &str) -> Option<(u64, Result<Value, ToolServerError>)> {
    let v: Value = serde_json::from_str(line.trim()).ok()?;
    let id = v.get("id")?.as_u64()?;
    if let Some(err) = v.get("error") {
        let msg = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown rpc error");
        return Some((id, Err(ToolServerError::Transport(msg.to_string()))));
    }
    let result = v.get("result").cloned().unwrap_or(Value::Null);
    Some((id, Ok(result)))
}

/// Flatten a `tools/call` result into the text the model sees.
///
/// Canonical shape is `{content: [{type, text}]}`; a bare string result is
/// accepted too, and anything else is passed through as compact JSON so no
/// information is silently dropped.
pub(crate) fn result_text(result: &Value) -> String {
    if let Some(parts) = result.get("content").and_then(|c| c.as_array()) {
        let texts: Vec<&str> = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect();
        return texts.join("\n");
    }
    if let Some(s) = result.as_str() {
        return s.to_string();
    }
    result.to_string()
}

/// Parse a `tools/list` result into descriptors.
pub(crate) fn parse_tool_list(result: &Value) -> Vec<ToolDescriptor> {
    let items = result
        .get("tools")
        .and_then(|t| t.as_array())
        .cloned()
        .or_else(|| result.as_array().cloned())
        .unwrap_or_default();

    items
        .iter()
        .filter_map(|item| {
            let name = item.get("name")?.as_str()?.to_string();
            Some(ToolDescriptor {
                name,
                description: item
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or("")
                    .to_string(),
                // Servers advertise the schema as either `parameters` or
                // `inputSchema` depending on vintage.
                parameters: item
                    .get("parameters")
                    .or_else(|| item.get("inputSchema"))
                    .cloned()
                    .unwrap_or_else(|| json!({ "type": "object" })),
            })
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_is_single_line_json() {
        let line = request_line(7, "tools/call", call_params("read_file", &json!({"path":"a"})));
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let v: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 7);
        assert_eq!(v["method"], "tools/call");
        assert_eq!(v["params"]["name"], "read_file");
        assert_eq!(v["params"]["arguments"]["path"], "a");
    }

    #[test]
    fn parse_response_matches_id_and_result() {
        let (id, res) =
            parse_response_line(r#"{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hi"}]}}"#)
                .unwrap();
        assert_eq!(id, 3);
        assert_eq!(result_text(&res.unwrap()), "hi");
    }

    #[test]
    fn parse_response_error_becomes_transport_error() {
        let (id, res) = parse_response_line(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"no such tool"}}"#,
        )
        .unwrap();
        assert_eq!(id, 4);
        match res {
            Err(ToolServerError::Transport(msg)) => assert!(msg.contains("no such tool")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn non_response_lines_are_ignored() {
        assert!(parse_response_line("not json at all").is_none());
        assert!(parse_response_line(r#"{"jsonrpc":"2.0","method":"log","params":{}}"#).is_none());
    }

    #[test]
    fn result_text_joins_content_parts() {
        let r = json!({ "content": [
            { "type": "text", "text": "line one" },
            { "type": "text", "text": "line two" },
        ]});
        assert_eq!(result_text(&r), "line one\nline two");
    }

    #[test]
    fn result_text_accepts_bare_string() {
        assert_eq!(result_text(&json!("plain")), "plain");
    }

    #[test]
    fn tool_list_parses_both_schema_keys() {
        let r = json!({ "tools": [
            { "name": "read_file", "description": "Read", "parameters": {"type":"object"} },
            { "name": "search", "inputSchema": {"type":"object","required":["q"]} },
        ]});
        let tools = parse_tool_list(&r);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "read_file");
        assert_eq!(tools[1].parameters["required"][0], "q");
    }

    #[test]
    fn tool_list_skips_nameless_entries() {
        let r = json!({ "tools": [ { "description": "broken" }, { "name": "ok" } ]});
        let tools = parse_tool_list(&r);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ok");
    }
}
