// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The wire format a model uses when it emits a tool call.
///
/// A closed set: the intent parser and the provider adapter branch on these
/// variants, never on free-form pattern sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// The provider's native structured tool-call field.
    #[default]
    NativeStructured,
    /// OpenAI-style `tool_calls` array.
    OpenAiTools,
    /// Hermes/Qwen `<tool_call>{…}</tool_call>` markup in text.
    HermesXml,
    /// `[TOOL_REQUEST]{…}[END_TOOL_REQUEST]` bracket markup in text.
    Bracketed,
    /// A bare JSON object in the content stream.
    RawJson,
}

impl WireFormat {
    /// True when tool schemas can be sent through the provider's structured
    /// `tools` field.  Text dialects get their tool catalog rendered into
    /// the prompt instead.
    pub fn is_structured(self) -> bool {
        matches!(self, WireFormat::NativeStructured | WireFormat::OpenAiTools)
    }
}

/// Per-model capability record.
///
/// Loaded from the profile store at startup, replaced wholesale on reload.
/// The verification score is written by an external benchmarking subsystem;
/// the core only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityProfile {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub wire_format: WireFormat,
    /// Tool names this model should see in its prompt.
    #[serde(default)]
    pub tools: Vec<String>,
    /// What the model is likely to emit → the canonical tool name.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Prosthetic fragment prepended to the system message to compensate
    /// for a known weakness (e.g. tool-call formatting discipline).
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub context_window: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub verification_score: f32,
}

fn default_enabled() -> bool {
    true
}

impl CapabilityProfile {
    /// The minimal profile used for models the store has never seen:
    /// native JSON tool calls, no aliases, no prosthetic.
    pub fn synthetic(model_id: &str) -> Self {
        Self {
            display_name: model_id.to_string(),
            provider: String::new(),
            wire_format: WireFormat::NativeStructured,
            tools: Vec::new(),
            aliases: HashMap::new(),
            system_prompt: None,
            context_window: 0,
            enabled: true,
            verification_score: 0.0,
        }
    }

    /// Map a native alias to its canonical tool name; unknown names pass
    /// through unchanged, which makes resolution idempotent.
    pub fn resolve_alias<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }
}
