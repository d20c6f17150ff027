// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Top-level configuration, read once at startup.
///
/// Everything here is a read-only snapshot for the lifetime of the process.
/// The only piece that reloads at runtime is the capability-profile store,
/// which is re-read when a `profiles_invalidated` event is published.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    /// Named provider endpoints.  The architect and executor model ids are
    /// resolved against this map; a bare model id with no matching entry
    /// falls back to the `default` entry.
    ///
    /// ```yaml
    /// providers:
    ///   default:
    ///     kind: local
    ///     base_url: http://localhost:8080/v1
    ///   hosted:
    ///     kind: api
    ///     base_url: https://api.example.com/v1
    ///     api_key_env: RELAY_API_KEY
    /// ```
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub tool_server: ToolServerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
}

/// Which models drive the agentic pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// The architect: plans, reasons, decides what to do next.
    #[serde(default = "default_main_model")]
    pub main: String,
    /// Optional executor: a smaller schema-disciplined model that turns the
    /// architect's plan into the structured tool call.  When unset (or equal
    /// to `main`) the pipeline runs single-model.
    #[serde(default)]
    pub executor: Option<String>,
    /// Enable the architect/executor split even for requests that declare
    /// no tools.
    #[serde(default)]
    pub dual_model: bool,
}

fn default_main_model() -> String {
    "gpt-4o".into()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            main: default_main_model(),
            executor: None,
            dual_model: false,
        }
    }
}

/// How one upstream provider endpoint is reached.
///
/// The closed set of provider kinds the adapter supports; every kind speaks
/// the OpenAI chat-completions wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local inference server (llama.cpp, vLLM, Ollama); no auth.
    Local,
    /// Hosted OpenAI-compatible API; bearer key.
    Api,
    /// Tenant-scoped hosted deployment (resource + deployment + api-version);
    /// key sent in the `api-key` header.
    Tenant,
    /// Aggregator endpoint (routes to many upstream models); bearer key plus
    /// attribution headers.
    Aggregator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,
    /// API base ending before `/chat/completions`.  Ignored for `tenant`,
    /// which builds its URL from the resource/deployment fields.
    pub base_url: Option<String>,
    /// Environment variable holding the API key (read at startup).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer `api_key_env` in files kept under version
    /// control.
    pub api_key: Option<String>,
    /// Tenant resource name (the subdomain of the hosted deployment).
    pub resource: Option<String>,
    /// Tenant deployment name; defaults to the model id.
    pub deployment: Option<String>,
    /// Tenant REST API version string, e.g. `"2024-02-01"`.
    pub api_version: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Additional headers sent on every request (aggregator attribution).
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::Local
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Local,
            base_url: Some("http://localhost:8080/v1".into()),
            api_key_env: None,
            api_key: None,
            resource: None,
            deployment: None,
            api_version: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            extra_headers: HashMap::new(),
        }
    }
}

impl ProviderConfig {
    /// Resolve the API key: explicit value wins, then the named env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.clone());
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

fn default_max_steps() -> u32 {
    8
}
fn default_total_deadline_secs() -> u64 {
    300
}
fn default_step_deadline_secs() -> u64 {
    120
}
fn default_tool_deadline_secs() -> u64 {
    60
}
fn default_parallel_tool_cap() -> usize {
    4
}

/// Iteration and deadline budgets for the agentic loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum architect iterations per request.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Wall-clock cap for the whole request.
    #[serde(default = "default_total_deadline_secs")]
    pub total_deadline_secs: u64,
    /// Wall-clock cap for a single model turn.
    #[serde(default = "default_step_deadline_secs")]
    pub step_deadline_secs: u64,
    /// Wall-clock cap for a single tool call.
    #[serde(default = "default_tool_deadline_secs")]
    pub tool_deadline_secs: u64,
    /// Tool calls from one step executed concurrently; the rest queue.
    #[serde(default = "default_parallel_tool_cap")]
    pub parallel_tool_cap: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            total_deadline_secs: default_total_deadline_secs(),
            step_deadline_secs: default_step_deadline_secs(),
            tool_deadline_secs: default_tool_deadline_secs(),
            parallel_tool_cap: default_parallel_tool_cap(),
        }
    }
}

impl LimitsConfig {
    pub fn total_deadline(&self) -> Duration {
        Duration::from_secs(self.total_deadline_secs)
    }
    pub fn step_deadline(&self) -> Duration {
        Duration::from_secs(self.step_deadline_secs)
    }
    pub fn tool_deadline(&self) -> Duration {
        Duration::from_secs(self.tool_deadline_secs)
    }
}

fn default_health_timeout_ms() -> u64 {
    1500
}
fn default_reconnect_initial_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_advert_ttl_secs() -> u64 {
    60
}

/// How the external tool server is reached.
///
/// When `remote_url` answers its health probe the remote transport is used;
/// otherwise `command` is spawned as a child process speaking line-delimited
/// JSON-RPC on stdin/stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    /// Base URL of a remote tool server, e.g. `http://localhost:9470`.
    #[serde(default)]
    pub remote_url: Option<String>,
    /// Health-probe timeout when deciding between transports.
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    /// Subprocess fallback: the tool-server binary.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the subprocess (the developer's project root).
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// How long a `list_tools` advertisement stays cached.
    #[serde(default = "default_advert_ttl_secs")]
    pub advert_ttl_secs: u64,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            health_timeout_ms: default_health_timeout_ms(),
            command: None,
            args: Vec::new(),
            working_dir: None,
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            advert_ttl_secs: default_advert_ttl_secs(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:4000".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the proxy front-end.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Include internal error detail in responses.  Off in production:
    /// clients get the request id, operators get the log line.
    #[serde(default)]
    pub dev_mode: bool,
    /// Subscriber buffer for the SSE/WebSocket event endpoints.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_event_buffer() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            dev_mode: false,
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_sessions_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relay/sessions")
}

/// Where completed turns are persisted (one JSON file per turn).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_sessions_dir")]
    pub dir: PathBuf,
    /// Persist turns at all; disable for ephemeral deployments.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            dir: default_sessions_dir(),
            enabled: true,
        }
    }
}

fn default_profiles_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relay/profiles.yaml")
}

/// Capability-profile store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilesConfig {
    #[serde(default = "default_profiles_path")]
    pub path: PathBuf,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            path: default_profiles_path(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let c = Config::default();
        assert_eq!(c.limits.max_steps, 8);
        assert_eq!(c.limits.parallel_tool_cap, 4);
        assert_eq!(c.limits.tool_deadline_secs, 60);
        assert!(!c.models.dual_model);
    }

    #[test]
    fn provider_kind_parses_lowercase() {
        let p: ProviderConfig =
            serde_yaml::from_str("kind: aggregator\nbase_url: https://agg.example/v1").unwrap();
        assert_eq!(p.kind, ProviderKind::Aggregator);
    }

    #[test]
    fn resolve_api_key_prefers_explicit_value() {
        let p = ProviderConfig {
            api_key: Some("sekrit".into()),
            api_key_env: Some("RELAY_TEST_KEY_UNSET".into()),
            ..Default::default()
        };
        assert_eq!(p.resolve_api_key().as_deref(), Some("sekrit"));
    }

    #[test]
    fn resolve_api_key_none_when_nothing_set() {
        let p = ProviderConfig {
            api_key: None,
            api_key_env: Some("RELAY_TEST_KEY_DEFINITELY_UNSET".into()),
            ..Default::default()
        };
        assert!(p.resolve_api_key().is_none());
    }

    #[test]
    fn limits_durations_convert() {
        let l = LimitsConfig {
            tool_deadline_secs: 2,
            ..Default::default()
        };
        assert_eq!(l.tool_deadline(), Duration::from_secs(2));
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let mut c = Config::default();
        c.models.executor = Some("small-model".into());
        let text = serde_yaml::to_string(&c).unwrap();
        let back: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.models.executor.as_deref(), Some("small-model"));
    }
}
