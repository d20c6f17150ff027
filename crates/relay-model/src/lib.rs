// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider adapter: one call shape over every upstream model endpoint.
//!
//! The closed set of provider kinds (local server, hosted API,
//! tenant-scoped deployment, aggregator) all speak the OpenAI-compatible
//! chat wire format; `from_config` builds the right variant and
//! [`ProviderSet`] resolves model ids to cached provider instances.

mod mock;
mod openai_compat;
mod provider;
mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};

use relay_config::{Config, ProviderConfig, ProviderKind};

pub use mock::{MockProvider, ScriptedMockProvider};
pub use openai_compat::{AuthStyle, OpenAiCompatProvider};
pub use provider::{ModelProvider, ResponseStream};
pub use types::{
    CompletionRequest, FunctionCall, Message, MessageContent, ResponseEvent, Role, ToolSchema,
    Usage,
};

/// Build a provider for `model` from one provider-endpoint config.
pub fn from_config(
    cfg: &ProviderConfig,
    model: impl Into<String>,
) -> anyhow::Result<Arc<dyn ModelProvider>> {
    let model = model.into();
    let key = cfg.resolve_api_key();
    let headers: Vec<(String, String)> = cfg
        .extra_headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let provider: Arc<dyn ModelProvider> = match cfg.kind {
        ProviderKind::Local => Arc::new(OpenAiCompatProvider::new(
            "local",
            model,
            None,
            cfg.base_url.as_deref().unwrap_or("http://localhost:8080/v1"),
            cfg.max_tokens,
            cfg.temperature,
            headers,
            AuthStyle::None,
        )),
        ProviderKind::Api => Arc::new(OpenAiCompatProvider::new(
            "api",
            model,
            key,
            cfg.base_url
                .as_deref()
                .context("api provider requires base_url")?,
            cfg.max_tokens,
            cfg.temperature,
            headers,
            AuthStyle::Bearer,
        )),
        ProviderKind::Tenant => {
            let resource = cfg
                .resource
                .as_deref()
                .context("tenant provider requires resource")?;
            let deployment = cfg.deployment.as_deref().unwrap_or(&model);
            let api_version = cfg.api_version.as_deref().unwrap_or("2024-02-01");
            let chat_url = format!(
                "https://{resource}.openai.azure.com/openai/deployments/{deployment}/chat/completions?api-version={api_version}"
            );
            Arc::new(OpenAiCompatProvider::with_full_chat_url(
                "tenant",
                model,
                key,
                chat_url,
                cfg.max_tokens,
                cfg.temperature,
                headers,
                AuthStyle::ApiKeyHeader,
            ))
        }
        ProviderKind::Aggregator => Arc::new(OpenAiCompatProvider::new(
            "aggregator",
            model,
            key,
            cfg.base_url
                .as_deref()
                .context("aggregator provider requires base_url")?,
            cfg.max_tokens,
            cfg.temperature,
            headers,
            AuthStyle::Bearer,
        )),
    };
    Ok(provider)
}

/// Resolves model ids to providers, caching built instances.
///
/// A model id may be `"<provider-key>/<model>"` to pick a named entry from
/// the `providers` map, or a bare model name served by the `default` entry.
pub struct ProviderSet {
    providers: HashMap<String, ProviderConfig>,
    cache: Mutex<HashMap<String, Arc<dyn ModelProvider>>>,
}

impl ProviderSet {
    pub fn new(config: &Config) -> Self {
        Self {
            providers: config.providers.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Build a set with one pre-seeded provider, for tests.
    pub fn with_provider(model_id: &str, provider: Arc<dyn ModelProvider>) -> Self {
        let set = Self {
            providers: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        };
        set.cache
            .lock()
            .expect("provider cache poisoned")
            .insert(model_id.to_string(), provider);
        set
    }

    /// Insert or replace a provider under a model id.
    pub fn insert(&self, model_id: &str, provider: Arc<dyn ModelProvider>) {
        self.cache
            .lock()
            .expect("provider cache poisoned")
            .insert(model_id.to_string(), provider);
    }

    pub fn provider_for(&self, model_id: &str) -> anyhow::Result<Arc<dyn ModelProvider>> {
        if let Some(p) = self
            .cache
            .lock()
            .expect("provider cache poisoned")
            .get(model_id)
        {
            return Ok(Arc::clone(p));
        }

        let (cfg, model) = self.resolve(model_id)?;
        let provider = from_config(cfg, model)?;
        self.cache
            .lock()
            .expect("provider cache poisoned")
            .insert(model_id.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    fn resolve(&self, model_id: &str) -> anyhow::Result<(&ProviderConfig, String)> {
        if let Some((prefix, rest)) = model_id.split_once('/') {
            if let Some(cfg) = self.providers.get(prefix) {
                return Ok((cfg, rest.to_string()));
            }
        }
        if let Some(cfg) = self.providers.get("default") {
            return Ok((cfg, model_id.to_string()));
        }
        bail!("no provider configured for model '{model_id}'")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
