// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Request classification: pick a strategy, the models, and the tool set.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use relay_config::Config;
use relay_events::{Event, EventBus};
use relay_model::{Role, ToolSchema};
use relay_registry::ProfileView;
use relay_toolserver::ToolDispatch;

use crate::plan::{ExecutionPlan, IncomingRequest, Strategy};

/// Leading phrases that mark a user message as contradicting the assistant
/// message before it.  Deliberately conservative; the emitted learning
/// event is advisory only.
const CORRECTION_PREFIXES: &[&str] = &[
    "no,",
    "no ",
    "that's wrong",
    "that is wrong",
    "that's not",
    "incorrect",
    "actually,",
    "you're wrong",
    "not what i asked",
];

pub struct Router {
    dual_model: bool,
    main_model: String,
    executor_model: Option<String>,
    limits: relay_config::LimitsConfig,
    profiles: Arc<dyn ProfileView>,
    tools: Arc<dyn ToolDispatch>,
    bus: Arc<EventBus>,
}

impl Router {
    pub fn new(
        config: &Config,
        profiles: Arc<dyn ProfileView>,
        tools: Arc<dyn ToolDispatch>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            dual_model: config.models.dual_model,
            main_model: config.models.main.clone(),
            executor_model: config.models.executor.clone(),
            limits: config.limits.clone(),
            profiles,
            tools,
            bus,
        }
    }

    /// Produce the execution plan for one normalized request.
    pub async fn plan(&self, request_id: &str, req: &IncomingRequest) -> ExecutionPlan {
        self.detect_correction(request_id, req).await;

        let declared_tools = !req.tools.is_empty();

        if !self.dual_model && !declared_tools {
            // Pure pass-through: the named model, no tool set, one step.
            let profile = self.profiles.profile(&req.model);
            return ExecutionPlan {
                strategy: Strategy::Direct,
                architect: req.model.clone(),
                executor: None,
                tools: Vec::new(),
                wire_format: profile.wire_format,
                prosthetic: None,
                max_steps: 1,
                total_deadline: self.limits.total_deadline(),
                step_deadline: self.limits.step_deadline(),
                tool_deadline: self.limits.tool_deadline(),
            };
        }

        // Agentic path: the architect is always the configured main model.
        let architect = self.main_model.clone();
        let executor = self
            .executor_model
            .clone()
            .filter(|e| *e != architect);
        let strategy = if executor.is_some() {
            Strategy::DualModel
        } else {
            Strategy::Agentic
        };

        let profile = self.profiles.profile(&architect);
        let tools = self.tool_set(request_id, &profile.tools, req).await;

        debug!(
            request_id,
            strategy = strategy.as_str(),
            architect,
            tool_count = tools.len(),
            "execution plan"
        );

        ExecutionPlan {
            strategy,
            architect,
            executor,
            tools,
            wire_format: profile.wire_format,
            prosthetic: profile.system_prompt.clone(),
            max_steps: self.limits.max_steps,
            total_deadline: self.limits.total_deadline(),
            step_deadline: self.limits.step_deadline(),
            tool_deadline: self.limits.tool_deadline(),
        }
    }

    /// The tool set is the intersection of the architect profile's tools
    /// and the live advertisement.  An empty profile list means the profile
    /// places no restriction, so the advertisement is used as-is.  Profile
    /// tools missing from the advertisement are dropped with a warning.
    ///
    /// When the supervisor is disconnected there is no advertisement to
    /// intersect with; the profile's list is kept so that attempted calls
    /// surface transport errors rather than being silently dropped here.
    async fn tool_set(
        &self,
        request_id: &str,
        profile_tools: &[String],
        req: &IncomingRequest,
    ) -> Vec<ToolSchema> {
        let advertised = match self.tools.list_tools().await {
            Ok(list) => list,
            Err(e) => {
                debug!(request_id, "no tool advertisement available: {e}");
                return profile_tools
                    .iter()
                    .map(|name| schema_from_declared(name, req))
                    .collect();
            }
        };

        if profile_tools.is_empty() {
            return advertised
                .into_iter()
                .map(|d| ToolSchema {
                    name: d.name,
                    description: d.description,
                    parameters: d.parameters,
                })
                .collect();
        }

        let mut out = Vec::with_capacity(profile_tools.len());
        for name in profile_tools {
            match advertised.iter().find(|d| d.name == *name) {
                Some(d) => out.push(ToolSchema {
                    name: d.name.clone(),
                    description: d.description.clone(),
                    parameters: d.parameters.clone(),
                }),
                None => {
                    warn!(request_id, tool = %name, "profile tool not advertised; dropping");
                    self.bus
                        .publish(
                            request_id,
                            Event::Warning {
                                message: format!("tool '{name}' not advertised by tool server"),
                            },
                        )
                        .await;
                }
            }
        }
        out
    }

    /// Emit an advisory learning event when the last user message looks
    /// like a correction of the assistant message right before it.  The
    /// main path is unaffected either way.
    async fn detect_correction(&self, request_id: &str, req: &IncomingRequest) {
        let mut it = req.messages.iter().rev();
        let Some(last) = it.next() else { return };
        let Some(prev) = it.next() else { return };
        if last.role != Role::User || prev.role != Role::Assistant {
            return;
        }
        let Some(text) = last.as_text() else { return };
        let lower = text.trim().to_lowercase();
        if CORRECTION_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            let pattern = text.lines().next().unwrap_or("").trim().to_string();
            self.bus
                .publish(request_id, Event::LearningSignal { pattern })
                .await;
        }
    }
}

/// Fall back to the client-declared schema for a profile tool when the
/// advertisement is unavailable.
fn schema_from_declared(name: &str, req: &IncomingRequest) -> ToolSchema {
    req.tools
        .iter()
        .find(|t| t.name == name)
        .cloned()
        .unwrap_or_else(|| ToolSchema {
            name: name.to_string(),
            description: String::new(),
            parameters: json!({ "type": "object" }),
        })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
