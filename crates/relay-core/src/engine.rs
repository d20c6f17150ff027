// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use relay_events::{Event, EventBus};
use relay_model::{
    CompletionRequest, Message, ModelProvider, ProviderSet, ResponseEvent, Role,
};
use relay_registry::ProfileView;
use relay_toolserver::ToolDispatch;

use crate::intent::{parse_response, Intent, ToolCallRequest};
use crate::plan::{
    ExecutionPlan, IncomingRequest, Outcome, StepRecord, Strategy, ToolCallRecord, TurnOutput,
};

/// Consecutive error results from one call target before the loop gives up
/// on the request.
const MAX_CONSECUTIVE_TOOL_ERRORS: u32 = 3;

/// The planner/executor state machine.  Owns no request state; every
/// request runs in its own task through [`run`](Engine::run).
pub struct Engine {
    providers: Arc<ProviderSet>,
    tools: Arc<dyn ToolDispatch>,
    profiles: Arc<dyn ProfileView>,
    bus: Arc<EventBus>,
}

/// One fully-accumulated model turn.
struct ModelTurn {
    text: String,
    structured_calls: Vec<StructuredCall>,
}

struct StructuredCall {
    id: String,
    name: String,
    arguments: Value,
}

/// A call ready for dispatch: alias-resolved name plus a call id that is
/// unique within the step.
struct PlannedCall {
    id: String,
    name: String,
    arguments: Value,
}

enum TurnError {
    /// The step deadline elapsed before the stream finished.
    Timeout,
    Model(anyhow::Error),
}

impl Engine {
    pub fn new(
        providers: Arc<ProviderSet>,
        tools: Arc<dyn ToolDispatch>,
        profiles: Arc<dyn ProfileView>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            providers,
            tools,
            profiles,
            bus,
        }
    }

    /// Run one request to its terminal state.
    ///
    /// Tool-scope failures are converted to error tool-results and the loop
    /// continues; only provider failures and exhausted budgets terminate.
    /// The returned output always carries an outcome; `Err` is reserved for
    /// programmer errors.
    pub async fn run(
        &self,
        request_id: &str,
        plan: &ExecutionPlan,
        req: &IncomingRequest,
    ) -> TurnOutput {
        match plan.strategy {
            Strategy::Direct => self.run_direct(request_id, plan, req).await,
            Strategy::Agentic | Strategy::DualModel => {
                self.run_agentic(request_id, plan, req).await
            }
        }
    }

    /// Pass-through: one provider call, the response returned unchanged.
    async fn run_direct(
        &self,
        request_id: &str,
        plan: &ExecutionPlan,
        req: &IncomingRequest,
    ) -> TurnOutput {
        let mut transcript = req.messages.clone();

        let provider = match self.providers.provider_for(&plan.architect) {
            Ok(p) => p,
            Err(e) => return model_error_output(transcript, e.to_string()),
        };

        self.bus
            .publish(request_id, Event::StepStarted { step: 1 })
            .await;
        let step_start = Instant::now();

        let creq = CompletionRequest {
            messages: transcript.clone(),
            tools: Vec::new(),
            tool_format: plan.wire_format,
            stream: true,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        };

        let turn = match self
            .stream_turn(request_id, 1, provider.as_ref(), creq, plan.step_deadline)
            .await
        {
            Ok(t) => t,
            Err(TurnError::Timeout) => {
                return TurnOutput {
                    assistant_text: String::new(),
                    outcome: Outcome::Deadline,
                    steps: Vec::new(),
                    transcript,
                    error: None,
                }
            }
            Err(TurnError::Model(e)) => return model_error_output(transcript, format!("{e:#}")),
        };

        transcript.push(Message::assistant(&turn.text));
        let elapsed_ms = step_start.elapsed().as_millis() as u64;
        self.bus
            .publish(request_id, Event::StepFinished { step: 1, elapsed_ms })
            .await;

        TurnOutput {
            assistant_text: turn.text.clone(),
            outcome: Outcome::Completed,
            steps: vec![StepRecord {
                index: 1,
                response_text: turn.text,
                intent: "respond".into(),
                tool_calls: Vec::new(),
                elapsed_ms,
                terminal: true,
            }],
            transcript,
            error: None,
        }
    }

    /// The bounded planner ↔ tool-execute ↔ observe cycle.
    async fn run_agentic(
        &self,
        request_id: &str,
        plan: &ExecutionPlan,
        req: &IncomingRequest,
    ) -> TurnOutput {
        let mut transcript = req.messages.clone();
        apply_prosthetic(&mut transcript, plan.prosthetic.as_deref());

        let architect = match self.providers.provider_for(&plan.architect) {
            Ok(p) => p,
            Err(e) => return model_error_output(transcript, e.to_string()),
        };

        let deadline_at = Instant::now() + plan.total_deadline;
        let mut steps: Vec<StepRecord> = Vec::new();
        // Last respond-intent text, returned when a budget runs out.
        let mut best_text = String::new();
        // Consecutive error count per call target.
        let mut error_streaks: HashMap<String, u32> = HashMap::new();
        let mut step_index: u32 = 0;

        loop {
            step_index += 1;
            if step_index > plan.max_steps {
                return self.finish(
                    request_id,
                    best_text,
                    Outcome::IterationLimit,
                    steps,
                    transcript,
                );
            }
            let now = Instant::now();
            if now >= deadline_at {
                return self.finish(request_id, best_text, Outcome::Deadline, steps, transcript);
            }

            self.bus
                .publish(request_id, Event::StepStarted { step: step_index })
                .await;
            let step_start = Instant::now();
            let step_deadline = plan.step_deadline.min(deadline_at - now);

            let creq = CompletionRequest {
                messages: transcript.clone(),
                tools: plan.tools.clone(),
                tool_format: plan.wire_format,
                stream: true,
                max_tokens: req.max_tokens,
                temperature: req.temperature,
            };

            let turn = match self
                .stream_turn(
                    request_id,
                    step_index,
                    architect.as_ref(),
                    creq,
                    step_deadline,
                )
                .await
            {
                Ok(t) => t,
                Err(TurnError::Timeout) => {
                    return self.finish(request_id, best_text, Outcome::Deadline, steps, transcript)
                }
                Err(TurnError::Model(e)) => {
                    let mut out = model_error_output(transcript, format!("{e:#}"));
                    out.steps = steps;
                    out.assistant_text = best_text;
                    return out;
                }
            };

            // Classify the turn.  Structured tool calls from the provider
            // protocol short-circuit the text parser; everything else goes
            // through it.
            let (reasoning, intent, provided_ids) = if !turn.structured_calls.is_empty() {
                let prose = turn.text.trim().to_string();
                let ids: Vec<String> =
                    turn.structured_calls.iter().map(|c| c.id.clone()).collect();
                let calls: Vec<ToolCallRequest> = turn
                    .structured_calls
                    .iter()
                    .map(|c| ToolCallRequest {
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    })
                    .collect();
                (
                    if prose.is_empty() { None } else { Some(prose) },
                    Intent::CallTools(calls),
                    Some(ids),
                )
            } else {
                let parsed = parse_response(&turn.text);
                (parsed.reasoning, parsed.intent, None)
            };

            self.bus
                .publish(
                    request_id,
                    Event::IntentParsed {
                        step: step_index,
                        kind: intent.kind().into(),
                        tools: match &intent {
                            Intent::CallTools(calls) => {
                                calls.iter().map(|c| c.name.clone()).collect()
                            }
                            _ => Vec::new(),
                        },
                    },
                )
                .await;

            match intent {
                Intent::Respond(text) => {
                    transcript.push(Message::assistant(&text));
                    best_text = text;
                    let elapsed_ms = step_start.elapsed().as_millis() as u64;
                    self.bus
                        .publish(
                            request_id,
                            Event::StepFinished {
                                step: step_index,
                                elapsed_ms,
                            },
                        )
                        .await;
                    steps.push(StepRecord {
                        index: step_index,
                        response_text: turn.text,
                        intent: "respond".into(),
                        tool_calls: Vec::new(),
                        elapsed_ms,
                        terminal: true,
                    });
                    return self.finish(
                        request_id,
                        best_text,
                        Outcome::Completed,
                        steps,
                        transcript,
                    );
                }
                Intent::AskUser(question) => {
                    // The question is the assistant message; the caller
                    // answers in a follow-up request.
                    transcript.push(Message::assistant(&question));
                    best_text = question;
                    let elapsed_ms = step_start.elapsed().as_millis() as u64;
                    self.bus
                        .publish(
                            request_id,
                            Event::StepFinished {
                                step: step_index,
                                elapsed_ms,
                            },
                        )
                        .await;
                    steps.push(StepRecord {
                        index: step_index,
                        response_text: turn.text,
                        intent: "ask_user".into(),
                        tool_calls: Vec::new(),
                        elapsed_ms,
                        terminal: true,
                    });
                    return self.finish(
                        request_id,
                        best_text,
                        Outcome::Completed,
                        steps,
                        transcript,
                    );
                }
                Intent::CallTools(calls) => {
                    // Dual-model refinement: hand the architect's plan to
                    // the executor and let its output drive the dispatch.
                    let (calls, provided_ids) = if plan.strategy == Strategy::DualModel {
                        match self
                            .executor_extract(request_id, step_index, plan, req, &turn.text)
                            .await
                        {
                            Some(extracted) if !extracted.is_empty() => (extracted, None),
                            _ => (calls, provided_ids),
                        }
                    } else {
                        (calls, provided_ids)
                    };

                    // Retain architect prose as the reasoning message that
                    // precedes the tool calls.
                    if let Some(prose) = &reasoning {
                        transcript.push(Message::assistant(prose));
                    }

                    let planned = self.plan_calls(&plan.architect, calls, provided_ids);
                    let records = self
                        .dispatch_calls(request_id, step_index, &planned, plan.tool_deadline)
                        .await;

                    // Assistant tool-call messages first, then one tool
                    // message per result, in issue order.
                    for p in &planned {
                        transcript.push(Message::tool_call(
                            &p.id,
                            &p.name,
                            p.arguments.to_string(),
                        ));
                    }
                    for r in &records {
                        transcript.push(Message::tool_result(&r.call_id, &r.content));
                    }

                    // Streak bookkeeping per call target.
                    let mut terminal_error = false;
                    for r in &records {
                        if r.ok {
                            error_streaks.insert(r.tool.clone(), 0);
                        } else {
                            let streak = error_streaks.entry(r.tool.clone()).or_insert(0);
                            *streak += 1;
                            if *streak >= MAX_CONSECUTIVE_TOOL_ERRORS {
                                terminal_error = true;
                            }
                        }
                    }

                    let elapsed_ms = step_start.elapsed().as_millis() as u64;
                    self.bus
                        .publish(
                            request_id,
                            Event::StepFinished {
                                step: step_index,
                                elapsed_ms,
                            },
                        )
                        .await;
                    steps.push(StepRecord {
                        index: step_index,
                        response_text: turn.text,
                        intent: "call_tool".into(),
                        tool_calls: records,
                        elapsed_ms,
                        terminal: terminal_error,
                    });

                    if terminal_error {
                        return self.finish(
                            request_id,
                            best_text,
                            Outcome::ToolErrorTerminal,
                            steps,
                            transcript,
                        );
                    }
                }
            }
        }
    }

    fn finish(
        &self,
        _request_id: &str,
        assistant_text: String,
        outcome: Outcome,
        steps: Vec<StepRecord>,
        transcript: Vec<Message>,
    ) -> TurnOutput {
        TurnOutput {
            assistant_text,
            outcome,
            steps,
            transcript,
            error: None,
        }
    }

    /// Dual-model extraction: give the executor only the last user
    /// instruction and the architect's plan, and parse whatever structured
    /// call it emits.  Returns `None` when the executor fails; the caller
    /// falls back to the architect's own calls.
    async fn executor_extract(
        &self,
        request_id: &str,
        step: u32,
        plan: &ExecutionPlan,
        req: &IncomingRequest,
        architect_plan: &str,
    ) -> Option<Vec<ToolCallRequest>> {
        let executor_id = plan.executor.as_deref()?;
        let executor = match self.providers.provider_for(executor_id) {
            Ok(p) => p,
            Err(e) => {
                warn!(request_id, "executor unavailable, using architect output: {e:#}");
                return None;
            }
        };
        let ex_profile = self.profiles.profile(executor_id);

        let instruction = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.as_text())
            .unwrap_or("");

        let system = ex_profile.system_prompt.clone().unwrap_or_else(|| {
            "Convert the plan into the single tool call it describes. \
             Output only the tool call, no commentary."
                .to_string()
        });
        let messages = vec![
            Message::system(system),
            Message::user(format!(
                "Instruction:\n{instruction}\n\nPlan:\n{architect_plan}"
            )),
        ];

        let creq = CompletionRequest {
            messages,
            tools: plan.tools.clone(),
            tool_format: ex_profile.wire_format,
            stream: true,
            max_tokens: req.max_tokens,
            temperature: Some(0.0),
        };

        let turn = match self
            .stream_turn(request_id, step, executor.as_ref(), creq, plan.step_deadline)
            .await
        {
            Ok(t) => t,
            Err(_) => {
                warn!(request_id, "executor call failed, using architect output");
                return None;
            }
        };

        if !turn.structured_calls.is_empty() {
            return Some(
                turn.structured_calls
                    .into_iter()
                    .map(|c| ToolCallRequest {
                        name: c.name,
                        arguments: c.arguments,
                    })
                    .collect(),
            );
        }
        match parse_response(&turn.text).intent {
            Intent::CallTools(calls) => Some(calls),
            _ => None,
        }
    }

    /// Resolve aliases and assign call ids (provider ids are reused when
    /// the calls came through the structured protocol).
    fn plan_calls(
        &self,
        architect: &str,
        calls: Vec<ToolCallRequest>,
        provided_ids: Option<Vec<String>>,
    ) -> Vec<PlannedCall> {
        calls
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                let id = provided_ids
                    .as_ref()
                    .and_then(|ids| ids.get(i))
                    .filter(|id| !id.is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
                PlannedCall {
                    id,
                    name: self.tools.resolve_alias(architect, &c.name),
                    arguments: c.arguments,
                }
            })
            .collect()
    }

    /// Dispatch all calls of one step concurrently (the supervisor's
    /// semaphore enforces the parallel cap).  Finished events are published
    /// in completion order; the returned records are in issue order.
    async fn dispatch_calls(
        &self,
        request_id: &str,
        step: u32,
        planned: &[PlannedCall],
        tool_deadline: Duration,
    ) -> Vec<ToolCallRecord> {
        // Local rejection needs the advertised names; without a connection
        // the check is skipped and dispatch surfaces the transport error.
        let advertised: Option<HashSet<String>> = if self.tools.connected() {
            self.tools
                .list_tools()
                .await
                .ok()
                .map(|list| list.into_iter().map(|d| d.name).collect())
        } else {
            None
        };

        for p in planned {
            self.bus
                .publish(
                    request_id,
                    Event::ToolCallStarted {
                        step,
                        call_id: p.id.clone(),
                        tool: p.name.clone(),
                        arguments: p.arguments.clone(),
                    },
                )
                .await;
        }

        let mut handles = Vec::with_capacity(planned.len());
        for p in planned {
            let tools = Arc::clone(&self.tools);
            let bus = Arc::clone(&self.bus);
            let request_id = request_id.to_string();
            let call_id = p.id.clone();
            let name = p.name.clone();
            let args = p.arguments.clone();
            let unknown = advertised
                .as_ref()
                .map(|names| !names.contains(&name))
                .unwrap_or(false);

            handles.push(tokio::spawn(async move {
                let started = Instant::now();
                let (ok, content) = if unknown {
                    (false, format!("tool not available: {name}"))
                } else {
                    match tools.execute(&name, &args, tool_deadline).await {
                        Ok(out) => (true, out),
                        Err(e) => (false, e.to_string()),
                    }
                };
                let duration_ms = started.elapsed().as_millis() as u64;
                bus.publish(
                    &request_id,
                    Event::ToolCallFinished {
                        step,
                        call_id: call_id.clone(),
                        tool: name.clone(),
                        ok,
                        content: content.clone(),
                        duration_ms,
                    },
                )
                .await;
                ToolCallRecord {
                    call_id,
                    tool: name,
                    arguments: args,
                    ok,
                    content,
                    duration_ms,
                }
            }));
        }

        let mut records = Vec::with_capacity(handles.len());
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A panicked task still yields exactly one result.
                    records.push(ToolCallRecord {
                        call_id: planned[i].id.clone(),
                        tool: planned[i].name.clone(),
                        arguments: planned[i].arguments.clone(),
                        ok: false,
                        content: format!("tool execution panicked: {e}"),
                        duration_ms: 0,
                    });
                }
            }
        }
        records
    }

    /// Call the model once, publishing chunk events and accumulating the
    /// full text plus any structured tool calls.
    async fn stream_turn(
        &self,
        request_id: &str,
        step: u32,
        provider: &dyn ModelProvider,
        creq: CompletionRequest,
        deadline: Duration,
    ) -> Result<ModelTurn, TurnError> {
        let consume = async {
            let mut stream = provider.complete(creq).await.map_err(TurnError::Model)?;

            let mut full_text = String::new();
            // Keyed by the parallel-tool-call index; providers interleave
            // argument deltas for different calls by index.
            let mut pending: HashMap<u32, (String, String, String)> = HashMap::new();

            while let Some(event) = stream.next().await {
                match event.map_err(TurnError::Model)? {
                    ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                        full_text.push_str(&delta);
                        self.bus
                            .publish(
                                request_id,
                                Event::ModelChunk {
                                    step,
                                    text: delta,
                                },
                            )
                            .await;
                    }
                    ResponseEvent::TextDelta(_) => {}
                    ResponseEvent::ThinkingDelta(_) => {}
                    ResponseEvent::ToolCall {
                        index,
                        id,
                        name,
                        arguments,
                    } => {
                        let entry = pending.entry(index).or_default();
                        if !id.is_empty() {
                            entry.0 = id;
                        }
                        if !name.is_empty() {
                            entry.1 = name;
                        }
                        entry.2.push_str(&arguments);
                    }
                    ResponseEvent::Usage { .. } => {}
                    ResponseEvent::Done => break,
                    ResponseEvent::Error(e) => {
                        warn!(request_id, "model stream warning: {e}");
                    }
                }
            }

            // Flush accumulated calls ordered by index.  Calls with no name
            // cannot be dispatched and are dropped.
            let mut sorted: Vec<(u32, (String, String, String))> = pending.into_iter().collect();
            sorted.sort_by_key(|(idx, _)| *idx);
            let mut structured_calls = Vec::new();
            for (_, (id, name, args_buf)) in sorted {
                if name.is_empty() {
                    warn!(request_id, "dropping tool call with empty name");
                    continue;
                }
                let arguments = if args_buf.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    match serde_json::from_str(&args_buf) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(
                                request_id,
                                tool = %name,
                                "invalid JSON tool arguments ({e}); substituting {{}}"
                            );
                            Value::Object(Default::default())
                        }
                    }
                };
                structured_calls.push(StructuredCall {
                    id,
                    name,
                    arguments,
                });
            }

            debug!(
                request_id,
                step,
                text_len = full_text.len(),
                structured = structured_calls.len(),
                "model turn complete"
            );
            Ok(ModelTurn {
                text: full_text,
                structured_calls,
            })
        };

        match tokio::time::timeout(deadline, consume).await {
            Ok(result) => result,
            Err(_) => Err(TurnError::Timeout),
        }
    }
}

/// Prepend the prosthetic fragment to the leading system message.
fn apply_prosthetic(transcript: &mut [Message], prosthetic: Option<&str>) {
    let Some(fragment) = prosthetic else { return };
    if fragment.is_empty() {
        return;
    }
    if let Some(first) = transcript.first_mut() {
        if first.role == Role::System {
            if let Some(existing) = first.as_text() {
                *first = Message::system(format!("{fragment}\n\n{existing}"));
            }
        }
    }
}

fn model_error_output(transcript: Vec<Message>, error: String) -> TurnOutput {
    TurnOutput {
        assistant_text: String::new(),
        outcome: Outcome::ModelError,
        steps: Vec::new(),
        transcript,
        error: Some(error),
    }
}
