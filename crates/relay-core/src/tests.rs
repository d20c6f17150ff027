// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end loop scenarios driven by scripted providers and a scripted
//! tool backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use relay_events::{Event, EventBus, EventEnvelope};
use relay_model::{
    Message, MessageContent, ProviderSet, ResponseEvent, Role, ScriptedMockProvider, ToolSchema,
};
use relay_registry::{CapabilityProfile, ProfileView, WireFormat};
use relay_toolserver::{ToolDescriptor, ToolDispatch, ToolServerError};

use crate::{Engine, ExecutionPlan, IncomingRequest, Outcome, Strategy};

// ─── Test doubles ─────────────────────────────────────────────────────────────

struct SyntheticProfiles;
impl ProfileView for SyntheticProfiles {
    fn profile(&self, model_id: &str) -> Arc<CapabilityProfile> {
        Arc::new(CapabilityProfile::synthetic(model_id))
    }
}

/// How one simulated tool call behaves.
#[derive(Clone)]
enum Behavior {
    Ok(String),
    Fail(String),
    /// Respond with the text after the delay; the deadline is honoured the
    /// way the real supervisor honours it.
    Delay(Duration, String),
}

type BehaviorFn = dyn Fn(&str, &Value) -> Behavior + Send + Sync;

/// Scripted tool backend: behavior is a function of (name, args) so
/// parallel calls stay deterministic.
struct TestTools {
    advertised: Vec<String>,
    aliases: HashMap<String, String>,
    connected: bool,
    behavior: Box<BehaviorFn>,
    executed: Mutex<Vec<(String, Value)>>,
}

impl TestTools {
    fn new(advertised: &[&str]) -> Self {
        Self {
            advertised: advertised.iter().map(|s| s.to_string()).collect(),
            aliases: HashMap::new(),
            connected: true,
            behavior: Box::new(|name, _| Behavior::Ok(format!("{name} ok"))),
            executed: Mutex::new(Vec::new()),
        }
    }

    fn with_behavior(
        mut self,
        f: impl Fn(&str, &Value) -> Behavior + Send + Sync + 'static,
    ) -> Self {
        self.behavior = Box::new(f);
        self
    }

    fn with_alias(mut self, from: &str, to: &str) -> Self {
        self.aliases.insert(from.into(), to.into());
        self
    }

    fn disconnected(mut self) -> Self {
        self.connected = false;
        self
    }

    fn executed(&self) -> Vec<(String, Value)> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ToolDispatch for TestTools {
    async fn execute(
        &self,
        name: &str,
        args: &Value,
        deadline: Duration,
    ) -> Result<String, ToolServerError> {
        if !self.connected {
            return Err(ToolServerError::NotConnected);
        }
        self.executed
            .lock()
            .unwrap()
            .push((name.to_string(), args.clone()));
        match (self.behavior)(name, args) {
            Behavior::Ok(text) => Ok(text),
            Behavior::Fail(msg) => Err(ToolServerError::Transport(msg)),
            Behavior::Delay(d, text) => {
                if d > deadline {
                    tokio::time::sleep(deadline).await;
                    Err(ToolServerError::Timeout)
                } else {
                    tokio::time::sleep(d).await;
                    Ok(text)
                }
            }
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolServerError> {
        if !self.connected {
            return Err(ToolServerError::NotConnected);
        }
        Ok(self
            .advertised
            .iter()
            .map(|name| ToolDescriptor {
                name: name.clone(),
                description: String::new(),
                parameters: json!({ "type": "object" }),
            })
            .collect())
    }

    fn resolve_alias(&self, _model_id: &str, name: &str) -> String {
        self.aliases.get(name).cloned().unwrap_or_else(|| name.to_string())
    }

    fn connected(&self) -> bool {
        self.connected
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn plan(strategy: Strategy, tools: &[&str], max_steps: u32) -> ExecutionPlan {
    ExecutionPlan {
        strategy,
        architect: "architect".into(),
        executor: if strategy == Strategy::DualModel {
            Some("executor".into())
        } else {
            None
        },
        tools: tools
            .iter()
            .map(|name| ToolSchema {
                name: name.to_string(),
                description: String::new(),
                parameters: json!({ "type": "object" }),
            })
            .collect(),
        wire_format: WireFormat::HermesXml,
        prosthetic: None,
        max_steps,
        total_deadline: Duration::from_secs(30),
        step_deadline: Duration::from_secs(10),
        tool_deadline: Duration::from_millis(100),
    }
}

fn request(content: &str) -> IncomingRequest {
    IncomingRequest {
        model: "gpt-x".into(),
        messages: crate::normalize(vec![Message::user(content)]),
        tools: Vec::new(),
        temperature: None,
        max_tokens: None,
        stream: false,
    }
}

fn engine_with(
    architect: ScriptedMockProvider,
    tools: Arc<TestTools>,
    bus: Arc<EventBus>,
) -> Engine {
    let providers = Arc::new(ProviderSet::with_provider("architect", Arc::new(architect)));
    Engine::new(providers, tools, Arc::new(SyntheticProfiles), bus)
}

fn tool_call_text(name: &str, path: &str) -> String {
    format!(r#"<tool_call>{{"name":"{name}","arguments":{{"path":"{path}"}}}}</tool_call>"#)
}

fn drain(sub: &mut relay_events::Subscription) -> Vec<EventEnvelope> {
    let mut out = Vec::new();
    while let Ok(env) = sub.rx.try_recv() {
        out.push((*env).clone());
    }
    out
}

fn tool_messages(transcript: &[Message]) -> Vec<(String, String)> {
    transcript
        .iter()
        .filter_map(|m| match &m.content {
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => Some((tool_call_id.clone(), content.clone())),
            _ => None,
        })
        .collect()
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

/// Direct pass-through: one provider call, one assistant message, exactly
/// one step recorded.
#[tokio::test]
async fn direct_pass_through() {
    let architect = ScriptedMockProvider::always_text("hello back");
    let tools = Arc::new(TestTools::new(&[]));
    let engine = engine_with(architect, Arc::clone(&tools), Arc::new(EventBus::new()));

    let out = engine
        .run("r1", &plan(Strategy::Direct, &[], 8), &request("hello"))
        .await;

    assert_eq!(out.outcome, Outcome::Completed);
    assert_eq!(out.assistant_text, "hello back");
    assert_eq!(out.steps.len(), 1);
    assert!(tools.executed().is_empty());
}

/// Single tool call, single iteration: the tool result reaches the
/// transcript and the second architect response becomes the answer.
#[tokio::test]
async fn single_tool_call_then_answer() {
    let architect = ScriptedMockProvider::new(vec![
        ScriptedMockProvider::text_script(tool_call_text("read_file", "README.md")),
        ScriptedMockProvider::text_script("it's a project"),
    ]);
    let requests = Arc::clone(&architect.requests);
    let tools =
        Arc::new(TestTools::new(&["read_file"]).with_behavior(|_, _| Behavior::Ok("# readme".into())));
    let engine = engine_with(architect, Arc::clone(&tools), Arc::new(EventBus::new()));

    let out = engine
        .run(
            "r1",
            &plan(Strategy::Agentic, &["read_file"], 8),
            &request("what is this repo?"),
        )
        .await;

    assert_eq!(out.outcome, Outcome::Completed);
    assert_eq!(out.assistant_text, "it's a project");
    assert_eq!(out.steps.len(), 2);

    // The supervisor saw exactly the decoded arguments.
    let executed = tools.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].0, "read_file");
    assert_eq!(executed[0].1, json!({"path":"README.md"}));

    // The transcript passed to the second model call carries exactly one
    // tool message for the issued call.
    let reqs = requests.lock().unwrap();
    assert_eq!(reqs.len(), 2);
    let second = &reqs[1];
    let tool_msgs: Vec<_> = second
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tool_msgs.len(), 1);
    match &tool_msgs[0].content {
        MessageContent::ToolResult { content, .. } => assert_eq!(content, "# readme"),
        other => panic!("unexpected content: {other:?}"),
    }
}

/// Alias resolution: the model's native name is mapped to the canonical
/// supervisor name before dispatch.
#[tokio::test]
async fn alias_resolution_before_dispatch() {
    let architect = ScriptedMockProvider::new(vec![
        ScriptedMockProvider::text_script(
            r#"{"action":"call_tool","tool":"fs.read","parameters":{"path":"a.txt"}}"#,
        ),
        ScriptedMockProvider::text_script("done"),
    ]);
    let tools = Arc::new(
        TestTools::new(&["read_file"])
            .with_alias("fs.read", "read_file")
            .with_behavior(|_, _| Behavior::Ok("contents".into())),
    );
    let engine = engine_with(architect, Arc::clone(&tools), Arc::new(EventBus::new()));

    let out = engine
        .run(
            "r1",
            &plan(Strategy::Agentic, &["read_file"], 8),
            &request("read a.txt"),
        )
        .await;

    assert_eq!(out.outcome, Outcome::Completed);
    let executed = tools.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].0, "read_file");
    assert_eq!(executed[0].1, json!({"path":"a.txt"}));
}

/// Iteration limit: with a budget of 2 and an architect that always calls
/// tools, exactly 2 tool iterations run and the final text is empty.
#[tokio::test]
async fn iteration_limit_stops_the_loop() {
    let architect = ScriptedMockProvider::new(vec![
        ScriptedMockProvider::text_script(tool_call_text("read_file", "a.txt")),
        ScriptedMockProvider::text_script(tool_call_text("read_file", "b.txt")),
        ScriptedMockProvider::text_script(tool_call_text("read_file", "c.txt")),
    ]);
    let tools = Arc::new(TestTools::new(&["read_file"]));
    let engine = engine_with(architect, Arc::clone(&tools), Arc::new(EventBus::new()));

    let out = engine
        .run(
            "r1",
            &plan(Strategy::Agentic, &["read_file"], 2),
            &request("keep going"),
        )
        .await;

    assert_eq!(out.outcome, Outcome::IterationLimit);
    assert_eq!(out.assistant_text, "");
    assert_eq!(out.steps.len(), 2);
    assert!(out.steps.iter().all(|s| !s.tool_calls.is_empty()));
    assert_eq!(tools.executed().len(), 2);
}

/// Budget of zero completes immediately with no steps.
#[tokio::test]
async fn zero_iteration_budget_finishes_immediately() {
    let architect = ScriptedMockProvider::always_text("never called");
    let tools = Arc::new(TestTools::new(&[]));
    let engine = engine_with(architect, tools, Arc::new(EventBus::new()));

    let out = engine
        .run("r1", &plan(Strategy::Agentic, &[], 0), &request("hi"))
        .await;

    assert_eq!(out.outcome, Outcome::IterationLimit);
    assert_eq!(out.assistant_text, "");
    assert!(out.steps.is_empty());
}

/// Tool timeout then success: the first result is a timeout error, the
/// second succeeds, and the request still completes.
#[tokio::test]
async fn tool_timeout_then_success() {
    let architect = ScriptedMockProvider::new(vec![
        ScriptedMockProvider::text_script(tool_call_text("read_file", "slow.txt")),
        ScriptedMockProvider::text_script(tool_call_text("read_file", "fast.txt")),
        ScriptedMockProvider::text_script("done"),
    ]);
    let tools = Arc::new(TestTools::new(&["read_file"]).with_behavior(|_, args| {
        if args["path"] == "slow.txt" {
            Behavior::Delay(Duration::from_millis(500), "late".into())
        } else {
            Behavior::Delay(Duration::from_millis(10), "quick".into())
        }
    }));
    let engine = engine_with(architect, Arc::clone(&tools), Arc::new(EventBus::new()));

    let out = engine
        .run(
            "r1",
            &plan(Strategy::Agentic, &["read_file"], 8),
            &request("read both"),
        )
        .await;

    assert_eq!(out.outcome, Outcome::Completed);
    assert_eq!(out.assistant_text, "done");
    assert_eq!(out.steps.len(), 3);

    let first = &out.steps[0].tool_calls[0];
    assert!(!first.ok);
    assert!(first.content.contains("timed out"));
    let second = &out.steps[1].tool_calls[0];
    assert!(second.ok);
    assert_eq!(second.content, "quick");
}

/// Parallel tool calls: results are appended in issue order even when the
/// second call finishes first; finished events arrive in completion order.
#[tokio::test]
async fn parallel_calls_preserve_issue_order() {
    let architect = ScriptedMockProvider::new(vec![
        ScriptedMockProvider::text_script(format!(
            "{}{}",
            tool_call_text("read_file", "a.txt"),
            tool_call_text("read_file", "b.txt"),
        )),
        ScriptedMockProvider::text_script("both read"),
    ]);
    let tools = Arc::new(TestTools::new(&["read_file"]).with_behavior(|_, args| {
        if args["path"] == "a.txt" {
            Behavior::Delay(Duration::from_millis(60), "content A".into())
        } else {
            Behavior::Delay(Duration::from_millis(5), "content B".into())
        }
    }));
    let bus = Arc::new(EventBus::new());
    let mut sub = bus.subscribe(256);
    let engine = engine_with(architect, Arc::clone(&tools), Arc::clone(&bus));

    let out = engine
        .run(
            "r1",
            &plan(Strategy::Agentic, &["read_file"], 8),
            &request("read a and b"),
        )
        .await;

    assert_eq!(out.outcome, Outcome::Completed);

    // Transcript order follows issue order: a.txt before b.txt.
    let results = tool_messages(&out.transcript);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].1, "content A");
    assert_eq!(results[1].1, "content B");

    // Finished events arrive in completion order: b first.
    let events = drain(&mut sub);
    let finished: Vec<&EventEnvelope> = events
        .iter()
        .filter(|e| matches!(e.event, Event::ToolCallFinished { .. }))
        .collect();
    assert_eq!(finished.len(), 2);
    match (&finished[0].event, &finished[1].event) {
        (
            Event::ToolCallFinished { content: c1, .. },
            Event::ToolCallFinished { content: c2, .. },
        ) => {
            assert_eq!(c1, "content B");
            assert_eq!(c2, "content A");
        }
        _ => unreachable!(),
    }

    // Every issued call id finished exactly once.
    let started_ids: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.event {
            Event::ToolCallStarted { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();
    for id in &started_ids {
        let count = events
            .iter()
            .filter(|e| {
                matches!(&e.event, Event::ToolCallFinished { call_id, .. } if call_id == id)
            })
            .count();
        assert_eq!(count, 1, "call {id} should finish exactly once");
    }

    // Per-request sequence numbers are strictly increasing.
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

/// Unknown tool after alias resolution: a local error result, not a
/// dispatch, and the loop continues.
#[tokio::test]
async fn unknown_tool_is_rejected_locally() {
    let architect = ScriptedMockProvider::new(vec![
        ScriptedMockProvider::text_script(tool_call_text("no_such_tool", "x")),
        ScriptedMockProvider::text_script("recovered"),
    ]);
    let tools = Arc::new(TestTools::new(&["read_file"]));
    let engine = engine_with(architect, Arc::clone(&tools), Arc::new(EventBus::new()));

    let out = engine
        .run(
            "r1",
            &plan(Strategy::Agentic, &["read_file"], 8),
            &request("try it"),
        )
        .await;

    assert_eq!(out.outcome, Outcome::Completed);
    assert_eq!(out.assistant_text, "recovered");
    assert!(tools.executed().is_empty(), "unknown tool must not dispatch");
    let first = &out.steps[0].tool_calls[0];
    assert!(!first.ok);
    assert!(first.content.contains("tool not available"));
}

/// Three consecutive failures from the same call target terminate the
/// request with a tool-error outcome.
#[tokio::test]
async fn repeated_tool_errors_become_terminal() {
    let architect = ScriptedMockProvider::new(vec![
        ScriptedMockProvider::text_script(tool_call_text("read_file", "a")),
        ScriptedMockProvider::text_script(tool_call_text("read_file", "b")),
        ScriptedMockProvider::text_script(tool_call_text("read_file", "c")),
        ScriptedMockProvider::text_script("unreachable"),
    ]);
    let tools = Arc::new(
        TestTools::new(&["read_file"])
            .with_behavior(|_, _| Behavior::Fail("backend exploded".into())),
    );
    let engine = engine_with(architect, Arc::clone(&tools), Arc::new(EventBus::new()));

    let out = engine
        .run(
            "r1",
            &plan(Strategy::Agentic, &["read_file"], 8),
            &request("keep failing"),
        )
        .await;

    assert_eq!(out.outcome, Outcome::ToolErrorTerminal);
    assert_eq!(out.steps.len(), 3);
    assert!(out.steps[2].terminal);
}

/// Disconnected supervisor: attempted calls surface transport errors as
/// tool results; the loop keeps going.
#[tokio::test]
async fn disconnected_supervisor_yields_transport_error_result() {
    let architect = ScriptedMockProvider::new(vec![
        ScriptedMockProvider::text_script(tool_call_text("read_file", "a")),
        ScriptedMockProvider::text_script("gave up on tools"),
    ]);
    let tools = Arc::new(TestTools::new(&["read_file"]).disconnected());
    let engine = engine_with(architect, tools, Arc::new(EventBus::new()));

    let out = engine
        .run(
            "r1",
            &plan(Strategy::Agentic, &["read_file"], 8),
            &request("try"),
        )
        .await;

    assert_eq!(out.outcome, Outcome::Completed);
    let first = &out.steps[0].tool_calls[0];
    assert!(!first.ok);
    assert!(first.content.contains("not connected"));
}

/// Model emits empty text with no calls: treated as respond("") and the
/// request finishes.
#[tokio::test]
async fn empty_model_response_completes_with_empty_text() {
    let architect = ScriptedMockProvider::new(vec![vec![ResponseEvent::Done]]);
    let tools = Arc::new(TestTools::new(&[]));
    let engine = engine_with(architect, tools, Arc::new(EventBus::new()));

    let out = engine
        .run("r1", &plan(Strategy::Agentic, &[], 8), &request("hi"))
        .await;

    assert_eq!(out.outcome, Outcome::Completed);
    assert_eq!(out.assistant_text, "");
    assert_eq!(out.steps.len(), 1);
}

/// Prose accompanying a tool directive is retained as the assistant
/// reasoning message preceding the call.
#[tokio::test]
async fn reasoning_prose_precedes_tool_call_in_transcript() {
    let architect = ScriptedMockProvider::new(vec![
        ScriptedMockProvider::text_script(format!(
            "Let me check the readme.\n{}",
            tool_call_text("read_file", "README.md")
        )),
        ScriptedMockProvider::text_script("done"),
    ]);
    let tools = Arc::new(TestTools::new(&["read_file"]));
    let engine = engine_with(architect, tools, Arc::new(EventBus::new()));

    let out = engine
        .run(
            "r1",
            &plan(Strategy::Agentic, &["read_file"], 8),
            &request("what's here?"),
        )
        .await;

    let reasoning_pos = out
        .transcript
        .iter()
        .position(|m| m.as_text() == Some("Let me check the readme."))
        .expect("reasoning message present");
    let call_pos = out
        .transcript
        .iter()
        .position(|m| matches!(m.content, MessageContent::ToolCall { .. }))
        .expect("tool call message present");
    assert!(reasoning_pos < call_pos);
}

/// Structured provider tool calls (native protocol) bypass the text parser
/// and reuse the provider's call ids.
#[tokio::test]
async fn structured_tool_calls_use_provider_ids() {
    let architect = ScriptedMockProvider::new(vec![
        ScriptedMockProvider::tool_call_script("call_native_1", "read_file", r#"{"path":"x"}"#),
        ScriptedMockProvider::text_script("ok"),
    ]);
    let tools = Arc::new(TestTools::new(&["read_file"]));
    let engine = engine_with(architect, tools, Arc::new(EventBus::new()));

    let out = engine
        .run(
            "r1",
            &plan(Strategy::Agentic, &["read_file"], 8),
            &request("go"),
        )
        .await;

    assert_eq!(out.outcome, Outcome::Completed);
    let results = tool_messages(&out.transcript);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "call_native_1");
}

/// Dual-model: the executor's structured output drives the dispatch, not
/// the architect's prose plan.
#[tokio::test]
async fn dual_model_executor_extracts_the_call() {
    let architect = ScriptedMockProvider::new(vec![
        // The architect gestures at a call without emitting clean JSON args.
        ScriptedMockProvider::text_script(
            "Plan: read the main readme file. <tool_call>{\"name\":\"read_file\",\"arguments\":{}}</tool_call>",
        ),
        ScriptedMockProvider::text_script("summarised"),
    ]);
    let executor = ScriptedMockProvider::new(vec![ScriptedMockProvider::text_script(
        r#"{"name":"read_file","arguments":{"path":"README.md"}}"#,
    )]);

    let tools = Arc::new(TestTools::new(&["read_file"]));
    let providers = Arc::new(ProviderSet::with_provider("architect", Arc::new(architect)));
    providers.insert("executor", Arc::new(executor));
    let engine = Engine::new(
        providers,
        Arc::clone(&tools) as Arc<dyn ToolDispatch>,
        Arc::new(SyntheticProfiles),
        Arc::new(EventBus::new()),
    );

    let out = engine
        .run(
            "r1",
            &plan(Strategy::DualModel, &["read_file"], 8),
            &request("summarise the readme"),
        )
        .await;

    assert_eq!(out.outcome, Outcome::Completed);
    let executed = tools.executed();
    assert_eq!(executed.len(), 1);
    // The executor supplied the argument the architect omitted.
    assert_eq!(executed[0].1, json!({"path":"README.md"}));
}

/// Parsing the same response twice yields equal intents.
#[test]
fn intent_parsing_is_stable() {
    let text = "check this\n<tool_call>{\"name\":\"search\",\"arguments\":{\"q\":\"rust\"}}</tool_call>";
    assert_eq!(crate::parse_response(text), crate::parse_response(text));
}
