// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The proxy front-end: OpenAI-compatible chat endpoint, liveness and
//! readiness probes, and the observer event stream (NDJSON + WebSocket).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode, Uri},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use relay_config::Config;
use relay_core::{normalize, Engine, IncomingRequest, Outcome};
use relay_events::{Event, EventBus};
use relay_toolserver::ToolDispatch;

use crate::error::ApiError;
use crate::openai::{chunk_frame, completion_response, finish_reason, ChatCompletionRequest};

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
    pub router: Arc<relay_core::Router>,
    pub engine: Arc<Engine>,
    pub tools: Arc<dyn ToolDispatch>,
    /// Whether the capability profile store was readable at startup.
    pub profiles_ready: bool,
    /// Whether the session store directory is writable.
    pub sessions_ready: bool,
    pub started_at: Instant,
}

/// Request bodies above this size are rejected before JSON parsing.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/events", get(events_ndjson))
        .route("/events/ws", get(events_ws))
        .fallback(not_found)
        .layer(tower_http::limit::RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the provided shutdown future resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "proxy front-end listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn with_request_id(request_id: &str, status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(REQUEST_ID_HEADER, request_id.to_string())],
        Json(body),
    )
        .into_response()
}

// ─── POST /v1/chat/completions ────────────────────────────────────────────────

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id_from(&headers);

    match handle_chat(&state, &request_id, &body).await {
        Ok(resp) => resp,
        Err(err) => {
            warn!(request_id, "request failed: {err}");
            let kind = match &err {
                ApiError::Validation(_) => "validation",
                ApiError::NotFound(_) => "not-found",
                ApiError::Upstream(_) => "upstream",
                ApiError::Internal(_) => "internal",
            };
            state
                .bus
                .publish(
                    &request_id,
                    Event::RequestFailed {
                        kind: kind.into(),
                        error: err.to_string(),
                    },
                )
                .await;
            with_request_id(
                &request_id,
                err.status(),
                err.envelope(&request_id, state.config.server.dev_mode),
            )
        }
    }
}

async fn handle_chat(
    state: &AppState,
    request_id: &str,
    body: &Bytes,
) -> Result<Response, ApiError> {
    let wire: ChatCompletionRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("invalid request body: {e}")))?;
    if wire.model.trim().is_empty() {
        return Err(ApiError::Validation("model must not be empty".into()));
    }

    let messages = normalize(wire.to_messages().map_err(ApiError::Validation)?);
    let incoming = IncomingRequest {
        model: wire.model.clone(),
        messages,
        tools: wire.tool_schemas(),
        temperature: wire.temperature,
        max_tokens: wire.max_tokens,
        stream: wire.stream,
    };

    let plan = state.router.plan(request_id, &incoming).await;

    let request_snapshot = json!({
        "model": incoming.model,
        "messages": incoming.messages,
        "stream": incoming.stream,
    });
    state
        .bus
        .publish(
            request_id,
            Event::RequestStarted {
                model: incoming.model.clone(),
                strategy: plan.strategy.as_str().into(),
                request: request_snapshot,
            },
        )
        .await;

    let prompt_chars: usize = incoming
        .messages
        .iter()
        .filter_map(|m| m.as_text())
        .map(str::len)
        .sum();

    if incoming.stream {
        return Ok(stream_chat(state, request_id, plan, incoming));
    }

    let out = state.engine.run(request_id, &plan, &incoming).await;
    state
        .bus
        .publish(
            request_id,
            Event::RequestFinished {
                outcome: out.outcome.as_str().into(),
                assistant_text: out.assistant_text.clone(),
                steps: serde_json::to_value(&out.steps).unwrap_or_default(),
            },
        )
        .await;

    if out.outcome == Outcome::ModelError {
        let err = ApiError::Upstream(out.error.unwrap_or_else(|| "model call failed".into()));
        return Ok(with_request_id(
            request_id,
            err.status(),
            err.envelope(request_id, state.config.server.dev_mode),
        ));
    }

    Ok(with_request_id(
        request_id,
        StatusCode::OK,
        completion_response(
            request_id,
            &incoming.model,
            &out.assistant_text,
            out.outcome,
            prompt_chars,
        ),
    ))
}

/// Streaming path: the SSE writer is a bus subscriber; the loop itself runs
/// unchanged.  Dropping the response body (client disconnect) closes the
/// channel, which cancels the in-flight engine future.
fn stream_chat(
    state: &AppState,
    request_id: &str,
    plan: relay_core::ExecutionPlan,
    incoming: IncomingRequest,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<SseEvent, Infallible>>(64);
    // Subscribe before the engine starts so no chunk can be missed.
    let mut sub = state.bus.subscribe(state.config.server.event_buffer);

    let engine = Arc::clone(&state.engine);
    let bus = Arc::clone(&state.bus);
    let request_id_owned = request_id.to_string();
    let model = incoming.model.clone();

    tokio::spawn(async move {
        let request_id = request_id_owned;
        let run = engine.run(&request_id, &plan, &incoming);
        tokio::pin!(run);

        let out = loop {
            tokio::select! {
                biased;
                _ = tx.closed() => {
                    // Client went away; dropping `run` cancels the model
                    // stream and any pending tool waits.
                    bus.publish(
                        &request_id,
                        Event::RequestFailed {
                            kind: "cancelled".into(),
                            error: "client disconnected".into(),
                        },
                    )
                    .await;
                    return;
                }
                out = &mut run => break out,
                env = sub.recv() => {
                    if let Some(env) = env {
                        if env.request_id == request_id {
                            if let Event::ModelChunk { text, .. } = &env.event {
                                let frame =
                                    chunk_frame(&request_id, &model, Some(text.as_str()), None);
                                if tx
                                    .send(Ok(SseEvent::default().data(frame.to_string())))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        };

        // The engine finished; everything it published is buffered.  Flush
        // remaining chunks before the terminal frame.
        while let Ok(env) = sub.rx.try_recv() {
            if env.request_id == request_id {
                if let Event::ModelChunk { text, .. } = &env.event {
                    let frame = chunk_frame(&request_id, &model, Some(text.as_str()), None);
                    if tx
                        .send(Ok(SseEvent::default().data(frame.to_string())))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }

        bus.publish(
            &request_id,
            Event::RequestFinished {
                outcome: out.outcome.as_str().into(),
                assistant_text: out.assistant_text.clone(),
                steps: serde_json::to_value(&out.steps).unwrap_or_default(),
            },
        )
        .await;

        let last = chunk_frame(&request_id, &model, None, Some(finish_reason(out.outcome)));
        let _ = tx.send(Ok(SseEvent::default().data(last.to_string()))).await;
        let _ = tx.send(Ok(SseEvent::default().data("[DONE]"))).await;
    });

    let mut resp = Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Ok(value) = request_id.parse() {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}

// ─── Probes ───────────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Response {
    let (used, total) = memory_usage();
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now(),
        "memory": { "used": used, "total": total },
    }))
    .into_response()
}

async fn ready(State(state): State<AppState>) -> Response {
    let services = json!({
        "tool_server": state.tools.connected(),
        "profile_store": state.profiles_ready,
        "session_store": state.sessions_ready,
    });
    let ready = services
        .as_object()
        .map(|m| m.values().all(|v| v.as_bool().unwrap_or(false)))
        .unwrap_or(false);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ready": ready, "services": services }))).into_response()
}

/// Resident set and total system memory in bytes, best-effort from procfs;
/// zeroes on platforms without it.
fn memory_usage() -> (u64, u64) {
    fn kb_field(path: &str, key: &str) -> Option<u64> {
        let text = std::fs::read_to_string(path).ok()?;
        text.lines().find(|l| l.starts_with(key)).and_then(|l| {
            l.split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
        })
    }
    let used = kb_field("/proc/self/status", "VmRSS:").unwrap_or(0) * 1024;
    let total = kb_field("/proc/meminfo", "MemTotal:").unwrap_or(0) * 1024;
    (used, total)
}

// ─── Event stream ─────────────────────────────────────────────────────────────

async fn events_ndjson(State(state): State<AppState>) -> Response {
    let sub = state.bus.subscribe(state.config.server.event_buffer);
    let stream = ReceiverStream::new(sub.rx).map(|env| {
        let line = serde_json::to_string(&*env).unwrap_or_default();
        Ok::<_, Infallible>(Bytes::from(format!("{line}\n")))
    });
    (
        [(axum::http::header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| ws_relay(socket, state))
}

/// Same payloads as the NDJSON stream, one event per text frame.
async fn ws_relay(mut socket: WebSocket, state: AppState) {
    let mut sub = state.bus.subscribe(state.config.server.event_buffer);
    while let Some(env) = sub.recv().await {
        let Ok(text) = serde_json::to_string(&*env) else {
            continue;
        };
        if socket.send(WsMessage::Text(text)).await.is_err() {
            break;
        }
    }
}

// ─── Fallback ─────────────────────────────────────────────────────────────────

async fn not_found(uri: Uri, headers: HeaderMap) -> Response {
    let request_id = request_id_from(&headers);
    with_request_id(
        &request_id,
        StatusCode::NOT_FOUND,
        json!({
            "error": "route not found",
            "code": "NOT_FOUND",
            "path": uri.path(),
            "requestId": request_id,
        }),
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
