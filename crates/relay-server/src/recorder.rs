// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session recorder: turns the event stream into durable turn records.
//!
//! The recorder is the sole owner of turn records.  It subscribes to the
//! bus, buffers the per-request context, and on a terminal event writes one
//! JSON file named by the turn id.  Writes are idempotent: an existing file
//! wins, so replays and duplicate terminal events are harmless.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use relay_events::{Event, EventBus};

/// One persisted conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: String,
    pub arrived_at: DateTime<Utc>,
    pub model: String,
    pub strategy: String,
    /// The normalized incoming request.
    pub request: Value,
    /// Step records as emitted by the loop.
    pub steps: Value,
    pub final_message: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct PendingTurn {
    arrived_at: DateTime<Utc>,
    model: String,
    strategy: String,
    request: Value,
}

pub struct SessionRecorder {
    dir: PathBuf,
}

impl SessionRecorder {
    /// Create the store directory and start the recorder task.
    pub fn spawn(bus: &Arc<EventBus>, dir: PathBuf, buffer: usize) -> anyhow::Result<()> {
        std::fs::create_dir_all(&dir)?;
        let recorder = Self { dir };
        let mut sub = bus.subscribe(buffer);
        tokio::spawn(async move {
            let mut pending: HashMap<String, PendingTurn> = HashMap::new();
            while let Some(env) = sub.recv().await {
                recorder.observe(&mut pending, &env.request_id, env.timestamp, &env.event);
            }
        });
        Ok(())
    }

    fn observe(
        &self,
        pending: &mut HashMap<String, PendingTurn>,
        request_id: &str,
        timestamp: DateTime<Utc>,
        event: &Event,
    ) {
        match event {
            Event::RequestStarted {
                model,
                strategy,
                request,
            } => {
                pending.insert(
                    request_id.to_string(),
                    PendingTurn {
                        arrived_at: timestamp,
                        model: model.clone(),
                        strategy: strategy.clone(),
                        request: request.clone(),
                    },
                );
            }
            Event::RequestFinished {
                outcome,
                assistant_text,
                steps,
            } => {
                let ctx = pending.remove(request_id);
                self.write(TurnRecord {
                    turn_id: request_id.to_string(),
                    arrived_at: ctx.as_ref().map(|c| c.arrived_at).unwrap_or(timestamp),
                    model: ctx.as_ref().map(|c| c.model.clone()).unwrap_or_default(),
                    strategy: ctx
                        .as_ref()
                        .map(|c| c.strategy.clone())
                        .unwrap_or_default(),
                    request: ctx.map(|c| c.request).unwrap_or(Value::Null),
                    steps: steps.clone(),
                    final_message: assistant_text.clone(),
                    outcome: outcome.clone(),
                    error: None,
                });
            }
            Event::RequestFailed { kind, error } => {
                // A failed request still leaves a durable trace when it got
                // far enough to be started.
                if let Some(ctx) = pending.remove(request_id) {
                    self.write(TurnRecord {
                        turn_id: request_id.to_string(),
                        arrived_at: ctx.arrived_at,
                        model: ctx.model,
                        strategy: ctx.strategy,
                        request: ctx.request,
                        steps: Value::Array(Vec::new()),
                        final_message: String::new(),
                        outcome: kind.clone(),
                        error: Some(error.clone()),
                    });
                }
            }
            _ => {}
        }
    }

    fn write(&self, record: TurnRecord) {
        let path = self.dir.join(format!("{}.json", record.turn_id));
        if path.exists() {
            debug!(turn_id = %record.turn_id, "turn record already persisted; skipping");
            return;
        }
        let json = match serde_json::to_vec_pretty(&record) {
            Ok(j) => j,
            Err(e) => {
                warn!(turn_id = %record.turn_id, "turn record serialization failed: {e}");
                return;
            }
        };
        if let Err(e) = std::fs::write(&path, json) {
            warn!(path = %path.display(), "turn record write failed: {e}");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
