// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::event::{Event, EventEnvelope};

/// How long a publisher waits on a full subscriber buffer before dropping
/// that subscriber.  Kept short: a stalled dashboard must never stall a
/// request.
const FULL_BUFFER_GRACE: Duration = Duration::from_millis(50);

/// In-process publish/subscribe fan-out.
///
/// Every subscriber gets its own bounded queue.  Delivery per subscriber is
/// in publish order; per-request sequence numbers are assigned here so any
/// subscriber can detect gaps after a re-attach (there is no back-fill).
pub struct EventBus {
    subscribers: Mutex<Vec<SubscriberSlot>>,
    /// Per-request sequence counters; entries are released when the
    /// terminal event for the request is published.
    seqs: Mutex<HashMap<String, u64>>,
    next_subscriber_id: AtomicU64,
}

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<Arc<EventEnvelope>>,
}

/// Receiving half handed to a subscriber.  Dropping it detaches the
/// subscriber on the next publish.
pub struct Subscription {
    pub rx: mpsc::Receiver<Arc<EventEnvelope>>,
    id: u64,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<EventEnvelope>> {
        self.rx.recv().await
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            seqs: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Attach a subscriber with the given buffer bound.
    pub fn subscribe(&self, buffer: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber table poisoned")
            .push(SubscriberSlot { id, tx });
        Subscription { rx, id }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber table poisoned")
            .len()
    }

    /// Publish one event for `request_id`, assigning the next sequence
    /// number for that request.
    ///
    /// A subscriber whose buffer stays full for longer than the grace bound
    /// is detached; it can re-attach with [`subscribe`](Self::subscribe) but
    /// receives no back-fill.
    pub async fn publish(&self, request_id: &str, event: Event) {
        let seq = self.next_seq(request_id, event.is_terminal());
        let envelope = Arc::new(EventEnvelope {
            request_id: request_id.to_string(),
            seq,
            timestamp: Utc::now(),
            event,
        });

        // Snapshot the senders; never hold the table lock across an await.
        let targets: Vec<(u64, mpsc::Sender<Arc<EventEnvelope>>)> = {
            let subs = self.subscribers.lock().expect("subscriber table poisoned");
            subs.iter().map(|s| (s.id, s.tx.clone())).collect()
        };

        let mut dead: Vec<u64> = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(Arc::clone(&envelope)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
                Err(mpsc::error::TrySendError::Full(env)) => {
                    match tokio::time::timeout(FULL_BUFFER_GRACE, tx.send(env)).await {
                        Ok(Ok(())) => {}
                        _ => {
                            warn!(subscriber = id, "event subscriber too slow; dropping");
                            dead.push(id);
                        }
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscribers.lock().expect("subscriber table poisoned");
            subs.retain(|s| !dead.contains(&s.id));
        }
    }

    fn next_seq(&self, request_id: &str, terminal: bool) -> u64 {
        let mut seqs = self.seqs.lock().expect("seq table poisoned");
        if terminal {
            // Terminal event takes the next number, then the counter is
            // released so long-lived processes do not accumulate entries.
            let n = seqs.remove(request_id).unwrap_or(0);
            return n;
        }
        let counter = seqs.entry(request_id.to_string()).or_insert(0);
        let n = *counter;
        *counter += 1;
        n
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(step: u32, text: &str) -> Event {
        Event::ModelChunk {
            step,
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(16);
        bus.publish("r1", chunk(1, "a")).await;
        bus.publish("r1", chunk(1, "b")).await;
        bus.publish("r1", chunk(1, "c")).await;

        let mut texts = Vec::new();
        for _ in 0..3 {
            let env = sub.recv().await.unwrap();
            if let Event::ModelChunk { text, .. } = &env.event {
                texts.push(text.clone());
            }
        }
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn seq_is_monotonic_per_request() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(16);
        bus.publish("r1", chunk(1, "x")).await;
        bus.publish("r2", chunk(1, "y")).await;
        bus.publish("r1", chunk(1, "z")).await;

        let a = sub.recv().await.unwrap();
        let b = sub.recv().await.unwrap();
        let c = sub.recv().await.unwrap();
        assert_eq!((a.request_id.as_str(), a.seq), ("r1", 0));
        assert_eq!((b.request_id.as_str(), b.seq), ("r2", 0));
        assert_eq!((c.request_id.as_str(), c.seq), ("r1", 1));
    }

    #[tokio::test]
    async fn terminal_event_releases_seq_counter() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(16);
        bus.publish("r1", chunk(1, "x")).await;
        bus.publish(
            "r1",
            Event::RequestFinished {
                outcome: "completed".into(),
                assistant_text: String::new(),
                steps: serde_json::Value::Null,
            },
        )
        .await;
        // A fresh request reusing the id starts counting from zero again.
        bus.publish("r1", chunk(1, "y")).await;

        let _ = sub.recv().await.unwrap();
        let terminal = sub.recv().await.unwrap();
        let restart = sub.recv().await.unwrap();
        assert_eq!(terminal.seq, 1);
        assert_eq!(restart.seq, 0);
    }

    #[tokio::test]
    async fn fans_out_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(4);
        let mut b = bus.subscribe(4);
        bus.publish("r1", chunk(1, "hello")).await;
        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped() {
        let bus = EventBus::new();
        // Buffer of 1, never drained.
        let _stuck = bus.subscribe(1);
        let mut live = bus.subscribe(16);

        bus.publish("r1", chunk(1, "a")).await;
        // Second publish finds the stuck buffer full, waits out the grace
        // period, then detaches the subscriber.
        bus.publish("r1", chunk(1, "b")).await;

        assert_eq!(bus.subscriber_count(), 1);
        assert!(live.recv().await.is_some());
        assert!(live.recv().await.is_some());
    }

    #[tokio::test]
    async fn dropped_receiver_is_detached_on_next_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe(4);
        drop(sub);
        bus.publish("r1", chunk(1, "a")).await;
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn envelope_serializes_with_flattened_event() {
        let env = EventEnvelope {
            request_id: "req-1".into(),
            seq: 3,
            timestamp: Utc::now(),
            event: Event::StepStarted { step: 2 },
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["request_id"], "req-1");
        assert_eq!(v["seq"], 3);
        assert_eq!(v["type"], "step_started");
        assert_eq!(v["step"], 2);
    }
}
