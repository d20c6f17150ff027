// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

use relay_config::ToolServerConfig;
use relay_events::{Event, EventBus};
use relay_registry::ProfileView;

use crate::error::{ConnectError, ToolServerError};
use crate::rpc;
use crate::{ToolDescriptor, ToolDispatch};

/// Deadline for the supervisor's own control calls (`tools/list`).
const CONTROL_DEADLINE: Duration = Duration::from_secs(10);

/// The logical connection to the external tool server.
///
/// Callers see a single `execute`/`list_tools` surface; underneath the
/// supervisor picks the remote HTTP transport when the configured URL
/// answers its health probe, and otherwise supervises a child process
/// speaking line-delimited JSON-RPC on stdin/stdout.
pub struct ToolServerSupervisor {
    config: ToolServerConfig,
    bus: Arc<EventBus>,
    profiles: Arc<dyn ProfileView>,
    http: reqwest::Client,
    transport: Mutex<Transport>,
    /// Pending subprocess calls keyed by rpc id.  The mutex is held only
    /// for table mutations, never across I/O.
    pending: Arc<Mutex<HashMap<u64, Pending>>>,
    next_rpc_id: AtomicU64,
    advert: Mutex<Option<AdvertCache>>,
    /// Caps concurrent tool executions; calls beyond the cap queue here.
    permits: Arc<Semaphore>,
    /// At most one reconnect loop may be in flight.
    reconnecting: AtomicBool,
    /// Back-reference handed to spawned reader/waiter/reconnect tasks.
    weak: Weak<Self>,
}

#[derive(Clone)]
enum Transport {
    Disconnected,
    Remote {
        base_url: String,
    },
    Subprocess {
        stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    },
}

enum Pending {
    Waiting(oneshot::Sender<Result<Value, ToolServerError>>),
    /// The caller gave up; the id is kept so a late response is recognised
    /// and discarded instead of being mistaken for a fresh call.
    TimedOut,
}

struct AdvertCache {
    tools: Vec<ToolDescriptor>,
    fetched_at: Instant,
}

impl ToolServerSupervisor {
    pub fn new(
        config: ToolServerConfig,
        profiles: Arc<dyn ProfileView>,
        bus: Arc<EventBus>,
        parallel_cap: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            bus,
            profiles,
            http: reqwest::Client::new(),
            transport: Mutex::new(Transport::Disconnected),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_rpc_id: AtomicU64::new(1),
            advert: Mutex::new(None),
            permits: Arc::new(Semaphore::new(parallel_cap.max(1))),
            reconnecting: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    /// An owned handle to self for spawned tasks.  A method on `&self` is
    /// only reachable while a strong reference exists, so the upgrade
    /// cannot fail.
    fn strong(&self) -> Arc<Self> {
        self.weak.upgrade().expect("supervisor alive")
    }

    /// Establish the initial transport.
    ///
    /// Remote-first: a healthy remote wins.  A dead remote falls back to
    /// the subprocess; a subprocess that cannot start is fatal only when no
    /// remote is configured (that condition maps to process exit code 2).
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if let Some(url) = self.config.remote_url.clone() {
            if self.probe_remote(&url).await {
                self.set_transport(Transport::Remote { base_url: url });
                self.bus
                    .publish(
                        "-",
                        Event::ToolServerConnected {
                            transport: "remote".into(),
                        },
                    )
                    .await;
                return Ok(());
            }
            debug!(url, "remote tool server health probe failed");
        }

        if self.config.command.is_some() {
            match self.spawn_subprocess().await {
                Ok(()) => {
                    self.bus
                        .publish(
                            "-",
                            Event::ToolServerConnected {
                                transport: "subprocess".into(),
                            },
                        )
                        .await;
                    return Ok(());
                }
                Err(e) if self.config.remote_url.is_some() => {
                    // The remote may come back; keep trying in the background.
                    warn!("tool server subprocess failed to start ({e}); will retry remote");
                    self.schedule_reconnect();
                    return Ok(());
                }
                Err(e) => return Err(ConnectError::Spawn(e)),
            }
        }

        if self.config.remote_url.is_some() {
            // Remote configured but currently down and no subprocess
            // fallback: start disconnected and keep probing.
            self.schedule_reconnect();
            return Ok(());
        }

        Err(ConnectError::NoTransport)
    }

    async fn probe_remote(&self, base_url: &str) -> bool {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        let probe = self.http.get(&url).send();
        match tokio::time::timeout(Duration::from_millis(self.config.health_timeout_ms), probe)
            .await
        {
            Ok(Ok(resp)) => resp.status().is_success(),
            _ => false,
        }
    }

    async fn spawn_subprocess(&self) -> std::io::Result<()> {
        let command = self.config.command.as_deref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no tool server command")
        })?;

        let mut cmd = Command::new(command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        info!(command, "tool server subprocess started");

        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        self.set_transport(Transport::Subprocess {
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
        });

        // Response reader: matches stdout lines against the pending table.
        let reader_self = self.strong();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some((id, outcome)) = rpc::parse_response_line(&line) {
                    reader_self.complete_pending(id, outcome);
                } else {
                    debug!(target: "tool_server", "unmatched stdout line: {line}");
                }
            }
        });

        // Stderr is free-form log text from the tool server.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "tool_server", "{line}");
            }
        });

        // Exit watcher tears down the transport and schedules reconnect.
        let waiter_self = self.strong();
        tokio::spawn(async move {
            let status = wait_child(&mut child).await;
            waiter_self
                .handle_disconnect(&format!("tool server subprocess exited ({status})"))
                .await;
        });

        Ok(())
    }

    fn set_transport(&self, t: Transport) {
        *self.transport.lock().expect("transport lock poisoned") = t;
    }

    fn transport_snapshot(&self) -> Transport {
        self.transport
            .lock()
            .expect("transport lock poisoned")
            .clone()
    }

    fn complete_pending(&self, id: u64, outcome: Result<Value, ToolServerError>) {
        let mut pending = self.pending.lock().expect("pending table poisoned");
        match pending.remove(&id) {
            Some(Pending::Waiting(tx)) => {
                let _ = tx.send(outcome);
            }
            Some(Pending::TimedOut) => {
                debug!(rpc_id = id, "late tool server response discarded");
            }
            None => {
                debug!(rpc_id = id, "response for unknown rpc id");
            }
        }
    }

    /// Tear down the current transport: fail every pending call, drop the
    /// advertisement cache, and kick off the reconnect loop.
    async fn handle_disconnect(&self, reason: &str) {
        {
            let mut t = self.transport.lock().expect("transport lock poisoned");
            if matches!(*t, Transport::Disconnected) {
                return;
            }
            *t = Transport::Disconnected;
        }

        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            pending.drain().map(|(_, p)| p).collect()
        };
        for p in drained {
            if let Pending::Waiting(tx) = p {
                let _ = tx.send(Err(ToolServerError::Transport(reason.to_string())));
            }
        }

        *self.advert.lock().expect("advert cache poisoned") = None;

        warn!(reason, "tool server disconnected");
        self.bus
            .publish(
                "-",
                Event::ToolServerDisconnected {
                    reason: reason.to_string(),
                },
            )
            .await;

        self.schedule_reconnect();
    }

    /// Start the reconnect loop unless one is already running.
    /// Exponential back-off from the configured floor to the cap.
    fn schedule_reconnect(&self) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let sup = self.strong();
        tokio::spawn(async move {
            let mut backoff = Duration::from_millis(sup.config.reconnect_initial_ms.max(1));
            let cap = Duration::from_millis(sup.config.reconnect_max_ms.max(1));
            loop {
                tokio::time::sleep(backoff).await;
                if sup.try_reconnect_once().await {
                    sup.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                backoff = (backoff * 2).min(cap);
            }
        });
    }

    async fn try_reconnect_once(&self) -> bool {
        if let Some(url) = self.config.remote_url.clone() {
            if self.probe_remote(&url).await {
                self.set_transport(Transport::Remote { base_url: url });
                info!("tool server reconnected (remote)");
                self.bus
                    .publish(
                        "-",
                        Event::ToolServerConnected {
                            transport: "remote".into(),
                        },
                    )
                    .await;
                return true;
            }
        }
        if self.config.command.is_some() {
            if self.spawn_subprocess().await.is_ok() {
                info!("tool server reconnected (subprocess)");
                self.bus
                    .publish(
                        "-",
                        Event::ToolServerConnected {
                            transport: "subprocess".into(),
                        },
                    )
                    .await;
                return true;
            }
        }
        false
    }

    async fn remote_call(
        &self,
        base_url: &str,
        name: &str,
        args: &Value,
        deadline: Duration,
    ) -> Result<String, ToolServerError> {
        let url = format!("{}/tools/{name}", base_url.trim_end_matches('/'));
        let send = async {
            let resp = self
                .http
                .post(&url)
                .json(args)
                .send()
                .await
                .map_err(|e| ToolServerError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(ToolServerError::Transport(format!(
                    "tool endpoint returned {}",
                    resp.status()
                )));
            }
            let body: Value = resp
                .json()
                .await
                .map_err(|e| ToolServerError::Transport(e.to_string()))?;
            Ok(rpc::result_text(&body))
        };
        match tokio::time::timeout(deadline, send).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ToolServerError::Timeout),
        }
    }

    async fn rpc_call(
        &self,
        stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, ToolServerError> {
        let id = self.next_rpc_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(id, Pending::Waiting(tx));

        let line = rpc::request_line(id, method, params);
        {
            let mut w = stdin.lock().await;
            if let Err(e) = w.write_all(line.as_bytes()).await {
                self.pending
                    .lock()
                    .expect("pending table poisoned")
                    .remove(&id);
                return Err(ToolServerError::Transport(e.to_string()));
            }
            if let Err(e) = w.flush().await {
                self.pending
                    .lock()
                    .expect("pending table poisoned")
                    .remove(&id);
                return Err(ToolServerError::Transport(e.to_string()));
            }
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ToolServerError::Transport(
                "connection torn down while waiting".into(),
            )),
            Err(_) => {
                // Keep the id so a late response is discarded, not matched
                // against a future call.
                let mut pending = self.pending.lock().expect("pending table poisoned");
                if let Some(entry) = pending.get_mut(&id) {
                    *entry = Pending::TimedOut;
                }
                Err(ToolServerError::Timeout)
            }
        }
    }

    fn cached_advert(&self) -> Option<Vec<ToolDescriptor>> {
        let ttl = Duration::from_secs(self.config.advert_ttl_secs);
        let advert = self.advert.lock().expect("advert cache poisoned");
        advert
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < ttl)
            .map(|c| c.tools.clone())
    }

    fn store_advert(&self, tools: Vec<ToolDescriptor>) {
        *self.advert.lock().expect("advert cache poisoned") = Some(AdvertCache {
            tools,
            fetched_at: Instant::now(),
        });
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending table poisoned").len()
    }
}

async fn wait_child(child: &mut Child) -> String {
    match child.wait().await {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    }
}

#[async_trait::async_trait]
impl ToolDispatch for ToolServerSupervisor {
    async fn execute(
        &self,
        name: &str,
        args: &Value,
        deadline: Duration,
    ) -> Result<String, ToolServerError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ToolServerError::NotConnected)?;

        match self.transport_snapshot() {
            Transport::Disconnected => Err(ToolServerError::NotConnected),
            Transport::Remote { base_url } => {
                self.remote_call(&base_url, name, args, deadline).await
            }
            Transport::Subprocess { stdin } => {
                let result = self
                    .rpc_call(stdin, "tools/call", rpc::call_params(name, args), deadline)
                    .await?;
                Ok(rpc::result_text(&result))
            }
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolServerError> {
        if let Some(tools) = self.cached_advert() {
            return Ok(tools);
        }

        let tools = match self.transport_snapshot() {
            Transport::Disconnected => return Err(ToolServerError::NotConnected),
            Transport::Remote { base_url } => {
                let url = format!("{}/tools", base_url.trim_end_matches('/'));
                let fetch = async {
                    let resp = self
                        .http
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| ToolServerError::Transport(e.to_string()))?;
                    let body: Value = resp
                        .json()
                        .await
                        .map_err(|e| ToolServerError::Transport(e.to_string()))?;
                    Ok::<_, ToolServerError>(rpc::parse_tool_list(&body))
                };
                tokio::time::timeout(CONTROL_DEADLINE, fetch)
                    .await
                    .map_err(|_| ToolServerError::Timeout)??
            }
            Transport::Subprocess { stdin } => {
                let result = self
                    .rpc_call(stdin, "tools/list", json!({}), CONTROL_DEADLINE)
                    .await?;
                rpc::parse_tool_list(&result)
            }
        };

        self.store_advert(tools.clone());
        Ok(tools)
    }

    fn resolve_alias(&self, model_id: &str, name: &str) -> String {
        self.profiles.resolve_alias(model_id, name)
    }

    fn connected(&self) -> bool {
        !matches!(self.transport_snapshot(), Transport::Disconnected)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use relay_registry::{CapabilityProfile, ProfileView};

    struct NoProfiles;
    impl ProfileView for NoProfiles {
        fn profile(&self, model_id: &str) -> Arc<CapabilityProfile> {
            Arc::new(CapabilityProfile::synthetic(model_id))
        }
    }

    fn supervisor(config: ToolServerConfig) -> Arc<ToolServerSupervisor> {
        ToolServerSupervisor::new(config, Arc::new(NoProfiles), Arc::new(EventBus::new()), 4)
    }

    fn subprocess_config(cmd: &str, args: &[&str]) -> ToolServerConfig {
        ToolServerConfig {
            command: Some(cmd.to_string()),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn connect_without_any_transport_is_fatal() {
        let sup = supervisor(ToolServerConfig::default());
        match sup.connect().await {
            Err(ConnectError::NoTransport) => {}
            other => panic!("expected NoTransport, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_with_unstartable_subprocess_is_fatal_without_remote() {
        let sup = supervisor(subprocess_config("/nonexistent/relay-tool-server", &[]));
        assert!(matches!(sup.connect().await, Err(ConnectError::Spawn(_))));
    }

    #[tokio::test]
    async fn execute_while_disconnected_returns_not_connected() {
        let sup = supervisor(ToolServerConfig::default());
        let err = sup
            .execute("read_file", &json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolServerError::NotConnected));
    }

    #[tokio::test]
    async fn subprocess_call_round_trips_through_stdio() {
        // A one-shot shell stand-in for the tool server: reads one request
        // line and answers rpc id 1.
        let script = r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":{"content":[{"type":"text","text":"pong"}]}}\n'"#;
        let sup = supervisor(subprocess_config("sh", &["-c", script]));
        sup.connect().await.unwrap();

        let out = sup
            .execute("ping", &json!({"x":1}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "pong");
        assert_eq!(sup.pending_len(), 0);
    }

    #[tokio::test]
    async fn subprocess_list_tools_parses_and_caches() {
        let script = r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"read_file","description":"Read a file","parameters":{"type":"object"}}]}}\n'; sleep 5"#;
        let sup = supervisor(subprocess_config("sh", &["-c", script]));
        sup.connect().await.unwrap();

        let tools = sup.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "read_file");

        // Second read is served from cache; the one-shot server already
        // consumed its only request.
        let again = sup.list_tools().await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn timeout_leaves_rpc_id_reserved() {
        // Server that never answers.
        let sup = supervisor(subprocess_config("sh", &["-c", "sleep 30"]));
        sup.connect().await.unwrap();

        let err = sup
            .execute("slow", &json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolServerError::Timeout));
        // The id remains in the table so a late response is discarded.
        assert_eq!(sup.pending_len(), 1);
    }

    #[tokio::test]
    async fn alias_resolution_passes_through_registry() {
        let sup = supervisor(ToolServerConfig::default());
        assert_eq!(sup.resolve_alias("any-model", "read_file"), "read_file");
    }
}
