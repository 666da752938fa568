//! Per-host container observer.
//!
//! Each enabled host runs one observer task driving the state machine
//! described by the container discovery design:
//!
//! ```text
//!    Init ──connect──▶ Snapshot ──success──▶ Streaming ──event──▶ Streaming
//!                         │                      │
//!                         └──fail──▶ Backoff ◀───┘
//!                                      │
//!                                      └──▶ Init
//! ```
//!
//! A snapshot lists every container (running and stopped) and emits an
//! authoritative `Sync` event; the streaming phase follows the remote
//! event feed and emits targeted `Changed`/`Removed` events. A stalled
//! stream is torn down after the heartbeat deadline, and a periodic
//! resync re-snapshots regardless of stream health to close any gap.

use crate::backoff::Backoff;
use crate::container::{self, Container, EventRecord, HostEvent};
use crate::executor::{validate_host_token, CommandOutput, ExecError, RemoteExecutor};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Connection state of one observed host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum HostState {
    Unknown,
    Connecting,
    Connected,
    Disconnected { reason: String },
    Failed { reason: String },
}

/// Shared table of host connection states, read by the status API.
pub type HostStates = Arc<RwLock<HashMap<String, HostState>>>;

pub fn new_host_states(aliases: impl IntoIterator<Item = String>) -> HostStates {
    Arc::new(RwLock::new(
        aliases
            .into_iter()
            .map(|a| (a, HostState::Unknown))
            .collect(),
    ))
}

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Stream considered stalled after this long without a line.
    pub heartbeat_deadline: Duration,
    /// Interval of the authoritative periodic re-snapshot.
    pub resync_interval: Duration,
}

/// Why the streaming phase ended.
enum StreamEnd {
    Shutdown,
    /// Stream or resync failed; reconnect through backoff.
    Retry(String),
    /// Executor reported a permanent failure; park until shutdown.
    Fatal(String),
}

pub struct HostObserver {
    host: String,
    backend_host: String,
    executor: Arc<dyn RemoteExecutor>,
    events: mpsc::Sender<HostEvent>,
    states: HostStates,
    config: ObserverConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl HostObserver {
    pub fn new(
        host: String,
        backend_host: String,
        executor: Arc<dyn RemoteExecutor>,
        events: mpsc::Sender<HostEvent>,
        states: HostStates,
        config: ObserverConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            host,
            backend_host,
            executor,
            events,
            states,
            config,
            shutdown_rx,
        }
    }

    /// The resolved network address containers on this host are dialed at.
    pub fn backend_host(&self) -> &str {
        &self.backend_host
    }

    fn set_state(&self, state: HostState) {
        self.states.write().insert(self.host.clone(), state);
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run the observer until shutdown.
    pub async fn run(mut self) {
        info!(host = %self.host, "Host observer starting");
        let mut backoff = Backoff::reconnect();

        loop {
            if self.shutting_down() {
                break;
            }

            self.set_state(HostState::Connecting);
            match self.snapshot().await {
                Ok(containers) => {
                    backoff.reset();
                    self.set_state(HostState::Connected);
                    let count = containers.len();
                    if self
                        .events
                        .send(HostEvent::Sync {
                            host: self.host.clone(),
                            containers,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    debug!(host = %self.host, containers = count, "Snapshot complete");
                }
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    warn!(
                        host = %self.host,
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Snapshot failed, reconnecting"
                    );
                    self.set_state(HostState::Disconnected { reason: e.message });
                    if self.sleep_or_shutdown(delay).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(host = %self.host, error = %e, "Host failed permanently");
                    self.set_state(HostState::Failed { reason: e.message });
                    self.park_until_shutdown().await;
                    break;
                }
            }

            match self.streaming().await {
                StreamEnd::Shutdown => break,
                StreamEnd::Retry(reason) => {
                    let delay = backoff.next_delay();
                    warn!(
                        host = %self.host,
                        reason = %reason,
                        delay_ms = delay.as_millis() as u64,
                        "Event stream lost, reconnecting"
                    );
                    self.set_state(HostState::Disconnected { reason });
                    if self.sleep_or_shutdown(delay).await {
                        break;
                    }
                }
                StreamEnd::Fatal(reason) => {
                    error!(host = %self.host, reason = %reason, "Host failed permanently");
                    self.set_state(HostState::Failed { reason });
                    self.park_until_shutdown().await;
                    break;
                }
            }
        }

        info!(host = %self.host, "Host observer stopped");
    }

    /// Sleep for `delay`, returning true if shutdown arrived first.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown_rx.changed() => *self.shutdown_rx.borrow(),
        }
    }

    async fn park_until_shutdown(&mut self) {
        while !*self.shutdown_rx.borrow() {
            if self.shutdown_rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// List all containers, inspect them, and return the labeled ones.
    async fn snapshot(&self) -> Result<Vec<Container>, ExecError> {
        let ps = self
            .executor
            .run(
                &self.host,
                &["docker", "ps", "--all", "--no-trunc", "--format", "{{json .}}"],
                None,
            )
            .await?;
        check_docker_exit(&ps)?;

        // Ids feed back into an argv; anything outside the allowlist is
        // not a container id.
        let ids: Vec<String> = container::parse_ps_output(&ps.stdout)
            .into_iter()
            .filter(|id| validate_host_token(id).is_ok())
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut argv = vec!["docker", "inspect"];
        argv.extend(ids.iter().map(|s| s.as_str()));
        let inspect = self.executor.run(&self.host, &argv, None).await?;
        check_docker_exit(&inspect)?;

        let containers = container::parse_inspect_output(&self.host, &inspect.stdout)
            .map_err(|e| ExecError {
                kind: crate::executor::ExecErrorKind::Transient,
                message: format!("unreadable inspect output: {}", e),
            })?;

        Ok(containers
            .into_iter()
            .filter(Container::has_route_labels)
            .collect())
    }

    /// Follow the remote event stream until shutdown or failure, running
    /// the periodic resync alongside.
    async fn streaming(&mut self) -> StreamEnd {
        let mut stream = match self
            .executor
            .stream(
                &self.host,
                &[
                    "docker",
                    "events",
                    "--filter",
                    "type=container",
                    "--format",
                    "{{json .}}",
                ],
            )
            .await
        {
            Ok(s) => s,
            Err(e) if e.is_transient() => return StreamEnd::Retry(e.message),
            Err(e) => return StreamEnd::Fatal(e.message),
        };

        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        resync.reset();

        let end = loop {
            tokio::select! {
                line = tokio::time::timeout(self.config.heartbeat_deadline, stream.next_line()) => {
                    match line {
                        Ok(Some(line)) => {
                            if let Err(end) = self.handle_stream_line(&line).await {
                                break end;
                            }
                        }
                        Ok(None) => break StreamEnd::Retry("event stream ended".to_string()),
                        Err(_) => break StreamEnd::Retry(format!(
                            "no stream traffic for {}s",
                            self.config.heartbeat_deadline.as_secs()
                        )),
                    }
                }
                _ = resync.tick() => {
                    match self.snapshot().await {
                        Ok(containers) => {
                            debug!(host = %self.host, containers = containers.len(), "Periodic resync");
                            if self.events.send(HostEvent::Sync {
                                host: self.host.clone(),
                                containers,
                            }).await.is_err() {
                                break StreamEnd::Shutdown;
                            }
                        }
                        Err(e) if e.is_transient() => break StreamEnd::Retry(e.message),
                        Err(e) => break StreamEnd::Fatal(e.message),
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break StreamEnd::Shutdown;
                    }
                }
            }
        };

        stream.abort().await;
        end
    }

    /// React to one event line: inspect the container and forward the
    /// resulting change. Returns Err to end the streaming phase.
    async fn handle_stream_line(&self, line: &str) -> Result<(), StreamEnd> {
        let event = match EventRecord::parse(line) {
            Ok(event) => event,
            Err(e) => {
                debug!(host = %self.host, error = %e, "Skipping unparseable event line");
                return Ok(());
            }
        };
        if !event.is_watched() || validate_host_token(&event.id).is_err() {
            return Ok(());
        }

        debug!(host = %self.host, action = %event.action, id = %event.id, "Container event");

        if event.action == "destroy" {
            return self.emit_removed(&event.id).await;
        }

        match self.inspect_one(&event.id).await {
            Ok(Some(container)) => {
                if container.has_route_labels() {
                    if self.events.send(HostEvent::Changed(container)).await.is_err() {
                        return Err(StreamEnd::Shutdown);
                    }
                } else if event.is_removal() {
                    return self.emit_removed(&event.id).await;
                }
                Ok(())
            }
            Ok(None) => self.emit_removed(&event.id).await,
            Err(e) if e.is_transient() => Err(StreamEnd::Retry(e.message)),
            Err(e) => Err(StreamEnd::Fatal(e.message)),
        }
    }

    async fn emit_removed(&self, id: &str) -> Result<(), StreamEnd> {
        self.events
            .send(HostEvent::Removed {
                host: self.host.clone(),
                id: id.to_string(),
            })
            .await
            .map_err(|_| StreamEnd::Shutdown)
    }

    /// Inspect one container; `Ok(None)` means it no longer exists.
    async fn inspect_one(&self, id: &str) -> Result<Option<Container>, ExecError> {
        let out = self
            .executor
            .run(&self.host, &["docker", "inspect", id], None)
            .await?;
        if !out.success() {
            if out.stderr.contains("No such object") || out.stderr.contains("No such container") {
                return Ok(None);
            }
            check_docker_exit(&out)?;
        }
        let mut containers = container::parse_inspect_output(&self.host, &out.stdout)
            .map_err(|e| ExecError {
                kind: crate::executor::ExecErrorKind::Transient,
                message: format!("unreadable inspect output: {}", e),
            })?;
        Ok(containers.pop())
    }
}

/// Exit code shells report for "command not found".
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Turn a failed docker invocation into the right error class: a missing
/// docker binary will not fix itself, everything else is worth a retry.
fn check_docker_exit(out: &CommandOutput) -> Result<(), ExecError> {
    if out.success() {
        return Ok(());
    }
    let kind = if out.exit_code == EXIT_COMMAND_NOT_FOUND {
        crate::executor::ExecErrorKind::Permanent
    } else {
        crate::executor::ExecErrorKind::Transient
    };
    Err(ExecError {
        kind,
        message: format!(
            "docker exited with code {}: {}",
            out.exit_code,
            out.stderr.trim()
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecErrorKind, HostHealth, LineStream};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const INSPECT_JSON: &str = r#"[{
        "Id": "abc123",
        "Name": "/web",
        "Config": {
            "Image": "nginx",
            "Labels": { "snadboy.revp.80.domain": "app.example.com" }
        },
        "State": { "Status": "running" },
        "NetworkSettings": {
            "Ports": { "80/tcp": [{ "HostIp": "0.0.0.0", "HostPort": "8080" }] }
        }
    }]"#;

    struct FakeExecutor {
        ps_output: String,
        inspect_output: String,
        inspect_missing: bool,
        stream_rx: Mutex<Option<mpsc::Receiver<String>>>,
    }

    #[async_trait]
    impl RemoteExecutor for FakeExecutor {
        async fn run(
            &self,
            _host: &str,
            argv: &[&str],
            _stdin: Option<&[u8]>,
        ) -> Result<CommandOutput, ExecError> {
            match argv.get(1).copied() {
                Some("ps") => Ok(CommandOutput {
                    exit_code: 0,
                    stdout: self.ps_output.clone(),
                    stderr: String::new(),
                }),
                Some("inspect") if self.inspect_missing => Ok(CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "Error: No such object: abc123".to_string(),
                }),
                Some("inspect") => Ok(CommandOutput {
                    exit_code: 0,
                    stdout: self.inspect_output.clone(),
                    stderr: String::new(),
                }),
                _ => Ok(CommandOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                }),
            }
        }

        async fn stream(&self, _host: &str, _argv: &[&str]) -> Result<LineStream, ExecError> {
            let rx = self
                .stream_rx
                .lock()
                .take()
                .expect("stream opened more than once");
            Ok(LineStream::from_channel(rx))
        }

        async fn health(&self, _host: &str) -> HostHealth {
            HostHealth::Connected
        }
    }

    fn observer_with(
        executor: Arc<dyn RemoteExecutor>,
    ) -> (
        HostObserver,
        mpsc::Receiver<HostEvent>,
        watch::Sender<bool>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let observer = HostObserver::new(
            "h1".to_string(),
            "10.0.0.1".to_string(),
            executor,
            event_tx,
            new_host_states(["h1".to_string()]),
            ObserverConfig {
                heartbeat_deadline: Duration::from_secs(90),
                resync_interval: Duration::from_secs(300),
            },
            shutdown_rx,
        );
        (observer, event_rx, shutdown_tx)
    }

    #[tokio::test]
    async fn test_snapshot_then_event_stream() {
        let (line_tx, line_rx) = mpsc::channel(8);
        let executor = Arc::new(FakeExecutor {
            ps_output: "{\"ID\":\"abc123\"}\n".to_string(),
            inspect_output: INSPECT_JSON.to_string(),
            inspect_missing: false,
            stream_rx: Mutex::new(Some(line_rx)),
        });

        let (observer, mut events, shutdown_tx) = observer_with(executor);
        let states = observer.states.clone();
        let handle = tokio::spawn(observer.run());

        // Initial snapshot.
        match events.recv().await.unwrap() {
            HostEvent::Sync { host, containers } => {
                assert_eq!(host, "h1");
                assert_eq!(containers.len(), 1);
                assert_eq!(containers[0].id, "abc123");
            }
            other => panic!("expected Sync, got {:?}", other),
        }
        assert_eq!(states.read().get("h1"), Some(&HostState::Connected));

        // A start event triggers an inspect and a Changed.
        line_tx
            .send(r#"{"Type":"container","Action":"start","id":"abc123","time":1}"#.to_string())
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            HostEvent::Changed(container) => assert_eq!(container.id, "abc123"),
            other => panic!("expected Changed, got {:?}", other),
        }

        // Destroy removes without inspecting.
        line_tx
            .send(r#"{"Type":"container","Action":"destroy","id":"abc123","time":2}"#.to_string())
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            HostEvent::Removed { id, .. } => assert_eq!(id, "abc123"),
            other => panic!("expected Removed, got {:?}", other),
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_vanished_container_emits_removed() {
        let (line_tx, line_rx) = mpsc::channel(8);
        let executor = Arc::new(FakeExecutor {
            ps_output: String::new(),
            inspect_output: String::new(),
            inspect_missing: true,
            stream_rx: Mutex::new(Some(line_rx)),
        });

        let (observer, mut events, shutdown_tx) = observer_with(executor);
        let handle = tokio::spawn(observer.run());

        // Empty snapshot.
        assert!(matches!(
            events.recv().await.unwrap(),
            HostEvent::Sync { ref containers, .. } if containers.is_empty()
        ));

        line_tx
            .send(r#"{"Type":"container","Action":"die","id":"abc123","time":1}"#.to_string())
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            HostEvent::Removed { id, .. } => assert_eq!(id, "abc123"),
            other => panic!("expected Removed, got {:?}", other),
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_check_docker_exit_classification() {
        let not_found = CommandOutput {
            exit_code: 127,
            stdout: String::new(),
            stderr: "docker: command not found".to_string(),
        };
        assert_eq!(
            check_docker_exit(&not_found).unwrap_err().kind,
            ExecErrorKind::Permanent
        );

        let daemon_down = CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "Cannot connect to the Docker daemon".to_string(),
        };
        assert_eq!(
            check_docker_exit(&daemon_down).unwrap_err().kind,
            ExecErrorKind::Transient
        );
    }
}
