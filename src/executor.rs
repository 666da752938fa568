//! Remote command execution over SSH.
//!
//! One logical host keeps a multiplexed control connection (OpenSSH
//! ControlMaster) so that every `run` and `stream` against it shares a
//! single authenticated channel instead of re-authenticating per call.
//! The control socket lives in a crate-owned directory; nothing here
//! touches `~/.ssh`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Characters allowed in hostnames and other values interpolated into
/// ssh argument vectors.
pub fn validate_host_token(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("value is empty".to_string());
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(format!(
            "'{}' contains characters outside [A-Za-z0-9._-]",
            value
        ));
    }
    Ok(())
}

/// How a failed remote invocation should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecErrorKind {
    /// Connection-shaped failure; reconnect with backoff.
    Transient,
    /// Authentication or environment failure; retrying is pointless until
    /// configuration changes.
    Permanent,
}

/// Error surfaced by the executor for invocations that never produced a
/// remote exit status.
#[derive(Debug)]
pub struct ExecError {
    pub kind: ExecErrorKind,
    pub message: String,
}

impl ExecError {
    fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ExecErrorKind::Transient,
            message: message.into(),
        }
    }

    fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ExecErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ExecErrorKind::Transient
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExecError {}

/// Output of a bounded unary command. A non-zero exit code is not an
/// executor error: the remote command ran and reported it.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Connection health of a host as last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostHealth {
    Connected,
    Disconnected(String),
}

/// Lazy sequence of stdout lines from a streaming remote command.
///
/// Lines arrive in remote emission order. The stream ends (yields `None`)
/// when the remote command terminates; dropping the stream kills the
/// underlying child.
pub struct LineStream {
    rx: mpsc::Receiver<String>,
    child: Option<Child>,
}

impl LineStream {
    /// Build a stream from a plain channel; used by in-memory executors
    /// in tests.
    pub fn from_channel(rx: mpsc::Receiver<String>) -> Self {
        Self { rx, child: None }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Kill the remote command and reap the child.
    pub async fn abort(mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// Abstraction over "run a command on a named host".
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Bounded unary command; argv is a fixed vector, never a shell
    /// string. `stdin` is fed to the remote command when present.
    async fn run(
        &self,
        host: &str,
        argv: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ExecError>;

    /// Long-running command whose stdout is consumed line by line.
    async fn stream(&self, host: &str, argv: &[&str]) -> Result<LineStream, ExecError>;

    /// Probe connection health with a cheap remote no-op.
    async fn health(&self, host: &str) -> HostHealth;
}

/// One SSH-reachable host as the executor sees it.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub alias: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub identity_file: String,
}

/// [`RemoteExecutor`] backed by the system OpenSSH client.
pub struct SshExecutor {
    targets: HashMap<String, SshTarget>,
    control_dir: PathBuf,
    command_timeout: Duration,
}

impl SshExecutor {
    pub fn new(
        targets: Vec<SshTarget>,
        control_dir: PathBuf,
        command_timeout: Duration,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&control_dir)?;
        Ok(Self {
            targets: targets
                .into_iter()
                .map(|t| (t.alias.clone(), t))
                .collect(),
            control_dir,
            command_timeout,
        })
    }

    fn target(&self, host: &str) -> Result<&SshTarget, ExecError> {
        self.targets
            .get(host)
            .ok_or_else(|| ExecError::permanent(format!("unknown host alias '{}'", host)))
    }

    /// Options shared by every invocation against a target. The
    /// ControlMaster settings are what make calls against one host share
    /// a single authenticated connection.
    fn base_args(&self, target: &SshTarget) -> Vec<String> {
        let control_path = self.control_dir.join("cm-%r@%h:%p");
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=60".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            "-o".to_string(),
            "ControlPersist=10m".to_string(),
            "-p".to_string(),
            target.port.to_string(),
            "-i".to_string(),
            target.identity_file.clone(),
            "-l".to_string(),
            target.user.clone(),
            target.hostname.clone(),
        ]
    }

    fn classify_ssh_failure(stderr: &str) -> ExecError {
        let permanent_markers = [
            "Permission denied",
            "Too many authentication failures",
            "No such identity",
            "Host key verification failed",
        ];
        if permanent_markers.iter().any(|m| stderr.contains(m)) {
            ExecError::permanent(format!("ssh authentication failed: {}", stderr.trim()))
        } else {
            ExecError::transient(format!("ssh connection failed: {}", stderr.trim()))
        }
    }
}

/// Exit code OpenSSH reserves for its own failures, as opposed to the
/// remote command's.
const SSH_FAILURE_EXIT: i32 = 255;

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        host: &str,
        argv: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ExecError> {
        let target = self.target(host)?;
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args(target))
            .args(argv)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host, command = ?argv, "Running remote command");

        let run = async {
            let mut child = cmd
                .spawn()
                .map_err(|e| ExecError::permanent(format!("failed to spawn ssh: {}", e)))?;
            if let Some(input) = stdin {
                if let Some(mut pipe) = child.stdin.take() {
                    use tokio::io::AsyncWriteExt;
                    pipe.write_all(input).await.map_err(|e| {
                        ExecError::transient(format!("failed to write remote stdin: {}", e))
                    })?;
                }
            }
            child.wait_with_output().await.map_err(|e| {
                ExecError::transient(format!("failed to collect remote output: {}", e))
            })
        };

        let output = tokio::time::timeout(self.command_timeout, run)
            .await
            .map_err(|_| {
                ExecError::transient(format!(
                    "remote command timed out after {}s",
                    self.command_timeout.as_secs()
                ))
            })??;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if exit_code == SSH_FAILURE_EXIT {
            return Err(Self::classify_ssh_failure(&stderr));
        }

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }

    async fn stream(&self, host: &str, argv: &[&str]) -> Result<LineStream, ExecError> {
        let target = self.target(host)?;
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args(target))
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host, command = ?argv, "Starting remote stream");

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::permanent(format!("failed to spawn ssh: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::permanent("ssh child has no stdout pipe"))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(1024);
        let host_name = host.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(host = %host_name, error = %e, "Remote stream read error");
                        break;
                    }
                }
            }
            // Drain stderr for the log so connection failures are visible.
            if let Some(mut stderr) = stderr {
                let mut buf = String::new();
                if stderr.read_to_string(&mut buf).await.is_ok() && !buf.trim().is_empty() {
                    debug!(host = %host_name, stderr = %buf.trim(), "Remote stream ended");
                }
            }
        });

        Ok(LineStream {
            rx,
            child: Some(child),
        })
    }

    async fn health(&self, host: &str) -> HostHealth {
        match self.run(host, &["true"], None).await {
            Ok(out) if out.success() => HostHealth::Connected,
            Ok(out) => HostHealth::Disconnected(format!(
                "health probe exited with code {}",
                out.exit_code
            )),
            Err(e) => HostHealth::Disconnected(e.message),
        }
    }
}
