//! Child process supervision for agent runtimes.
//!
//! The supervisor spawns one OS process per started agent, overlays the
//! agent contract environment (`AGENT_ID`, `AGENT_TYPE`, `AGENT_NAME`,
//! `WORKING_DIR`, `LOG_DIR`), pipes all three stdio streams, and reaps
//! every exit. Exits always publish `process:exit`; non-zero codes also
//! publish `agent:error`.

use crate::events::{EventBus, EventTopic};
use crate::{Result, StrandError};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Launch description for one agent process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub agent_id: String,
    pub agent_type: String,
    pub agent_name: String,
    pub program: String,
    pub args: Vec<String>,
    /// Agent-specific additions on top of the inherited environment.
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Structured agent config, handed over once via `--config`.
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Soft terminate (SIGTERM); the child is expected to exit cleanly.
    Terminate,
    /// Hard kill (SIGKILL).
    Kill,
}

/// One captured line of child output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

struct ManagedProcess {
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
    output: broadcast::Sender<OutputLine>,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    bus: EventBus,
    processes: Arc<Mutex<HashMap<String, ManagedProcess>>>,
    stop_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(bus: EventBus, stop_timeout: Duration) -> Self {
        Self {
            bus,
            processes: Arc::new(Mutex::new(HashMap::new())),
            stop_timeout,
        }
    }

    /// Spawn the process described by `spec` and begin supervising it.
    ///
    /// Returns the OS pid. Fails with `LimitExceeded` if a process is
    /// already supervised for the agent.
    pub async fn spawn(&self, spec: ProcessSpec) -> Result<u32> {
        {
            let processes = self.processes.lock().await;
            if processes.contains_key(&spec.agent_id) {
                return Err(StrandError::LimitExceeded(format!(
                    "agent {} already has a supervised process",
                    spec.agent_id
                )));
            }
        }

        tokio::fs::create_dir_all(&spec.log_dir).await?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .env("AGENT_ID", &spec.agent_id)
            .env("AGENT_TYPE", &spec.agent_type)
            .env("AGENT_NAME", &spec.agent_name)
            .env("WORKING_DIR", &spec.working_dir)
            .env("LOG_DIR", &spec.log_dir)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(config) = &spec.config {
            command.arg("--config").arg(serde_json::to_string(config)?);
        }

        let mut child = command.spawn().map_err(|e| StrandError::ProcessFailed {
            message: format!("spawn {} for agent {}: {e}", spec.program, spec.agent_id),
            exit_code: None,
        })?;

        let pid = child.id().ok_or_else(|| StrandError::ProcessFailed {
            message: format!("agent {} exited before pid was known", spec.agent_id),
            exit_code: None,
        })?;

        let (output_tx, _) = broadcast::channel(256);
        let log_path = spec.log_dir.join(format!("{}.log", spec.agent_id));

        if let Some(stdout) = child.stdout.take() {
            self.pump_output(
                spec.agent_id.clone(),
                OutputStream::Stdout,
                stdout,
                output_tx.clone(),
                log_path.clone(),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            self.pump_output(
                spec.agent_id.clone(),
                OutputStream::Stderr,
                stderr,
                output_tx.clone(),
                log_path.clone(),
            );
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        {
            let bus = self.bus.clone();
            let agent_id = spec.agent_id.clone();
            tokio::spawn(async move {
                let code = match child.wait().await {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(e) => {
                        warn!("wait for agent {agent_id} failed: {e}");
                        -1
                    }
                };
                info!("agent {agent_id} process exited with code {code}");

                bus.publish(
                    EventTopic::ProcessExit,
                    json!({"agentId": agent_id, "exitCode": code}),
                )
                .await;
                if code != 0 {
                    bus.publish(
                        EventTopic::AgentError,
                        json!({
                            "agentId": agent_id,
                            "kind": "process_exit",
                            "exitCode": code,
                        }),
                    )
                    .await;
                }

                let _ = exit_tx.send(Some(code));
            });
        }

        let mut processes = self.processes.lock().await;
        processes.insert(
            spec.agent_id.clone(),
            ManagedProcess {
                pid,
                exit: exit_rx,
                output: output_tx,
            },
        );

        info!("spawned agent {} as pid {pid}", spec.agent_id);
        Ok(pid)
    }

    fn pump_output<R>(
        &self,
        agent_id: String,
        stream: OutputStream,
        reader: R,
        output: broadcast::Sender<OutputLine>,
        log_path: PathBuf,
    ) where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let log_file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await;
            let mut log_file = match log_file {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!("cannot open {log_path:?} for agent {agent_id}: {e}");
                    None
                }
            };

            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[{agent_id}:{stream:?}] {line}");
                if let Some(file) = log_file.as_mut() {
                    let _ = file.write_all(line.as_bytes()).await;
                    let _ = file.write_all(b"\n").await;
                }
                // Receivers are optional; dropped subscriptions are fine.
                let _ = output.send(OutputLine {
                    stream,
                    line,
                });
            }
        });
    }

    /// Deliver a signal to a supervised process.
    pub async fn signal(&self, agent_id: &str, signal: ProcessSignal) -> Result<()> {
        let pid = {
            let processes = self.processes.lock().await;
            processes
                .get(agent_id)
                .map(|p| p.pid)
                .ok_or_else(|| StrandError::NotFound(format!("process for agent {agent_id}")))?
        };

        let signum = match signal {
            ProcessSignal::Terminate => libc::SIGTERM,
            ProcessSignal::Kill => libc::SIGKILL,
        };

        // ESRCH means the process already exited; the reaper handles it.
        let rc = unsafe { libc::kill(pid as i32, signum) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(StrandError::ProcessFailed {
                    message: format!("signal {signal:?} to pid {pid}: {err}"),
                    exit_code: None,
                });
            }
        }
        debug!("sent {signal:?} to agent {agent_id} (pid {pid})");
        Ok(())
    }

    /// Wait for the supervised process to exit, up to `timeout`.
    pub async fn wait_exit(&self, agent_id: &str, timeout: Duration) -> Result<i32> {
        let mut exit = {
            let processes = self.processes.lock().await;
            processes
                .get(agent_id)
                .map(|p| p.exit.clone())
                .ok_or_else(|| StrandError::NotFound(format!("process for agent {agent_id}")))?
        };

        let wait = async {
            loop {
                if let Some(code) = *exit.borrow() {
                    return code;
                }
                if exit.changed().await.is_err() {
                    // Reaper dropped without sending; treat as abnormal.
                    return -1;
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| StrandError::Timeout(format!("waiting for agent {agent_id} to exit")))
    }

    /// Graceful stop protocol: soft-terminate, wait, hard-kill, reap.
    ///
    /// Returns the exit code, or `None` when no process was supervised
    /// for the agent (making repeated stops idempotent).
    pub async fn stop(&self, agent_id: &str) -> Result<Option<i32>> {
        {
            let processes = self.processes.lock().await;
            if !processes.contains_key(agent_id) {
                return Ok(None);
            }
        }

        self.signal(agent_id, ProcessSignal::Terminate).await?;
        let code = match self.wait_exit(agent_id, self.stop_timeout).await {
            Ok(code) => code,
            Err(StrandError::Timeout(_)) => {
                warn!("agent {agent_id} ignored soft terminate; killing");
                self.signal(agent_id, ProcessSignal::Kill).await?;
                self.wait_exit(agent_id, Duration::from_secs(5)).await?
            }
            Err(e) => return Err(e),
        };

        let mut processes = self.processes.lock().await;
        processes.remove(agent_id);
        Ok(Some(code))
    }

    /// Subscribe to the line-wise output of a supervised process.
    pub async fn output(&self, agent_id: &str) -> Result<broadcast::Receiver<OutputLine>> {
        let processes = self.processes.lock().await;
        processes
            .get(agent_id)
            .map(|p| p.output.subscribe())
            .ok_or_else(|| StrandError::NotFound(format!("process for agent {agent_id}")))
    }

    /// Whether a process is currently supervised and has not exited.
    pub async fn is_running(&self, agent_id: &str) -> bool {
        let processes = self.processes.lock().await;
        processes
            .get(agent_id)
            .map(|p| p.exit.borrow().is_none())
            .unwrap_or(false)
    }

    /// Drop bookkeeping for an exited process without signalling it.
    pub async fn forget(&self, agent_id: &str) {
        let mut processes = self.processes.lock().await;
        processes.remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn shell_spec(agent_id: &str, script: &str, dir: &std::path::Path) -> ProcessSpec {
        ProcessSpec {
            agent_id: agent_id.to_string(),
            agent_type: "tester".to_string(),
            agent_name: format!("{agent_id}-name"),
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            working_dir: dir.to_path_buf(),
            log_dir: dir.join("logs"),
            config: None,
        }
    }

    #[tokio::test]
    async fn spawn_and_wait_for_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(EventBus::new(), Duration::from_secs(5));

        supervisor
            .spawn(shell_spec("a-1", "exit 0", dir.path()))
            .await
            .unwrap();
        let code = supervisor
            .wait_exit("a-1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_publishes_agent_error() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let errors = Arc::new(AtomicUsize::new(0));
        {
            let errors = errors.clone();
            bus.subscribe(EventTopic::AgentError, move |event| {
                if event.payload["kind"] == "process_exit" {
                    errors.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        }

        let supervisor = ProcessSupervisor::new(bus, Duration::from_secs(5));
        supervisor
            .spawn(shell_spec("a-2", "exit 3", dir.path()))
            .await
            .unwrap();
        let code = supervisor
            .wait_exit("a-2", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(code, 3);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_terminates_a_sleeping_process() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(EventBus::new(), Duration::from_secs(5));

        supervisor
            .spawn(shell_spec("a-3", "sleep 60", dir.path()))
            .await
            .unwrap();
        assert!(supervisor.is_running("a-3").await);

        let code = supervisor.stop("a-3").await.unwrap();
        assert!(code.is_some());
        assert!(!supervisor.is_running("a-3").await);

        // Second stop is a no-op.
        assert_eq!(supervisor.stop("a-3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn output_lines_are_captured() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(EventBus::new(), Duration::from_secs(5));

        // The leading sleep keeps the lines from racing the subscription.
        supervisor
            .spawn(shell_spec("a-4", "sleep 0.3; echo hello; echo world", dir.path()))
            .await
            .unwrap();
        let mut output = supervisor.output("a-4").await.unwrap();

        let mut lines = Vec::new();
        while lines.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(5), output.recv()).await {
                Ok(Ok(line)) => lines.push(line.line),
                _ => break,
            }
        }
        assert_eq!(lines, vec!["hello".to_string(), "world".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_spawn_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(EventBus::new(), Duration::from_secs(5));

        supervisor
            .spawn(shell_spec("a-5", "sleep 60", dir.path()))
            .await
            .unwrap();
        let result = supervisor.spawn(shell_spec("a-5", "exit 0", dir.path())).await;
        assert!(matches!(result, Err(StrandError::LimitExceeded(_))));

        supervisor.stop("a-5").await.unwrap();
    }
}
