use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{info, warn};

use crate::errors::{OrchestratorError, Result};
use crate::models::{Build, BuildOutcome};
use crate::store::StoreHandle;

/// Abstraction over launching the code-generation agent, so tests can
/// substitute a stub process.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, workdir: &Path, instructions: Option<&str>) -> AnyResult<Child>;
}

/// Launches the real agent CLI in non-interactive mode.
pub struct AgentCli {
    cmd: String,
    flags: Vec<String>,
}

impl AgentCli {
    pub fn new(cmd: String, flags: Vec<String>) -> Self {
        Self { cmd, flags }
    }
}

#[async_trait]
impl AgentLauncher for AgentCli {
    async fn launch(&self, workdir: &Path, instructions: Option<&str>) -> AnyResult<Child> {
        let prompt = instructions.unwrap_or("Implement the spec for this worktree.");
        let mut cmd = Command::new(&self.cmd);
        cmd.args(&self.flags)
            .args(["-p", prompt])
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd.spawn().context("Failed to spawn agent process")
    }
}

struct RunHandle {
    pid: Option<u32>,
    cancel_requested: Arc<AtomicBool>,
    forced: Arc<AtomicBool>,
}

/// Launches, monitors and cancels the long-running generation process bound
/// to a worktree. One running build per spec; the terminal outcome is written
/// exactly once (store-level compare-and-set), so a cancel racing natural
/// completion resolves to a single result.
pub struct BuildRunner {
    store: StoreHandle,
    launcher: Arc<dyn AgentLauncher>,
    running: Arc<Mutex<HashMap<i64, RunHandle>>>,
    grace: Duration,
}

impl BuildRunner {
    pub fn new(store: StoreHandle, launcher: Arc<dyn AgentLauncher>, grace: Duration) -> Self {
        Self {
            store,
            launcher,
            running: Arc::new(Mutex::new(HashMap::new())),
            grace,
        }
    }

    /// Launch a build in the given worktree and return immediately. The
    /// receiver resolves with the terminal outcome once the process exits.
    pub async fn start(
        &self,
        spec_id: &str,
        worktree_path: &Path,
        instructions: Option<&str>,
    ) -> Result<(Build, oneshot::Receiver<BuildOutcome>)> {
        {
            let id = spec_id.to_string();
            if self
                .store
                .call(move |s| s.running_build(&id))
                .await?
                .is_some()
            {
                return Err(OrchestratorError::BuildAlreadyRunning {
                    spec_id: spec_id.to_string(),
                });
            }
        }

        let mut child = self
            .launcher
            .launch(worktree_path, instructions)
            .await
            .context("Failed to launch agent")?;
        let pid = child.id();

        let build = {
            let id = spec_id.to_string();
            let instructions = instructions.map(|s| s.to_string());
            self.store
                .call(move |s| s.create_build(&id, instructions.as_deref(), pid))
                .await?
        };

        let cancel_requested = Arc::new(AtomicBool::new(false));
        let forced = Arc::new(AtomicBool::new(false));
        {
            let mut running = self.running.lock().await;
            running.insert(
                build.id,
                RunHandle {
                    pid,
                    cancel_requested: cancel_requested.clone(),
                    forced: forced.clone(),
                },
            );
        }

        info!(spec_id, build_id = build.id, pid, "build started");

        let (tx, rx) = oneshot::channel();
        let store = self.store.clone();
        let running = self.running.clone();
        let build_id = build.id;
        tokio::spawn(async move {
            let stderr_content = match child.stderr.take() {
                Some(stderr) => {
                    let mut content = String::new();
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        content.push_str(&line);
                        content.push('\n');
                    }
                    content
                }
                None => String::new(),
            };

            let status = child.wait().await;
            let was_cancelled = cancel_requested.load(Ordering::SeqCst);
            let was_forced = forced.load(Ordering::SeqCst);

            let (outcome, error) = match status {
                _ if was_cancelled => (
                    BuildOutcome::Cancelled,
                    was_forced.then(|| "terminated forcibly after grace period".to_string()),
                ),
                Ok(st) if st.success() => (BuildOutcome::Succeeded, None),
                Ok(st) => {
                    let msg = if stderr_content.trim().is_empty() {
                        format!("agent exited with status {}", st.code().unwrap_or(-1))
                    } else {
                        format!("agent failed: {}", stderr_content.trim())
                    };
                    (BuildOutcome::Failed, Some(msg))
                }
                Err(e) => (BuildOutcome::Failed, Some(format!("wait failed: {}", e))),
            };

            let recorded = store
                .call(move |s| s.finish_build(build_id, outcome, was_forced, error.as_deref()))
                .await;
            match recorded {
                Ok(true) => info!(build_id, outcome = %outcome, "build finished"),
                Ok(false) => warn!(build_id, "build already closed by another writer"),
                Err(e) => warn!(build_id, error = %e, "failed to record build outcome"),
            }

            running.lock().await.remove(&build_id);
            let _ = tx.send(outcome);
        });

        Ok((build, rx))
    }

    /// Non-blocking poll of a build's state.
    pub async fn status(&self, build_id: i64) -> Result<Build> {
        self.store
            .call(move |s| s.get_build(build_id))
            .await?
            .ok_or(OrchestratorError::BuildNotFound { id: build_id })
    }

    /// Request cooperative termination. Safe on finished builds: returns the
    /// original terminal record unchanged. If the process ignores the
    /// interrupt for the grace period it is killed and the build is marked
    /// cancelled with the forced flag.
    pub async fn cancel(&self, build_id: i64) -> Result<Build> {
        let build = self.status(build_id).await?;
        if !build.is_running() {
            return Ok(build);
        }

        let handle = {
            let running = self.running.lock().await;
            running
                .get(&build_id)
                .map(|h| (h.pid, h.cancel_requested.clone(), h.forced.clone()))
        };

        let Some((pid, cancel_requested, forced)) = handle else {
            // Running in the registry but not supervised by this process
            // (e.g. pre-restart leftovers the recovery pass missed).
            let closed = self
                .store
                .call(move |s| {
                    s.finish_build(
                        build_id,
                        BuildOutcome::Cancelled,
                        false,
                        Some("process handle not owned by this instance"),
                    )
                })
                .await?;
            if closed {
                warn!(build_id, "cancelled unsupervised build record");
            }
            return self.status(build_id).await;
        };

        cancel_requested.store(true, Ordering::SeqCst);
        if let Some(pid) = pid {
            interrupt(pid);
        }
        info!(build_id, "cancel requested");

        if self.wait_closed(build_id).await? {
            return self.status(build_id).await;
        }

        // Grace period elapsed: escalate.
        forced.store(true, Ordering::SeqCst);
        if let Some(pid) = pid {
            terminate(pid);
        }
        warn!(build_id, "graceful interrupt timed out, killed process");
        self.wait_closed(build_id).await?;
        self.status(build_id).await
    }

    /// Poll until the build row is terminal or the grace period elapses.
    async fn wait_closed(&self, build_id: i64) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.grace;
        loop {
            if !self.status(build_id).await?.is_running() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(unix)]
fn interrupt(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGINT);
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn interrupt(_pid: u32) {}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

/// Whether a process with the given pid still exists. Used by restart
/// reconciliation.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Test double: runs an arbitrary shell command instead of the agent.
pub struct ShellLauncher {
    pub script: String,
}

#[async_trait]
impl AgentLauncher for ShellLauncher {
    async fn launch(&self, workdir: &Path, _instructions: Option<&str>) -> AnyResult<Child> {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &self.script])
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd.spawn().context("Failed to spawn shell")
    }
}
