use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Runtime configuration for the orchestrator.
///
/// All durable state lives under `<project_dir>/.autobuild/`: the registry
/// database and the worktree checkouts. The agent and QA commands default to
/// the standard tools but can be overridden via environment for testing.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub worktrees_dir: PathBuf,
    /// Command used to launch the code-generation agent.
    pub agent_cmd: String,
    /// Shell command run inside a worktree for QA validation.
    pub qa_cmd: String,
    /// How long a cancelled build gets to exit after the interrupt signal
    /// before it is forcibly killed.
    pub cancel_grace: Duration,
    pub verbose: bool,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let data_dir = project_dir.join(".autobuild");
        let db_path = data_dir.join("registry.db");
        let worktrees_dir = data_dir.join("worktrees");

        let agent_cmd = std::env::var("AGENT_CMD").unwrap_or_else(|_| "claude".to_string());
        let qa_cmd = std::env::var("QA_CMD").unwrap_or_else(|_| "cargo test".to_string());

        let cancel_grace = std::env::var("CANCEL_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));

        Ok(Self {
            project_dir,
            data_dir,
            db_path,
            worktrees_dir,
            agent_cmd,
            qa_cmd,
            cancel_grace,
            verbose,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).context("Failed to create data directory")?;
        std::fs::create_dir_all(&self.worktrees_dir)
            .context("Failed to create worktrees directory")?;
        Ok(())
    }

    /// Flags passed to the agent command for non-interactive runs.
    pub fn agent_flags(&self) -> Vec<String> {
        vec![
            "--print".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ]
    }
}
