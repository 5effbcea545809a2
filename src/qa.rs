use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use crate::errors::{OrchestratorError, Result};
use crate::models::{Finding, FindingSeverity, QaReport, QaVerdict};
use crate::store::StoreHandle;

/// Exit codes a POSIX shell uses when the command itself could not run.
/// These indicate tooling failure, not a validation failure.
const EXIT_NOT_EXECUTABLE: i32 = 126;
const EXIT_NOT_FOUND: i32 = 127;

/// Runs validation against a worktree's current state and records a
/// structured report. Tooling failure is reported as verdict `errored`,
/// distinct from a validation `fail`, so infra problems are not mistaken
/// for "needs rework".
pub struct QaEngine {
    store: StoreHandle,
    qa_cmd: String,
}

impl QaEngine {
    pub fn new(store: StoreHandle, qa_cmd: String) -> Self {
        Self { store, qa_cmd }
    }

    /// Run the QA command inside the spec's worktree and append exactly one
    /// new report. Fails with `WorktreeMissing` if no live worktree and
    /// `BuildNotComplete` if the most recent build is still running.
    pub async fn run(&self, spec_id: &str) -> Result<QaReport> {
        let worktree = {
            let id = spec_id.to_string();
            self.store.call(move |s| s.get_worktree(&id)).await?
        };
        let Some(worktree) = worktree.filter(|w| w.live) else {
            return Err(OrchestratorError::WorktreeMissing {
                spec_id: spec_id.to_string(),
            });
        };

        let latest = {
            let id = spec_id.to_string();
            self.store.call(move |s| s.latest_build(&id)).await?
        };
        if let Some(build) = latest {
            if build.is_running() {
                return Err(OrchestratorError::BuildNotComplete {
                    spec_id: spec_id.to_string(),
                });
            }
        }

        let (verdict, findings) = self.execute(Path::new(&worktree.path)).await?;
        info!(spec_id, verdict = %verdict, findings = findings.len(), "qa run complete");

        let id = spec_id.to_string();
        let report = self
            .store
            .call(move |s| s.create_qa_report(&id, verdict, &findings))
            .await?;
        Ok(report)
    }

    pub async fn latest(&self, spec_id: &str) -> Result<Option<QaReport>> {
        let id = spec_id.to_string();
        Ok(self.store.call(move |s| s.latest_qa_report(&id)).await?)
    }

    async fn execute(&self, workdir: &Path) -> Result<(QaVerdict, Vec<Finding>)> {
        let spawned = Command::new("sh")
            .args(["-c", &self.qa_cmd])
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match spawned {
            Ok(output) => output,
            Err(e) => {
                // Could not even run the shell: infrastructure failure.
                return Ok((
                    QaVerdict::Errored,
                    vec![Finding::new(
                        FindingSeverity::Error,
                        format!("QA tooling failed to start: {}", e),
                    )],
                ));
            }
        };

        let code = output.status.code();
        if matches!(code, Some(EXIT_NOT_EXECUTABLE) | Some(EXIT_NOT_FOUND)) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok((
                QaVerdict::Errored,
                vec![Finding::new(
                    FindingSeverity::Error,
                    format!("QA command could not run: {}", stderr.trim()),
                )],
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut findings: Vec<Finding> = stdout.lines().filter_map(parse_finding_line).collect();

        if output.status.success() {
            return Ok((QaVerdict::Pass, findings));
        }

        if findings.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = last_lines(stderr.trim(), 5);
            let message = if detail.is_empty() {
                format!(
                    "QA command exited with status {}",
                    code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into())
                )
            } else {
                detail
            };
            findings.push(Finding::new(FindingSeverity::Error, message));
        }
        Ok((QaVerdict::Fail, findings))
    }
}

/// Parse one line of QA output into a structured finding. Lines are expected
/// as JSON objects with severity/message and optional file/line; anything
/// else is ignored here (non-finding chatter).
fn parse_finding_line(line: &str) -> Option<Finding> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str::<Finding>(trimmed).ok()
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
