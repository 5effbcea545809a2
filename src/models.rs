use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a spec. Terminal states are `Merged` and `Discarded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    Draft,
    Building,
    AwaitingQa,
    QaFailed,
    QaPassed,
    AwaitingReview,
    Approved,
    Rejected,
    Merged,
    Discarded,
}

impl SpecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Building => "building",
            Self::AwaitingQa => "awaiting_qa",
            Self::QaFailed => "qa_failed",
            Self::QaPassed => "qa_passed",
            Self::AwaitingReview => "awaiting_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Merged => "merged",
            Self::Discarded => "discarded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Discarded)
    }
}

impl fmt::Display for SpecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpecStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "building" => Ok(Self::Building),
            "awaiting_qa" => Ok(Self::AwaitingQa),
            "qa_failed" => Ok(Self::QaFailed),
            "qa_passed" => Ok(Self::QaPassed),
            "awaiting_review" => Ok(Self::AwaitingReview),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "merged" => Ok(Self::Merged),
            "discarded" => Ok(Self::Discarded),
            _ => Err(format!("Invalid spec status: {}", s)),
        }
    }
}

/// A unit of requested work, tracked through the full lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    pub id: String,
    pub title: String,
    pub status: SpecStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An isolated working copy bound 1:1 to a spec while live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub spec_id: String,
    pub path: String,
    pub branch: String,
    pub base_revision: String,
    pub live: bool,
}

/// Terminal outcome of a build. Absent while the process is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl BuildOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid build outcome: {}", s)),
        }
    }
}

/// One execution attempt of the code-generation agent inside a worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub spec_id: String,
    /// Follow-up instructions, if any. `None` means a fresh generation run.
    pub instructions: Option<String>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<BuildOutcome>,
    /// Set when cancellation had to escalate to a forced kill.
    pub forced: bool,
    pub error: Option<String>,
}

impl Build {
    pub fn is_running(&self) -> bool {
        self.outcome.is_none()
    }

    /// Caller-visible status string: `running` or the terminal outcome.
    pub fn status_str(&self) -> &'static str {
        match self.outcome {
            None => "running",
            Some(o) => o.as_str(),
        }
    }
}

/// Verdict of a QA run. `Errored` means the QA tooling itself failed,
/// which is distinct from the validation failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaVerdict {
    Pass,
    Fail,
    Errored,
}

impl QaVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Errored => "errored",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

impl fmt::Display for QaVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QaVerdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "errored" => Ok(Self::Errored),
            _ => Err(format!("Invalid QA verdict: {}", s)),
        }
    }
}

/// Severity of an individual QA finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Error,
    #[default]
    Warning,
    Info,
}

impl FindingSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Error)
    }
}

impl fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single issue identified by a QA run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: FindingSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Finding {
    pub fn new(severity: FindingSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            file: None,
            line: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// Human-readable location, `file:line` when both are known.
    pub fn location(&self) -> String {
        match (&self.file, self.line) {
            (Some(f), Some(l)) => format!("{}:{}", f, l),
            (Some(f), None) => f.clone(),
            _ => String::from("-"),
        }
    }
}

/// Immutable result of one QA run. Superseded, never mutated, by later runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaReport {
    pub id: i64,
    pub spec_id: String,
    pub verdict: QaVerdict,
    pub findings: Vec<Finding>,
    pub created_at: DateTime<Utc>,
}

impl QaReport {
    pub fn blocking_findings(&self) -> Vec<&Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity.is_blocking())
            .collect()
    }
}

/// Human judgement on a spec's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved,
    Rejected,
    Pending,
}

impl ReviewVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Pending => "pending",
        }
    }
}

impl fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewVerdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "pending" => Ok(Self::Pending),
            _ => Err(format!("Invalid review verdict: {}", s)),
        }
    }
}

/// One entry in the append-only review history. The latest entry is current.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub id: i64,
    pub spec_id: String,
    pub verdict: ReviewVerdict,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Strategy passed into a merge. Only `AbortOnConflict` is supported;
/// the tagged form leaves room for auto-resolution strategies later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    AbortOnConflict,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AbortOnConflict => "abort_on_conflict",
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort_on_conflict" => Ok(Self::AbortOnConflict),
            _ => Err(format!("Invalid merge strategy: {}", s)),
        }
    }
}

/// Read-only conflict analysis between a worktree branch and a target branch.
/// Computed per request, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePreview {
    pub spec_id: String,
    pub target_branch: String,
    pub conflicting_paths: Vec<String>,
    pub changed_paths: Vec<String>,
    pub mergeable: bool,
}

/// Result of a successful merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub spec_id: String,
    pub target_branch: String,
    pub merge_commit: String,
    pub fast_forward: bool,
}

/// File-level summary of a worktree's changes since its base revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub files_added: Vec<String>,
    pub files_modified: Vec<String>,
    pub files_deleted: Vec<String>,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl ChangeSummary {
    pub fn total_files(&self) -> usize {
        self.files_added.len() + self.files_modified.len() + self.files_deleted.len()
    }
}

/// Diff/content summary of a worktree returned by `review_spec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecReview {
    pub spec_id: String,
    pub summary: ChangeSummary,
    pub diff: String,
}

/// Aggregate view of one spec for `batch_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecOverview {
    pub spec: Spec,
    pub worktree: Option<Worktree>,
    pub last_build: Option<Build>,
    pub last_qa: Option<QaReport>,
    pub last_review: Option<ReviewDecision>,
}
