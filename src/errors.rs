//! Typed error hierarchy for the autobuild orchestrator.
//!
//! One enum covers the whole lifecycle surface. Variants group into:
//! - not-found: `SpecNotFound`, `BuildNotFound`, `WorktreeMissing`,
//!   `BaseRevisionNotFound`, `TargetBranchNotFound`
//! - conflict (invariant violation): `WorktreeExists`, `BuildAlreadyRunning`,
//!   `InvalidTransition`
//! - gate failures: `PreconditionFailed`, `BuildNotComplete`
//! - `MergeConflicts` — not fatal, resolvable by a followup build
//! - `Infrastructure` — underlying tool/process failure

use thiserror::Error;

use crate::models::SpecStatus;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Spec {id} not found")]
    SpecNotFound { id: String },

    #[error("Build {id} not found")]
    BuildNotFound { id: i64 },

    #[error("No live worktree for spec {spec_id}")]
    WorktreeMissing { spec_id: String },

    #[error("A live worktree already exists for spec {spec_id}")]
    WorktreeExists { spec_id: String },

    #[error("Base revision {revision} not found")]
    BaseRevisionNotFound { revision: String },

    #[error("Target branch {branch} not found")]
    TargetBranchNotFound { branch: String },

    #[error("A build is already running for spec {spec_id}")]
    BuildAlreadyRunning { spec_id: String },

    #[error("The most recent build for spec {spec_id} is still running")]
    BuildNotComplete { spec_id: String },

    #[error("Cannot {operation} while spec is {status}")]
    PreconditionFailed {
        operation: &'static str,
        status: SpecStatus,
    },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: SpecStatus, to: SpecStatus },

    #[error("Merge has conflicts in {} path(s): {}", paths.len(), paths.join(", "))]
    MergeConflicts { paths: Vec<String> },

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Conflicts and gate failures are permanent until state changes;
    /// infrastructure errors are worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
