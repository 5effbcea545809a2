use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::build::{AgentLauncher, BuildRunner, process_alive};
use crate::config::Config;
use crate::errors::{OrchestratorError, Result};
use crate::merge::MergeEngine;
use crate::models::*;
use crate::qa::QaEngine;
use crate::store::StoreHandle;
use crate::worktree::WorktreeManager;

/// Whether the lifecycle allows moving a spec from `from` to `to`.
///
/// Terminal states accept nothing. `Discarded` is reachable from every
/// non-terminal state; everything else follows the build/QA/review/merge
/// pipeline, with `Building -> Draft` as the fallback after a failed or
/// cancelled build.
pub fn is_valid_transition(from: SpecStatus, to: SpecStatus) -> bool {
    use SpecStatus::*;
    if from.is_terminal() {
        return false;
    }
    match (from, to) {
        (_, Discarded) => true,
        (Draft | QaFailed | Rejected, Building) => true,
        (Building, AwaitingQa) => true,
        (Building, Draft) => true,
        (AwaitingQa, QaPassed) => true,
        (AwaitingQa, QaFailed) => true,
        (QaPassed, AwaitingReview) => true,
        (AwaitingReview, Approved) => true,
        (AwaitingReview, Rejected) => true,
        (Approved, Merged) => true,
        _ => false,
    }
}

/// What a startup reconciliation pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub orphaned_builds: usize,
    pub reset_specs: usize,
}

/// The single writer of spec lifecycle state.
///
/// Every mutating operation takes a per-spec async mutex, so concurrent
/// requests against the same spec serialize into a consistent order while
/// different specs proceed independently. Components (worktrees, builds, QA,
/// merge) never change a spec's status themselves.
pub struct SpecOrchestrator {
    store: StoreHandle,
    worktrees: Arc<WorktreeManager>,
    builds: Arc<BuildRunner>,
    qa: QaEngine,
    merges: MergeEngine,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SpecOrchestrator {
    pub fn new(config: &Config, store: StoreHandle, launcher: Arc<dyn AgentLauncher>) -> Self {
        let worktrees = Arc::new(WorktreeManager::new(
            config.project_dir.clone(),
            config.worktrees_dir.clone(),
            store.clone(),
        ));
        let builds = Arc::new(BuildRunner::new(
            store.clone(),
            launcher,
            config.cancel_grace,
        ));
        let qa = QaEngine::new(store.clone(), config.qa_cmd.clone());
        let merges = MergeEngine::new(config.project_dir.clone(), store.clone());
        Self {
            store,
            worktrees,
            builds,
            qa,
            merges,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile the registry with reality after a restart. Builds whose
    /// process no longer exists are closed as failed, and specs stuck in
    /// `building` with no running build fall back to `draft`.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let store = self.store.lock_sync()?;

        let mut orphaned_builds = 0;
        for build in store.running_builds()? {
            let alive = build.pid.map(process_alive).unwrap_or(false);
            if alive {
                continue;
            }
            if store.finish_build(
                build.id,
                BuildOutcome::Failed,
                false,
                Some("orphaned by restart"),
            )? {
                warn!(build_id = build.id, spec_id = %build.spec_id, "closed orphaned build");
                orphaned_builds += 1;
            }
        }

        let mut reset_specs = 0;
        for spec in store.list_specs()? {
            if spec.status == SpecStatus::Building && store.running_build(&spec.id)?.is_none() {
                store.set_spec_status(&spec.id, SpecStatus::Draft)?;
                info!(spec_id = %spec.id, "reset interrupted spec to draft");
                reset_specs += 1;
            }
        }

        Ok(RecoveryReport {
            orphaned_builds,
            reset_specs,
        })
    }

    // ── Registration and queries ────────────────────────────────────────

    pub async fn register_spec(&self, spec_id: &str, title: &str) -> Result<Spec> {
        let id = spec_id.to_string();
        let title = title.to_string();
        Ok(self
            .store
            .call(move |s| s.get_or_create_spec(&id, &title))
            .await?)
    }

    pub async fn list_specs(&self) -> Result<Vec<Spec>> {
        Ok(self.store.call(|s| s.list_specs()).await?)
    }

    /// Live worktrees only. Torn-down records stay in the registry for
    /// history but are not part of the current world.
    pub async fn list_worktrees(&self) -> Result<Vec<Worktree>> {
        let all = self.store.call(|s| s.list_worktrees()).await?;
        Ok(all.into_iter().filter(|w| w.live).collect())
    }

    /// One aggregate record per spec: status, live worktree, latest build,
    /// latest QA report, latest review decision.
    pub async fn batch_status(&self) -> Result<Vec<SpecOverview>> {
        Ok(self
            .store
            .call(|s| {
                let mut overviews = Vec::new();
                for spec in s.list_specs()? {
                    overviews.push(SpecOverview {
                        worktree: s.get_worktree(&spec.id)?.filter(|w| w.live),
                        last_build: s.latest_build(&spec.id)?,
                        last_qa: s.latest_qa_report(&spec.id)?,
                        last_review: s.latest_review_decision(&spec.id)?,
                        spec,
                    });
                }
                Ok(overviews)
            })
            .await?)
    }

    pub async fn spec_status(&self, spec_id: &str) -> Result<SpecOverview> {
        let spec = self.require_spec(spec_id).await?;
        let id = spec_id.to_string();
        Ok(self
            .store
            .call(move |s| {
                Ok(SpecOverview {
                    worktree: s.get_worktree(&id)?.filter(|w| w.live),
                    last_build: s.latest_build(&id)?,
                    last_qa: s.latest_qa_report(&id)?,
                    last_review: s.latest_review_decision(&id)?,
                    spec,
                })
            })
            .await?)
    }

    /// Change summary and diff of the spec's worktree against its base
    /// revision, for human review.
    pub async fn review_spec(&self, spec_id: &str) -> Result<SpecReview> {
        self.require_spec(spec_id).await?;
        self.worktrees.changes(spec_id).await
    }

    pub async fn qa_status(&self, spec_id: &str) -> Result<Option<QaReport>> {
        self.require_spec(spec_id).await?;
        self.qa.latest(spec_id).await
    }

    pub async fn review_status(&self, spec_id: &str) -> Result<Option<ReviewDecision>> {
        self.require_spec(spec_id).await?;
        let id = spec_id.to_string();
        Ok(self
            .store
            .call(move |s| s.latest_review_decision(&id))
            .await?)
    }

    // ── Build ───────────────────────────────────────────────────────────

    /// Start a build for the spec, creating it and its worktree on first
    /// use. Allowed from `draft`, `qa_failed` and `rejected`.
    pub async fn run_build(&self, spec_id: &str, title: &str) -> Result<Build> {
        let lock = self.lock_for(spec_id).await;
        let _guard = lock.lock().await;
        {
            let id = spec_id.to_string();
            let title = title.to_string();
            self.store
                .call(move |s| s.get_or_create_spec(&id, &title))
                .await?;
        }
        self.start_build_locked(spec_id, None, false).await
    }

    /// Run the agent again in the existing worktree with extra
    /// instructions, typically to address QA findings or review feedback.
    pub async fn run_followup(&self, spec_id: &str, instructions: &str) -> Result<Build> {
        let lock = self.lock_for(spec_id).await;
        let _guard = lock.lock().await;
        self.start_build_locked(spec_id, Some(instructions.to_string()), true)
            .await
    }

    /// Cancel the spec's running build, if any. Cancelling a spec whose
    /// latest build already finished returns that record unchanged.
    pub async fn cancel_build(&self, spec_id: &str) -> Result<Build> {
        let spec = self.require_spec(spec_id).await?;
        let latest = {
            let id = spec_id.to_string();
            self.store.call(move |s| s.latest_build(&id)).await?
        };
        let Some(build) = latest else {
            return Err(OrchestratorError::PreconditionFailed {
                operation: "cancel",
                status: spec.status,
            });
        };
        self.builds.cancel(build.id).await
    }

    async fn start_build_locked(
        &self,
        spec_id: &str,
        instructions: Option<String>,
        require_existing_worktree: bool,
    ) -> Result<Build> {
        let spec = self.require_spec(spec_id).await?;
        if spec.status == SpecStatus::Building {
            return Err(OrchestratorError::BuildAlreadyRunning {
                spec_id: spec_id.to_string(),
            });
        }
        if !matches!(
            spec.status,
            SpecStatus::Draft | SpecStatus::QaFailed | SpecStatus::Rejected
        ) {
            return Err(OrchestratorError::PreconditionFailed {
                operation: "build",
                status: spec.status,
            });
        }

        let worktree = match self.worktrees.get(spec_id).await? {
            Some(wt) if wt.live => wt,
            _ if require_existing_worktree => {
                return Err(OrchestratorError::WorktreeMissing {
                    spec_id: spec_id.to_string(),
                });
            }
            _ => self.worktrees.create(spec_id, "HEAD").await?,
        };

        let previous = spec.status;
        self.set_status(spec_id, SpecStatus::Building).await?;

        let started = self
            .builds
            .start(
                spec_id,
                std::path::Path::new(&worktree.path),
                instructions.as_deref(),
            )
            .await;
        let (build, rx) = match started {
            Ok(pair) => pair,
            Err(e) => {
                // Roll back the status write; the build never started.
                let id = spec_id.to_string();
                self.store
                    .call(move |s| s.set_spec_status(&id, previous))
                    .await?;
                return Err(e);
            }
        };

        // Watcher resolves the lifecycle once the process exits. It takes
        // the spec lock itself, so a discard or cancel that lands first
        // simply wins; the watcher then finds the status moved on and
        // leaves it alone.
        let lock = self.lock_for(spec_id).await;
        let store = self.store.clone();
        let worktrees = self.worktrees.clone();
        let id = spec_id.to_string();
        tokio::spawn(async move {
            let Ok(outcome) = rx.await else { return };
            let _guard = lock.lock().await;

            let current = {
                let id = id.clone();
                store.call(move |s| s.get_spec(&id)).await
            };
            let Ok(Some(current)) = current else { return };
            if current.status != SpecStatus::Building {
                return;
            }

            let next = match outcome {
                BuildOutcome::Succeeded => {
                    match worktrees.commit_changes(&id, "agent build output").await {
                        Ok(_) => SpecStatus::AwaitingQa,
                        Err(e) => {
                            warn!(spec_id = %id, error = %e, "failed to commit build output");
                            SpecStatus::Draft
                        }
                    }
                }
                BuildOutcome::Failed | BuildOutcome::Cancelled => SpecStatus::Draft,
            };
            let set = {
                let id = id.clone();
                store.call(move |s| s.set_spec_status(&id, next)).await
            };
            match set {
                Ok(()) => info!(spec_id = %id, status = %next, "build resolved"),
                Err(e) => warn!(spec_id = %id, error = %e, "failed to resolve build status"),
            }
        });

        Ok(build)
    }

    // ── QA ──────────────────────────────────────────────────────────────

    /// Run validation and apply the verdict: `pass` moves the spec to
    /// `qa_passed`, `fail` to `qa_failed`. An `errored` verdict records
    /// the report but leaves the status untouched. Once a verdict has
    /// landed, only a new build re-opens the gate.
    pub async fn run_qa(&self, spec_id: &str) -> Result<QaReport> {
        let lock = self.lock_for(spec_id).await;
        let _guard = lock.lock().await;

        let spec = self.require_spec(spec_id).await?;
        if spec.status != SpecStatus::AwaitingQa {
            return Err(OrchestratorError::PreconditionFailed {
                operation: "qa",
                status: spec.status,
            });
        }

        let report = self.qa.run(spec_id).await?;
        match report.verdict {
            QaVerdict::Pass => {
                self.set_status(spec_id, SpecStatus::QaPassed).await?;
            }
            QaVerdict::Fail => {
                self.set_status(spec_id, SpecStatus::QaFailed).await?;
            }
            QaVerdict::Errored => {
                warn!(spec_id, "qa tooling errored, status unchanged");
            }
        }
        Ok(report)
    }

    // ── Review ──────────────────────────────────────────────────────────

    /// Put a QA-passed spec in front of a human.
    pub async fn request_review(&self, spec_id: &str) -> Result<Spec> {
        let lock = self.lock_for(spec_id).await;
        let _guard = lock.lock().await;

        let spec = self.require_spec(spec_id).await?;
        if spec.status != SpecStatus::QaPassed {
            return Err(OrchestratorError::PreconditionFailed {
                operation: "request review",
                status: spec.status,
            });
        }
        self.set_status(spec_id, SpecStatus::AwaitingReview).await
    }

    /// Record a human review decision. `pending` appends to the history
    /// without moving the spec; `approved` and `rejected` transition it.
    pub async fn record_review(
        &self,
        spec_id: &str,
        verdict: ReviewVerdict,
        comment: Option<&str>,
    ) -> Result<ReviewDecision> {
        let lock = self.lock_for(spec_id).await;
        let _guard = lock.lock().await;

        let spec = self.require_spec(spec_id).await?;
        if spec.status != SpecStatus::AwaitingReview {
            return Err(OrchestratorError::PreconditionFailed {
                operation: "review",
                status: spec.status,
            });
        }

        let decision = {
            let id = spec_id.to_string();
            let comment = comment.map(|c| c.to_string());
            self.store
                .call(move |s| s.create_review_decision(&id, verdict, comment.as_deref()))
                .await?
        };
        match verdict {
            ReviewVerdict::Approved => {
                self.set_status(spec_id, SpecStatus::Approved).await?;
            }
            ReviewVerdict::Rejected => {
                self.set_status(spec_id, SpecStatus::Rejected).await?;
            }
            ReviewVerdict::Pending => {}
        }
        Ok(decision)
    }

    // ── Merge and discard ───────────────────────────────────────────────

    /// Read-only conflict analysis. Available at any point once the spec
    /// has a live worktree; it never changes state.
    pub async fn merge_preview(&self, spec_id: &str, target_branch: &str) -> Result<MergePreview> {
        self.require_spec(spec_id).await?;
        self.merges.preview(spec_id, target_branch).await
    }

    /// Merge an approved spec's work into the target branch. On success the
    /// worktree is torn down and the spec is `merged`; on conflict nothing
    /// changes and the error lists the conflicting paths.
    pub async fn merge_worktree(
        &self,
        spec_id: &str,
        target_branch: &str,
        strategy: MergeStrategy,
    ) -> Result<MergeResult> {
        let lock = self.lock_for(spec_id).await;
        let _guard = lock.lock().await;

        let spec = self.require_spec(spec_id).await?;
        if spec.status != SpecStatus::Approved {
            return Err(OrchestratorError::PreconditionFailed {
                operation: "merge",
                status: spec.status,
            });
        }

        let result = self.merges.merge(spec_id, target_branch, strategy).await?;
        self.worktrees.destroy(spec_id).await?;
        self.set_status(spec_id, SpecStatus::Merged).await?;
        Ok(result)
    }

    /// Abandon a spec: cancel any running build, tear down its worktree and
    /// mark it `discarded`. Allowed from every non-terminal state.
    pub async fn discard_worktree(&self, spec_id: &str) -> Result<Spec> {
        let lock = self.lock_for(spec_id).await;
        let _guard = lock.lock().await;

        let spec = self.require_spec(spec_id).await?;
        if spec.status.is_terminal() {
            return Err(OrchestratorError::PreconditionFailed {
                operation: "discard",
                status: spec.status,
            });
        }

        let running = {
            let id = spec_id.to_string();
            self.store.call(move |s| s.running_build(&id)).await?
        };
        if let Some(build) = running {
            self.builds.cancel(build.id).await?;
        }

        match self.worktrees.destroy(spec_id).await {
            Ok(()) => {}
            // A draft spec may never have had a worktree.
            Err(OrchestratorError::WorktreeMissing { .. }) => {}
            Err(e) => return Err(e),
        }
        self.set_status(spec_id, SpecStatus::Discarded).await
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn require_spec(&self, spec_id: &str) -> Result<Spec> {
        let id = spec_id.to_string();
        self.store
            .call(move |s| s.get_spec(&id))
            .await?
            .ok_or_else(|| OrchestratorError::SpecNotFound {
                id: spec_id.to_string(),
            })
    }

    /// Validated status write. The transition table is the final arbiter
    /// even for internal callers.
    async fn set_status(&self, spec_id: &str, to: SpecStatus) -> Result<Spec> {
        let spec = self.require_spec(spec_id).await?;
        if !is_valid_transition(spec.status, to) {
            return Err(OrchestratorError::InvalidTransition {
                from: spec.status,
                to,
            });
        }
        let id = spec_id.to_string();
        self.store
            .call(move |s| {
                s.set_spec_status(&id, to)?;
                s.get_spec(&id)
            })
            .await?
            .ok_or_else(|| OrchestratorError::SpecNotFound {
                id: spec_id.to_string(),
            })
    }

    async fn lock_for(&self, spec_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(spec_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
