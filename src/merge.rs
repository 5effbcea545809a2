use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Context;
use git2::{BranchType, Repository, Signature};
use tracing::info;

use crate::errors::{OrchestratorError, Result};
use crate::models::{MergePreview, MergeResult, MergeStrategy, Worktree};
use crate::store::StoreHandle;

/// Computes conflict previews and performs merges between a spec's worktree
/// branch and a target branch.
///
/// Preview is strictly read-only: the three-way merge runs on an in-memory
/// index and never touches the working directory or any ref. The merge
/// itself advances the target branch ref atomically (fast-forward or a
/// single merge commit). Gate enforcement (QA pass, review approval) is the
/// orchestrator's job; this engine executes when invoked.
pub struct MergeEngine {
    project_dir: PathBuf,
    store: StoreHandle,
}

impl MergeEngine {
    pub fn new(project_dir: PathBuf, store: StoreHandle) -> Self {
        Self {
            project_dir,
            store,
        }
    }

    /// Read-only conflict analysis of merging the worktree branch into
    /// `target_branch`. Calling this repeatedly without intervening state
    /// changes yields identical results.
    pub async fn preview(&self, spec_id: &str, target_branch: &str) -> Result<MergePreview> {
        let worktree = self.live_worktree(spec_id).await?;
        let project_dir = self.project_dir.clone();
        let target = target_branch.to_string();
        let spec = spec_id.to_string();
        tokio::task::spawn_blocking(move || compute_preview(&project_dir, &worktree, &target, &spec))
            .await
            .context("preview task panicked")?
    }

    /// Merge the worktree branch into `target_branch`. With
    /// `AbortOnConflict` any conflict aborts before anything is mutated,
    /// returning the same conflicting paths a preview would show.
    pub async fn merge(
        &self,
        spec_id: &str,
        target_branch: &str,
        strategy: MergeStrategy,
    ) -> Result<MergeResult> {
        let preview = self.preview(spec_id, target_branch).await?;
        if !preview.mergeable {
            match strategy {
                MergeStrategy::AbortOnConflict => {
                    return Err(OrchestratorError::MergeConflicts {
                        paths: preview.conflicting_paths,
                    });
                }
            }
        }

        let worktree = self.live_worktree(spec_id).await?;
        let project_dir = self.project_dir.clone();
        let target = target_branch.to_string();
        let spec = spec_id.to_string();
        let result =
            tokio::task::spawn_blocking(move || execute_merge(&project_dir, &worktree, &target, &spec))
                .await
                .context("merge task panicked")??;

        info!(
            spec_id,
            target_branch,
            commit = %result.merge_commit,
            fast_forward = result.fast_forward,
            "merge complete"
        );
        Ok(result)
    }

    async fn live_worktree(&self, spec_id: &str) -> Result<Worktree> {
        let id = spec_id.to_string();
        let worktree = self.store.call(move |s| s.get_worktree(&id)).await?;
        worktree
            .filter(|w| w.live)
            .ok_or_else(|| OrchestratorError::WorktreeMissing {
                spec_id: spec_id.to_string(),
            })
    }
}

fn resolve_tips<'repo>(
    repo: &'repo Repository,
    worktree: &Worktree,
    target_branch: &str,
) -> Result<(git2::Commit<'repo>, git2::Commit<'repo>)> {
    let target = repo
        .find_branch(target_branch, BranchType::Local)
        .map_err(|_| OrchestratorError::TargetBranchNotFound {
            branch: target_branch.to_string(),
        })?
        .get()
        .peel_to_commit()
        .context("Target branch does not point to a commit")?;

    let ours = repo
        .find_branch(&worktree.branch, BranchType::Local)
        .with_context(|| format!("Worktree branch {} not found", worktree.branch))?
        .get()
        .peel_to_commit()
        .context("Worktree branch does not point to a commit")?;

    Ok((target, ours))
}

fn compute_preview(
    project_dir: &std::path::Path,
    worktree: &Worktree,
    target_branch: &str,
    spec_id: &str,
) -> Result<MergePreview> {
    let repo = Repository::open(project_dir).context("Failed to open project repository")?;
    let (target_tip, wt_tip) = resolve_tips(&repo, worktree, target_branch)?;

    let base_oid = repo
        .merge_base(target_tip.id(), wt_tip.id())
        .context("No common ancestor with target branch")?;
    let base_tree = repo
        .find_commit(base_oid)
        .context("base commit")?
        .tree()
        .context("base tree")?;

    // Three-way merge on an in-memory index; nothing on disk moves.
    let merged = repo
        .merge_commits(&target_tip, &wt_tip, None)
        .context("Failed to compute in-memory merge")?;

    let mut conflicting = BTreeSet::new();
    if merged.has_conflicts() {
        for conflict in merged.conflicts().context("conflict iterator")? {
            let conflict = conflict.context("conflict entry")?;
            let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
            if let Some(entry) = entry {
                conflicting.insert(String::from_utf8_lossy(&entry.path).into_owned());
            }
        }
    }

    let wt_tree = wt_tip.tree().context("worktree tree")?;
    let diff = repo
        .diff_tree_to_tree(Some(&base_tree), Some(&wt_tree), None)
        .context("Failed to diff against merge base")?;

    let mut changed = BTreeSet::new();
    for delta in diff.deltas() {
        if let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) {
            let path = path.to_string_lossy().into_owned();
            if !conflicting.contains(&path) {
                changed.insert(path);
            }
        }
    }

    Ok(MergePreview {
        spec_id: spec_id.to_string(),
        target_branch: target_branch.to_string(),
        mergeable: conflicting.is_empty(),
        conflicting_paths: conflicting.into_iter().collect(),
        changed_paths: changed.into_iter().collect(),
    })
}

fn execute_merge(
    project_dir: &std::path::Path,
    worktree: &Worktree,
    target_branch: &str,
    spec_id: &str,
) -> Result<MergeResult> {
    let repo = Repository::open(project_dir).context("Failed to open project repository")?;
    let (target_tip, wt_tip) = resolve_tips(&repo, worktree, target_branch)?;

    let target_ref = format!("refs/heads/{}", target_branch);
    let head_is_target = repo
        .head()
        .ok()
        .and_then(|h| h.shorthand().map(|s| s == target_branch))
        .unwrap_or(false);

    let (merge_commit, fast_forward) = if target_tip.id() == wt_tip.id()
        || repo
            .graph_descendant_of(wt_tip.id(), target_tip.id())
            .context("ancestry check")?
    {
        // Target has not diverged: move the ref forward.
        repo.reference(
            &target_ref,
            wt_tip.id(),
            true,
            &format!("fast-forward merge of {}", worktree.branch),
        )
        .context("Failed to fast-forward target branch")?;
        (wt_tip.id(), true)
    } else {
        let mut merged = repo
            .merge_commits(&target_tip, &wt_tip, None)
            .context("Failed to merge commits")?;
        if merged.has_conflicts() {
            // Target moved between preview and merge.
            let preview = compute_preview(project_dir, worktree, target_branch, spec_id)?;
            return Err(OrchestratorError::MergeConflicts {
                paths: preview.conflicting_paths,
            });
        }
        let tree_oid = merged
            .write_tree_to(&repo)
            .context("Failed to write merged tree")?;
        let tree = repo.find_tree(tree_oid).context("merged tree")?;
        let sig = Signature::now("autobuild", "autobuild@localhost").context("signature")?;
        let commit = repo
            .commit(
                Some(&target_ref),
                &sig,
                &sig,
                &format!("Merge spec {} ({})", spec_id, worktree.branch),
                &tree,
                &[&target_tip, &wt_tip],
            )
            .context("Failed to create merge commit")?;
        (commit, false)
    };

    // The ref moved under a checked-out branch: sync the working directory.
    if head_is_target {
        repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))
            .context("Failed to checkout after merge")?;
    }

    Ok(MergeResult {
        spec_id: spec_id.to_string(),
        target_branch: target_branch.to_string(),
        merge_commit: merge_commit.to_string(),
        fast_forward,
    })
}
