use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyResult};
use git2::{DiffOptions, Repository, Signature};
use tokio::process::Command;
use tracing::{info, warn};

use crate::errors::{OrchestratorError, Result};
use crate::models::{ChangeSummary, SpecReview, Worktree};
use crate::store::StoreHandle;

/// Convert a title into a filesystem/branch-safe slug.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let collapsed = slug
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    collapsed.chars().take(max_len).collect::<String>()
        .trim_end_matches('-')
        .to_string()
}

/// Creates and destroys isolated git worktrees, one per spec.
///
/// Worktree add/remove shells out to the git CLI; diff and commit plumbing
/// uses libgit2. The liveness flag in the registry is the mutual-exclusion
/// gate: at most one live worktree per spec.
pub struct WorktreeManager {
    project_dir: PathBuf,
    worktrees_dir: PathBuf,
    store: StoreHandle,
}

impl WorktreeManager {
    pub fn new(project_dir: PathBuf, worktrees_dir: PathBuf, store: StoreHandle) -> Self {
        Self {
            project_dir,
            worktrees_dir,
            store,
        }
    }

    pub fn branch_name(spec_id: &str) -> String {
        format!("autobuild/{}", slugify(spec_id, 60))
    }

    /// Materialize an isolated worktree for the spec at the given base
    /// revision. Fails with `WorktreeExists` if a live one is present and
    /// `BaseRevisionNotFound` if the revision does not resolve. A failed
    /// create leaves no partial state.
    pub async fn create(&self, spec_id: &str, base_revision: &str) -> Result<Worktree> {
        let existing = {
            let id = spec_id.to_string();
            self.store.call(move |s| s.get_worktree(&id)).await?
        };
        if let Some(wt) = existing {
            if wt.live {
                return Err(OrchestratorError::WorktreeExists {
                    spec_id: spec_id.to_string(),
                });
            }
        }

        let resolved = self
            .resolve_revision(base_revision)
            .await?
            .ok_or_else(|| OrchestratorError::BaseRevisionNotFound {
                revision: base_revision.to_string(),
            })?;

        let branch = Self::branch_name(spec_id);
        // Same slug as the branch: a spec id with separators must not
        // escape the worktrees directory.
        let path = self.worktrees_dir.join(slugify(spec_id, 60));
        tokio::fs::create_dir_all(&self.worktrees_dir)
            .await
            .context("Failed to create worktrees directory")?;

        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?
            .to_string();

        let output = Command::new("git")
            .args(["worktree", "add", "-b", &branch, &path_str, &resolved])
            .current_dir(&self.project_dir)
            .output()
            .await
            .context("Failed to run git worktree add")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!("git worktree add failed: {}", stderr.trim()).into());
        }

        let worktree = Worktree {
            spec_id: spec_id.to_string(),
            path: path_str,
            branch,
            base_revision: resolved,
            live: true,
        };

        let record = worktree.clone();
        if let Err(e) = self.store.call(move |s| s.insert_worktree(&record)).await {
            // Recording failed: tear the checkout back down so the caller
            // never observes partial state.
            if let Err(cleanup) = self.remove_checkout(&path, &worktree.branch).await {
                warn!(spec_id, error = %cleanup, "cleanup after failed worktree record");
            }
            return Err(e.into());
        }

        info!(spec_id, branch = %worktree.branch, "worktree created");
        Ok(worktree)
    }

    /// Tear down the spec's worktree. Idempotent: destroying an already
    /// torn-down worktree is a no-op success; only a spec with no worktree
    /// record at all is an error.
    pub async fn destroy(&self, spec_id: &str) -> Result<()> {
        let record = {
            let id = spec_id.to_string();
            self.store.call(move |s| s.get_worktree(&id)).await?
        };
        let Some(worktree) = record else {
            return Err(OrchestratorError::WorktreeMissing {
                spec_id: spec_id.to_string(),
            });
        };
        if !worktree.live {
            return Ok(());
        }

        self.remove_checkout(Path::new(&worktree.path), &worktree.branch)
            .await?;

        let id = spec_id.to_string();
        self.store
            .call(move |s| s.mark_worktree_torn_down(&id))
            .await?;
        info!(spec_id, "worktree destroyed");
        Ok(())
    }

    pub async fn get(&self, spec_id: &str) -> Result<Option<Worktree>> {
        let id = spec_id.to_string();
        Ok(self.store.call(move |s| s.get_worktree(&id)).await?)
    }

    /// The spec's live worktree, or `WorktreeMissing`.
    pub async fn get_live(&self, spec_id: &str) -> Result<Worktree> {
        match self.get(spec_id).await? {
            Some(wt) if wt.live => Ok(wt),
            _ => Err(OrchestratorError::WorktreeMissing {
                spec_id: spec_id.to_string(),
            }),
        }
    }

    /// Commit everything in the worktree onto its branch so that preview and
    /// merge operate on a committed tip. Returns the new commit id, or `None`
    /// if the tree is unchanged.
    pub async fn commit_changes(&self, spec_id: &str, message: &str) -> Result<Option<String>> {
        let worktree = self.get_live(spec_id).await?;
        let path = PathBuf::from(&worktree.path);
        let message = message.to_string();
        let commit = tokio::task::spawn_blocking(move || commit_all(&path, &message))
            .await
            .context("commit task panicked")??;
        Ok(commit)
    }

    /// File change summary and unified diff of the worktree against its base
    /// revision, for review.
    pub async fn changes(&self, spec_id: &str) -> Result<SpecReview> {
        let worktree = self.get_live(spec_id).await?;
        let path = PathBuf::from(&worktree.path);
        let base = worktree.base_revision.clone();
        let id = spec_id.to_string();
        let review = tokio::task::spawn_blocking(move || diff_against_base(&path, &base, &id))
            .await
            .context("diff task panicked")??;
        Ok(review)
    }

    /// Resolve a revision to a full commit id, or `None` if it is unknown.
    async fn resolve_revision(&self, revision: &str) -> Result<Option<String>> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("{}^{{commit}}", revision)])
            .current_dir(&self.project_dir)
            .output()
            .await
            .context("Failed to run git rev-parse")?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }

    async fn remove_checkout(&self, path: &Path, branch: &str) -> AnyResult<()> {
        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.project_dir)
            .output()
            .await
            .context("Failed to run git worktree remove")?;

        if !output.status.success() && path.exists() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git worktree remove failed: {}", stderr.trim());
        }

        // Prune stale admin entries, then drop the branch. Branch deletion is
        // best effort: merged branches may already be gone.
        let _ = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.project_dir)
            .output()
            .await;
        let delete = Command::new("git")
            .args(["branch", "-D", branch])
            .current_dir(&self.project_dir)
            .output()
            .await
            .context("Failed to run git branch -D")?;
        if !delete.status.success() {
            let stderr = String::from_utf8_lossy(&delete.stderr);
            warn!(branch, stderr = %stderr.trim(), "branch delete skipped");
        }
        Ok(())
    }
}

fn commit_all(worktree_path: &Path, message: &str) -> AnyResult<Option<String>> {
    let repo = Repository::open(worktree_path).context("Failed to open worktree repository")?;
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let head = repo.head()?.peel_to_commit()?;
    if head.tree_id() == tree_id {
        return Ok(None);
    }

    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now("autobuild", "autobuild@localhost")?;
    let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&head])?;
    Ok(Some(commit_id.to_string()))
}

fn diff_against_base(worktree_path: &Path, base_revision: &str, spec_id: &str) -> AnyResult<SpecReview> {
    let repo = Repository::open(worktree_path).context("Failed to open worktree repository")?;
    let base_oid = git2::Oid::from_str(base_revision)?;
    let base_tree = repo.find_commit(base_oid)?.tree()?;

    let mut opts = DiffOptions::new();
    opts.include_untracked(true);

    let diff = repo.diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))?;

    let mut summary = ChangeSummary::default();
    let mut diff_text = String::new();

    diff.foreach(
        &mut |delta, _progress| {
            if let Some(path) = delta.new_file().path() {
                let path = path.to_string_lossy().to_string();
                match delta.status() {
                    git2::Delta::Added | git2::Delta::Untracked => summary.files_added.push(path),
                    git2::Delta::Modified => summary.files_modified.push(path),
                    git2::Delta::Deleted => summary.files_deleted.push(path),
                    _ => {}
                }
            }
            true
        },
        None,
        None,
        Some(&mut |_delta, _hunk, line| {
            match line.origin() {
                '+' => summary.lines_added += 1,
                '-' => summary.lines_removed += 1,
                _ => {}
            }
            true
        }),
    )?;

    diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
        match line.origin() {
            '+' | '-' | ' ' => diff_text.push(line.origin()),
            _ => {}
        }
        if let Ok(s) = std::str::from_utf8(line.content()) {
            diff_text.push_str(s);
        }
        true
    })?;

    Ok(SpecReview {
        spec_id: spec_id.to_string(),
        summary,
        diff: diff_text,
    })
}
