//! End-to-end lifecycle scenarios against a real git repository.
//!
//! The agent is replaced by a shell script and QA by a shell command, so
//! every path through build, QA, review, merge and discard runs for real
//! without the actual generation tooling.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use git2::{Repository, Signature};
use tempfile::TempDir;

use autobuild::build::ShellLauncher;
use autobuild::config::Config;
use autobuild::errors::OrchestratorError;
use autobuild::models::*;
use autobuild::orchestrator::SpecOrchestrator;
use autobuild::store::{Store, StoreHandle};

const SPEC: &str = "001-add-login";

fn init_repo(dir: &Path) {
    let repo = Repository::init(dir).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();
    fs::write(dir.join("README.md"), "hello\n").unwrap();
    commit_all(dir, "init");
}

fn commit_all(dir: &Path, message: &str) {
    let repo = Repository::open(dir).unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::now("test", "test@test.com").unwrap();
    let parents = repo.head().ok().map(|h| h.peel_to_commit().unwrap());
    let parent_refs: Vec<_> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap();
}

fn default_branch(dir: &Path) -> String {
    Repository::open(dir)
        .unwrap()
        .head()
        .unwrap()
        .shorthand()
        .unwrap()
        .to_string()
}

struct Harness {
    orchestrator: SpecOrchestrator,
    store: StoreHandle,
    target: String,
    dir: TempDir,
}

fn harness(agent_script: &str, qa_cmd: &str) -> Harness {
    let dir = TempDir::new().unwrap();
    init_repo(dir.path());
    let project_dir = dir.path().canonicalize().unwrap();
    let config = Config {
        data_dir: project_dir.join(".autobuild"),
        db_path: project_dir.join(".autobuild/registry.db"),
        worktrees_dir: project_dir.join(".autobuild/worktrees"),
        agent_cmd: "true".to_string(),
        qa_cmd: qa_cmd.to_string(),
        cancel_grace: Duration::from_secs(2),
        verbose: false,
        project_dir,
    };
    let store = StoreHandle::new(Store::open_in_memory().unwrap());
    let launcher = Arc::new(ShellLauncher {
        script: agent_script.to_string(),
    });
    let target = default_branch(dir.path());
    Harness {
        orchestrator: SpecOrchestrator::new(&config, store.clone(), launcher),
        store,
        target,
        dir,
    }
}

async fn wait_for_status(h: &Harness, spec_id: &str, status: SpecStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let spec = h.orchestrator.spec_status(spec_id).await.unwrap().spec;
        if spec.status == status {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("spec {} stuck at {}, wanted {}", spec_id, spec.status, status);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_full_lifecycle_to_merge() {
    let h = harness("echo 'fn login() {}' > login.rs", "exit 0");

    h.orchestrator.run_build(SPEC, "Add login").await.unwrap();
    wait_for_status(&h, SPEC, SpecStatus::AwaitingQa).await;

    let report = h.orchestrator.run_qa(SPEC).await.unwrap();
    assert_eq!(report.verdict, QaVerdict::Pass);
    wait_for_status(&h, SPEC, SpecStatus::QaPassed).await;

    h.orchestrator.request_review(SPEC).await.unwrap();

    let review = h.orchestrator.review_spec(SPEC).await.unwrap();
    assert!(review.summary.files_added.iter().any(|p| p == "login.rs"));
    assert!(review.diff.contains("fn login"));

    h.orchestrator
        .record_review(SPEC, ReviewVerdict::Approved, Some("looks good"))
        .await
        .unwrap();

    let preview = h
        .orchestrator
        .merge_preview(SPEC, &h.target)
        .await
        .unwrap();
    assert!(preview.mergeable);
    assert!(preview.changed_paths.contains(&"login.rs".to_string()));

    let result = h
        .orchestrator
        .merge_worktree(SPEC, &h.target, MergeStrategy::AbortOnConflict)
        .await
        .unwrap();
    assert_eq!(result.target_branch, h.target);

    let spec = h.orchestrator.spec_status(SPEC).await.unwrap().spec;
    assert_eq!(spec.status, SpecStatus::Merged);
    assert!(h.orchestrator.list_worktrees().await.unwrap().is_empty());
    assert!(h.dir.path().join("login.rs").exists());

    // History survives the merge
    assert!(h.orchestrator.qa_status(SPEC).await.unwrap().is_some());
    let decision = h.orchestrator.review_status(SPEC).await.unwrap().unwrap();
    assert_eq!(decision.verdict, ReviewVerdict::Approved);
}

#[tokio::test]
async fn test_failed_build_returns_to_draft() {
    let h = harness("echo 'generation blew up' >&2; exit 1", "exit 0");

    h.orchestrator.run_build(SPEC, "Add login").await.unwrap();
    wait_for_status(&h, SPEC, SpecStatus::Draft).await;

    let overview = h.orchestrator.spec_status(SPEC).await.unwrap();
    let build = overview.last_build.unwrap();
    assert_eq!(build.outcome, Some(BuildOutcome::Failed));
    assert!(build.error.unwrap().contains("generation blew up"));

    // Worktree survives for a retry on the same branch
    let wt = overview.worktree.unwrap();
    assert!(wt.live);
    h.orchestrator.run_build(SPEC, "Add login").await.unwrap();
    wait_for_status(&h, SPEC, SpecStatus::Draft).await;
}

#[tokio::test]
async fn test_concurrent_build_requests_conflict() {
    let h = harness("sleep 30", "exit 0");

    // Two requests race; exactly one build starts and the loser gets the
    // already-running conflict, whichever order the per-spec lock picks.
    let (first, second) = tokio::join!(
        h.orchestrator.run_build(SPEC, "Add login"),
        h.orchestrator.run_build(SPEC, "Add login"),
    );
    let (winner, loser) = match (first, second) {
        (Ok(build), Err(e)) | (Err(e), Ok(build)) => (build, e),
        other => panic!("Expected one winner and one conflict, got {:?}", other),
    };
    assert!(winner.is_running());
    match loser {
        OrchestratorError::BuildAlreadyRunning { spec_id } => assert_eq!(spec_id, SPEC),
        other => panic!("Expected BuildAlreadyRunning, got {:?}", other),
    }

    h.orchestrator.discard_worktree(SPEC).await.unwrap();
    let spec = h.orchestrator.spec_status(SPEC).await.unwrap().spec;
    assert_eq!(spec.status, SpecStatus::Discarded);
}

#[tokio::test]
async fn test_merge_conflict_leaves_state_unchanged() {
    let h = harness("echo 'worktree version' > README.md", "exit 0");

    h.orchestrator.run_build(SPEC, "Rewrite readme").await.unwrap();
    wait_for_status(&h, SPEC, SpecStatus::AwaitingQa).await;

    // Diverge the target branch on the same file
    fs::write(h.dir.path().join("README.md"), "main version\n").unwrap();
    commit_all(h.dir.path(), "main edit");

    h.orchestrator.run_qa(SPEC).await.unwrap();
    h.orchestrator.request_review(SPEC).await.unwrap();
    h.orchestrator
        .record_review(SPEC, ReviewVerdict::Approved, None)
        .await
        .unwrap();

    let preview = h
        .orchestrator
        .merge_preview(SPEC, &h.target)
        .await
        .unwrap();
    assert!(!preview.mergeable);
    assert_eq!(preview.conflicting_paths, vec!["README.md".to_string()]);

    let err = h
        .orchestrator
        .merge_worktree(SPEC, &h.target, MergeStrategy::AbortOnConflict)
        .await
        .unwrap_err();
    match err {
        OrchestratorError::MergeConflicts { paths } => {
            assert_eq!(paths, vec!["README.md".to_string()]);
        }
        other => panic!("Expected MergeConflicts, got {:?}", other),
    }

    // Nothing moved: still approved, worktree still live, preview repeats
    let overview = h.orchestrator.spec_status(SPEC).await.unwrap();
    assert_eq!(overview.spec.status, SpecStatus::Approved);
    assert!(overview.worktree.unwrap().live);
    let again = h
        .orchestrator
        .merge_preview(SPEC, &h.target)
        .await
        .unwrap();
    assert_eq!(again, preview);
}

#[tokio::test]
async fn test_merge_requires_approval() {
    let h = harness("echo x > new.rs", "exit 0");

    h.orchestrator.run_build(SPEC, "Add file").await.unwrap();
    wait_for_status(&h, SPEC, SpecStatus::AwaitingQa).await;
    h.orchestrator.run_qa(SPEC).await.unwrap();

    let err = h
        .orchestrator
        .merge_worktree(SPEC, &h.target, MergeStrategy::AbortOnConflict)
        .await
        .unwrap_err();
    match err {
        OrchestratorError::PreconditionFailed { operation, status } => {
            assert_eq!(operation, "merge");
            assert_eq!(status, SpecStatus::QaPassed);
        }
        other => panic!("Expected PreconditionFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_qa_fail_then_followup_recovers() {
    // Each agent run appends a line; QA requires at least two runs.
    let h = harness(
        "echo run >> attempts.txt",
        "test \"$(wc -l < attempts.txt)\" -ge 2",
    );

    h.orchestrator.run_build(SPEC, "Add login").await.unwrap();
    wait_for_status(&h, SPEC, SpecStatus::AwaitingQa).await;

    let report = h.orchestrator.run_qa(SPEC).await.unwrap();
    assert_eq!(report.verdict, QaVerdict::Fail);
    assert!(!report.findings.is_empty());
    wait_for_status(&h, SPEC, SpecStatus::QaFailed).await;

    h.orchestrator
        .run_followup(SPEC, "address the QA findings")
        .await
        .unwrap();
    wait_for_status(&h, SPEC, SpecStatus::AwaitingQa).await;

    let overview = h.orchestrator.spec_status(SPEC).await.unwrap();
    assert_eq!(
        overview.last_build.unwrap().instructions.as_deref(),
        Some("address the QA findings")
    );

    let report = h.orchestrator.run_qa(SPEC).await.unwrap();
    assert_eq!(report.verdict, QaVerdict::Pass);
    wait_for_status(&h, SPEC, SpecStatus::QaPassed).await;
}

#[tokio::test]
async fn test_qa_verdict_stands_until_next_build() {
    let h = harness("echo x > new.rs", "exit 1");

    h.orchestrator.run_build(SPEC, "Add file").await.unwrap();
    wait_for_status(&h, SPEC, SpecStatus::AwaitingQa).await;
    let report = h.orchestrator.run_qa(SPEC).await.unwrap();
    assert_eq!(report.verdict, QaVerdict::Fail);

    // No re-running QA against the same output; a followup build is the
    // only way back to the gate.
    let err = h.orchestrator.run_qa(SPEC).await.unwrap_err();
    match err {
        OrchestratorError::PreconditionFailed { operation, status } => {
            assert_eq!(operation, "qa");
            assert_eq!(status, SpecStatus::QaFailed);
        }
        other => panic!("Expected PreconditionFailed, got {:?}", other),
    }

    h.orchestrator.run_followup(SPEC, "fix it").await.unwrap();
    wait_for_status(&h, SPEC, SpecStatus::AwaitingQa).await;
}

#[tokio::test]
async fn test_followup_requires_existing_worktree() {
    let h = harness("exit 0", "exit 0");
    h.orchestrator
        .register_spec(SPEC, "Add login")
        .await
        .unwrap();
    let err = h
        .orchestrator
        .run_followup(SPEC, "do more")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::WorktreeMissing { .. }));
}

#[tokio::test]
async fn test_qa_tooling_error_keeps_status() {
    let h = harness("echo x > new.rs", "/nonexistent-qa-tool-xyz");

    h.orchestrator.run_build(SPEC, "Add file").await.unwrap();
    wait_for_status(&h, SPEC, SpecStatus::AwaitingQa).await;

    let report = h.orchestrator.run_qa(SPEC).await.unwrap();
    assert_eq!(report.verdict, QaVerdict::Errored);
    let spec = h.orchestrator.spec_status(SPEC).await.unwrap().spec;
    assert_eq!(spec.status, SpecStatus::AwaitingQa);
}

#[tokio::test]
async fn test_cancel_running_and_completed_builds() {
    let h = harness("sleep 30", "exit 0");

    h.orchestrator.run_build(SPEC, "Slow build").await.unwrap();
    let cancelled = h.orchestrator.cancel_build(SPEC).await.unwrap();
    assert_eq!(cancelled.outcome, Some(BuildOutcome::Cancelled));
    wait_for_status(&h, SPEC, SpecStatus::Draft).await;

    // Cancelling again is a no-op on the terminal record
    let again = h.orchestrator.cancel_build(SPEC).await.unwrap();
    assert_eq!(again.id, cancelled.id);
    assert_eq!(again.outcome, Some(BuildOutcome::Cancelled));
    assert_eq!(again.finished_at, cancelled.finished_at);
}

#[tokio::test]
async fn test_discard_is_terminal() {
    let h = harness("echo x > new.rs", "exit 0");

    h.orchestrator.run_build(SPEC, "Add file").await.unwrap();
    wait_for_status(&h, SPEC, SpecStatus::AwaitingQa).await;

    let wt_path = h
        .orchestrator
        .spec_status(SPEC)
        .await
        .unwrap()
        .worktree
        .unwrap()
        .path;
    h.orchestrator.discard_worktree(SPEC).await.unwrap();
    assert!(!Path::new(&wt_path).exists());

    // Terminal: no further operations
    let err = h.orchestrator.run_build(SPEC, "Add file").await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::PreconditionFailed {
            status: SpecStatus::Discarded,
            ..
        }
    ));
    let err = h.orchestrator.discard_worktree(SPEC).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::PreconditionFailed { .. }));
}

#[tokio::test]
async fn test_discard_while_building_cancels_first() {
    let h = harness("sleep 30", "exit 0");

    h.orchestrator.run_build(SPEC, "Slow build").await.unwrap();
    h.orchestrator.discard_worktree(SPEC).await.unwrap();

    let overview = h.orchestrator.spec_status(SPEC).await.unwrap();
    assert_eq!(overview.spec.status, SpecStatus::Discarded);
    assert_eq!(
        overview.last_build.unwrap().outcome,
        Some(BuildOutcome::Cancelled)
    );
    assert!(overview.worktree.is_none());
}

#[tokio::test]
async fn test_restart_recovery_orphans_builds() {
    let h = harness("exit 0", "exit 0");

    // Simulate a pre-restart world: spec mid-build, process long gone
    {
        let s = h.store.lock_sync().unwrap();
        s.create_spec(SPEC, "Add login").unwrap();
        s.set_spec_status(SPEC, SpecStatus::Building).unwrap();
        s.create_build(SPEC, None, Some(999_999_999)).unwrap();
    }

    let report = h.orchestrator.recover().unwrap();
    assert_eq!(report.orphaned_builds, 1);
    assert_eq!(report.reset_specs, 1);

    let overview = h.orchestrator.spec_status(SPEC).await.unwrap();
    assert_eq!(overview.spec.status, SpecStatus::Draft);
    let build = overview.last_build.unwrap();
    assert_eq!(build.outcome, Some(BuildOutcome::Failed));
    assert!(build.error.unwrap().contains("orphaned by restart"));

    // Recovery is idempotent
    let report = h.orchestrator.recover().unwrap();
    assert_eq!(report.orphaned_builds, 0);
    assert_eq!(report.reset_specs, 0);
}

#[tokio::test]
async fn test_rejected_spec_can_rebuild() {
    let h = harness("echo x > new.rs", "exit 0");

    h.orchestrator.run_build(SPEC, "Add file").await.unwrap();
    wait_for_status(&h, SPEC, SpecStatus::AwaitingQa).await;
    h.orchestrator.run_qa(SPEC).await.unwrap();
    h.orchestrator.request_review(SPEC).await.unwrap();
    h.orchestrator
        .record_review(SPEC, ReviewVerdict::Rejected, Some("wrong approach"))
        .await
        .unwrap();
    wait_for_status(&h, SPEC, SpecStatus::Rejected).await;

    h.orchestrator
        .run_followup(SPEC, "use the other approach")
        .await
        .unwrap();
    wait_for_status(&h, SPEC, SpecStatus::AwaitingQa).await;
}

#[tokio::test]
async fn test_batch_status_covers_all_specs() {
    let h = harness("echo x > new.rs", "exit 0");

    h.orchestrator.register_spec("001-a", "A").await.unwrap();
    h.orchestrator.run_build("002-b", "B").await.unwrap();
    wait_for_status(&h, "002-b", SpecStatus::AwaitingQa).await;

    let overviews = h.orchestrator.batch_status().await.unwrap();
    assert_eq!(overviews.len(), 2);

    let a = overviews.iter().find(|o| o.spec.id == "001-a").unwrap();
    assert!(a.worktree.is_none());
    assert!(a.last_build.is_none());

    let b = overviews.iter().find(|o| o.spec.id == "002-b").unwrap();
    assert!(b.worktree.is_some());
    assert_eq!(
        b.last_build.as_ref().unwrap().outcome,
        Some(BuildOutcome::Succeeded)
    );
}

#[tokio::test]
async fn test_unknown_spec_is_not_found() {
    let h = harness("exit 0", "exit 0");
    let err = h.orchestrator.spec_status("999-ghost").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::SpecNotFound { .. }));
    let err = h.orchestrator.cancel_build("999-ghost").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::SpecNotFound { .. }));
}
