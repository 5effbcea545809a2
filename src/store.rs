use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::*;

/// Async-safe handle to the registry database.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, so synchronous SQLite I/O never ties up
/// async worker threads. The single mutex also makes every read-modify-write
/// of a spec's state atomic with respect to other components.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Store task panicked")?
    }

    /// Acquire the store mutex synchronously. For startup recovery and tests;
    /// must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))
    }
}

/// Durable record of specs, worktrees, builds, QA reports and review
/// decisions. Only the orchestrator writes lifecycle transitions.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the registry database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open registry database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory registry (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory registry database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS specs (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'draft',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS worktrees (
                    spec_id TEXT PRIMARY KEY REFERENCES specs(id),
                    path TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    base_revision TEXT NOT NULL,
                    live INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS builds (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    spec_id TEXT NOT NULL REFERENCES specs(id),
                    instructions TEXT,
                    pid INTEGER,
                    started_at TEXT NOT NULL,
                    finished_at TEXT,
                    outcome TEXT,
                    forced INTEGER NOT NULL DEFAULT 0,
                    error TEXT
                );

                CREATE TABLE IF NOT EXISTS qa_reports (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    spec_id TEXT NOT NULL REFERENCES specs(id),
                    verdict TEXT NOT NULL,
                    findings TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS review_decisions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    spec_id TEXT NOT NULL REFERENCES specs(id),
                    verdict TEXT NOT NULL,
                    comment TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_builds_spec ON builds(spec_id);
                CREATE INDEX IF NOT EXISTS idx_qa_reports_spec ON qa_reports(spec_id);
                CREATE INDEX IF NOT EXISTS idx_reviews_spec ON review_decisions(spec_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Specs ───────────────────────────────────────────────────────────

    pub fn create_spec(&self, id: &str, title: &str) -> Result<Spec> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO specs (id, title, status, created_at, updated_at)
                 VALUES (?1, ?2, 'draft', ?3, ?3)",
                params![id, title, now.to_rfc3339()],
            )
            .context("Failed to insert spec")?;
        self.get_spec(id)?
            .ok_or_else(|| anyhow::anyhow!("Spec {} missing after insert", id))
    }

    /// Register a spec if absent, otherwise return the existing record.
    pub fn get_or_create_spec(&self, id: &str, title: &str) -> Result<Spec> {
        if let Some(spec) = self.get_spec(id)? {
            return Ok(spec);
        }
        self.create_spec(id, title)
    }

    pub fn get_spec(&self, id: &str) -> Result<Option<Spec>> {
        self.conn
            .query_row(
                "SELECT id, title, status, created_at, updated_at FROM specs WHERE id = ?1",
                params![id],
                row_to_spec,
            )
            .optional()
            .context("Failed to query spec")
    }

    pub fn list_specs(&self) -> Result<Vec<Spec>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, status, created_at, updated_at FROM specs ORDER BY id",
        )?;
        let specs = stmt
            .query_map([], row_to_spec)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list specs")?;
        Ok(specs)
    }

    pub fn set_spec_status(&self, id: &str, status: SpecStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE specs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            anyhow::bail!("Spec {} not found", id);
        }
        Ok(())
    }

    // ── Worktrees ───────────────────────────────────────────────────────

    /// Record a freshly created worktree. Replaces a torn-down record for the
    /// same spec; the caller guarantees no live worktree exists.
    pub fn insert_worktree(&self, wt: &Worktree) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO worktrees (spec_id, path, branch, base_revision, live)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![wt.spec_id, wt.path, wt.branch, wt.base_revision, wt.live],
            )
            .context("Failed to insert worktree")?;
        Ok(())
    }

    pub fn get_worktree(&self, spec_id: &str) -> Result<Option<Worktree>> {
        self.conn
            .query_row(
                "SELECT spec_id, path, branch, base_revision, live
                 FROM worktrees WHERE spec_id = ?1",
                params![spec_id],
                row_to_worktree,
            )
            .optional()
            .context("Failed to query worktree")
    }

    pub fn mark_worktree_torn_down(&self, spec_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE worktrees SET live = 0 WHERE spec_id = ?1",
            params![spec_id],
        )?;
        Ok(())
    }

    pub fn list_worktrees(&self) -> Result<Vec<Worktree>> {
        let mut stmt = self.conn.prepare(
            "SELECT spec_id, path, branch, base_revision, live
             FROM worktrees ORDER BY spec_id",
        )?;
        let worktrees = stmt
            .query_map([], row_to_worktree)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list worktrees")?;
        Ok(worktrees)
    }

    // ── Builds ──────────────────────────────────────────────────────────

    pub fn create_build(
        &self,
        spec_id: &str,
        instructions: Option<&str>,
        pid: Option<u32>,
    ) -> Result<Build> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO builds (spec_id, instructions, pid, started_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![spec_id, instructions, pid, now.to_rfc3339()],
            )
            .context("Failed to insert build")?;
        let id = self.conn.last_insert_rowid();
        self.get_build(id)?
            .ok_or_else(|| anyhow::anyhow!("Build {} missing after insert", id))
    }

    pub fn get_build(&self, id: i64) -> Result<Option<Build>> {
        self.conn
            .query_row(
                "SELECT id, spec_id, instructions, pid, started_at, finished_at,
                        outcome, forced, error
                 FROM builds WHERE id = ?1",
                params![id],
                row_to_build,
            )
            .optional()
            .context("Failed to query build")
    }

    pub fn running_build(&self, spec_id: &str) -> Result<Option<Build>> {
        self.conn
            .query_row(
                "SELECT id, spec_id, instructions, pid, started_at, finished_at,
                        outcome, forced, error
                 FROM builds WHERE spec_id = ?1 AND outcome IS NULL
                 ORDER BY id DESC LIMIT 1",
                params![spec_id],
                row_to_build,
            )
            .optional()
            .context("Failed to query running build")
    }

    pub fn latest_build(&self, spec_id: &str) -> Result<Option<Build>> {
        self.conn
            .query_row(
                "SELECT id, spec_id, instructions, pid, started_at, finished_at,
                        outcome, forced, error
                 FROM builds WHERE spec_id = ?1 ORDER BY id DESC LIMIT 1",
                params![spec_id],
                row_to_build,
            )
            .optional()
            .context("Failed to query latest build")
    }

    /// Record a build's terminal outcome. Only the first terminal write wins:
    /// returns `true` if this call closed the build, `false` if it was
    /// already closed (e.g. cancel racing natural completion).
    pub fn finish_build(
        &self,
        id: i64,
        outcome: BuildOutcome,
        forced: bool,
        error: Option<&str>,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE builds SET outcome = ?2, finished_at = ?3, forced = ?4, error = ?5
             WHERE id = ?1 AND outcome IS NULL",
            params![id, outcome.as_str(), Utc::now().to_rfc3339(), forced, error],
        )?;
        Ok(changed == 1)
    }

    /// Builds still marked running from a previous process. Used by restart
    /// reconciliation.
    pub fn running_builds(&self) -> Result<Vec<Build>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, spec_id, instructions, pid, started_at, finished_at,
                    outcome, forced, error
             FROM builds WHERE outcome IS NULL ORDER BY id",
        )?;
        let builds = stmt
            .query_map([], row_to_build)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list running builds")?;
        Ok(builds)
    }

    // ── QA reports ──────────────────────────────────────────────────────

    pub fn create_qa_report(
        &self,
        spec_id: &str,
        verdict: QaVerdict,
        findings: &[Finding],
    ) -> Result<QaReport> {
        let now = Utc::now();
        let findings_json =
            serde_json::to_string(findings).context("Failed to serialize findings")?;
        self.conn
            .execute(
                "INSERT INTO qa_reports (spec_id, verdict, findings, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![spec_id, verdict.as_str(), findings_json, now.to_rfc3339()],
            )
            .context("Failed to insert QA report")?;
        let id = self.conn.last_insert_rowid();
        Ok(QaReport {
            id,
            spec_id: spec_id.to_string(),
            verdict,
            findings: findings.to_vec(),
            created_at: now,
        })
    }

    pub fn latest_qa_report(&self, spec_id: &str) -> Result<Option<QaReport>> {
        self.conn
            .query_row(
                "SELECT id, spec_id, verdict, findings, created_at
                 FROM qa_reports WHERE spec_id = ?1 ORDER BY id DESC LIMIT 1",
                params![spec_id],
                row_to_qa_report,
            )
            .optional()
            .context("Failed to query latest QA report")
    }

    // ── Review decisions ────────────────────────────────────────────────

    pub fn create_review_decision(
        &self,
        spec_id: &str,
        verdict: ReviewVerdict,
        comment: Option<&str>,
    ) -> Result<ReviewDecision> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO review_decisions (spec_id, verdict, comment, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![spec_id, verdict.as_str(), comment, now.to_rfc3339()],
            )
            .context("Failed to insert review decision")?;
        let id = self.conn.last_insert_rowid();
        Ok(ReviewDecision {
            id,
            spec_id: spec_id.to_string(),
            verdict,
            comment: comment.map(|c| c.to_string()),
            created_at: now,
        })
    }

    pub fn latest_review_decision(&self, spec_id: &str) -> Result<Option<ReviewDecision>> {
        self.conn
            .query_row(
                "SELECT id, spec_id, verdict, comment, created_at
                 FROM review_decisions WHERE spec_id = ?1 ORDER BY id DESC LIMIT 1",
                params![spec_id],
                row_to_review_decision,
            )
            .optional()
            .context("Failed to query latest review decision")
    }
}

// ── Row mapping ─────────────────────────────────────────────────────────

fn parse_timestamp(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_enum<T: FromStr>(s: &str) -> rusqlite::Result<T> {
    s.parse::<T>().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("invalid enum value: {}", s).into(),
        )
    })
}

fn row_to_spec(row: &rusqlite::Row<'_>) -> rusqlite::Result<Spec> {
    Ok(Spec {
        id: row.get(0)?,
        title: row.get(1)?,
        status: parse_enum(&row.get::<_, String>(2)?)?,
        created_at: parse_timestamp(&row.get::<_, String>(3)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(4)?)?,
    })
}

fn row_to_worktree(row: &rusqlite::Row<'_>) -> rusqlite::Result<Worktree> {
    Ok(Worktree {
        spec_id: row.get(0)?,
        path: row.get(1)?,
        branch: row.get(2)?,
        base_revision: row.get(3)?,
        live: row.get(4)?,
    })
}

fn row_to_build(row: &rusqlite::Row<'_>) -> rusqlite::Result<Build> {
    let outcome: Option<String> = row.get(6)?;
    Ok(Build {
        id: row.get(0)?,
        spec_id: row.get(1)?,
        instructions: row.get(2)?,
        pid: row.get(3)?,
        started_at: parse_timestamp(&row.get::<_, String>(4)?)?,
        finished_at: row
            .get::<_, Option<String>>(5)?
            .map(|s| parse_timestamp(&s))
            .transpose()?,
        outcome: outcome.map(|s| parse_enum(&s)).transpose()?,
        forced: row.get(7)?,
        error: row.get(8)?,
    })
}

fn row_to_qa_report(row: &rusqlite::Row<'_>) -> rusqlite::Result<QaReport> {
    let findings_json: String = row.get(3)?;
    let findings = serde_json::from_str(&findings_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(QaReport {
        id: row.get(0)?,
        spec_id: row.get(1)?,
        verdict: parse_enum(&row.get::<_, String>(2)?)?,
        findings,
        created_at: parse_timestamp(&row.get::<_, String>(4)?)?,
    })
}

fn row_to_review_decision(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewDecision> {
    Ok(ReviewDecision {
        id: row.get(0)?,
        spec_id: row.get(1)?,
        verdict: parse_enum(&row.get::<_, String>(2)?)?,
        comment: row.get(3)?,
        created_at: parse_timestamp(&row.get::<_, String>(4)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_and_get_spec() {
        let s = store();
        let spec = s.create_spec("001-add-login", "Add login").unwrap();
        assert_eq!(spec.status, SpecStatus::Draft);
        assert_eq!(s.get_spec("001-add-login").unwrap().unwrap().title, "Add login");
        assert!(s.get_spec("999-missing").unwrap().is_none());
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let s = store();
        s.create_spec("001-a", "A").unwrap();
        let again = s.get_or_create_spec("001-a", "different title").unwrap();
        assert_eq!(again.title, "A");
        assert_eq!(s.list_specs().unwrap().len(), 1);
    }

    #[test]
    fn test_set_spec_status_updates_timestamp() {
        let s = store();
        let spec = s.create_spec("001-a", "A").unwrap();
        s.set_spec_status("001-a", SpecStatus::Building).unwrap();
        let updated = s.get_spec("001-a").unwrap().unwrap();
        assert_eq!(updated.status, SpecStatus::Building);
        assert!(updated.updated_at >= spec.updated_at);
        assert!(s.set_spec_status("999-missing", SpecStatus::Draft).is_err());
    }

    #[test]
    fn test_worktree_lifecycle() {
        let s = store();
        s.create_spec("001-a", "A").unwrap();
        let wt = Worktree {
            spec_id: "001-a".into(),
            path: "/tmp/wt".into(),
            branch: "autobuild/001-a".into(),
            base_revision: "abc123".into(),
            live: true,
        };
        s.insert_worktree(&wt).unwrap();
        assert!(s.get_worktree("001-a").unwrap().unwrap().live);

        s.mark_worktree_torn_down("001-a").unwrap();
        assert!(!s.get_worktree("001-a").unwrap().unwrap().live);

        // Re-creation after teardown replaces the record
        s.insert_worktree(&wt).unwrap();
        assert!(s.get_worktree("001-a").unwrap().unwrap().live);
        assert_eq!(s.list_worktrees().unwrap().len(), 1);
    }

    #[test]
    fn test_build_terminal_write_is_first_wins() {
        let s = store();
        s.create_spec("001-a", "A").unwrap();
        let build = s.create_build("001-a", None, Some(42)).unwrap();
        assert!(build.is_running());
        assert_eq!(s.running_build("001-a").unwrap().unwrap().id, build.id);

        // Natural completion wins the race
        assert!(s.finish_build(build.id, BuildOutcome::Succeeded, false, None).unwrap());
        // Later cancel is a no-op on the record
        assert!(!s.finish_build(build.id, BuildOutcome::Cancelled, true, None).unwrap());

        let closed = s.get_build(build.id).unwrap().unwrap();
        assert_eq!(closed.outcome, Some(BuildOutcome::Succeeded));
        assert!(!closed.forced);
        assert!(closed.finished_at.is_some());
        assert!(s.running_build("001-a").unwrap().is_none());
    }

    #[test]
    fn test_latest_build_ordering() {
        let s = store();
        s.create_spec("001-a", "A").unwrap();
        let first = s.create_build("001-a", None, None).unwrap();
        s.finish_build(first.id, BuildOutcome::Failed, false, Some("boom")).unwrap();
        let second = s.create_build("001-a", Some("fix the tests"), None).unwrap();
        let latest = s.latest_build("001-a").unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.instructions.as_deref(), Some("fix the tests"));
    }

    #[test]
    fn test_qa_reports_append_only_latest_wins() {
        let s = store();
        s.create_spec("001-a", "A").unwrap();
        let findings = vec![Finding::new(FindingSeverity::Error, "test failed").with_file("a.rs")];
        s.create_qa_report("001-a", QaVerdict::Fail, &findings).unwrap();
        s.create_qa_report("001-a", QaVerdict::Pass, &[]).unwrap();

        let latest = s.latest_qa_report("001-a").unwrap().unwrap();
        assert_eq!(latest.verdict, QaVerdict::Pass);
        assert!(latest.findings.is_empty());
    }

    #[test]
    fn test_review_decisions_append_only() {
        let s = store();
        s.create_spec("001-a", "A").unwrap();
        s.create_review_decision("001-a", ReviewVerdict::Rejected, Some("needs work"))
            .unwrap();
        s.create_review_decision("001-a", ReviewVerdict::Approved, None)
            .unwrap();
        let latest = s.latest_review_decision("001-a").unwrap().unwrap();
        assert_eq!(latest.verdict, ReviewVerdict::Approved);
        assert!(s.latest_review_decision("002-b").unwrap().is_none());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        {
            let s = Store::open(&path).unwrap();
            s.create_spec("001-a", "A").unwrap();
            s.set_spec_status("001-a", SpecStatus::Building).unwrap();
            s.create_build("001-a", None, Some(777)).unwrap();
        }
        {
            let s = Store::open(&path).unwrap();
            assert_eq!(
                s.get_spec("001-a").unwrap().unwrap().status,
                SpecStatus::Building
            );
            let running = s.running_builds().unwrap();
            assert_eq!(running.len(), 1);
            assert_eq!(running[0].pid, Some(777));
        }
    }
}
