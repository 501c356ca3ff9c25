use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use sentinel_common::{
    Confidence, DetectedError, DiscoveryInfo, Job, JobStatus, Repository, ServerInfo,
    SuggestedFix, TestResult, TestStatus, User,
};

/// Async-safe handle to the job store.
///
/// Wraps `SentinelDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SentinelDb>>,
}

impl DbHandle {
    pub fn new(db: SentinelDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SentinelDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for start-up and tests;
    /// never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, SentinelDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Result of a guarded status write.
#[derive(Debug, Clone)]
pub enum Transition {
    /// The row moved to the requested status.
    Applied(Job),
    /// The row was already in the requested status; nothing was written.
    Unchanged(Job),
    /// The move is illegal from the row's current status.
    Rejected(Job),
}

impl Transition {
    pub fn job(&self) -> &Job {
        match self {
            Self::Applied(job) | Self::Unchanged(job) | Self::Rejected(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Self::Applied(job) | Self::Unchanged(job) | Self::Rejected(job) => job,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Filter for `list_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub user_id: Option<i64>,
    pub status: Option<JobStatus>,
    pub limit: Option<u32>,
}

/// A durably recorded step output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepRecord {
    pub name: String,
    pub output: String,
    pub completed_at: String,
}

pub const CANCELED_SUMMARY: &str = "Canceled by user.";

const JOB_COLUMNS: &str = "id, user_id, repository_id, status, bug_description, summary, error, \
     sandbox_id, discovery_info, server_info, created_at, started_at, completed_at";

const ACTIVE_GUARD: &str = "status NOT IN ('COMPLETED', 'FAILED')";

pub struct SentinelDb {
    conn: Connection,
}

impl SentinelDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    external_id TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS repositories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    repo_owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    repo_url TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(user_id, repo_owner, repo_name)
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    repository_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    bug_description TEXT NOT NULL,
                    summary TEXT,
                    error TEXT,
                    sandbox_id TEXT,
                    discovery_info TEXT,
                    server_info TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS tests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    test_file TEXT NOT NULL,
                    test_name TEXT NOT NULL,
                    file_content TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL,
                    exit_code INTEGER,
                    output TEXT,
                    executed_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS bugs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    test_file TEXT NOT NULL,
                    test_name TEXT,
                    message TEXT NOT NULL,
                    source_file TEXT,
                    root_cause TEXT,
                    confidence TEXT NOT NULL DEFAULT 'MEDIUM',
                    suggested_fixes TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS job_steps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    output TEXT NOT NULL,
                    completed_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(job_id, name)
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs(user_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_tests_job ON tests(job_id);
                CREATE INDEX IF NOT EXISTS idx_bugs_job ON bugs(job_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users & repositories ──────────────────────────────────────────

    /// Insert the user if unseen; concurrent callers converge on one row.
    pub fn upsert_user(&self, external_id: &str) -> Result<User> {
        self.conn
            .execute(
                "INSERT INTO users (external_id) VALUES (?1) ON CONFLICT(external_id) DO NOTHING",
                params![external_id],
            )
            .context("Failed to upsert user")?;
        self.conn
            .query_row(
                "SELECT id, external_id, created_at FROM users WHERE external_id = ?1",
                params![external_id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        external_id: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .context("Failed to read user after upsert")
    }

    pub fn find_user(&self, external_id: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, external_id, created_at FROM users WHERE external_id = ?1",
                params![external_id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        external_id: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to query user")
    }

    /// Upsert keyed by (user, owner, name); the URL is refreshed on conflict.
    pub fn upsert_repository(
        &self,
        user_id: i64,
        repo_owner: &str,
        repo_name: &str,
        repo_url: &str,
    ) -> Result<Repository> {
        self.conn
            .execute(
                "INSERT INTO repositories (user_id, repo_owner, repo_name, repo_url)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, repo_owner, repo_name)
                 DO UPDATE SET repo_url = excluded.repo_url, updated_at = datetime('now')",
                params![user_id, repo_owner, repo_name, repo_url],
            )
            .context("Failed to upsert repository")?;
        self.conn
            .query_row(
                "SELECT id, user_id, repo_owner, repo_name, repo_url, created_at
                 FROM repositories WHERE user_id = ?1 AND repo_owner = ?2 AND repo_name = ?3",
                params![user_id, repo_owner, repo_name],
                read_repository,
            )
            .context("Failed to read repository after upsert")
    }

    pub fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        self.conn
            .query_row(
                "SELECT id, user_id, repo_owner, repo_name, repo_url, created_at
                 FROM repositories WHERE id = ?1",
                params![id],
                read_repository,
            )
            .optional()
            .context("Failed to query repository")
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn create_job(&self, user_id: i64, repository_id: i64, bug_description: &str) -> Result<Job> {
        self.conn
            .execute(
                "INSERT INTO jobs (user_id, repository_id, bug_description) VALUES (?1, ?2, ?3)",
                params![user_id, repository_id, bug_description],
            )
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], read_job_row)
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    fn require_job(&self, id: i64) -> Result<Job> {
        self.get_job(id)?
            .with_context(|| format!("Job {} not found", id))
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs
             WHERE (?1 IS NULL OR user_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY id DESC LIMIT ?3",
            JOB_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map(
                params![
                    filter.user_id,
                    filter.status.map(|s| s.as_str()),
                    filter.limit.unwrap_or(20)
                ],
                read_job_row,
            )
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    /// Every job a crashed process may have left mid-flight.
    pub fn list_active_jobs(&self) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE {} ORDER BY id ASC",
            JOB_COLUMNS, ACTIVE_GUARD
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_active_jobs")?;
        let rows = stmt
            .query_map([], read_job_row)
            .context("Failed to query active jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    /// Move a job forward along the happy path. The write only applies from
    /// the single legal predecessor, so replays and out-of-order writes are
    /// harmless. `started_at` and `completed_at` are write-once.
    pub fn transition_job(&self, id: i64, to: JobStatus) -> Result<Transition> {
        let Some(from) = to.predecessor() else {
            anyhow::bail!("{} is not a forward transition target", to);
        };
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET
                    status = ?2,
                    started_at = CASE WHEN ?2 = 'ANALYZING'
                        THEN COALESCE(started_at, datetime('now')) ELSE started_at END,
                    completed_at = CASE WHEN ?2 = 'COMPLETED'
                        THEN COALESCE(completed_at, datetime('now')) ELSE completed_at END
                 WHERE id = ?1 AND status = ?3",
                params![id, to.as_str(), from.as_str()],
            )
            .context("Failed to update job status")?;
        let job = self.require_job(id)?;
        Ok(classify(changed, job, to))
    }

    /// Force an active job to FAILED. The reason goes to `error`; a summary
    /// already written is never replaced.
    pub fn fail_job(&self, id: i64, error: &str) -> Result<Transition> {
        let sql = format!(
            "UPDATE jobs SET
                status = 'FAILED',
                error = COALESCE(error, ?2),
                completed_at = COALESCE(completed_at, datetime('now'))
             WHERE id = ?1 AND {}",
            ACTIVE_GUARD
        );
        let changed = self
            .conn
            .execute(&sql, params![id, error])
            .context("Failed to mark job failed")?;
        let job = self.require_job(id)?;
        Ok(classify(changed, job, JobStatus::Failed))
    }

    /// Cancel an active job. The cancellation marker is appended to any
    /// partial summary instead of replacing it.
    pub fn cancel_job(&self, id: i64) -> Result<Transition> {
        let sql = format!(
            "UPDATE jobs SET
                status = 'FAILED',
                summary = CASE WHEN summary IS NULL OR summary = '' THEN ?2
                    ELSE summary || char(10) || char(10) || ?2 END,
                error = COALESCE(error, 'canceled'),
                completed_at = COALESCE(completed_at, datetime('now'))
             WHERE id = ?1 AND {}",
            ACTIVE_GUARD
        );
        let changed = self
            .conn
            .execute(&sql, params![id, CANCELED_SUMMARY])
            .context("Failed to cancel job")?;
        let job = self.require_job(id)?;
        // A job that was already FAILED is reported as rejected, not unchanged:
        // the cancel itself did nothing.
        Ok(if changed > 0 {
            Transition::Applied(job)
        } else {
            Transition::Rejected(job)
        })
    }

    /// Persist the sandbox id if none is recorded yet. Returns the id that is
    /// persisted afterwards, which is the earlier one on a replay.
    pub fn set_sandbox_id_once(&self, id: i64, sandbox_id: &str) -> Result<String> {
        self.conn
            .execute(
                "UPDATE jobs SET sandbox_id = ?2 WHERE id = ?1 AND sandbox_id IS NULL",
                params![id, sandbox_id],
            )
            .context("Failed to set sandbox id")?;
        self.require_job(id)?
            .sandbox_id
            .context("Sandbox id missing after update")
    }

    /// Record the run summary. Only the first summary of an active job sticks.
    pub fn set_summary_once(&self, id: i64, summary: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE jobs SET summary = ?2 WHERE id = ?1 AND summary IS NULL AND {}",
            ACTIVE_GUARD
        );
        let changed = self
            .conn
            .execute(&sql, params![id, summary])
            .context("Failed to set summary")?;
        Ok(changed > 0)
    }

    pub fn update_discovery(&self, id: i64, info: &DiscoveryInfo) -> Result<bool> {
        let json = serde_json::to_string(info).context("Failed to serialize discovery info")?;
        let sql = format!(
            "UPDATE jobs SET discovery_info = ?2 WHERE id = ?1 AND {}",
            ACTIVE_GUARD
        );
        let changed = self
            .conn
            .execute(&sql, params![id, json])
            .context("Failed to update discovery info")?;
        Ok(changed > 0)
    }

    pub fn update_server_info(&self, id: i64, info: &ServerInfo) -> Result<bool> {
        let json = serde_json::to_string(info).context("Failed to serialize server info")?;
        let sql = format!(
            "UPDATE jobs SET server_info = ?2 WHERE id = ?1 AND {}",
            ACTIVE_GUARD
        );
        let changed = self
            .conn
            .execute(&sql, params![id, json])
            .context("Failed to update server info")?;
        Ok(changed > 0)
    }

    // ── Tests & bugs (append-only) ────────────────────────────────────

    pub fn insert_test(&self, job_id: i64, test: &TestResult) -> Result<i64> {
        let sql = format!(
            "INSERT INTO tests (job_id, test_file, test_name, file_content, status, exit_code, output, executed_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8
             WHERE EXISTS (SELECT 1 FROM jobs WHERE id = ?1 AND {})",
            ACTIVE_GUARD
        );
        let inserted = self
            .conn
            .execute(
                &sql,
                params![
                    job_id,
                    test.test_file,
                    test.test_name,
                    test.file_content,
                    test.status.as_str(),
                    test.exit_code,
                    test.output,
                    test.executed_at,
                ],
            )
            .context("Failed to insert test result")?;
        if inserted == 0 {
            anyhow::bail!("Job {} is not active; test result not recorded", job_id);
        }
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_tests(&self, job_id: i64) -> Result<Vec<TestResult>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT test_file, test_name, file_content, status, exit_code, output, executed_at
                 FROM tests WHERE job_id = ?1 ORDER BY id ASC",
            )
            .context("Failed to prepare list_tests")?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok(TestRow {
                    test_file: row.get(0)?,
                    test_name: row.get(1)?,
                    file_content: row.get(2)?,
                    status: row.get(3)?,
                    exit_code: row.get(4)?,
                    output: row.get(5)?,
                    executed_at: row.get(6)?,
                })
            })
            .context("Failed to query tests")?;
        let mut tests = Vec::new();
        for row in rows {
            tests.push(row.context("Failed to read test row")?.into_test()?);
        }
        Ok(tests)
    }

    pub fn insert_bug(&self, job_id: i64, bug: &DetectedError) -> Result<i64> {
        let fixes =
            serde_json::to_string(&bug.suggested_fixes).context("Failed to serialize fixes")?;
        let sql = format!(
            "INSERT INTO bugs (job_id, test_file, test_name, message, source_file, root_cause, confidence, suggested_fixes)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8
             WHERE EXISTS (SELECT 1 FROM jobs WHERE id = ?1 AND {})",
            ACTIVE_GUARD
        );
        let inserted = self
            .conn
            .execute(
                &sql,
                params![
                    job_id,
                    bug.test_file,
                    bug.test_name,
                    bug.message,
                    bug.source_file,
                    bug.root_cause,
                    bug.confidence.as_str(),
                    fixes,
                ],
            )
            .context("Failed to insert bug")?;
        if inserted == 0 {
            anyhow::bail!("Job {} is not active; bug not recorded", job_id);
        }
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_bugs(&self, job_id: i64) -> Result<Vec<DetectedError>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT test_file, test_name, message, source_file, root_cause, confidence, suggested_fixes
                 FROM bugs WHERE job_id = ?1 ORDER BY id ASC",
            )
            .context("Failed to prepare list_bugs")?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok(BugRow {
                    test_file: row.get(0)?,
                    test_name: row.get(1)?,
                    message: row.get(2)?,
                    source_file: row.get(3)?,
                    root_cause: row.get(4)?,
                    confidence: row.get(5)?,
                    suggested_fixes: row.get(6)?,
                })
            })
            .context("Failed to query bugs")?;
        let mut bugs = Vec::new();
        for row in rows {
            bugs.push(row.context("Failed to read bug row")?.into_bug()?);
        }
        Ok(bugs)
    }

    // ── Durable steps ─────────────────────────────────────────────────

    pub fn get_step_output(&self, job_id: i64, name: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT output FROM job_steps WHERE job_id = ?1 AND name = ?2",
                params![job_id, name],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query step output")
    }

    /// Record a step's output. The first recorded output wins; returns the
    /// output that is stored afterwards.
    pub fn record_step(&self, job_id: i64, name: &str, output: &str) -> Result<String> {
        self.conn
            .execute(
                "INSERT INTO job_steps (job_id, name, output) VALUES (?1, ?2, ?3)
                 ON CONFLICT(job_id, name) DO NOTHING",
                params![job_id, name, output],
            )
            .context("Failed to record step")?;
        self.get_step_output(job_id, name)?
            .context("Step output missing after insert")
    }

    pub fn list_steps(&self, job_id: i64) -> Result<Vec<StepRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, output, completed_at FROM job_steps WHERE job_id = ?1 ORDER BY id ASC",
            )
            .context("Failed to prepare list_steps")?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok(StepRecord {
                    name: row.get(0)?,
                    output: row.get(1)?,
                    completed_at: row.get(2)?,
                })
            })
            .context("Failed to query steps")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read step row")
    }
}

fn classify(changed: usize, job: Job, to: JobStatus) -> Transition {
    if changed > 0 {
        Transition::Applied(job)
    } else if job.status == to {
        Transition::Unchanged(job)
    } else {
        Transition::Rejected(job)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn read_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        user_id: row.get(1)?,
        repo_owner: row.get(2)?,
        repo_name: row.get(3)?,
        repo_url: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Intermediate row struct for jobs before parsing status and JSON columns.
struct JobRow {
    id: i64,
    user_id: i64,
    repository_id: i64,
    status: String,
    bug_description: String,
    summary: Option<String>,
    error: Option<String>,
    sandbox_id: Option<String>,
    discovery_info: Option<String>,
    server_info: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        repository_id: row.get(2)?,
        status: row.get(3)?,
        bug_description: row.get(4)?,
        summary: row.get(5)?,
        error: row.get(6)?,
        sandbox_id: row.get(7)?,
        discovery_info: row.get(8)?,
        server_info: row.get(9)?,
        created_at: row.get(10)?,
        started_at: row.get(11)?,
        completed_at: row.get(12)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        let discovery_info = self
            .discovery_info
            .as_deref()
            .map(serde_json::from_str::<DiscoveryInfo>)
            .transpose()
            .context("Failed to parse discovery_info JSON")?;
        let server_info = self
            .server_info
            .as_deref()
            .map(serde_json::from_str::<ServerInfo>)
            .transpose()
            .context("Failed to parse server_info JSON")?;
        Ok(Job {
            id: self.id,
            user_id: self.user_id,
            repository_id: self.repository_id,
            status,
            bug_description: self.bug_description,
            summary: self.summary,
            error: self.error,
            sandbox_id: self.sandbox_id,
            discovery_info,
            server_info,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

struct TestRow {
    test_file: String,
    test_name: String,
    file_content: String,
    status: String,
    exit_code: Option<i64>,
    output: Option<String>,
    executed_at: String,
}

impl TestRow {
    fn into_test(self) -> Result<TestResult> {
        let status = TestStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse test status")?;
        Ok(TestResult {
            test_file: self.test_file,
            test_name: self.test_name,
            file_content: self.file_content,
            status,
            exit_code: self.exit_code,
            output: self.output,
            executed_at: self.executed_at,
        })
    }
}

struct BugRow {
    test_file: String,
    test_name: Option<String>,
    message: String,
    source_file: Option<String>,
    root_cause: Option<String>,
    confidence: String,
    suggested_fixes: String,
}

impl BugRow {
    fn into_bug(self) -> Result<DetectedError> {
        let confidence = Confidence::from_str(&self.confidence)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse bug confidence")?;
        let suggested_fixes: Vec<SuggestedFix> = serde_json::from_str(&self.suggested_fixes)
            .context("Failed to parse suggested_fixes JSON")?;
        Ok(DetectedError {
            test_file: self.test_file,
            test_name: self.test_name,
            message: self.message,
            source_file: self.source_file,
            root_cause: self.root_cause,
            confidence,
            suggested_fixes,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_common::FixKind;

    fn seed_job(db: &SentinelDb) -> Result<Job> {
        let user = db.upsert_user("user_1")?;
        let repo = db.upsert_repository(user.id, "acme", "shop", "https://github.com/acme/shop")?;
        db.create_job(user.id, repo.id, "weak password accepted")
    }

    fn sample_test(status: TestStatus) -> TestResult {
        TestResult {
            test_file: "tests/auth.test.js".into(),
            test_name: "rejects weak password".into(),
            file_content: "it('rejects', () => {})".into(),
            status,
            exit_code: Some(1),
            output: Some("expected 400, got 201".into()),
            executed_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    fn sample_bug() -> DetectedError {
        DetectedError {
            test_file: "tests/auth.test.js".into(),
            test_name: Some("rejects weak password".into()),
            message: "Weak password accepted".into(),
            source_file: Some("src/routes/auth.js".into()),
            root_cause: Some("No length check".into()),
            confidence: Confidence::High,
            suggested_fixes: vec![SuggestedFix {
                kind: FixKind::Modify,
                file_path: "src/routes/auth.js".into(),
                existing_snippet: Some("const user = new User(body);".into()),
                updated_snippet: "validatePassword(body.password);\nconst user = new User(body);"
                    .into(),
            }],
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('users', 'repositories', 'jobs', 'tests', 'bugs', 'job_steps')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 6);
        Ok(())
    }

    #[test]
    fn test_migrations_are_rerunnable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sentinel.db");
        {
            let db = SentinelDb::new(&path)?;
            seed_job(&db)?;
        }
        let db = SentinelDb::new(&path)?;
        assert_eq!(db.list_jobs(&JobFilter::default())?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_upsert_repository_is_keyed_by_user_owner_name() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let user = db.upsert_user("user_1")?;
        let again = db.upsert_user("user_1")?;
        assert_eq!(user.id, again.id);

        let a = db.upsert_repository(user.id, "acme", "shop", "https://github.com/acme/shop")?;
        let b = db.upsert_repository(user.id, "acme", "shop", "https://github.com/acme/shop.git")?;
        assert_eq!(a.id, b.id);
        assert_eq!(b.repo_url, "https://github.com/acme/shop.git");

        let other = db.upsert_user("user_2")?;
        let c = db.upsert_repository(other.id, "acme", "shop", "https://github.com/acme/shop")?;
        assert_ne!(a.id, c.id);

        assert_eq!(db.find_user("user_2")?.map(|u| u.id), Some(other.id));
        assert!(db.find_user("user_3")?.is_none());
        Ok(())
    }

    #[test]
    fn test_create_job_starts_pending() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let job = seed_job(&db)?;
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
        assert!(job.summary.is_none());
        Ok(())
    }

    #[test]
    fn test_transitions_follow_the_order() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let job = seed_job(&db)?;

        let t = db.transition_job(job.id, JobStatus::Analyzing)?;
        assert!(t.is_applied());
        assert!(t.job().started_at.is_some());

        // Skipping ahead is refused.
        let t = db.transition_job(job.id, JobStatus::Testing)?;
        assert!(matches!(t, Transition::Rejected(ref j) if j.status == JobStatus::Analyzing));

        // Replaying the same transition is a no-op.
        let t = db.transition_job(job.id, JobStatus::Analyzing)?;
        assert!(matches!(t, Transition::Unchanged(_)));

        db.transition_job(job.id, JobStatus::SettingUp)?;
        db.transition_job(job.id, JobStatus::Testing)?;
        let t = db.transition_job(job.id, JobStatus::Completed)?;
        assert!(t.is_applied());
        assert!(t.job().completed_at.is_some());
        Ok(())
    }

    #[test]
    fn test_terminal_job_never_moves_back() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let job = seed_job(&db)?;
        db.transition_job(job.id, JobStatus::Analyzing)?;
        let failed = db.fail_job(job.id, "sandbox unreachable")?;
        assert!(failed.is_applied());
        let completed_at = failed.job().completed_at.clone();
        assert!(completed_at.is_some());

        for status in [JobStatus::SettingUp, JobStatus::Testing, JobStatus::Completed] {
            let t = db.transition_job(job.id, status)?;
            assert_eq!(t.job().status, JobStatus::Failed);
        }
        let again = db.fail_job(job.id, "second failure")?;
        assert!(matches!(again, Transition::Unchanged(_)));
        assert_eq!(again.job().error.as_deref(), Some("sandbox unreachable"));
        assert_eq!(again.job().completed_at, completed_at);
        Ok(())
    }

    #[test]
    fn test_fail_keeps_partial_summary() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let job = seed_job(&db)?;
        assert!(db.set_summary_once(job.id, "<task_summary>partial</task_summary>")?);
        let failed = db.fail_job(job.id, "model timed out")?.into_job();
        assert_eq!(
            failed.summary.as_deref(),
            Some("<task_summary>partial</task_summary>")
        );
        assert_eq!(failed.error.as_deref(), Some("model timed out"));
        Ok(())
    }

    #[test]
    fn test_cancel_active_job() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let job = seed_job(&db)?;
        db.transition_job(job.id, JobStatus::Analyzing)?;
        let t = db.cancel_job(job.id)?;
        assert!(t.is_applied());
        let job = t.into_job();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.summary.as_deref(), Some(CANCELED_SUMMARY));
        assert!(job.completed_at.is_some());

        // Second cancel does nothing.
        assert!(matches!(db.cancel_job(job.id)?, Transition::Rejected(_)));
        Ok(())
    }

    #[test]
    fn test_cancel_appends_to_existing_summary() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let job = seed_job(&db)?;
        db.set_summary_once(job.id, "found two bugs")?;
        let job = db.cancel_job(job.id)?.into_job();
        let summary = job.summary.unwrap_or_default();
        assert!(summary.starts_with("found two bugs"));
        assert!(summary.ends_with(CANCELED_SUMMARY));
        Ok(())
    }

    #[test]
    fn test_sandbox_id_is_write_once() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let job = seed_job(&db)?;
        assert_eq!(db.set_sandbox_id_once(job.id, "sbx-1")?, "sbx-1");
        assert_eq!(db.set_sandbox_id_once(job.id, "sbx-2")?, "sbx-1");
        assert_eq!(db.get_job(job.id)?.unwrap().sandbox_id.as_deref(), Some("sbx-1"));
        Ok(())
    }

    #[test]
    fn test_summary_is_write_once() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let job = seed_job(&db)?;
        assert!(db.set_summary_once(job.id, "first")?);
        assert!(!db.set_summary_once(job.id, "second")?);
        assert_eq!(db.get_job(job.id)?.unwrap().summary.as_deref(), Some("first"));
        Ok(())
    }

    #[test]
    fn test_tests_and_bugs_round_trip() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let job = seed_job(&db)?;
        db.insert_test(job.id, &sample_test(TestStatus::Fail))?;
        db.insert_bug(job.id, &sample_bug())?;

        let tests = db.list_tests(job.id)?;
        assert_eq!(tests, vec![sample_test(TestStatus::Fail)]);
        let bugs = db.list_bugs(job.id)?;
        assert_eq!(bugs, vec![sample_bug()]);
        Ok(())
    }

    #[test]
    fn test_records_refused_after_terminal() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let job = seed_job(&db)?;
        db.fail_job(job.id, "boom")?;
        assert!(db.insert_test(job.id, &sample_test(TestStatus::Pass)).is_err());
        assert!(db.insert_bug(job.id, &sample_bug()).is_err());
        assert!(!db.set_summary_once(job.id, "late")?);
        assert!(!db.update_discovery(job.id, &DiscoveryInfo::default())?);
        assert!(db.list_tests(job.id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_discovery_and_server_info_persist() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let job = seed_job(&db)?;
        let discovery = DiscoveryInfo {
            framework: Some("express".into()),
            database_used: Some(true),
            ..Default::default()
        };
        let server = ServerInfo {
            port: Some(3000),
            is_running: Some(true),
            ..Default::default()
        };
        assert!(db.update_discovery(job.id, &discovery)?);
        assert!(db.update_server_info(job.id, &server)?);
        let job = db.get_job(job.id)?.unwrap();
        assert_eq!(job.discovery_info, Some(discovery));
        assert_eq!(job.server_info, Some(server));
        Ok(())
    }

    #[test]
    fn test_step_output_first_write_wins() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let job = seed_job(&db)?;
        assert!(db.get_step_output(job.id, "acquire-sandbox")?.is_none());
        assert_eq!(db.record_step(job.id, "acquire-sandbox", "\"sbx-1\"")?, "\"sbx-1\"");
        assert_eq!(db.record_step(job.id, "acquire-sandbox", "\"sbx-2\"")?, "\"sbx-1\"");
        let steps = db.list_steps(job.id)?;
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "acquire-sandbox");
        Ok(())
    }

    #[test]
    fn test_list_jobs_filters() -> Result<()> {
        let db = SentinelDb::new_in_memory()?;
        let a = seed_job(&db)?;
        let b = seed_job(&db)?;
        db.fail_job(b.id, "boom")?;

        let failed = db.list_jobs(&JobFilter {
            status: Some(JobStatus::Failed),
            ..Default::default()
        })?;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, b.id);

        let active = db.list_active_jobs()?;
        assert_eq!(active.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a.id]);

        let limited = db.list_jobs(&JobFilter {
            limit: Some(1),
            ..Default::default()
        })?;
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, b.id);
        Ok(())
    }
}
