//! Job runner: drives one job through its durable steps.
//!
//! ```text
//! PENDING ─start─▶ ANALYZING ─acquire-sandbox─▶ clone-repo ─setting-up─▶ SETTING_UP
//!    ─testing─▶ TESTING ─agent-loop─▶ finalize ─▶ COMPLETED
//! ```
//!
//! Any error escaping a step moves the job to FAILED. Each step is memoized,
//! so `resume_active` can re-drive a job from the top after a restart and
//! only the unfinished steps execute.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sentinel_common::{Job, JobReport, JobStatus, Repository, parse_github_url};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use super::agent::{AgentLoop, AgentOutcome, AgentSettings};
use super::prompt;
use super::reconciler::Reconciler;
use super::state::RunState;
use super::steps::{self, RetryPolicy, StepRunner};
use crate::config::Config;
use crate::db::{DbHandle, Transition};
use crate::errors::JobError;
use crate::llm::ChatModel;
use crate::sandbox::SandboxGateway;
use crate::tools::{RunScope, ToolRegistry, ToolSettings};

/// Run parameters taken from configuration.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub image: String,
    pub sandbox_timeout: Duration,
    pub agent: AgentSettings,
    pub retry: RetryPolicy,
    pub tools: ToolSettings,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            image: config.sandbox.image.clone(),
            sandbox_timeout: Duration::from_secs(config.sandbox.timeout_secs),
            agent: AgentSettings::from(&config.agent),
            retry: RetryPolicy::from_config(&config.steps),
            tools: ToolSettings {
                fix_limits: config.limits,
                cluster_uri: config.provisioning.cluster_uri.clone(),
            },
        }
    }
}

/// Starts, cancels and resumes jobs. Cheap to clone.
#[derive(Clone)]
pub struct JobRunner {
    db: DbHandle,
    gateway: SandboxGateway,
    model: Arc<dyn ChatModel>,
    settings: Arc<RunnerSettings>,
    /// Background drives by job id.
    running: Arc<tokio::sync::Mutex<HashMap<i64, JoinHandle<()>>>>,
}

impl JobRunner {
    pub fn new(
        db: DbHandle,
        gateway: SandboxGateway,
        model: Arc<dyn ChatModel>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            db,
            gateway,
            model,
            settings: Arc::new(settings),
            running: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.db.clone())
    }

    /// Register the user and repository, create a PENDING job and return it
    /// without starting it.
    pub async fn create(
        &self,
        user: &str,
        repo_url: &str,
        bug_description: &str,
    ) -> Result<Job, JobError> {
        let (owner, name) = parse_github_url(repo_url).ok_or_else(|| {
            JobError::BadRequest(format!("Not a GitHub repository URL: {}", repo_url))
        })?;
        if bug_description.trim().is_empty() {
            return Err(JobError::BadRequest("Bug description must not be empty".to_string()));
        }
        let user = user.to_string();
        let repo_url = repo_url.trim().to_string();
        let bug = bug_description.trim().to_string();
        let job = self
            .db
            .call(move |db| {
                let user = db.upsert_user(&user)?;
                let repo = db.upsert_repository(user.id, &owner, &name, &repo_url)?;
                db.create_job(user.id, repo.id, &bug)
            })
            .await
            .map_err(JobError::Persistence)?;
        info!(job_id = job.id, repository_id = job.repository_id, "job created");
        Ok(job)
    }

    /// Create a job and start it in the background.
    pub async fn submit(
        &self,
        user: &str,
        repo_url: &str,
        bug_description: &str,
    ) -> Result<Job, JobError> {
        let job = self.create(user, repo_url, bug_description).await?;
        self.trigger(job.id).await;
        Ok(job)
    }

    /// Start driving `job_id` in the background. A job that is already being
    /// driven by this process is left alone.
    pub async fn trigger(&self, job_id: i64) -> bool {
        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.is_finished());
        if running.contains_key(&job_id) {
            return false;
        }
        let runner = self.clone();
        let handle = tokio::spawn(async move {
            // The outcome is already recorded on the job row.
            let _ = runner.drive(job_id).await;
        });
        running.insert(job_id, handle);
        true
    }

    /// Drive a job to a terminal status in the foreground. Any failure is
    /// recorded on the job before it is returned.
    pub async fn drive(&self, job_id: i64) -> Result<JobReport, JobError> {
        let span = info_span!("job", job_id);
        async {
            match self.execute(job_id).await {
                Ok(report) => Ok(report),
                Err(e) => {
                    self.record_failure(job_id, &e).await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn record_failure(&self, job_id: i64, err: &JobError) {
        if matches!(err, JobError::Cancelled { .. } | JobError::NotActive { .. }) {
            info!(error = %err, "job stopped");
            return;
        }
        let reason = err.to_string();
        match self.db.call(move |db| db.fail_job(job_id, &reason)).await {
            Ok(Transition::Applied(_)) => error!(error = %err, "job failed"),
            // Typically a cancel that landed while a tool was writing.
            Ok(other) => info!(
                error = %err,
                status = %other.job().status,
                "job was already terminal"
            ),
            Err(e) => error!(error = %err, record_error = %e, "could not record job failure"),
        }
    }

    async fn execute(&self, job_id: i64) -> Result<JobReport, JobError> {
        let (job, repository) = self.load(job_id).await?;
        if job.status == JobStatus::Completed {
            return self.reconciler().report(job_id).await;
        }
        if job.status.is_terminal() {
            return Err(JobError::NotActive {
                id: job_id,
                status: job.status,
            });
        }

        let memo = StepRunner::new(self.db.clone(), job_id, self.settings.retry);

        memo
            .run(steps::STEP_START, || self.advance(job_id, JobStatus::Analyzing))
            .await?;
        let sandbox_id: String = memo
            .run(steps::STEP_ACQUIRE_SANDBOX, || self.acquire_sandbox(job_id))
            .await?;
        memo
            .run(steps::STEP_CLONE_REPO, || {
                self.clone_repo(&sandbox_id, &repository.repo_url)
            })
            .await?;
        memo
            .run(steps::STEP_SETTING_UP, || self.advance(job_id, JobStatus::SettingUp))
            .await?;
        memo
            .run(steps::STEP_TESTING, || self.advance(job_id, JobStatus::Testing))
            .await?;

        let mut state = self.rehydrate(job_id).await?;
        let scope = RunScope {
            job_id,
            sandbox_id: &sandbox_id,
        };
        let task = prompt::task_message(&repository.repo_url, &job.bug_description);
        let agent = self.agent();
        let _outcome: AgentOutcome = memo
            .once(steps::STEP_AGENT_LOOP, agent.run(scope, &mut state, task))
            .await?;

        let reconciler = self.reconciler();
        memo
            .once(steps::STEP_FINALIZE, reconciler.finalize(job_id, Some(&state)))
            .await
    }

    fn agent(&self) -> AgentLoop {
        let tools = ToolRegistry::new(
            self.gateway.clone(),
            self.db.clone(),
            self.settings.tools.clone(),
        );
        AgentLoop::new(
            self.model.clone(),
            tools,
            self.db.clone(),
            self.settings.agent.clone(),
            self.settings.retry,
        )
    }

    async fn load(&self, job_id: i64) -> Result<(Job, Repository), JobError> {
        let job = self
            .db
            .call(move |db| db.get_job(job_id))
            .await
            .map_err(JobError::Persistence)?
            .ok_or(JobError::NotFound { id: job_id })?;
        let repository_id = job.repository_id;
        let repository = self
            .db
            .call(move |db| db.get_repository(repository_id))
            .await
            .map_err(JobError::Persistence)?
            .ok_or(JobError::RepositoryNotFound { id: repository_id })?;
        Ok((job, repository))
    }

    /// Move the job forward. Replaying a transition that already happened is
    /// fine; a job that left the active states stops the run.
    async fn advance(&self, job_id: i64, to: JobStatus) -> Result<JobStatus, JobError> {
        let transition = self
            .db
            .call(move |db| db.transition_job(job_id, to))
            .await
            .map_err(JobError::Persistence)?;
        match transition {
            Transition::Applied(job) => {
                info!(status = %job.status, "status changed");
                Ok(job.status)
            }
            Transition::Unchanged(job) => Ok(job.status),
            Transition::Rejected(job) if job.status.is_terminal() => Err(JobError::NotActive {
                id: job_id,
                status: job.status,
            }),
            Transition::Rejected(job) => {
                // Already past `to`; a replay after a crash.
                warn!(status = %job.status, requested = %to, "transition skipped");
                Ok(job.status)
            }
        }
    }

    /// Reuse the sandbox recorded on the job, or create one and record it.
    async fn acquire_sandbox(&self, job_id: i64) -> Result<String, JobError> {
        let existing = self
            .db
            .call(move |db| db.get_job(job_id))
            .await
            .map_err(JobError::Persistence)?
            .ok_or(JobError::NotFound { id: job_id })?
            .sandbox_id;
        if let Some(sandbox_id) = existing {
            info!(sandbox_id, "reusing recorded sandbox");
            return Ok(sandbox_id);
        }

        let created = self
            .gateway
            .create_sandbox(&self.settings.image, self.settings.sandbox_timeout)
            .await?;
        let recorded = created.clone();
        let persisted = self
            .db
            .call(move |db| db.set_sandbox_id_once(job_id, &recorded))
            .await
            .map_err(JobError::Persistence)?;
        if persisted != created {
            warn!(created, persisted, "another execution recorded a sandbox first");
        }
        Ok(persisted)
    }

    async fn clone_repo(&self, sandbox_id: &str, repo_url: &str) -> Result<(), JobError> {
        self.gateway.clone_repo(sandbox_id, repo_url).await?;
        info!(sandbox_id, repo_url, "repository cloned");
        Ok(())
    }

    async fn rehydrate(&self, job_id: i64) -> Result<RunState, JobError> {
        self.db
            .call(move |db| {
                let job = db
                    .get_job(job_id)?
                    .ok_or_else(|| anyhow::anyhow!("Job {} not found", job_id))?;
                let tests = db.list_tests(job_id)?;
                let bugs = db.list_bugs(job_id)?;
                Ok(RunState::rehydrate(&job, tests, bugs))
            })
            .await
            .map_err(JobError::Persistence)
    }

    /// Load `job_id` on behalf of `user`, refusing jobs created by someone else.
    async fn owned_job(&self, job_id: i64, user: &str) -> Result<Job, JobError> {
        let user = user.to_string();
        let (job, requester) = self
            .db
            .call(move |db| Ok((db.get_job(job_id)?, db.find_user(&user)?)))
            .await
            .map_err(JobError::Persistence)?;
        let job = job.ok_or(JobError::NotFound { id: job_id })?;
        match requester {
            Some(requester) if requester.id == job.user_id => Ok(job),
            _ => Err(JobError::Forbidden { id: job_id }),
        }
    }

    /// Cancel an active job owned by `user`. The running drive, if any,
    /// notices at its next turn; the sandbox itself is left to expire.
    pub async fn cancel(&self, job_id: i64, user: &str) -> Result<Job, JobError> {
        self.owned_job(job_id, user).await?;
        let transition = self
            .db
            .call(move |db| db.cancel_job(job_id))
            .await
            .map_err(JobError::Persistence)?;
        match transition {
            Transition::Applied(job) => {
                info!(job_id, "job canceled");
                Ok(job)
            }
            other => {
                let job = other.into_job();
                Err(JobError::NotActive {
                    id: job_id,
                    status: job.status,
                })
            }
        }
    }

    /// Start a new job for the same repository and bug description.
    pub async fn rerun(&self, job_id: i64, user: &str) -> Result<Job, JobError> {
        let previous = self.owned_job(job_id, user).await?;
        let job = self
            .db
            .call(move |db| {
                db.create_job(previous.user_id, previous.repository_id, &previous.bug_description)
            })
            .await
            .map_err(JobError::Persistence)?;
        info!(job_id = job.id, rerun_of = job_id, "job rerun created");
        self.trigger(job.id).await;
        Ok(job)
    }

    /// Re-drive every job a previous process left in an active status.
    pub async fn resume_active(&self) -> Result<Vec<i64>, JobError> {
        let jobs = self
            .db
            .call(|db| db.list_active_jobs())
            .await
            .map_err(JobError::Persistence)?;
        let mut resumed = Vec::with_capacity(jobs.len());
        for job in jobs {
            if self.trigger(job.id).await {
                info!(job_id = job.id, status = %job.status, "resuming job");
                resumed.push(job.id);
            }
        }
        Ok(resumed)
    }

    /// Stop background drives. Their jobs stay active and are resumed on the
    /// next start.
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        for (job_id, handle) in running.drain() {
            if !handle.is_finished() {
                info!(job_id, "suspending job for shutdown");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::db::SentinelDb;
    use crate::llm::{ModelReply, ToolCall};
    use crate::sandbox::SandboxProvider;
    use crate::testing::{FakeSandbox, ScriptedModel};

    struct Fixture {
        runner: JobRunner,
        fake: Arc<FakeSandbox>,
        model: Arc<ScriptedModel>,
    }

    fn fixture(model: ScriptedModel) -> Fixture {
        let db = DbHandle::new(SentinelDb::new_in_memory().unwrap());
        let fake = Arc::new(FakeSandbox::new());
        let model = Arc::new(model);
        let settings = RunnerSettings {
            image: "code-sentinel-dev".into(),
            sandbox_timeout: Duration::from_secs(60),
            agent: AgentSettings {
                max_turns: 10,
                time_budget: Duration::from_secs(60),
                max_tool_output_bytes: 4096,
            },
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
            },
            tools: ToolSettings::default(),
        };
        let runner = JobRunner::new(
            db,
            SandboxGateway::new(fake.clone()),
            model.clone(),
            settings,
        );
        Fixture {
            runner,
            fake,
            model,
        }
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> ModelReply {
        ModelReply::tool_call(ToolCall::new(id, name, args.to_string()))
    }

    fn bug_script() -> Vec<ModelReply> {
        vec![
            call(
                "c1",
                "createOrUpdateFiles",
                json!({"files": [{"path": "tests/password.test.js", "content": "assert(false)"}]}),
            ),
            call("c2", "terminal", json!({"command": "node tests/password.test.js"})),
            call(
                "c3",
                "recordTestResult",
                json!({"testFile": "tests/password.test.js", "testName": "rejects weak password", "status": "FAIL", "exitCode": 1}),
            ),
            call(
                "c4",
                "recordBug",
                json!({"testFile": "tests/password.test.js", "message": "weak password accepted", "sourceFile": "src/auth.js"}),
            ),
            ModelReply::text("<task_summary>Reproduced: weak passwords are accepted.</task_summary>"),
        ]
    }

    async fn job(runner: &JobRunner) -> Job {
        runner
            .create("user-1", "https://github.com/acme/shop", "weak password accepted")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_completes() {
        let f = fixture(ScriptedModel::new(bug_script()));
        let job = job(&f.runner).await;
        let report = f.runner.drive(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.test_results.len(), 1);
        assert_eq!(report.detected_errors.len(), 1);
        assert_eq!(report.summary, "Reproduced: weak passwords are accepted.");

        let stored = f
            .runner
            .db()
            .call(move |db| db.get_job(job.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.sandbox_id.as_deref(), Some("fake-1"));
        assert_eq!(
            f.fake.commands()[0],
            "rm -rf repo && git clone --depth=1 'https://github.com/acme/shop' repo"
        );
    }

    #[tokio::test]
    async fn test_second_drive_replays_without_side_effects() {
        let f = fixture(ScriptedModel::new(bug_script()));
        let job = job(&f.runner).await;
        let first = f.runner.drive(job.id).await.unwrap();
        let calls = f.model.calls();
        let commands = f.fake.commands().len();

        let second = f.runner.drive(job.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.fake.created(), 1);
        assert_eq!(f.model.calls(), calls);
        assert_eq!(f.fake.commands().len(), commands);
    }

    #[tokio::test]
    async fn test_provisioning_failure_fails_job() {
        let f = fixture(ScriptedModel::new(vec![]));
        f.fake.fail_next_creates(10);
        let job = job(&f.runner).await;
        let err = f.runner.drive(job.id).await.unwrap_err();
        assert!(matches!(err, JobError::Sandbox(_)));

        let report = f.runner.reconciler().report(job.id).await.unwrap();
        assert_eq!(report.status, JobStatus::Failed);
        assert!(report.test_results.is_empty());
        assert!(report.detected_errors.is_empty());
        let stored = f
            .runner
            .db()
            .call(move |db| db.get_job(job.id))
            .await
            .unwrap()
            .unwrap();
        assert!(stored.completed_at.is_some());
        assert!(stored.error.unwrap().contains("simulated outage"));
    }

    #[tokio::test]
    async fn test_transient_provisioning_is_retried() {
        let f = fixture(ScriptedModel::new(vec![ModelReply::text(
            "<task_summary>nothing to report</task_summary>",
        )]));
        f.fake.fail_next_creates(2);
        let job = job(&f.runner).await;
        let report = f.runner.drive(job.id).await.unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(f.fake.created(), 1);
    }

    #[tokio::test]
    async fn test_clone_failure_is_fatal() {
        let f = fixture(ScriptedModel::new(vec![]));
        f.fake.respond_to("git clone", 128, "", "repository not found");
        let job = job(&f.runner).await;
        f.runner.drive(job.id).await.unwrap_err();
        let clones = f
            .fake
            .commands()
            .iter()
            .filter(|c| c.contains("git clone"))
            .count();
        assert_eq!(clones, 1);
        let report = f.runner.reconciler().report(job.id).await.unwrap();
        assert_eq!(report.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_failure_keeps_partial_summary_and_results() {
        let mut script = bug_script();
        script.truncate(3);
        let f = fixture(ScriptedModel::new(script));
        let job = job(&f.runner).await;
        let err = f.runner.drive(job.id).await.unwrap_err();
        assert!(matches!(err, JobError::Model(_)));

        let report = f.runner.reconciler().report(job.id).await.unwrap();
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.test_results.len(), 1);
        assert_eq!(report.summary, "");
    }

    #[tokio::test]
    async fn test_cancel_while_testing() {
        let f = fixture(ScriptedModel::repeating(call(
            "c",
            "terminal",
            json!({"command": "sleep 1"}),
        )));
        let job = job(&f.runner).await;
        let job_id = job.id;
        f.runner
            .db()
            .call(move |db| {
                for status in [JobStatus::Analyzing, JobStatus::SettingUp, JobStatus::Testing] {
                    db.transition_job(job_id, status)?;
                }
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(
            f.runner.cancel(job_id, "user-2").await.unwrap_err(),
            JobError::Forbidden { .. }
        ));
        let cancelled = f.runner.cancel(job_id, "user-1").await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert!(cancelled.summary.unwrap().contains(crate::db::CANCELED_SUMMARY));

        // A drive picked up afterwards stops without touching the row.
        let err = f.runner.drive(job_id).await.unwrap_err();
        assert!(matches!(err, JobError::NotActive { .. }));

        let again = f.runner.cancel(job_id, "user-1").await.unwrap_err();
        assert!(matches!(again, JobError::NotActive { .. }));
        assert!(matches!(
            f.runner.cancel(9999, "user-1").await.unwrap_err(),
            JobError::NotFound { id: 9999 }
        ));
    }

    #[tokio::test]
    async fn test_resume_reuses_recorded_sandbox() {
        let f = fixture(ScriptedModel::new(vec![ModelReply::text(
            "<task_summary>done</task_summary>",
        )]));
        let job = job(&f.runner).await;
        let job_id = job.id;
        // A previous process got as far as provisioning before it died.
        let sandbox = f
            .fake
            .create("code-sentinel-dev", Duration::from_secs(60))
            .await
            .unwrap();
        let recorded = sandbox.clone();
        f.runner
            .db()
            .call(move |db| {
                db.transition_job(job_id, JobStatus::Analyzing)?;
                db.record_step(job_id, steps::STEP_START, "\"ANALYZING\"")?;
                db.set_sandbox_id_once(job_id, &recorded)?;
                Ok(())
            })
            .await
            .unwrap();

        let resumed = f.runner.resume_active().await.unwrap();
        assert_eq!(resumed, vec![job_id]);
        // Wait for the background drive.
        for _ in 0..200 {
            let status = f
                .runner
                .db()
                .call(move |db| db.get_job(job_id))
                .await
                .unwrap()
                .unwrap()
                .status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let report = f.runner.reconciler().report(job_id).await.unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(f.fake.created(), 1);
    }

    #[tokio::test]
    async fn test_rerun_creates_new_job() {
        let f = fixture(ScriptedModel::new(vec![]));
        let first = job(&f.runner).await;
        assert!(matches!(
            f.runner.rerun(first.id, "someone-else").await.unwrap_err(),
            JobError::Forbidden { .. }
        ));
        let second = f.runner.rerun(first.id, "user-1").await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(second.repository_id, first.repository_id);
        assert_eq!(second.bug_description, first.bug_description);
        assert_eq!(second.status, JobStatus::Pending);
        f.runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let f = fixture(ScriptedModel::new(vec![]));
        assert!(matches!(
            f.runner.create("u", "https://gitlab.com/a/b", "bug").await,
            Err(JobError::BadRequest(_))
        ));
        assert!(matches!(
            f.runner.create("u", "https://github.com/a/b", "  ").await,
            Err(JobError::BadRequest(_))
        ));
    }
}
