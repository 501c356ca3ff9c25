//! Durable, memoized steps.
//!
//! A step's output is stored in `job_steps` under `(job_id, name)` the
//! first time it succeeds. Running the same step again for the same job
//! returns the stored output without executing anything, which is what makes
//! re-driving a half-finished job after a crash safe.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{Instrument, debug, info_span, warn};

use crate::config::StepsSection;
use crate::db::DbHandle;
use crate::errors::JobError;

pub const STEP_START: &str = "start";
pub const STEP_ACQUIRE_SANDBOX: &str = "acquire-sandbox";
pub const STEP_CLONE_REPO: &str = "clone-repo";
pub const STEP_SETTING_UP: &str = "setting-up";
pub const STEP_TESTING: &str = "testing";
pub const STEP_AGENT_LOOP: &str = "agent-loop";
pub const STEP_FINALIZE: &str = "finalize";

/// Bounded retry with doubling backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StepsSection) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    /// A policy that never retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Run `f` until it succeeds, fails with a non-transient error, or the
    /// attempts run out.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        is_transient: impl Fn(&E) -> bool,
        mut f: F,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && is_transient(&e) => {
                    let delay = self.delay(attempt);
                    warn!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Executes named steps for one job.
#[derive(Clone)]
pub struct StepRunner {
    db: DbHandle,
    job_id: i64,
    policy: RetryPolicy,
}

impl StepRunner {
    pub fn new(db: DbHandle, job_id: i64, policy: RetryPolicy) -> Self {
        Self { db, job_id, policy }
    }

    /// Run a retryable step. `f` is called again after transient errors.
    pub async fn run<T, F, Fut>(&self, name: &'static str, f: F) -> Result<T, JobError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, JobError>>,
    {
        let span = info_span!("step", name);
        async {
            if let Some(value) = self.replay(name).await? {
                return Ok(value);
            }
            let value = self.policy.run(name, JobError::is_transient, f).await?;
            self.record(name, value).await
        }
        .instrument(span)
        .await
    }

    /// Run a step exactly once. `fut` is dropped unpolled when the step was
    /// already recorded.
    pub async fn once<T, Fut>(&self, name: &'static str, fut: Fut) -> Result<T, JobError>
    where
        T: Serialize + DeserializeOwned,
        Fut: Future<Output = Result<T, JobError>>,
    {
        let span = info_span!("step", name);
        async {
            if let Some(value) = self.replay(name).await? {
                return Ok(value);
            }
            let value = fut.await?;
            self.record(name, value).await
        }
        .instrument(span)
        .await
    }

    async fn replay<T: DeserializeOwned>(&self, name: &'static str) -> Result<Option<T>, JobError> {
        let job_id = self.job_id;
        let stored = self
            .db
            .call(move |db| db.get_step_output(job_id, name))
            .await
            .map_err(JobError::Persistence)?;
        match stored {
            Some(raw) => {
                debug!(step = name, "replaying recorded step");
                let value = serde_json::from_str(&raw).map_err(|e| {
                    JobError::Persistence(anyhow::anyhow!(
                        "Recorded output of step '{}' is unreadable: {}",
                        name,
                        e
                    ))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Store `value`. If another execution recorded first, its output wins.
    async fn record<T>(&self, name: &'static str, value: T) -> Result<T, JobError>
    where
        T: Serialize + DeserializeOwned,
    {
        let raw = serde_json::to_string(&value)
            .map_err(|e| JobError::Persistence(anyhow::Error::new(e)))?;
        let job_id = self.job_id;
        let ours = raw.clone();
        let stored = self
            .db
            .call(move |db| db.record_step(job_id, name, &ours))
            .await
            .map_err(JobError::Persistence)?;
        if stored == raw {
            Ok(value)
        } else {
            serde_json::from_str(&stored).map_err(|e| JobError::Persistence(anyhow::Error::new(e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::db::SentinelDb;
    use crate::errors::SandboxError;

    fn runner(max_attempts: u32) -> (StepRunner, DbHandle, i64) {
        let db = DbHandle::new(SentinelDb::new_in_memory().unwrap());
        let job_id = {
            let guard = db.lock_sync().unwrap();
            let user = guard.upsert_user("u").unwrap();
            let repo = guard
                .upsert_repository(user.id, "acme", "shop", "https://github.com/acme/shop")
                .unwrap();
            guard.create_job(user.id, repo.id, "bug").unwrap().id
        };
        let policy = RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        };
        (StepRunner::new(db.clone(), job_id, policy), db, job_id)
    }

    fn transient() -> JobError {
        JobError::Sandbox(SandboxError::Provisioning {
            image: "img".into(),
            message: "busy".into(),
        })
    }

    #[tokio::test]
    async fn test_step_runs_once_then_replays() {
        let (steps, db, job_id) = runner(3);
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let out: String = steps
                .run("acquire-sandbox", move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok("sbx-1".to_string())
                    }
                })
                .await
                .unwrap();
            assert_eq!(out, "sbx-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let recorded = db.call(move |db| db.list_steps(job_id)).await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].output, "\"sbx-1\"");
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (steps, _db, _) = runner(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let out: u32 = steps
            .run("flaky", move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 { Err(transient()) } else { Ok(n) }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let (steps, db, job_id) = runner(2);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), JobError> = steps
            .run("flaky", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Failed steps leave no record, so a later run executes them again.
        assert!(db.call(move |db| db.list_steps(job_id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let (steps, _db, _) = runner(5);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), JobError> = steps
            .run("clone-repo", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::Sandbox(SandboxError::Command {
                        command: "git clone".into(),
                        exit_code: 128,
                        stdout: String::new(),
                        stderr: "not found".into(),
                    }))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_once_skips_recorded_future() {
        let (steps, _db, _) = runner(1);
        let first: u32 = steps.once("agent-loop", async { Ok(7) }).await.unwrap();
        let second: u32 = steps
            .once("agent-loop", async { panic!("must not run") })
            .await
            .unwrap();
        assert_eq!((first, second), (7, 7));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
    }
}
