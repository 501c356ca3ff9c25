//! Finalization and read-side views of finished runs.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use sentinel_common::{
    Confidence, DetectedError, Job, JobReport, JobStatus, TestResult, TestStatus,
};
use tracing::{info, warn};

use super::state::RunState;
use crate::db::{DbHandle, Transition};
use crate::errors::JobError;

/// Turns durable rows into the terminal report and commits COMPLETED.
#[derive(Clone)]
pub struct Reconciler {
    db: DbHandle,
}

impl Reconciler {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Read the job's rows fresh, build the report, then move the job to
    /// COMPLETED. Calling it again on a completed job returns the same
    /// report without writing anything.
    ///
    /// `state` is only compared against the rows; it never feeds the report.
    pub async fn finalize(
        &self,
        job_id: i64,
        state: Option<&RunState>,
    ) -> Result<JobReport, JobError> {
        let (job, tests, bugs) = self.load(job_id).await?;
        match job.status {
            JobStatus::Completed => return Ok(build_report(&job, tests, bugs)),
            status if status.is_terminal() => {
                return Err(JobError::NotActive { id: job_id, status });
            }
            _ => {}
        }

        if let Some(state) = state
            && (state.test_results.len() != tests.len()
                || state.detected_errors.len() != bugs.len())
        {
            warn!(
                job_id,
                state_tests = state.test_results.len(),
                stored_tests = tests.len(),
                state_bugs = state.detected_errors.len(),
                stored_bugs = bugs.len(),
                "run state diverged from stored rows; reporting stored rows"
            );
        }

        let transition = self
            .db
            .call(move |db| db.transition_job(job_id, JobStatus::Completed))
            .await
            .map_err(JobError::Persistence)?;
        let job = match transition {
            Transition::Applied(job) => {
                info!(job_id, tests = tests.len(), bugs = bugs.len(), "job completed");
                job
            }
            Transition::Unchanged(job) => job,
            Transition::Rejected(job) => {
                return Err(JobError::NotActive {
                    id: job_id,
                    status: job.status,
                });
            }
        };
        Ok(build_report(&job, tests, bugs))
    }

    /// Report for a job in any status, from its current rows.
    pub async fn report(&self, job_id: i64) -> Result<JobReport, JobError> {
        let (job, tests, bugs) = self.load(job_id).await?;
        Ok(build_report(&job, tests, bugs))
    }

    async fn load(
        &self,
        job_id: i64,
    ) -> Result<(Job, Vec<TestResult>, Vec<DetectedError>), JobError> {
        let loaded = self
            .db
            .call(move |db| {
                let Some(job) = db.get_job(job_id)? else {
                    return Ok(None);
                };
                let tests = db.list_tests(job_id)?;
                let bugs = db.list_bugs(job_id)?;
                Ok(Some((job, tests, bugs)))
            })
            .await
            .map_err(JobError::Persistence)?;
        loaded.ok_or(JobError::NotFound { id: job_id })
    }

    /// Line up the bugs of two runs of the same repository.
    pub async fn compare_runs(
        &self,
        base_id: i64,
        target_id: i64,
    ) -> Result<RunComparison, JobError> {
        let (base, base_tests, base_bugs) = self.load(base_id).await?;
        let (target, target_tests, target_bugs) = self.load(target_id).await?;
        if base.repository_id != target.repository_id {
            return Err(JobError::BadRequest(
                "Runs must belong to the same repository".to_string(),
            ));
        }
        Ok(compare(
            RunOverview::new(&base, base_tests.len(), base_bugs.len()),
            base_bugs,
            RunOverview::new(&target, target_tests.len(), target_bugs.len()),
            target_bugs,
        ))
    }
}

pub fn build_report(job: &Job, tests: Vec<TestResult>, bugs: Vec<DetectedError>) -> JobReport {
    JobReport {
        status: job.status,
        summary: job.summary.clone().unwrap_or_default(),
        discovery_info: job.discovery_info.clone().unwrap_or_default(),
        server_info: job.server_info.clone().unwrap_or_default(),
        test_results: tests,
        detected_errors: bugs,
    }
}

// ── Run comparison ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOverview {
    pub id: i64,
    pub status: JobStatus,
    pub created_at: String,
    pub test_count: usize,
    pub bug_count: usize,
}

impl RunOverview {
    fn new(job: &Job, test_count: usize, bug_count: usize) -> Self {
        Self {
            id: job.id,
            status: job.status,
            created_at: job.created_at.clone(),
            test_count,
            bug_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunComparison {
    pub base_run: RunOverview,
    pub compare_run: RunOverview,
    /// In the compared run only.
    pub new_bugs: Vec<DetectedError>,
    /// In the base run only.
    pub fixed_bugs: Vec<DetectedError>,
    /// In both; taken from the compared run.
    pub unchanged_bugs: Vec<DetectedError>,
}

fn compare(
    base_run: RunOverview,
    base_bugs: Vec<DetectedError>,
    compare_run: RunOverview,
    compare_bugs: Vec<DetectedError>,
) -> RunComparison {
    let base_keys: HashSet<String> = base_bugs.iter().map(DetectedError::comparison_key).collect();
    let compare_keys: HashSet<String> = compare_bugs
        .iter()
        .map(DetectedError::comparison_key)
        .collect();

    let fixed_bugs = base_bugs
        .into_iter()
        .filter(|b| !compare_keys.contains(&b.comparison_key()))
        .collect();
    let (unchanged_bugs, new_bugs) = compare_bugs
        .into_iter()
        .partition(|b| base_keys.contains(&b.comparison_key()));

    RunComparison {
        base_run,
        compare_run,
        new_bugs,
        fixed_bugs,
        unchanged_bugs,
    }
}

// ── Dashboard classification ──────────────────────────────────────────

/// Coarse outcome shown in run lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunVerdict {
    Queued,
    Running,
    Passed,
    Failed,
}

impl RunVerdict {
    pub fn of(status: JobStatus, failing_tests: usize, bugs: usize) -> Self {
        match status {
            JobStatus::Pending => Self::Queued,
            JobStatus::Analyzing | JobStatus::SettingUp | JobStatus::Testing => Self::Running,
            JobStatus::Failed => Self::Failed,
            JobStatus::Completed if failing_tests > 0 || bugs > 0 => Self::Failed,
            JobStatus::Completed => Self::Passed,
        }
    }

    pub fn for_report(report: &JobReport) -> Self {
        let failing = report
            .test_results
            .iter()
            .filter(|t| t.status == TestStatus::Fail)
            .count();
        Self::of(report.status, failing, report.detected_errors.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BugCategory {
    Auth,
    Validation,
    Security,
    #[serde(rename = "Data Leak")]
    DataLeak,
    Performance,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum BugSeverity {
    Low,
    Medium,
    High,
    Critical,
}

// Checked in order; the first match wins.
static CATEGORY_RULES: LazyLock<Vec<(BugCategory, Regex)>> = LazyLock::new(|| {
    vec![
        (
            BugCategory::Auth,
            Regex::new(r"auth|login|token|session|oauth|permission|unauthori").unwrap(),
        ),
        (
            BugCategory::Validation,
            Regex::new(r"valid|schema|input|sanit|constraint|format|required").unwrap(),
        ),
        (
            BugCategory::Security,
            Regex::new(r"xss|csrf|injection|sql|secure|vulnerab|exploit|rce").unwrap(),
        ),
        (
            BugCategory::DataLeak,
            Regex::new(r"leak|expos|pii|secret|password|credential|private data").unwrap(),
        ),
        (
            BugCategory::Performance,
            Regex::new(r"slow|latency|timeout|memory|cpu|performance|n\+1|loop").unwrap(),
        ),
    ]
});

static CRITICAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"data leak|credential|rce|injection|auth bypass|critical").unwrap()
});

fn bug_text(bug: &DetectedError) -> String {
    format!(
        "{} {}",
        bug.message.to_lowercase(),
        bug.root_cause.as_deref().unwrap_or_default().to_lowercase()
    )
}

pub fn bug_category(bug: &DetectedError) -> BugCategory {
    let text = bug_text(bug);
    CATEGORY_RULES
        .iter()
        .find(|(_, re)| re.is_match(&text))
        .map(|(category, _)| *category)
        .unwrap_or(BugCategory::General)
}

pub fn bug_severity(bug: &DetectedError) -> BugSeverity {
    if CRITICAL_REGEX.is_match(&bug_text(bug)) {
        return BugSeverity::Critical;
    }
    match bug.confidence {
        Confidence::High => BugSeverity::High,
        Confidence::Medium => BugSeverity::Medium,
        Confidence::Low => BugSeverity::Low,
    }
}
