use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use sentinel_common::{DetectedError, Job, JobReport, JobStatus};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::db::JobFilter;
use crate::engine::reconciler::{bug_category, bug_severity};
use crate::engine::{BugCategory, BugSeverity, JobRunner, RunVerdict};
use crate::errors::JobError;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;
const ANONYMOUS_USER: &str = "anonymous";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub runner: JobRunner,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub repo_url: String,
    pub bug_description: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub user_id: Option<i64>,
    pub limit: Option<u32>,
}

/// Who is acting on an existing job.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorQuery {
    pub user_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedBug {
    #[serde(flatten)]
    pub bug: DetectedError,
    pub category: BugCategory,
    pub severity: BugSeverity,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetail {
    pub job: Job,
    pub verdict: RunVerdict,
    pub report: JobReport,
    pub bugs: Vec<ClassifiedBug>,
}

impl JobDetail {
    fn new(job: Job, report: JobReport) -> Self {
        let bugs = report
            .detected_errors
            .iter()
            .map(|bug| ClassifiedBug {
                bug: bug.clone(),
                category: bug_category(bug),
                severity: bug_severity(bug),
            })
            .collect();
        Self {
            verdict: RunVerdict::for_report(&report),
            job,
            report,
            bugs,
        }
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound { .. } | JobError::RepositoryNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            JobError::Forbidden { .. } => ApiError::Forbidden(err.to_string()),
            JobError::NotActive { .. } => ApiError::Conflict(err.to_string()),
            JobError::BadRequest(msg) => ApiError::BadRequest(msg),
            other => {
                error!(error = %other, "request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/rerun", post(rerun_job))
        .route("/api/jobs/{id}/compare/{other}", get(compare_jobs))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_job(
    State(state): State<SharedState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = requesting_user(req.user_id.as_deref());
    let job = state
        .runner
        .submit(user, &req.repo_url, &req.bug_description)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(JobStatus::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let filter = JobFilter {
        user_id: query.user_id,
        status,
        limit: Some(query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)),
    };
    let jobs = state
        .runner
        .db()
        .call(move |db| db.list_jobs(&filter))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .runner
        .db()
        .call(move |db| db.get_job(id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", id)))?;
    let report = state.runner.reconciler().report(id).await?;
    Ok(Json(JobDetail::new(job, report)))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(actor): Query<ActorQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user = requesting_user(actor.user_id.as_deref());
    let job = state.runner.cancel(id, user).await?;
    Ok(Json(job))
}

async fn rerun_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(actor): Query<ActorQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user = requesting_user(actor.user_id.as_deref());
    let job = state.runner.rerun(id, user).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

fn requesting_user(user_id: Option<&str>) -> &str {
    user_id
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .unwrap_or(ANONYMOUS_USER)
}

async fn compare_jobs(
    State(state): State<SharedState>,
    Path((id, other)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let comparison = state.runner.reconciler().compare_runs(id, other).await?;
    Ok(Json(comparison))
}

// ── Tests ─────────────────────────────────────────────────────────────
