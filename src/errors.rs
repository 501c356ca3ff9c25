//! Typed error hierarchy for the CodeSentinel engine.
//!
//! Three top-level enums cover the three layers:
//! - `SandboxError`: provisioning and command failures in the sandbox
//! - `ToolError`: failures inside one tool call (always rendered back to the model)
//! - `JobError`: orchestrator-level failures that end a run

use sentinel_common::{FixError, JobStatus};
use thiserror::Error;

/// Errors from the sandbox gateway.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to provision sandbox from image '{image}': {message}")]
    Provisioning { image: String, message: String },

    /// Non-zero exit. Both buffers are kept so the caller sees everything
    /// captured before the fault.
    #[error("Command exited with code {exit_code}: {command}")]
    Command {
        command: String,
        exit_code: i64,
        stdout: String,
        stderr: String,
    },

    #[error("Sandbox {id} is not available")]
    Unavailable { id: String },

    #[error("Failed to read {path}: {message}")]
    FileRead { path: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SandboxError {
    /// Transient faults worth retrying at the step level.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provisioning { .. } | Self::Other(_))
    }
}

/// Errors raised inside a tool invocation. Never crosses the tool boundary
/// as an error: the registry renders it into the tool's text result.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {message}")]
    Validation { tool: String, message: String },

    #[error("Payload too large: {0}")]
    SizeLimit(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Persistence error: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ToolError {
    pub fn validation(tool: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}

impl From<FixError> for ToolError {
    fn from(err: FixError) -> Self {
        if err.is_size_limit() {
            Self::SizeLimit(err.to_string())
        } else {
            Self::validation("recordBug", err.to_string())
        }
    }
}

/// Errors that end a run (forcing it to FAILED) or that surface to callers.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: i64 },

    #[error("Repository {id} not found")]
    RepositoryNotFound { id: i64 },

    #[error("Job {id} belongs to another user")]
    Forbidden { id: i64 },

    #[error("Job {id} is not running (status {status})")]
    NotActive { id: i64, status: JobStatus },

    #[error("Persistence error: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Agent used all {turns} turns without producing a summary")]
    TurnBudgetExhausted { turns: u32 },

    #[error("Agent exceeded its {secs}s time budget")]
    TimeBudgetExhausted { secs: u64 },

    #[error("Job {id} was canceled")]
    Cancelled { id: i64 },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    /// Whether a durable step should retry after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sandbox(e) => e.is_transient(),
            Self::Model(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_keeps_both_buffers() {
        let err = SandboxError::Command {
            command: "npm test".into(),
            exit_code: 1,
            stdout: "1 passing".into(),
            stderr: "1 failing".into(),
        };
        match &err {
            SandboxError::Command { stdout, stderr, .. } => {
                assert_eq!(stdout, "1 passing");
                assert_eq!(stderr, "1 failing");
            }
            _ => panic!("Expected Command variant"),
        }
        assert!(!err.is_transient());
        assert!(err.to_string().contains("npm test"));
    }

    #[test]
    fn provisioning_error_is_transient() {
        let err = SandboxError::Provisioning {
            image: "code-sentinel-dev".into(),
            message: "quota exceeded".into(),
        };
        assert!(err.is_transient());
        assert!(JobError::from(err).is_transient());
    }

    #[test]
    fn fix_errors_split_into_size_and_validation() {
        let size: ToolError = FixError::TooMany { count: 12, max: 10 }.into();
        assert!(matches!(size, ToolError::SizeLimit(_)));

        let anchor: ToolError = FixError::MissingAnchor {
            index: 0,
            file_path: "src/a.js".into(),
        }
        .into();
        assert!(matches!(anchor, ToolError::Validation { ref tool, .. } if tool == "recordBug"));
    }

    #[test]
    fn job_not_found_carries_id() {
        let err = JobError::NotFound { id: 42 };
        assert!(matches!(err, JobError::NotFound { id: 42 }));
        assert_eq!(err.to_string(), "Job 42 not found");
        assert!(!err.is_transient());
    }

    #[test]
    fn forbidden_is_not_retried() {
        let err = JobError::Forbidden { id: 3 };
        assert_eq!(err.to_string(), "Job 3 belongs to another user");
        assert!(!err.is_transient());
    }

    #[test]
    fn anyhow_converts_to_other() {
        let err: JobError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, JobError::Other(_)));
    }
}
