//! The agent loop: one model, one tool call per turn, until a summary.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::prompt;
use super::state::RunState;
use super::steps::RetryPolicy;
use crate::config::AgentSection;
use crate::db::DbHandle;
use crate::errors::JobError;
use crate::llm::{self, ChatMessage, ChatModel, ModelReply, ToolSpec};
use crate::tools::{RunScope, ToolRegistry};

pub const SUMMARY_OPEN: &str = "<task_summary>";

static SUMMARY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<task_summary>\s*(.*?)\s*</task_summary>").unwrap());

const EXTRA_CALL_REFUSAL: &str =
    "Not executed: only one tool call runs per turn. Repeat this call on the next turn if you still need it.";

/// Recognizes the `<task_summary>` completion marker in model text.
pub struct SummaryDetector;

impl SummaryDetector {
    /// The summary text, if `text` completes the run.
    ///
    /// A closed block yields its trimmed contents. An opening tag without a
    /// closing one is accepted too, taking everything after the tag. An empty
    /// block does not count.
    pub fn detect(text: &str) -> Option<String> {
        if let Some(cap) = SUMMARY_REGEX.captures(text) {
            let body = cap.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            return (!body.is_empty()).then(|| body.to_string());
        }
        let (_, rest) = text.split_once(SUMMARY_OPEN)?;
        let body = rest.trim();
        if body.is_empty() {
            return None;
        }
        warn!("summary block is missing its closing tag; accepting it as is");
        Some(body.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_turns: u32,
    pub time_budget: Duration,
    pub max_tool_output_bytes: usize,
}

impl From<&AgentSection> for AgentSettings {
    fn from(config: &AgentSection) -> Self {
        Self {
            max_turns: config.max_turns,
            time_budget: Duration::from_secs(config.time_budget_secs),
            max_tool_output_bytes: config.max_tool_output_bytes,
        }
    }
}

/// Result of a completed loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub summary: String,
    pub turns: u32,
}

pub struct AgentLoop {
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    db: DbHandle,
    settings: AgentSettings,
    model_retry: RetryPolicy,
}

impl AgentLoop {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: ToolRegistry,
        db: DbHandle,
        settings: AgentSettings,
        model_retry: RetryPolicy,
    ) -> Self {
        Self {
            model,
            tools,
            db,
            settings,
            model_retry,
        }
    }

    /// Drive the model until it produces a summary, a budget runs out, or
    /// the job leaves its active state.
    pub async fn run(
        &self,
        scope: RunScope<'_>,
        state: &mut RunState,
        task: String,
    ) -> Result<AgentOutcome, JobError> {
        // A summary persisted before a restart already ended the loop.
        if !state.summary.is_empty() {
            return Ok(AgentOutcome {
                summary: state.summary.clone(),
                turns: 0,
            });
        }

        let started = Instant::now();
        let specs = self.tools.specs();
        let mut transcript = vec![
            ChatMessage::system(prompt::SYSTEM_PROMPT),
            ChatMessage::user(task),
        ];

        for turn in 1..=self.settings.max_turns {
            let remaining = self.remaining(started)?;
            self.ensure_active(scope.job_id).await?;

            let mut request = transcript.clone();
            request.push(ChatMessage::user(prompt::state_message(
                &state.snapshot(),
                turn,
                self.settings.max_turns,
            )));

            let reply = tokio::time::timeout(remaining, self.complete(&request, &specs))
                .await
                .map_err(|_| self.out_of_time())??;
            debug!(
                job_id = scope.job_id,
                turn,
                tool_calls = reply.tool_calls.len(),
                "agent turn"
            );

            let ModelReply {
                content,
                tool_calls,
            } = reply;
            let text_summary = content.as_deref().and_then(SummaryDetector::detect);

            if tool_calls.is_empty() {
                if let Some(summary) = text_summary {
                    return self.complete_run(scope, state, summary, turn).await;
                }
                transcript.push(ChatMessage::Assistant {
                    content,
                    tool_calls: Vec::new(),
                });
                transcript.push(ChatMessage::user(prompt::nudge_message()));
                continue;
            }

            transcript.push(ChatMessage::Assistant {
                content,
                tool_calls: tool_calls.clone(),
            });

            let (first, extra) = tool_calls.split_at(1);
            let call = &first[0];
            // A command that never exits must not outlast the budget.
            let remaining = self.remaining(started)?;
            let output = tokio::time::timeout(
                remaining,
                self.tools
                    .invoke(scope, state, &call.function.name, &call.function.arguments),
            )
            .await
            .map_err(|_| self.out_of_time())??;
            transcript.push(ChatMessage::tool(
                call.id.clone(),
                truncate_output(&output.text, self.settings.max_tool_output_bytes),
            ));
            for skipped in extra {
                transcript.push(ChatMessage::tool(skipped.id.clone(), EXTRA_CALL_REFUSAL));
            }

            if let Some(summary) = output.finished.or(text_summary) {
                return self.complete_run(scope, state, summary, turn).await;
            }
        }

        Err(JobError::TurnBudgetExhausted {
            turns: self.settings.max_turns,
        })
    }

    fn remaining(&self, started: Instant) -> Result<Duration, JobError> {
        self.settings
            .time_budget
            .checked_sub(started.elapsed())
            .ok_or_else(|| self.out_of_time())
    }

    fn out_of_time(&self) -> JobError {
        JobError::TimeBudgetExhausted {
            secs: self.settings.time_budget.as_secs(),
        }
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        specs: &[ToolSpec],
    ) -> Result<ModelReply, JobError> {
        self.model_retry
            .run("model", llm::is_retryable, || {
                self.model.complete(messages, specs)
            })
            .await
            .map_err(|e| JobError::Model(format!("{:#}", e)))
    }

    /// Cancellation is cooperative: a job moved to a terminal status out of
    /// band stops the loop at the next turn.
    async fn ensure_active(&self, job_id: i64) -> Result<(), JobError> {
        let job = self
            .db
            .call(move |db| db.get_job(job_id))
            .await
            .map_err(JobError::Persistence)?
            .ok_or(JobError::NotFound { id: job_id })?;
        if job.status.is_terminal() {
            info!(job_id, status = %job.status, "job left its active state, stopping agent");
            return Err(JobError::Cancelled { id: job_id });
        }
        Ok(())
    }

    async fn complete_run(
        &self,
        scope: RunScope<'_>,
        state: &mut RunState,
        summary: String,
        turns: u32,
    ) -> Result<AgentOutcome, JobError> {
        let job_id = scope.job_id;
        let text = summary.clone();
        let stored = self
            .db
            .call(move |db| db.set_summary_once(job_id, &text))
            .await
            .map_err(JobError::Persistence)?;
        if !stored {
            debug!(job_id, "summary already recorded");
        }
        info!(job_id, turns, "agent produced summary");
        state.summary = summary.clone();
        Ok(AgentOutcome { summary, turns })
    }
}

/// Keep the head and tail of long tool output.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let half = max_bytes / 2;
    let mut head_end = half;
    while !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len() - half;
    while !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!(
        "{}\n[... {} bytes omitted ...]\n{}",
        &text[..head_end],
        tail_start - head_end,
        &text[tail_start..]
    )
}
