//! Run engine: everything between "job created" and "report available".
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐  submit/cancel  ┌─────────────────────────────────────────────┐
//! │ api / cmd│ ──────────────> │ orchestrator.rs  (JobRunner)                │
//! └──────────┘                 │      │ StepRunner::run / once               │
//!                              │      v                                      │
//!                              │ steps.rs  (memoized steps, RetryPolicy)     │
//!                              │      │                                      │
//!                              │      │ AgentLoop::run                       │
//!                              │      v                                      │
//!                              │ agent.rs  (model turns, summary detection)  │
//!                              │      │ ToolRegistry::invoke                 │
//!                              │      v                                      │
//!                              │ crate::tools  ──> crate::sandbox            │
//!                              │      │                                      │
//!                              │      v                                      │
//!                              │ reconciler.rs  (report, COMPLETED, compare) │
//!                              └─────────────────────────────────────────────┘
//! ```
//!
//! | Module         | Responsibility                                          |
//! |----------------|---------------------------------------------------------|
//! | `state`        | `RunState`, the in-flight view the tools mutate         |
//! | `prompt`       | System prompt and per-turn messages                     |
//!
//! The database is the source of truth. `RunState` is rebuilt from rows
//! whenever a job is driven, and the final report never reads from it.

pub mod agent;
pub mod orchestrator;
pub mod prompt;
pub mod reconciler;
pub mod state;
pub mod steps;

pub use agent::{AgentLoop, AgentOutcome, AgentSettings, SummaryDetector};
pub use orchestrator::{JobRunner, RunnerSettings};
pub use reconciler::{
    BugCategory, BugSeverity, Reconciler, RunComparison, RunOverview, RunVerdict,
};
pub use state::RunState;
pub use steps::{RetryPolicy, StepRunner};
