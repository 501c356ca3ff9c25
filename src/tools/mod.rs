//! Tool registry: the fixed set of capabilities the agent may call.
//!
//! Arguments arrive as model-produced JSON. They are parsed into a typed
//! [`ToolInvocation`] at the boundary, so handlers only ever see validated
//! input. Every tool failure is rendered back to the model as text; only a
//! persistence fault escapes as a [`JobError`], because the run cannot keep
//! its records consistent past that point.

mod env_file;
mod handlers;
mod schema;

use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use sentinel_common::{
    Confidence, DiscoveryInfo, FixLimits, ServerInfo, SuggestedFix, TestStatus,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

pub use schema::{FINISH, tool_specs};

use crate::db::DbHandle;
use crate::engine::RunState;
use crate::errors::{JobError, ToolError};
use crate::llm::ToolSpec;
use crate::sandbox::SandboxGateway;

static ENV_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

static DB_ENV_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").unwrap());

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TestRecordArgs {
    pub test_file: String,
    pub test_name: String,
    pub status: TestStatus,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BugArgs {
    pub test_file: String,
    #[serde(default)]
    pub test_name: Option<String>,
    pub message: String,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub confidence: Option<Confidence>,
    #[serde(default)]
    pub suggested_fixes: Vec<SuggestedFix>,
}

/// One validated tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    Terminal { command: String },
    CreateOrUpdateFiles { files: Vec<FileWrite> },
    ReadFiles { files: Vec<String> },
    CreateEnv { vars: Vec<(String, String)> },
    CreateMongoDb { env_var_name: String },
    GetServerUrl { port: u16 },
    UpdateDiscovery(DiscoveryInfo),
    UpdateServerInfo(ServerInfo),
    RecordTestResult(TestRecordArgs),
    RecordBug(BugArgs),
    Finish { summary: String },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TerminalArgs {
    command: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FilesArgs {
    files: Vec<FileWrite>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadArgs {
    files: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvVar {
    key: String,
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EnvArgs {
    env_vars: Vec<EnvVar>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MongoArgs {
    env_var_name: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PortArgs {
    port: i64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FinishArgs {
    summary: String,
}

impl ToolInvocation {
    /// Parse and validate a raw call.
    pub fn parse(name: &str, arguments: &str) -> Result<Self, ToolError> {
        let invocation = match name {
            schema::TERMINAL => {
                let args: TerminalArgs = decode(name, arguments)?;
                require_text(name, "command", &args.command)?;
                Self::Terminal {
                    command: args.command,
                }
            }
            schema::CREATE_OR_UPDATE_FILES => {
                let args: FilesArgs = decode(name, arguments)?;
                if args.files.is_empty() {
                    return Err(ToolError::validation(name, "files must not be empty"));
                }
                for file in &args.files {
                    check_path(name, &file.path)?;
                }
                Self::CreateOrUpdateFiles { files: args.files }
            }
            schema::READ_FILES => {
                let args: ReadArgs = decode(name, arguments)?;
                if args.files.is_empty() {
                    return Err(ToolError::validation(name, "files must not be empty"));
                }
                for path in &args.files {
                    check_path(name, path)?;
                }
                Self::ReadFiles { files: args.files }
            }
            schema::CREATE_ENV => {
                let args: EnvArgs = decode(name, arguments)?;
                if args.env_vars.is_empty() {
                    return Err(ToolError::validation(name, "envVars must not be empty"));
                }
                for var in &args.env_vars {
                    if !ENV_KEY_REGEX.is_match(&var.key) {
                        return Err(ToolError::validation(
                            name,
                            format!("invalid variable name '{}'", var.key),
                        ));
                    }
                    if var.value.contains('\n') {
                        return Err(ToolError::validation(
                            name,
                            format!("value for '{}' must be a single line", var.key),
                        ));
                    }
                }
                let vars = args.env_vars.into_iter().map(|v| (v.key, v.value)).collect();
                Self::CreateEnv {
                    vars: env_file::dedupe(vars),
                }
            }
            schema::CREATE_MONGO_DB => {
                let args: MongoArgs = decode(name, arguments)?;
                if !DB_ENV_NAME_REGEX.is_match(&args.env_var_name) {
                    return Err(ToolError::validation(
                        name,
                        format!("Invalid env variable name '{}'", args.env_var_name),
                    ));
                }
                Self::CreateMongoDb {
                    env_var_name: args.env_var_name,
                }
            }
            schema::GET_SERVER_URL => {
                let args: PortArgs = decode(name, arguments)?;
                let port = u16::try_from(args.port)
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| {
                        ToolError::validation(name, format!("port {} is outside 1-65535", args.port))
                    })?;
                Self::GetServerUrl { port }
            }
            schema::UPDATE_DISCOVERY => Self::UpdateDiscovery(decode(name, arguments)?),
            schema::UPDATE_SERVER_INFO => Self::UpdateServerInfo(decode(name, arguments)?),
            schema::RECORD_TEST_RESULT => {
                let args: TestRecordArgs = decode(name, arguments)?;
                check_path(name, &args.test_file)?;
                require_text(name, "testName", &args.test_name)?;
                Self::RecordTestResult(args)
            }
            schema::RECORD_BUG => {
                let args: BugArgs = decode(name, arguments)?;
                require_text(name, "testFile", &args.test_file)?;
                require_text(name, "message", &args.message)?;
                Self::RecordBug(args)
            }
            schema::FINISH => {
                let args: FinishArgs = decode(name, arguments)?;
                require_text(name, "summary", &args.summary)?;
                Self::Finish {
                    summary: args.summary.trim().to_string(),
                }
            }
            other => return Err(ToolError::UnknownTool(other.to_string())),
        };
        Ok(invocation)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Terminal { .. } => schema::TERMINAL,
            Self::CreateOrUpdateFiles { .. } => schema::CREATE_OR_UPDATE_FILES,
            Self::ReadFiles { .. } => schema::READ_FILES,
            Self::CreateEnv { .. } => schema::CREATE_ENV,
            Self::CreateMongoDb { .. } => schema::CREATE_MONGO_DB,
            Self::GetServerUrl { .. } => schema::GET_SERVER_URL,
            Self::UpdateDiscovery(_) => schema::UPDATE_DISCOVERY,
            Self::UpdateServerInfo(_) => schema::UPDATE_SERVER_INFO,
            Self::RecordTestResult(_) => schema::RECORD_TEST_RESULT,
            Self::RecordBug(_) => schema::RECORD_BUG,
            Self::Finish { .. } => schema::FINISH,
        }
    }
}

fn decode<T: DeserializeOwned>(tool: &str, arguments: &str) -> Result<T, ToolError> {
    let raw = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    serde_json::from_str(raw).map_err(|e| ToolError::validation(tool, e.to_string()))
}

fn require_text(tool: &str, field: &str, value: &str) -> Result<(), ToolError> {
    if value.trim().is_empty() {
        Err(ToolError::validation(tool, format!("{} must not be empty", field)))
    } else {
        Ok(())
    }
}

/// Paths are relative to the clone; parent traversal is refused.
fn check_path(tool: &str, path: &str) -> Result<(), ToolError> {
    require_text(tool, "path", path)?;
    if path.split('/').any(|segment| segment == "..") {
        return Err(ToolError::validation(
            tool,
            format!("path '{}' escapes the repository", path),
        ));
    }
    Ok(())
}

/// Settings the tools need from configuration.
#[derive(Debug, Clone, Default)]
pub struct ToolSettings {
    pub fix_limits: FixLimits,
    /// Database cluster URI template containing `{db_name}`.
    pub cluster_uri: Option<String>,
}

/// Per-run scope a tool call executes in.
#[derive(Debug, Clone, Copy)]
pub struct RunScope<'a> {
    pub job_id: i64,
    pub sandbox_id: &'a str,
}

/// Text returned to the model, plus the completion signal when the call was
/// `finish`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub ok: bool,
    pub finished: Option<String>,
}

impl ToolOutput {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ok: true,
            finished: None,
        }
    }

    fn failed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ok: false,
            finished: None,
        }
    }
}

#[derive(Clone)]
pub struct ToolRegistry {
    gateway: SandboxGateway,
    db: DbHandle,
    settings: ToolSettings,
}

impl ToolRegistry {
    pub fn new(gateway: SandboxGateway, db: DbHandle, settings: ToolSettings) -> Self {
        Self {
            gateway,
            db,
            settings,
        }
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        tool_specs()
    }

    /// Run one call. Tool failures come back as `Ok` with `ok == false`;
    /// `Err` means the job store rejected a write and the run must stop.
    pub async fn invoke(
        &self,
        scope: RunScope<'_>,
        state: &mut RunState,
        name: &str,
        arguments: &str,
    ) -> Result<ToolOutput, JobError> {
        let started = Instant::now();
        let result = match ToolInvocation::parse(name, arguments) {
            Ok(invocation) => self.execute(scope, state, invocation).await,
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                info!(job_id = scope.job_id, tool = name, elapsed_ms, ok = output.ok, "tool call");
                Ok(output)
            }
            Err(ToolError::Persistence(e)) => {
                warn!(job_id = scope.job_id, tool = name, elapsed_ms, ok = false, error = %e, "tool call could not persist");
                Err(JobError::Persistence(e))
            }
            Err(e) => {
                info!(job_id = scope.job_id, tool = name, elapsed_ms, ok = false, error = %e, "tool call");
                Ok(ToolOutput::failed(format!("Error: {}", e)))
            }
        }
    }

    async fn execute(
        &self,
        scope: RunScope<'_>,
        state: &mut RunState,
        invocation: ToolInvocation,
    ) -> Result<ToolOutput, ToolError> {
        let ctx = handlers::Context {
            gateway: &self.gateway,
            db: &self.db,
            settings: &self.settings,
            scope,
        };
        match invocation {
            ToolInvocation::Terminal { command } => handlers::terminal(&ctx, &command).await,
            ToolInvocation::CreateOrUpdateFiles { files } => {
                handlers::write_files(&ctx, state, files).await
            }
            ToolInvocation::ReadFiles { files } => handlers::read_files(&ctx, &files).await,
            ToolInvocation::CreateEnv { vars } => handlers::create_env(&ctx, state, vars).await,
            ToolInvocation::CreateMongoDb { env_var_name } => {
                handlers::create_database(&ctx, state, &env_var_name).await
            }
            ToolInvocation::GetServerUrl { port } => handlers::server_url(&ctx, port).await,
            ToolInvocation::UpdateDiscovery(patch) => {
                handlers::update_discovery(&ctx, state, patch).await
            }
            ToolInvocation::UpdateServerInfo(patch) => {
                handlers::update_server_info(&ctx, state, patch).await
            }
            ToolInvocation::RecordTestResult(args) => {
                handlers::record_test_result(&ctx, state, args).await
            }
            ToolInvocation::RecordBug(args) => handlers::record_bug(&ctx, state, args).await,
            ToolInvocation::Finish { summary } => Ok(ToolOutput {
                text: "Summary received.".to_string(),
                ok: true,
                finished: Some(summary),
            }),
        }
    }
}
