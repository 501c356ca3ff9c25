use std::sync::Arc;

use sentinel_common::{DetectedError, DiscoveryInfo, ServerInfo, TestResult, validate_fixes};
use serde_json::json;
use tracing::trace;

use super::{BugArgs, FileWrite, RunScope, TestRecordArgs, ToolOutput, ToolSettings, env_file};
use crate::config::DB_NAME_PLACEHOLDER;
use crate::db::DbHandle;
use crate::engine::RunState;
use crate::errors::{SandboxError, ToolError};
use crate::sandbox::{OutputHook, OutputStream, SandboxGateway};

const ENV_FILE: &str = ".env";

/// `job_steps` marker written once a database URI has been put in `.env`.
/// It outlives the in-memory state, so a resumed run still merges.
const DATABASE_PROVISIONED: &str = "provision-database";

pub(super) struct Context<'a> {
    pub gateway: &'a SandboxGateway,
    pub db: &'a DbHandle,
    pub settings: &'a ToolSettings,
    pub scope: RunScope<'a>,
}

pub(super) async fn terminal(ctx: &Context<'_>, command: &str) -> Result<ToolOutput, ToolError> {
    let job_id = ctx.scope.job_id;
    let live: OutputHook = Arc::new(move |stream: OutputStream, chunk: &str| {
        trace!(job_id, ?stream, chunk, "command output");
    });
    match ctx
        .gateway
        .run_command_streaming(ctx.scope.sandbox_id, command, Some(live))
        .await
    {
        Ok(output) if output.stdout.is_empty() && output.stderr.is_empty() => {
            Ok(ToolOutput::ok("(command succeeded with no output)"))
        }
        Ok(output) if output.stdout.is_empty() => Ok(ToolOutput::ok(output.stderr)),
        Ok(output) => Ok(ToolOutput::ok(output.stdout)),
        // A failing command is information for the model, not a tool fault.
        Err(SandboxError::Command {
            exit_code,
            stdout,
            stderr,
            ..
        }) => Ok(ToolOutput::failed(format!(
            "Command failed (exit code {})\nstdout:\n{}\nstderr:\n{}",
            exit_code, stdout, stderr
        ))),
        Err(e) => Err(e.into()),
    }
}

pub(super) async fn write_files(
    ctx: &Context<'_>,
    state: &mut RunState,
    files: Vec<FileWrite>,
) -> Result<ToolOutput, ToolError> {
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        if let Err(e) = ctx
            .gateway
            .write_file(ctx.scope.sandbox_id, &file.path, &file.content)
            .await
        {
            let done = if written.is_empty() {
                String::new()
            } else {
                format!(" (already written: {})", written.join(", "))
            };
            return Ok(ToolOutput::failed(format!(
                "Failed to write {}: {}{}",
                file.path, e, done
            )));
        }
        state.remember_file(&file.path, &file.content);
        written.push(file.path);
    }
    Ok(ToolOutput::ok(format!(
        "Successfully created/updated {} file(s): {}",
        written.len(),
        written.join(", ")
    )))
}

pub(super) async fn read_files(ctx: &Context<'_>, files: &[String]) -> Result<ToolOutput, ToolError> {
    let mut results = Vec::with_capacity(files.len());
    for path in files {
        let content = match ctx.gateway.read_file(ctx.scope.sandbox_id, path).await {
            Ok(content) => content,
            Err(e) => format!("Error reading file: {}", e),
        };
        results.push(json!({ "path": path, "content": content }));
    }
    Ok(ToolOutput::ok(serde_json::Value::Array(results).to_string()))
}

pub(super) async fn create_env(
    ctx: &Context<'_>,
    state: &mut RunState,
    vars: Vec<(String, String)>,
) -> Result<ToolOutput, ToolError> {
    if !state.env_merge {
        state.env_merge = database_provisioned(ctx).await?;
    }
    let body = if state.env_merge {
        let existing = read_env(ctx).await?;
        env_file::merge(&existing, &vars)
    } else {
        env_file::render(&vars)
    };
    ctx.gateway
        .write_file(ctx.scope.sandbox_id, ENV_FILE, &body)
        .await?;
    let keys: Vec<&str> = vars.iter().map(|(k, _)| k.as_str()).collect();
    Ok(ToolOutput::ok(format!(
        "Created .env file with {} variable(s): {}",
        vars.len(),
        keys.join(", ")
    )))
}

pub(super) async fn create_database(
    ctx: &Context<'_>,
    state: &mut RunState,
    env_var_name: &str,
) -> Result<ToolOutput, ToolError> {
    let template = ctx
        .settings
        .cluster_uri
        .as_deref()
        .ok_or_else(|| ToolError::Config("MONGO_URI not configured".to_string()))?;
    if !template.contains(DB_NAME_PLACEHOLDER) {
        return Err(ToolError::Config(format!(
            "MONGO_URI must contain {} placeholder",
            DB_NAME_PLACEHOLDER
        )));
    }

    let db_name = format!("test_{}", uuid::Uuid::new_v4().simple());
    let uri = template.replace(DB_NAME_PLACEHOLDER, &db_name);

    let existing = read_env(ctx).await?;
    let body = env_file::merge(&existing, &[(env_var_name.to_string(), uri)]);
    ctx.gateway
        .write_file(ctx.scope.sandbox_id, ENV_FILE, &body)
        .await?;

    let job_id = ctx.scope.job_id;
    let marker = json!({ "db_name": db_name, "env_var": env_var_name }).to_string();
    ctx.db
        .call(move |db| db.record_step(job_id, DATABASE_PROVISIONED, &marker))
        .await
        .map_err(ToolError::Persistence)?;
    state.env_merge = true;

    Ok(ToolOutput::ok(
        json!({
            "status": "db_created",
            "db_name": db_name,
            "env_var": env_var_name,
            "env_file": ENV_FILE,
        })
        .to_string(),
    ))
}

async fn database_provisioned(ctx: &Context<'_>) -> Result<bool, ToolError> {
    let job_id = ctx.scope.job_id;
    let marker = ctx
        .db
        .call(move |db| db.get_step_output(job_id, DATABASE_PROVISIONED))
        .await
        .map_err(ToolError::Persistence)?;
    Ok(marker.is_some())
}

/// Current `.env` body, or empty when the file does not exist yet.
async fn read_env(ctx: &Context<'_>) -> Result<String, ToolError> {
    match ctx.gateway.read_file(ctx.scope.sandbox_id, ENV_FILE).await {
        Ok(body) => Ok(body),
        Err(SandboxError::FileRead { .. }) => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

pub(super) async fn server_url(ctx: &Context<'_>, port: u16) -> Result<ToolOutput, ToolError> {
    let url = ctx.gateway.expose_port(ctx.scope.sandbox_id, port).await?;
    Ok(ToolOutput::ok(
        json!({ "status": "ok", "port": port, "url": url }).to_string(),
    ))
}

pub(super) async fn update_discovery(
    ctx: &Context<'_>,
    state: &mut RunState,
    patch: DiscoveryInfo,
) -> Result<ToolOutput, ToolError> {
    let mut merged = state.discovery_info.clone();
    let changed = merged.merge(patch);
    if changed.is_empty() {
        return Ok(ToolOutput::ok("No updates provided"));
    }
    let job_id = ctx.scope.job_id;
    let snapshot = merged.clone();
    ctx.db
        .call(move |db| db.update_discovery(job_id, &snapshot))
        .await
        .map_err(ToolError::Persistence)?;
    state.discovery_info = merged;
    Ok(ToolOutput::ok(format!(
        "Updated discovery info: {}",
        changed.join(", ")
    )))
}

pub(super) async fn update_server_info(
    ctx: &Context<'_>,
    state: &mut RunState,
    patch: ServerInfo,
) -> Result<ToolOutput, ToolError> {
    let mut merged = state.server_info.clone();
    let changed = merged.merge(patch);
    if changed.is_empty() {
        return Ok(ToolOutput::ok("No updates provided"));
    }
    let job_id = ctx.scope.job_id;
    let snapshot = merged.clone();
    ctx.db
        .call(move |db| db.update_server_info(job_id, &snapshot))
        .await
        .map_err(ToolError::Persistence)?;
    state.server_info = merged;
    Ok(ToolOutput::ok(format!(
        "Updated server info: {}",
        changed.join(", ")
    )))
}

pub(super) async fn record_test_result(
    ctx: &Context<'_>,
    state: &mut RunState,
    args: TestRecordArgs,
) -> Result<ToolOutput, ToolError> {
    // The stored body must be exactly what ran. Prefer what this run wrote;
    // otherwise read it back from the sandbox.
    let file_content = match state.file_content(&args.test_file) {
        Some(content) => content.to_string(),
        None => ctx
            .gateway
            .read_file(ctx.scope.sandbox_id, &args.test_file)
            .await
            .map_err(|e| {
                ToolError::validation(
                    "recordTestResult",
                    format!(
                        "cannot read {} to record its content ({}); write it with createOrUpdateFiles first",
                        args.test_file, e
                    ),
                )
            })?,
    };

    let result = TestResult {
        test_file: args.test_file,
        test_name: args.test_name,
        file_content,
        status: args.status,
        exit_code: args.exit_code,
        output: args.output.filter(|o| !o.is_empty()),
        executed_at: chrono::Utc::now().to_rfc3339(),
    };

    let job_id = ctx.scope.job_id;
    let row = result.clone();
    ctx.db
        .call(move |db| db.insert_test(job_id, &row))
        .await
        .map_err(ToolError::Persistence)?;

    let text = format!("Recorded {} result for {}", result.status, result.test_file);
    state.test_results.push(result);
    Ok(ToolOutput::ok(text))
}

pub(super) async fn record_bug(
    ctx: &Context<'_>,
    state: &mut RunState,
    args: BugArgs,
) -> Result<ToolOutput, ToolError> {
    validate_fixes(&args.suggested_fixes, &ctx.settings.fix_limits)?;

    let bug = DetectedError {
        test_file: args.test_file,
        test_name: non_empty(args.test_name),
        message: args.message.trim().to_string(),
        source_file: non_empty(args.source_file),
        root_cause: non_empty(args.root_cause),
        confidence: args.confidence.unwrap_or_default(),
        suggested_fixes: args.suggested_fixes,
    };

    let job_id = ctx.scope.job_id;
    let row = bug.clone();
    ctx.db
        .call(move |db| db.insert_bug(job_id, &row))
        .await
        .map_err(ToolError::Persistence)?;

    let text = format!("Recorded bug: {}", bug.message);
    state.detected_errors.push(bug);
    Ok(ToolOutput::ok(text))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
