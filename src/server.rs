use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::{self, AppState};
use crate::config::Config;
use crate::db::{DbHandle, SentinelDb};
use crate::engine::{JobRunner, RunnerSettings};
use crate::llm::OpenAiClient;
use crate::sandbox::{DockerSandbox, SandboxGateway};

/// Build the full application router.
pub fn build_router(state: Arc<AppState>, cors: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open the database and wire the Docker sandbox and model client into a
/// [`JobRunner`].
pub fn build_runner(config: &Config) -> Result<JobRunner> {
    if let Some(parent) = config.database.path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = SentinelDb::new(&config.database.path)
        .context("Failed to initialize sentinel database")?;

    let sandbox = DockerSandbox::connect(config.sandbox.clone())
        .context("Failed to connect to the sandbox provider")?;
    let model = OpenAiClient::new(config.model.clone())
        .context("Failed to build the model client")?;

    Ok(JobRunner::new(
        DbHandle::new(db),
        SandboxGateway::new(Arc::new(sandbox))
            .with_command_timeout(config.sandbox.command_timeout()),
        Arc::new(model),
        RunnerSettings::from_config(config),
    ))
}

/// Start the HTTP service. Jobs left active by a previous process are
/// resumed before the listener accepts requests.
pub async fn start_server(config: Config) -> Result<()> {
    let runner = build_runner(&config)?;

    let resumed = runner
        .resume_active()
        .await
        .context("Failed to resume active jobs")?;
    if !resumed.is_empty() {
        info!(count = resumed.len(), jobs = ?resumed, "resumed active jobs");
    }

    let state = Arc::new(AppState {
        runner: runner.clone(),
    });
    let app = build_router(state, config.server.cors);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "code-sentinel listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    runner.shutdown().await;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::{AgentSettings, RetryPolicy};
    use crate::testing::{FakeSandbox, ScriptedModel};
    use crate::tools::ToolSettings;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router(cors: bool) -> Router {
        let runner = JobRunner::new(
            DbHandle::new(SentinelDb::new_in_memory().unwrap()),
            SandboxGateway::new(Arc::new(FakeSandbox::new())),
            Arc::new(ScriptedModel::new(vec![])),
            RunnerSettings {
                image: "img".into(),
                sandbox_timeout: Duration::from_secs(1),
                agent: AgentSettings {
                    max_turns: 1,
                    time_budget: Duration::from_secs(1),
                    max_tool_output_bytes: 1024,
                },
                retry: RetryPolicy::once(),
                tools: ToolSettings::default(),
            },
        );
        build_router(Arc::new(AppState { runner }), cors)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = test_router(false).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cors_headers_when_enabled() {
        let req = Request::builder()
            .uri("/api/jobs")
            .header("origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let resp = test_router(true).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let resp = test_router(false).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
