use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bollard::{
    Docker,
    errors::Error as BollardError,
    exec::{StartExecOptions, StartExecResults},
    models::{ContainerCreateBody, ExecConfig, HostConfig},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
        RemoveContainerOptionsBuilder,
    },
};
use futures_util::{StreamExt, TryStreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    CommandOutput, ExecOptions, OutputCollector, OutputStream, SandboxProvider, TIMEOUT_EXIT_CODE,
    shell_quote,
};
use crate::config::SandboxSection;
use crate::errors::SandboxError;

/// Bytes of file content per exec when writing; keeps each command well
/// under the kernel's argument limit.
const WRITE_CHUNK_BYTES: usize = 48 * 1024;

const LABEL: &str = "code-sentinel";

/// How long past a command's timeout the exec stream may run before it is
/// abandoned. The in-container `timeout` normally ends it first.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Sandboxes as local Docker containers.
///
/// Each sandbox is a detached container running `sleep <timeout>` with
/// auto-remove, so it is reclaimed when the timeout elapses even if the
/// service never comes back for it.
pub struct DockerSandbox {
    docker: Docker,
    config: SandboxSection,
}

impl DockerSandbox {
    pub fn connect(config: SandboxSection) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::Provisioning {
                image: config.image.clone(),
                message: format!("cannot connect to Docker: {}", e),
            }
        })?;
        Ok(Self { docker, config })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), BollardError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let (from_image, tag) = split_image_tag(image);
        info!(image, "pulling sandbox image");
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    async fn start_sandbox(&self, name: &str, image: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(name, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|e| SandboxError::Provisioning {
                image: image.to_string(),
                message: e.to_string(),
            })?;

        // The clone lands in `<workdir>/repo`; make sure the parent exists.
        let mkdir = format!("mkdir -p {}", shell_quote(&self.config.workdir));
        let output = self.exec(name, &mkdir, &ExecOptions::default()).await?;
        if !output.success() {
            return Err(SandboxError::Provisioning {
                image: image.to_string(),
                message: format!("cannot prepare workdir: {}", output.stderr.trim()),
            });
        }
        Ok(())
    }

    async fn remove_sandbox(&self, name: &str) {
        let options = RemoveContainerOptionsBuilder::new().force(true).build();
        match self.docker.remove_container(name, Some(options)).await {
            Ok(_) => debug!(sandbox_id = name, "removed half-provisioned sandbox"),
            Err(e) => warn!(sandbox_id = name, error = %e, "failed to remove sandbox"),
        }
    }

    fn absolute(&self, path: &str) -> String {
        format!("{}/{}", self.config.workdir.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl SandboxProvider for DockerSandbox {
    async fn create(&self, image: &str, timeout: Duration) -> Result<String, SandboxError> {
        let provisioning = |e: BollardError| SandboxError::Provisioning {
            image: image.to_string(),
            message: e.to_string(),
        };

        self.ensure_image(image).await.map_err(provisioning)?;

        let name = format!("sentinel-{}", uuid::Uuid::new_v4().simple());
        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            cmd: Some(vec!["sleep".to_string(), timeout.as_secs().to_string()]),
            working_dir: Some(self.config.workdir.clone()),
            labels: Some(HashMap::from([(LABEL.to_string(), "sandbox".to_string())])),
            host_config: Some(HostConfig {
                auto_remove: Some(true),
                memory: self.config.memory_mb.map(|mb| (mb as i64) * 1024 * 1024),
                nano_cpus: self.config.cpus.map(|c| (c * 1_000_000_000.0) as i64),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&name).build()),
                body,
            )
            .await
            .map_err(provisioning)?;

        // From here on the container exists; a failed start must not leave it behind.
        cleanup_on_error(self.start_sandbox(&name, image), || self.remove_sandbox(&name)).await?;

        info!(sandbox_id = %name, image, "sandbox created");
        Ok(name)
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<CommandOutput, SandboxError> {
        debug!(sandbox_id, command, "exec");
        let exec = self
            .docker
            .create_exec(
                sandbox_id,
                ExecConfig {
                    cmd: Some(exec_argv(command, options.timeout)),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(self.config.workdir.clone()),
                    ..ExecConfig::default()
                },
            )
            .await
            .map_err(|e| exec_error(sandbox_id, e))?;

        let started = Instant::now();
        let deadline = options.timeout.map(|t| started + t + KILL_GRACE);
        let mut collector = OutputCollector::new(options);
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| exec_error(sandbox_id, e))?
        {
            loop {
                let next = match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, output.next()).await {
                        Ok(next) => next,
                        Err(_) => break,
                    },
                    None => output.next().await,
                };
                let Some(chunk) = next else { break };
                match chunk {
                    Ok(bollard::container::LogOutput::StdOut { message }) => {
                        collector.push(OutputStream::Stdout, &String::from_utf8_lossy(&message));
                    }
                    Ok(bollard::container::LogOutput::StdErr { message }) => {
                        collector.push(OutputStream::Stderr, &String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    // Keep what was captured before the stream broke.
                    Err(e) => {
                        collector.push(OutputStream::Stderr, &format!("\n[stream error: {}]", e));
                        return Ok(collector.finish(-1));
                    }
                }
            }
        }

        if let Some(timeout) = options.timeout
            && started.elapsed() >= timeout
        {
            let exit_code = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .ok()
                .and_then(|inspect| inspect.exit_code);
            // No exit code means the stream was abandoned while still running.
            let killed = match exit_code {
                Some(code) => code == TIMEOUT_EXIT_CODE || code == KILLED_EXIT_CODE,
                None => true,
            };
            if killed {
                warn!(sandbox_id, command, timeout_secs = timeout.as_secs(), "command timed out");
                return Err(collector.timed_out(command, timeout));
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| exec_error(sandbox_id, e))?;
        Ok(collector.finish(inspect.exit_code.unwrap_or(-1)))
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, SandboxError> {
        let command = format!("cat -- {}", shell_quote(&self.absolute(path)));
        let output = self.exec(sandbox_id, &command, &ExecOptions::default()).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(SandboxError::FileRead {
                path: path.to_string(),
                message: output.stderr.trim().to_string(),
            })
        }
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let target = shell_quote(&self.absolute(path));
        let mut command = format!("mkdir -p \"$(dirname {target})\" && : > {target}");
        let bytes = content.as_bytes();
        for chunk in bytes.chunks(WRITE_CHUNK_BYTES) {
            let encoded = BASE64.encode(chunk);
            command.push_str(&format!(" && printf '%s' '{encoded}' | base64 -d >> {target}"));
            if command.len() > WRITE_CHUNK_BYTES {
                run_write(self, sandbox_id, path, &command).await?;
                command = ":".to_string();
            }
        }
        run_write(self, sandbox_id, path, &command).await
    }

    async fn public_url(&self, sandbox_id: &str, port: u16) -> Result<String, SandboxError> {
        if let Some(ref template) = self.config.public_url_template {
            return Ok(render_url_template(template, sandbox_id, port));
        }
        let inspect = self
            .docker
            .inspect_container(sandbox_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| exec_error(sandbox_id, e))?;
        let ip = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| {
                networks
                    .into_values()
                    .filter_map(|endpoint| endpoint.ip_address)
                    .find(|ip| !ip.is_empty())
            })
            .ok_or_else(|| SandboxError::Unavailable {
                id: sandbox_id.to_string(),
            })?;
        Ok(format!("http://{}:{}", ip, port))
    }
}

async fn run_write(
    sandbox: &DockerSandbox,
    sandbox_id: &str,
    path: &str,
    command: &str,
) -> Result<(), SandboxError> {
    let output = sandbox
        .exec(sandbox_id, command, &ExecOptions::default())
        .await?;
    if output.success() {
        Ok(())
    } else {
        Err(SandboxError::Other(anyhow::anyhow!(
            "Failed to write {}: {}",
            path,
            output.stderr.trim()
        )))
    }
}

/// Exit status of a process ended by SIGKILL (128 + 9).
const KILLED_EXIT_CODE: i64 = 137;

/// Wrap `command` in coreutils `timeout` so the process inside the container
/// dies with its deadline instead of outliving the exec stream.
fn exec_argv(command: &str, timeout: Option<Duration>) -> Vec<String> {
    let shell = ["sh".to_string(), "-c".to_string(), command.to_string()];
    match timeout {
        Some(timeout) => {
            let secs = timeout.as_secs().max(1);
            ["timeout", "-s", "KILL", &secs.to_string()]
                .into_iter()
                .map(str::to_string)
                .chain(shell)
                .collect()
        }
        None => shell.to_vec(),
    }
}

/// Await `work`; if it fails, run `cleanup` before handing the error back.
async fn cleanup_on_error<T, E, W, C, CF>(work: W, cleanup: C) -> Result<T, E>
where
    W: Future<Output = Result<T, E>>,
    C: FnOnce() -> CF,
    CF: Future<Output = ()>,
{
    let result = work.await;
    if result.is_err() {
        cleanup().await;
    }
    result
}

fn exec_error(sandbox_id: &str, e: BollardError) -> SandboxError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => SandboxError::Unavailable {
            id: sandbox_id.to_string(),
        },
        other => SandboxError::Other(anyhow::anyhow!("Docker request failed: {}", other)),
    }
}

/// `name[:tag]` → (name, tag). A colon inside a registry host (`host:5000/img`)
/// is not a tag separator.
fn split_image_tag(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

fn render_url_template(template: &str, sandbox_id: &str, port: u16) -> String {
    template
        .replace("{port}", &port.to_string())
        .replace("{sandbox_id}", sandbox_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_tag() {
        assert_eq!(split_image_tag("code-sentinel-dev"), ("code-sentinel-dev", "latest"));
        assert_eq!(split_image_tag("node:22-slim"), ("node", "22-slim"));
        assert_eq!(
            split_image_tag("localhost:5000/sentinel"),
            ("localhost:5000/sentinel", "latest")
        );
        assert_eq!(
            split_image_tag("localhost:5000/sentinel:v2"),
            ("localhost:5000/sentinel", "v2")
        );
    }

    #[test]
    fn test_exec_argv_wraps_timeout() {
        assert_eq!(exec_argv("npm test", None), vec!["sh", "-c", "npm test"]);
        assert_eq!(
            exec_argv("npm start", Some(Duration::from_secs(90))),
            vec!["timeout", "-s", "KILL", "90", "sh", "-c", "npm start"]
        );
        // Sub-second timeouts still kill rather than disabling the limit.
        assert_eq!(exec_argv("ls", Some(Duration::from_millis(10)))[3], "1");
    }

    #[tokio::test]
    async fn test_cleanup_runs_only_after_failed_provisioning() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let removed = AtomicUsize::new(0);
        let cleanup = || async {
            removed.fetch_add(1, Ordering::SeqCst);
        };

        let failed: Result<(), SandboxError> = cleanup_on_error(
            async {
                Err(SandboxError::Provisioning {
                    image: "img".into(),
                    message: "start failed".into(),
                })
            },
            cleanup,
        )
        .await;
        assert!(matches!(failed, Err(SandboxError::Provisioning { .. })));
        assert_eq!(removed.load(Ordering::SeqCst), 1);

        let ok: Result<u8, SandboxError> = cleanup_on_error(async { Ok(7) }, cleanup).await;
        assert_eq!(ok.unwrap(), 7);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_render_url_template() {
        assert_eq!(
            render_url_template("https://{port}-{sandbox_id}.sbx.dev", "sentinel-abc", 3000),
            "https://3000-sentinel-abc.sbx.dev"
        );
    }
}
