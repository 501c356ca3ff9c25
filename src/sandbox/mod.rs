//! Sandbox gateway: orchestration-level commands on top of an ephemeral
//! execution provider.
//!
//! `SandboxProvider` is the raw provider surface (Docker in production, an
//! in-memory fake in tests). `SandboxGateway` scopes everything to the
//! `repo/` clone directory and turns non-zero exits into
//! `SandboxError::Command` with both buffers attached. Neither layer retries;
//! retry policy belongs to the step runner.
//!
//! Commands the agent runs are bounded by the gateway's command timeout. A
//! command that outlives it is killed and reported as a `Command` failure
//! carrying whatever output was captured, with exit code
//! [`TIMEOUT_EXIT_CODE`]. Output can be observed while the command runs
//! through an [`OutputHook`]; the returned buffers are complete either way.

mod docker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use docker::DockerSandbox;

use crate::errors::SandboxError;

/// Clone directory inside the sandbox working directory.
pub const REPO_DIR: &str = "repo";

/// Exit code reported for a command killed by its timeout, as coreutils
/// `timeout` does.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives output chunks as a command produces them.
pub type OutputHook = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ExecOptions {
    /// Kill the command once this elapses.
    pub timeout: Option<Duration>,
    pub on_output: Option<OutputHook>,
}

/// Accumulates both streams of one command and forwards each chunk to the
/// hook, so a timeout can still report everything seen so far.
pub struct OutputCollector<'a> {
    output: CommandOutput,
    hook: Option<&'a OutputHook>,
}

impl<'a> OutputCollector<'a> {
    pub fn new(options: &'a ExecOptions) -> Self {
        Self {
            output: CommandOutput::default(),
            hook: options.on_output.as_ref(),
        }
    }

    pub fn push(&mut self, stream: OutputStream, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        match stream {
            OutputStream::Stdout => self.output.stdout.push_str(chunk),
            OutputStream::Stderr => self.output.stderr.push_str(chunk),
        }
        if let Some(hook) = self.hook {
            hook(stream, chunk);
        }
    }

    pub fn finish(mut self, exit_code: i64) -> CommandOutput {
        self.output.exit_code = exit_code;
        self.output
    }

    pub fn timed_out(self, command: &str, after: Duration) -> SandboxError {
        let mut stderr = self.output.stderr;
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("[killed after {}s timeout]", after.as_secs()));
        SandboxError::Command {
            command: command.to_string(),
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: self.output.stdout,
            stderr,
        }
    }
}

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Raw provider operations. Paths are relative to the sandbox working
/// directory.
/// Real implementation: `DockerSandbox`. Test double: `testing::FakeSandbox`.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Create a sandbox from `image` that the provider reclaims after `timeout`.
    async fn create(&self, image: &str, timeout: Duration) -> Result<String, SandboxError>;

    /// Run a shell command. A non-zero exit is reported in the output, not as
    /// an error. Exceeding `options.timeout` kills the command and returns
    /// [`OutputCollector::timed_out`].
    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<CommandOutput, SandboxError>;

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, SandboxError>;

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str)
    -> Result<(), SandboxError>;

    /// Publicly reachable URL for a port inside the sandbox.
    async fn public_url(&self, sandbox_id: &str, port: u16) -> Result<String, SandboxError>;
}

#[derive(Clone)]
pub struct SandboxGateway {
    provider: Arc<dyn SandboxProvider>,
    command_timeout: Option<Duration>,
}

impl SandboxGateway {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            provider,
            command_timeout: None,
        }
    }

    /// Bound every clone and agent command by `timeout`.
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub async fn create_sandbox(
        &self,
        image: &str,
        timeout: Duration,
    ) -> Result<String, SandboxError> {
        self.provider.create(image, timeout).await
    }

    /// Fresh shallow clone of `repo_url` into `repo/`, replacing any previous clone.
    pub async fn clone_repo(
        &self,
        sandbox_id: &str,
        repo_url: &str,
    ) -> Result<CommandOutput, SandboxError> {
        let command = format!(
            "rm -rf {dir} && git clone --depth=1 {url} {dir}",
            dir = REPO_DIR,
            url = shell_quote(repo_url)
        );
        self.checked(sandbox_id, &command, None).await
    }

    /// Run `command` from the clone root.
    pub async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
    ) -> Result<CommandOutput, SandboxError> {
        self.run_command_streaming(sandbox_id, command, None).await
    }

    /// [`run_command`](Self::run_command), handing output chunks to
    /// `on_output` as they arrive.
    pub async fn run_command_streaming(
        &self,
        sandbox_id: &str,
        command: &str,
        on_output: Option<OutputHook>,
    ) -> Result<CommandOutput, SandboxError> {
        let scoped = format!("cd {} && {}", REPO_DIR, command);
        self.checked(sandbox_id, &scoped, on_output).await
    }

    pub async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, SandboxError> {
        self.provider.read_file(sandbox_id, &repo_path(path)).await
    }

    pub async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        self.provider
            .write_file(sandbox_id, &repo_path(path), content)
            .await
    }

    pub async fn expose_port(&self, sandbox_id: &str, port: u16) -> Result<String, SandboxError> {
        self.provider.public_url(sandbox_id, port).await
    }

    async fn checked(
        &self,
        sandbox_id: &str,
        command: &str,
        on_output: Option<OutputHook>,
    ) -> Result<CommandOutput, SandboxError> {
        let options = ExecOptions {
            timeout: self.command_timeout,
            on_output,
        };
        let output = self.provider.exec(sandbox_id, command, &options).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(SandboxError::Command {
                command: command.to_string(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }
}

/// `repo/<path>`, with leading `./` and `/` stripped from `path`.
pub fn repo_path(path: &str) -> String {
    let trimmed = path.trim_start_matches("./").trim_start_matches('/');
    format!("{}/{}", REPO_DIR, trimmed)
}

/// Quote `value` for POSIX `sh` as a single argument.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
