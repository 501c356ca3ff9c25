//! In-memory doubles for the sandbox provider and the chat model.
//!
//! Compiled for unit tests and behind the `test-support` feature for
//! integration suites.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::errors::SandboxError;
use crate::llm::{ChatMessage, ChatModel, ModelReply, RequestRejected, ToolSpec};
use crate::sandbox::{CommandOutput, ExecOptions, OutputCollector, OutputStream, SandboxProvider};

struct Scripted {
    pattern: String,
    output: CommandOutput,
}

/// Sandbox provider backed by a map of files and canned command replies.
///
/// Commands succeed with empty output unless a reply registered with
/// [`FakeSandbox::respond_to`] matches by substring; the most recently
/// registered match wins. Commands matching [`FakeSandbox::hang_on`] never
/// exit on their own.
#[derive(Default)]
pub struct FakeSandbox {
    created: AtomicUsize,
    failing_creates: AtomicUsize,
    live: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, String>>,
    replies: Mutex<Vec<Scripted>>,
    hanging: Mutex<Vec<(String, String)>>,
    commands: Mutex<Vec<String>>,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_to(&self, pattern: &str, exit_code: i64, stdout: &str, stderr: &str) {
        self.replies.lock().unwrap().push(Scripted {
            pattern: pattern.to_string(),
            output: CommandOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
            },
        });
    }

    /// Commands containing `pattern` print `stdout` and then block until
    /// their timeout, like a server started in the foreground.
    pub fn hang_on(&self, pattern: &str, stdout: &str) {
        self.hanging
            .lock()
            .unwrap()
            .push((pattern.to_string(), stdout.to_string()));
    }

    /// Make the next `n` create calls fail with a provisioning error.
    pub fn fail_next_creates(&self, n: usize) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    /// Forget a sandbox, as if the provider reclaimed it.
    pub fn expire(&self, sandbox_id: &str) {
        self.live.lock().unwrap().retain(|id| id != sandbox_id);
    }

    pub fn put_file(&self, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Every command run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// How many sandboxes were successfully created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn check_live(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        if self.live.lock().unwrap().iter().any(|id| id == sandbox_id) {
            Ok(())
        } else {
            Err(SandboxError::Unavailable {
                id: sandbox_id.to_string(),
            })
        }
    }
}

#[async_trait]
impl SandboxProvider for FakeSandbox {
    async fn create(&self, image: &str, _timeout: Duration) -> Result<String, SandboxError> {
        let failing = self.failing_creates.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_creates.store(failing - 1, Ordering::SeqCst);
            return Err(SandboxError::Provisioning {
                image: image.to_string(),
                message: "simulated outage".to_string(),
            });
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("fake-{}", n);
        self.live.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<CommandOutput, SandboxError> {
        self.check_live(sandbox_id)?;
        self.commands.lock().unwrap().push(command.to_string());
        let mut collector = OutputCollector::new(options);

        let hang = self
            .hanging
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, stdout)| stdout.clone());
        if let Some(stdout) = hang {
            collector.push(OutputStream::Stdout, &stdout);
            return match options.timeout {
                Some(timeout) => {
                    tokio::time::sleep(timeout).await;
                    Err(collector.timed_out(command, timeout))
                }
                None => std::future::pending().await,
            };
        }

        let reply = self
            .replies
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| command.contains(&r.pattern))
            .map(|r| r.output.clone())
            .unwrap_or_default();
        collector.push(OutputStream::Stdout, &reply.stdout);
        collector.push(OutputStream::Stderr, &reply.stderr);
        Ok(collector.finish(reply.exit_code))
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, SandboxError> {
        self.check_live(sandbox_id)?;
        self.file(path).ok_or_else(|| SandboxError::FileRead {
            path: path.to_string(),
            message: "No such file or directory".to_string(),
        })
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        self.check_live(sandbox_id)?;
        self.put_file(path, content);
        Ok(())
    }

    async fn public_url(&self, sandbox_id: &str, port: u16) -> Result<String, SandboxError> {
        self.check_live(sandbox_id)?;
        Ok(format!("https://{}-{}.sandbox.test", port, sandbox_id))
    }
}

enum ScriptedFailure {
    Transient(String),
    Rejected(u16, String),
}

/// Chat model that replays queued replies and records every request.
///
/// When the queue runs dry it keeps returning the fallback reply, if one
/// was set, or fails.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ModelReply, ScriptedFailure>>>,
    fallback: Option<ModelReply>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    /// A model that answers every turn with `reply`.
    pub fn repeating(reply: ModelReply) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::default()
        }
    }

    pub fn push(&self, reply: ModelReply) {
        self.replies.lock().unwrap().push_back(Ok(reply));
    }

    /// Queue an endpoint failure.
    pub fn push_error(&self, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(ScriptedFailure::Transient(message.to_string())));
    }

    /// Queue a refusal of the request itself, such as a 401.
    pub fn push_rejection(&self, status: u16, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(ScriptedFailure::Rejected(status, message.to_string())));
    }

    /// The transcript sent on each call.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage], _tools: &[ToolSpec]) -> Result<ModelReply> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(ScriptedFailure::Transient(message))) => Err(anyhow::anyhow!(message)),
            Some(Err(ScriptedFailure::Rejected(status, body))) => {
                Err(anyhow::Error::new(RequestRejected { status, body }))
            }
            None => self
                .fallback
                .clone()
                .ok_or_else(|| anyhow::anyhow!("scripted model has no more replies")),
        }
    }
}
