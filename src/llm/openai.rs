use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{ChatMessage, ChatModel, ModelReply, RequestRejected, ToolCall, ToolSpec};
use crate::config::ModelSection;

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiClient {
    http: reqwest::Client,
    config: ModelSection,
}

impl OpenAiClient {
    pub fn new(config: ModelSection) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ModelReply> {
        let body = request_body(&self.config, messages, tools);
        let mut request = self.http.post(self.endpoint()).json(&body);
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .context("Failed to send chat completion request")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, text.trim()));
        }
        let payload: Value = resp
            .json()
            .await
            .context("Failed to parse chat completion response")?;
        let reply = parse_reply(payload)?;
        debug!(
            tool_calls = reply.tool_calls.len(),
            has_text = reply.content.is_some(),
            "model replied"
        );
        Ok(reply)
    }
}

/// Client errors other than rate limiting and request timeouts are
/// permanent; everything else may clear up on its own.
fn status_error(status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    let transient = matches!(
        status,
        reqwest::StatusCode::TOO_MANY_REQUESTS | reqwest::StatusCode::REQUEST_TIMEOUT
    );
    if status.is_client_error() && !transient {
        anyhow::Error::new(RequestRejected {
            status: status.as_u16(),
            body: body.to_string(),
        })
    } else {
        anyhow::anyhow!("Chat completion endpoint returned {}: {}", status, body)
    }
}

fn request_body(config: &ModelSection, messages: &[ChatMessage], tools: &[ToolSpec]) -> Value {
    let tools: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect();
    json!({
        "model": config.model,
        "temperature": config.temperature,
        "messages": messages,
        "tools": tools,
        "tool_choice": "auto",
        "parallel_tool_calls": false,
    })
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

fn parse_reply(payload: Value) -> Result<ModelReply> {
    let response: CompletionResponse =
        serde_json::from_value(payload).context("Unexpected chat completion shape")?;
    let message = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .context("Chat completion returned no choices")?;
    Ok(ModelReply {
        content: message.content.filter(|c| !c.trim().is_empty()),
        tool_calls: message.tool_calls.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let config = ModelSection::default();
        let tools = [ToolSpec {
            name: "terminal",
            description: "Run a command",
            parameters: json!({"type": "object"}),
        }];
        let body = request_body(&config, &[ChatMessage::user("hi")], &tools);
        assert_eq!(body["model"], "gpt-4.1-mini");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["tools"][0]["function"]["name"], "terminal");
        assert_eq!(body["parallel_tool_calls"], false);
    }

    #[test]
    fn test_status_errors_split_permanent_from_transient() {
        use crate::llm::is_retryable;
        use reqwest::StatusCode;

        for status in [StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED, StatusCode::NOT_FOUND] {
            let err = status_error(status, "nope");
            assert!(!is_retryable(&err), "{status} should be permanent");
            assert!(err.to_string().contains("nope"));
        }
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(is_retryable(&status_error(status, "")), "{status} should retry");
        }
    }

    #[test]
    fn test_parse_tool_call_reply() {
        let payload = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "readFiles", "arguments": "{\"files\":[\"a.js\"]}"}
                    }]
                }
            }]
        });
        let reply = parse_reply(payload).unwrap();
        assert!(reply.content.is_none());
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].function.name, "readFiles");
    }

    #[test]
    fn test_parse_text_reply_and_empty_choices() {
        let reply = parse_reply(json!({
            "choices": [{"message": {"content": "<task_summary>done</task_summary>"}}]
        }))
        .unwrap();
        assert_eq!(reply.content.as_deref(), Some("<task_summary>done</task_summary>"));
        assert!(reply.tool_calls.is_empty());

        assert!(parse_reply(json!({"choices": []})).is_err());
    }
}
