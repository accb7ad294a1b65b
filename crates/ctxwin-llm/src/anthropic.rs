//! Anthropic Messages API adapter. Client-side history only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use ctxwin_core::adapter::{
    ModelAdapter, ModelHandle, ModelRequest, ModelTurn, PendingToolCall, ToolBinding,
};
use ctxwin_core::errors::AdapterError;
use ctxwin_core::record::{Entry, RecordKind};
use ctxwin_core::tools::ToolExecutor;

use crate::render::{self, ToolSlot};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    client: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    tools: ToolSlot,
}

impl AnthropicAdapter {
    pub fn new(
        model: impl Into<String>,
        api_key: SecretString,
        base_url: Option<String>,
    ) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AdapterError::NetworkError(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            model: model.into(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            tools: ToolSlot::default(),
        })
    }

    pub fn from_env(
        model: impl Into<String>,
        key_env: &str,
        base_url: Option<String>,
    ) -> Result<Self, AdapterError> {
        Self::new(model, render::api_key_from_env(key_env)?, base_url)
    }

    pub fn into_handle(self) -> ModelHandle {
        let adapter = Arc::new(self);
        ModelHandle::new(adapter.clone())
            .with_tool_binding(adapter)
            .with_call_options()
    }

    async fn send(&self, body: &Value, cancel: &CancellationToken) -> Result<Value, AdapterError> {
        let request = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body);

        let exchange = async {
            let resp = request
                .send()
                .await
                .map_err(|e| AdapterError::NetworkError(e.to_string()))?;
            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                return Err(AdapterError::from_status(status, body));
            }
            resp.json::<Value>()
                .await
                .map_err(|e| AdapterError::InvalidResponse(e.to_string()))
        };

        tokio::select! {
            result = exchange => result,
            () = cancel.cancelled() => Err(AdapterError::Cancelled),
        }
    }
}

/// Build a Messages request body. System prompts become system blocks;
/// tool traffic is sent as user text; consecutive same-role turns merge.
pub fn build_request_body(model: &str, history: &[Entry], tools: &[Value]) -> Value {
    let mut system = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for entry in history.iter().filter(|e| !e.content.is_empty()) {
        let (role, text) = match entry.kind {
            RecordKind::SystemPrompt => {
                system.push(json!({"type": "text", "text": entry.content}));
                continue;
            }
            RecordKind::Prompt => ("user", entry.content.clone()),
            RecordKind::ModelResponse => ("assistant", entry.content.clone()),
            RecordKind::ToolCall | RecordKind::ToolOutput => (
                "user",
                format!("{}{}", render::prefix(entry.kind), entry.content),
            ),
        };
        let block = json!({"type": "text", "text": text});
        match messages.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(content) = last["content"].as_array_mut() {
                    content.push(block);
                }
            }
            _ => messages.push(json!({"role": role, "content": [block]})),
        }
    }

    let mut body = json!({
        "model": model,
        "max_tokens": MAX_TOKENS,
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = Value::Array(system);
    }
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools.to_vec());
    }
    body
}

/// Extract text blocks, tool_use blocks and input+output usage.
pub fn parse_response(value: &Value) -> Result<ModelTurn, AdapterError> {
    let content = value
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::InvalidResponse("missing content array".into()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => tool_calls.push(PendingToolCall {
                id: block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                arguments: block
                    .get("input")
                    .map_or_else(|| "{}".to_string(), Value::to_string),
            }),
            other => debug!(block_type = ?other, "skipping content block"),
        }
    }

    let usage = |key: &str| {
        value
            .get("usage")
            .and_then(|u| u.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };

    Ok(ModelTurn {
        text,
        tool_calls,
        continuation_token: None,
        tokens_used: usage("input_tokens") + usage("output_tokens"),
    })
}

#[async_trait]
impl ModelAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip(self, request), fields(model = %self.model, entries = request.history.len()))]
    async fn call(&self, request: ModelRequest) -> Result<ModelTurn, AdapterError> {
        let tools = render::tool_payloads(
            self.tools.definitions(request.options.disable_tools),
            |spec| spec.to_anthropic(),
        );
        let body = build_request_body(&self.model, &request.history, &tools);
        let value = self.send(&body, &request.options.cancel).await?;
        parse_response(&value)
    }
}

impl ToolBinding for AnthropicAdapter {
    fn bind_tools(&self, executor: Arc<dyn ToolExecutor>) {
        self.tools.bind(executor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_splits_system_and_merges_roles() {
        let history = vec![
            Entry::system("be brief"),
            Entry::prompt("run echo"),
            Entry::tool_call("echo", "{}"),
            Entry::tool_output("{}"),
            Entry::model_response("done", None),
        ];
        let body = build_request_body("claude-sonnet-4-5", &history, &[]);
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["system"][0]["text"], "be brief");

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"].as_array().unwrap().len(), 3);
        assert_eq!(messages[0]["content"][1]["text"], "Tool Call: echo({})");
        assert_eq!(messages[1]["role"], "assistant");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn body_includes_tools() {
        let tools = vec![json!({"name": "echo", "input_schema": {"type": "object"}})];
        let body = build_request_body("m", &[Entry::prompt("hi")], &tools);
        assert_eq!(body["tools"][0]["name"], "echo");
        assert!(body.get("system").is_none());
    }

    #[test]
    fn parse_text_and_tool_use() {
        let value = json!({
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_1", "name": "echo", "input": {"x": 1}}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 8}
        });
        let turn = parse_response(&value).unwrap();
        assert_eq!(turn.text, "Let me check.");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].arguments, "{\"x\":1}");
        assert_eq!(turn.tokens_used, 20);
        assert!(turn.continuation_token.is_none());
    }

    #[test]
    fn parse_rejects_missing_content() {
        assert!(matches!(
            parse_response(&json!({})),
            Err(AdapterError::InvalidResponse(_))
        ));
    }

    #[test]
    fn handle_has_no_threading() {
        let adapter = AnthropicAdapter::new("m", SecretString::from("key"), None).unwrap();
        let handle = adapter.into_handle();
        assert!(!handle.supports_threading());
        assert!(handle.supports_call_options());
    }
}
