//! OpenAI Responses API adapter. Threading-capable through
//! `previous_response_id`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use ctxwin_core::adapter::{
    ModelAdapter, ModelHandle, ModelRequest, ModelTurn, PendingToolCall, ThreadedModel,
    ThreadedRequest, ToolBinding,
};
use ctxwin_core::errors::AdapterError;
use ctxwin_core::tools::ToolExecutor;

use crate::render::{self, ToolSlot};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OpenAiResponsesAdapter {
    client: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    tools: ToolSlot,
}

impl OpenAiResponsesAdapter {
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

    /// Build with the API key read from `key_env`.
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
            .with_threading(adapter.clone())
            .with_tool_binding(adapter)
            .with_call_options()
    }

    fn tool_params(&self, disable_tools: bool) -> Vec<Value> {
        render::tool_payloads(self.tools.definitions(disable_tools), |spec| {
            spec.to_openai()
        })
    }

    async fn send(&self, body: &Value, cancel: &CancellationToken) -> Result<Value, AdapterError> {
        let request = self
            .client
            .post(format!("{}/responses", self.base_url))
            .header(
                "authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
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

/// Request body for one Responses call. `input` is a rendered transcript or
/// a single prompt line.
pub fn build_request_body(
    model: &str,
    input: &str,
    tools: &[Value],
    previous_response_id: Option<&str>,
) -> Value {
    let mut body = json!({
        "model": model,
        "input": input,
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools.to_vec());
        body["parallel_tool_calls"] = Value::Bool(true);
    }
    if let Some(id) = previous_response_id {
        body["previous_response_id"] = Value::String(id.to_string());
    }
    body
}

/// Extract text, function calls, the response id and total usage.
pub fn parse_response(value: &Value) -> Result<ModelTurn, AdapterError> {
    let output = value
        .get("output")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::InvalidResponse("missing output array".into()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for item in output {
        match item.get("type").and_then(Value::as_str) {
            Some("message") => {
                let parts = item
                    .get("content")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter(|c| c.get("type").and_then(Value::as_str) == Some("output_text"))
                    .filter_map(|c| c.get("text").and_then(Value::as_str));
                for part in parts {
                    text.push_str(part);
                }
            }
            Some("function_call") => {
                let field = |key: &str| {
                    item.get(key)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                tool_calls.push(PendingToolCall {
                    id: field("call_id"),
                    name: field("name"),
                    arguments: field("arguments"),
                });
            }
            other => debug!(item_type = ?other, "skipping output item"),
        }
    }

    Ok(ModelTurn {
        text,
        tool_calls,
        continuation_token: value
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(String::from),
        tokens_used: value
            .pointer("/usage/total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

#[async_trait]
impl ModelAdapter for OpenAiResponsesAdapter {
    fn name(&self) -> &str {
        "openai-responses"
    }

    #[instrument(skip(self, request), fields(model = %self.model, entries = request.history.len()))]
    async fn call(&self, request: ModelRequest) -> Result<ModelTurn, AdapterError> {
        let tools = self.tool_params(request.options.disable_tools);
        let body = build_request_body(
            &self.model,
            &render::transcript(&request.history),
            &tools,
            None,
        );
        let value = self.send(&body, &request.options.cancel).await?;
        parse_response(&value)
    }
}

#[async_trait]
impl ThreadedModel for OpenAiResponsesAdapter {
    #[instrument(
        skip(self, request),
        fields(model = %self.model, server_side = request.use_server_side)
    )]
    async fn call_threaded(&self, request: ThreadedRequest) -> Result<ModelTurn, AdapterError> {
        let tools = self.tool_params(request.options.disable_tools);
        let full = render::transcript(&request.history);
        let cancel = &request.options.cancel;

        let previous = request
            .last_token
            .as_deref()
            .filter(|t| request.use_server_side && !t.is_empty());
        let Some(previous) = previous else {
            let body = build_request_body(&self.model, &full, &tools, None);
            return parse_response(&self.send(&body, cancel).await?);
        };

        let body = match render::latest_prompt(&request.history) {
            Some(prompt) => build_request_body(&self.model, &prompt, &tools, Some(previous)),
            None => build_request_body(&self.model, &full, &tools, None),
        };
        match self.send(&body, cancel).await {
            Ok(value) => parse_response(&value),
            Err(AdapterError::Cancelled) => Err(AdapterError::Cancelled),
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "threaded request failed, retrying with full history");
                let body = build_request_body(&self.model, &full, &tools, None);
                parse_response(&self.send(&body, cancel).await?)
            }
        }
    }
}

impl ToolBinding for OpenAiResponsesAdapter {
    fn bind_tools(&self, executor: Arc<dyn ToolExecutor>) {
        self.tools.bind(executor);
    }
}
