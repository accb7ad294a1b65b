use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use ctxwin_core::adapter::{
    CallOptions, MiddlewareSink, ModelAdapter, ModelHandle, ModelRequest, ModelTurn,
    PendingToolCall, ThreadedModel, ThreadedRequest, ToolBinding,
};
use ctxwin_core::errors::AdapterError;
use ctxwin_core::record::Entry;
use ctxwin_core::tools::{Middleware, ToolExecutor};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Turn(ModelTurn),
    /// Return an error from the call itself.
    Error(AdapterError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Final text response.
    pub fn text(text: &str, tokens_used: u64) -> Self {
        Self::Turn(ModelTurn::text(text, tokens_used))
    }

    /// Final text response carrying a continuation token.
    pub fn threaded(text: &str, token: &str, tokens_used: u64) -> Self {
        Self::Turn(ModelTurn::text(text, tokens_used).with_token(token))
    }

    /// A turn asking for one tool call.
    pub fn tool_call(name: &str, arguments: &str, tokens_used: u64) -> Self {
        Self::Turn(ModelTurn {
            tool_calls: vec![PendingToolCall {
                id: format!("call_{name}"),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
            tokens_used,
            ..ModelTurn::default()
        })
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// What one call to the scripted adapter received.
#[derive(Clone, Debug)]
pub struct RecordedCall {
    /// `Some((use_server_side, last_token))` for threaded calls.
    pub threading: Option<(bool, Option<String>)>,
    pub history: Vec<Entry>,
    pub disable_tools: bool,
}

/// Adapter that returns pre-programmed responses in sequence and records
/// every request.
pub struct ScriptedAdapter {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
    tools: Mutex<Option<Arc<dyn ToolExecutor>>>,
    middleware: Mutex<Vec<Arc<dyn Middleware>>>,
}

impl ScriptedAdapter {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            tools: Mutex::new(None),
            middleware: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Names advertised by the bound executor, if any.
    pub fn bound_tool_names(&self) -> Option<Vec<String>> {
        self.tools
            .lock()
            .as_ref()
            .map(|exec| exec.definitions().into_iter().map(|d| d.name).collect())
    }

    pub fn middleware_count(&self) -> usize {
        self.middleware.lock().len()
    }

    /// Handle declaring every optional capability.
    pub fn into_handle(self: Arc<Self>) -> ModelHandle {
        ModelHandle::new(self.clone())
            .with_threading(self.clone())
            .with_tool_binding(self.clone())
            .with_middleware(self)
            .with_call_options()
    }

    /// Handle with only the required capability.
    pub fn into_plain_handle(self: Arc<Self>) -> ModelHandle {
        ModelHandle::new(self)
    }

    async fn respond(
        &self,
        call: RecordedCall,
        options: &CallOptions,
    ) -> Result<ModelTurn, AdapterError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(call);

        let Some(response) = self.responses.get(idx) else {
            return Err(AdapterError::InvalidRequest(format!(
                "ScriptedAdapter: no response configured for call {idx}"
            )));
        };

        let mut current = response;
        loop {
            match current {
                MockResponse::Turn(turn) => return Ok(turn.clone()),
                MockResponse::Error(e) => return Err(e.clone()),
                MockResponse::Delay(duration, inner) => {
                    tokio::select! {
                        () = tokio::time::sleep(*duration) => current = inner,
                        () = options.cancel.cancelled() => return Err(AdapterError::Cancelled),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ModelAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn call(&self, request: ModelRequest) -> Result<ModelTurn, AdapterError> {
        let call = RecordedCall {
            threading: None,
            history: request.history,
            disable_tools: request.options.disable_tools,
        };
        self.respond(call, &request.options).await
    }
}

#[async_trait]
impl ThreadedModel for ScriptedAdapter {
    async fn call_threaded(&self, request: ThreadedRequest) -> Result<ModelTurn, AdapterError> {
        let call = RecordedCall {
            threading: Some((request.use_server_side, request.last_token)),
            history: request.history,
            disable_tools: request.options.disable_tools,
        };
        self.respond(call, &request.options).await
    }
}

impl ToolBinding for ScriptedAdapter {
    fn bind_tools(&self, executor: Arc<dyn ToolExecutor>) {
        *self.tools.lock() = Some(executor);
    }
}

impl MiddlewareSink for ScriptedAdapter {
    fn set_middleware(&self, middleware: Vec<Arc<dyn Middleware>>) {
        *self.middleware.lock() = middleware;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn request(prompt: &str) -> ModelRequest {
        ModelRequest {
            history: vec![Entry::prompt(prompt)],
            options: CallOptions::default(),
        }
    }

    #[tokio::test]
    async fn text_response() {
        let mock = ScriptedAdapter::new(vec![MockResponse::text("hello world", 4)]);
        let turn = mock.call(request("hi")).await.unwrap();
        assert_eq!(turn.text, "hello world");
        assert_eq!(turn.tokens_used, 4);
        assert!(!turn.wants_tools());
        assert_eq!(mock.calls()[0].history, vec![Entry::prompt("hi")]);
    }

    #[tokio::test]
    async fn error_response() {
        let mock = ScriptedAdapter::new(vec![MockResponse::Error(
            AdapterError::AuthenticationFailed("bad".into()),
        )]);
        let result = mock.call(request("hi")).await;
        assert!(matches!(result, Err(AdapterError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn sequential_responses_and_exhaustion() {
        let mock = ScriptedAdapter::new(vec![
            MockResponse::tool_call("echo", "{}", 1),
            MockResponse::text("second", 1),
        ]);
        let first = mock.call(request("a")).await.unwrap();
        assert_eq!(first.tool_calls[0].name, "echo");
        let second = mock.call(request("b")).await.unwrap();
        assert_eq!(second.text, "second");
        assert_eq!(mock.call_count(), 2);
        assert!(mock.call(request("c")).await.is_err());
    }

    #[tokio::test]
    async fn threaded_call_is_recorded() {
        let mock = ScriptedAdapter::new(vec![MockResponse::threaded("ok", "resp_2", 1)]);
        let turn = mock
            .call_threaded(ThreadedRequest {
                use_server_side: true,
                last_token: Some("resp_1".into()),
                history: vec![Entry::prompt("next")],
                options: CallOptions::default(),
            })
            .await
            .unwrap();
        assert_eq!(turn.continuation_token.as_deref(), Some("resp_2"));
        assert_eq!(
            mock.calls()[0].threading,
            Some((true, Some("resp_1".to_string())))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_response() {
        let mock = ScriptedAdapter::new(vec![MockResponse::delayed(
            Duration::from_millis(50),
            MockResponse::text("after delay", 1),
        )]);
        let start = tokio::time::Instant::now();
        let turn = mock.call(request("hi")).await.unwrap();
        assert_eq!(turn.text, "after delay");
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn delay_honors_cancellation() {
        let mock = ScriptedAdapter::new(vec![MockResponse::delayed(
            Duration::from_secs(3600),
            MockResponse::text("never", 1),
        )]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = mock
            .call(ModelRequest {
                history: vec![],
                options: CallOptions {
                    disable_tools: false,
                    cancel,
                },
            })
            .await;
        assert!(matches!(result, Err(AdapterError::Cancelled)));
    }

    #[test]
    fn full_handle_declares_capabilities() {
        let handle = Arc::new(ScriptedAdapter::new(vec![])).into_handle();
        assert!(handle.supports_threading());
        assert!(handle.supports_call_options());
        assert!(handle.set_middleware(vec![]));

        let plain = Arc::new(ScriptedAdapter::new(vec![])).into_plain_handle();
        assert!(!plain.supports_threading());
    }
}
