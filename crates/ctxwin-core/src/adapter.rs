//! The boundary to concrete model integrations.
//!
//! An adapter always implements [`ModelAdapter`]. Threading, tool binding,
//! middleware and call options are optional capabilities gathered once into
//! a [`ModelHandle`] when the adapter is constructed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::AdapterError;
use crate::record::Entry;
use crate::tools::{Middleware, ToolExecutor};

/// Per-call options. `cancel` is always forwarded; the remaining fields only
/// reach adapters with the call-options capability.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub disable_tools: bool,
    pub cancel: CancellationToken,
}

impl CallOptions {
    pub fn without_tools() -> Self {
        Self {
            disable_tools: true,
            ..Self::default()
        }
    }

    fn is_default(&self) -> bool {
        !self.disable_tools
    }
}

#[derive(Clone, Debug, Default)]
pub struct ModelRequest {
    pub history: Vec<Entry>,
    pub options: CallOptions,
}

#[derive(Clone, Debug, Default)]
pub struct ThreadedRequest {
    pub use_server_side: bool,
    pub last_token: Option<String>,
    /// Full live history. In server-side mode the adapter transmits only the
    /// newest prompt alongside `last_token`, and keeps the rest for fallback.
    pub history: Vec<Entry>,
    pub options: CallOptions,
}

/// A tool invocation the model asked for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingToolCall {
    /// Provider-assigned call id. Informational: outputs are persisted in
    /// call order, so nothing is keyed by it.
    pub id: String,
    pub name: String,
    /// Raw JSON argument text.
    pub arguments: String,
}

/// One model round trip. Non-empty `tool_calls` means the model wants tool
/// results before it produces a final answer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTurn {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<PendingToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    pub tokens_used: u64,
}

impl ModelTurn {
    pub fn text(text: impl Into<String>, tokens_used: u64) -> Self {
        Self {
            text: text.into(),
            tokens_used,
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.continuation_token = Some(token.into());
        self
    }

    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, request: ModelRequest) -> Result<ModelTurn, AdapterError>;
}

/// Threading capability: a call may reference earlier output by token.
#[async_trait]
pub trait ThreadedModel: Send + Sync {
    async fn call_threaded(&self, request: ThreadedRequest) -> Result<ModelTurn, AdapterError>;
}

/// Receives the session's tool executor so the adapter can advertise tools.
pub trait ToolBinding: Send + Sync {
    fn bind_tools(&self, executor: Arc<dyn ToolExecutor>);
}

/// Receives observers for tools the adapter dispatches on its own.
pub trait MiddlewareSink: Send + Sync {
    fn set_middleware(&self, middleware: Vec<Arc<dyn Middleware>>);
}

/// An adapter plus whichever optional capabilities it declared.
#[derive(Clone)]
pub struct ModelHandle {
    base: Arc<dyn ModelAdapter>,
    threading: Option<Arc<dyn ThreadedModel>>,
    tool_binding: Option<Arc<dyn ToolBinding>>,
    middleware: Option<Arc<dyn MiddlewareSink>>,
    call_options: bool,
}

impl ModelHandle {
    pub fn new(base: Arc<dyn ModelAdapter>) -> Self {
        Self {
            base,
            threading: None,
            tool_binding: None,
            middleware: None,
            call_options: false,
        }
    }

    pub fn with_threading(mut self, threading: Arc<dyn ThreadedModel>) -> Self {
        self.threading = Some(threading);
        self
    }

    pub fn with_tool_binding(mut self, binding: Arc<dyn ToolBinding>) -> Self {
        self.tool_binding = Some(binding);
        self
    }

    pub fn with_middleware(mut self, sink: Arc<dyn MiddlewareSink>) -> Self {
        self.middleware = Some(sink);
        self
    }

    pub fn with_call_options(mut self) -> Self {
        self.call_options = true;
        self
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn supports_threading(&self) -> bool {
        self.threading.is_some()
    }

    pub fn supports_call_options(&self) -> bool {
        self.call_options
    }

    /// Hand the executor to the adapter. Returns false when the adapter
    /// has no tool-binding capability.
    pub fn bind_tools(&self, executor: Arc<dyn ToolExecutor>) -> bool {
        match &self.tool_binding {
            Some(binding) => {
                binding.bind_tools(executor);
                true
            }
            None => false,
        }
    }

    pub fn set_middleware(&self, middleware: Vec<Arc<dyn Middleware>>) -> bool {
        match &self.middleware {
            Some(sink) => {
                sink.set_middleware(middleware);
                true
            }
            None => false,
        }
    }

    fn effective_options(&self, options: CallOptions) -> CallOptions {
        if self.call_options || options.is_default() {
            return options;
        }
        debug!(adapter = self.name(), "adapter ignores call options, using defaults");
        CallOptions {
            cancel: options.cancel,
            ..CallOptions::default()
        }
    }

    pub async fn call(
        &self,
        history: Vec<Entry>,
        options: CallOptions,
    ) -> Result<ModelTurn, AdapterError> {
        let options = self.effective_options(options);
        self.base.call(ModelRequest { history, options }).await
    }

    pub async fn call_threaded(
        &self,
        request: ThreadedRequest,
    ) -> Result<ModelTurn, AdapterError> {
        let Some(threading) = &self.threading else {
            return Err(AdapterError::Unsupported(format!(
                "{} has no threading capability",
                self.name()
            )));
        };
        let options = self.effective_options(request.options);
        threading
            .call_threaded(ThreadedRequest { options, ..request })
            .await
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("adapter", &self.name())
            .field("threading", &self.threading.is_some())
            .field("tool_binding", &self.tool_binding.is_some())
            .field("middleware", &self.middleware.is_some())
            .field("call_options", &self.call_options)
            .finish()
    }
}
