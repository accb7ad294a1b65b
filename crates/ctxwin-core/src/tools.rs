use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::builder::ToolSpec;

/// Context available to tool runners during execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub context_name: String,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(context_name: impl Into<String>) -> Self {
        Self {
            context_name: context_name.into(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Definition advertised to model adapters. Either a structured spec from
/// [`crate::builder::ToolBuilder`] or an adapter-specific JSON payload that
/// is passed through untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub schema: ToolSchema,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ToolSchema {
    Spec(ToolSpec),
    Raw { definition: serde_json::Value },
}

impl ToolDefinition {
    pub fn from_spec(spec: ToolSpec) -> Self {
        Self {
            name: spec.name.clone(),
            schema: ToolSchema::Spec(spec),
        }
    }

    pub fn raw(name: impl Into<String>, definition: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            schema: ToolSchema::Raw { definition },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool '{0}' not registered")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("cancelled")]
    Cancelled,
    #[error("tool registered as '{registered}' but its definition advertises '{advertised}'")]
    NameMismatch {
        registered: String,
        advertised: String,
    },
}

/// Process-local executable handler for one tool. `args` is the raw JSON
/// argument text the model produced.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, args: &str, ctx: &ToolContext) -> Result<String, ToolError>;
}

struct FnRunner<F>(F);

#[async_trait]
impl<F> ToolRunner for FnRunner<F>
where
    F: Fn(&str) -> Result<String, ToolError> + Send + Sync,
{
    async fn run(&self, args: &str, _ctx: &ToolContext) -> Result<String, ToolError> {
        (self.0)(args)
    }
}

/// Wrap a synchronous closure as a tool runner.
pub fn tool_fn<F>(f: F) -> Arc<dyn ToolRunner>
where
    F: Fn(&str) -> Result<String, ToolError> + Send + Sync + 'static,
{
    Arc::new(FnRunner(f))
}

/// Name-addressed tool execution, handed to adapters at setup time.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, args: &str, ctx: &ToolContext) -> Result<String, ToolError>;
    fn definitions(&self) -> Vec<ToolDefinition>;
}

/// Observer invoked synchronously around each tool dispatch.
pub trait Middleware: Send + Sync {
    fn on_tool_call(&self, name: &str, args: &str);
    fn on_tool_result(&self, name: &str, result: &str, error: Option<&ToolError>);
}
