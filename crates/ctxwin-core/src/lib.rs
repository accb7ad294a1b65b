pub mod adapter;
pub mod builder;
pub mod context;
pub mod errors;
pub mod ids;
pub mod record;
pub mod tokens;
pub mod tools;

pub use adapter::{
    CallOptions, MiddlewareSink, ModelAdapter, ModelHandle, ModelRequest, ModelTurn,
    PendingToolCall, ThreadedModel, ThreadedRequest, ToolBinding,
};
pub use builder::{Parameter, ParameterType, ToolBuilder, ToolSpec};
pub use context::{Context, ContextExport, ContextStats, ToolHint};
pub use errors::AdapterError;
pub use ids::{ContextId, RecordId};
pub use record::{Entry, Record, RecordKind};
pub use tokens::{TokenCounter, TokenMeter, TokenUsage, TokenizerError};
pub use tools::{
    Middleware, ToolContext, ToolDefinition, ToolError, ToolExecutor, ToolRunner, ToolSchema,
};
