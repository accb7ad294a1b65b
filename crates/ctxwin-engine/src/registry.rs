use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{error, warn};

use ctxwin_core::tools::{
    Middleware, ToolContext, ToolDefinition, ToolError, ToolExecutor, ToolRunner,
};

struct ToolEntry {
    definition: ToolDefinition,
    runner: Arc<dyn ToolRunner>,
}

/// In-memory tool handlers and their advertised definitions. Shared with
/// adapters through the [`ToolExecutor`] seam.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolEntry>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            middleware: RwLock::new(Vec::new()),
        }
    }

    /// Register a tool under `name`, replacing any previous handler.
    /// `name` must match the name the definition advertises, since adapters
    /// dispatch by the advertised name.
    pub fn register(
        &self,
        name: &str,
        definition: ToolDefinition,
        runner: Arc<dyn ToolRunner>,
    ) -> Result<(), ToolError> {
        if definition.name != name {
            return Err(ToolError::NameMismatch {
                registered: name.to_string(),
                advertised: definition.name,
            });
        }
        self.tools
            .write()
            .insert(name.to_string(), ToolEntry { definition, runner });
        Ok(())
    }

    /// Unregister a tool by name.
    pub fn unregister(&self, name: &str) -> bool {
        self.tools.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// All tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.tools.read().len()
    }

    pub fn set_middleware(&self, middleware: Vec<Arc<dyn Middleware>>) {
        *self.middleware.write() = middleware;
    }

    pub fn middleware(&self) -> Vec<Arc<dyn Middleware>> {
        self.middleware.read().clone()
    }

    /// Run a tool and always produce output text. Failures become
    /// `error: <reason>` so the conversation can continue.
    pub async fn dispatch(&self, name: &str, args: &str, ctx: &ToolContext) -> String {
        match self.execute(name, args, ctx).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = name, error = %e, "tool failed, recording error output");
                format!("error: {e}")
            }
        }
    }

    async fn run(&self, name: &str, args: &str, ctx: &ToolContext) -> Result<String, ToolError> {
        let runner = self
            .tools
            .read()
            .get(name)
            .map(|e| Arc::clone(&e.runner))
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        match AssertUnwindSafe(runner.run(args, ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic_message(&panic);
                error!(tool = name, panic = %msg, "tool panicked during execution");
                Err(ToolError::ExecutionFailed("tool crashed".into()))
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    /// Middleware observes every dispatch, including unknown names.
    async fn execute(&self, name: &str, args: &str, ctx: &ToolContext) -> Result<String, ToolError> {
        let middleware = self.middleware();
        for m in &middleware {
            m.on_tool_call(name, args);
        }

        let result = self.run(name, args, ctx).await;

        for m in &middleware {
            match &result {
                Ok(output) => m.on_tool_result(name, output, None),
                Err(e) => m.on_tool_result(name, "", Some(e)),
            }
        }
        result
    }

    /// Definitions sorted by name.
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .values()
            .map(|e| e.definition.clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
