//! Helpers shared by the HTTP adapters: transcript rendering, bound tool
//! storage and API key loading.

use std::sync::Arc;

use parking_lot::RwLock;
use secrecy::SecretString;
use serde_json::Value;

use ctxwin_core::errors::AdapterError;
use ctxwin_core::record::{Entry, RecordKind};
use ctxwin_core::tools::{ToolDefinition, ToolExecutor, ToolSchema};

/// Prefix marking a prompt line in a rendered transcript.
pub const USER_PREFIX: &str = "User: ";

/// Line prefix for one entry kind.
pub fn prefix(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::SystemPrompt => "System: ",
        RecordKind::Prompt => USER_PREFIX,
        RecordKind::ModelResponse => "Assistant: ",
        RecordKind::ToolCall => "Tool Call: ",
        RecordKind::ToolOutput => "Tool Output: ",
    }
}

/// Render history as a single transcript, one prefixed line per entry.
/// System prompts always lead, whatever their position in the history.
pub fn transcript(history: &[Entry]) -> String {
    let (system, rest): (Vec<&Entry>, Vec<&Entry>) = history
        .iter()
        .partition(|e| e.kind == RecordKind::SystemPrompt);
    system
        .into_iter()
        .chain(rest)
        .map(|e| format!("{}{}", prefix(e.kind), e.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The newest prompt in `history`, rendered with its prefix.
pub fn latest_prompt(history: &[Entry]) -> Option<String> {
    history
        .iter()
        .rev()
        .find(|e| e.kind == RecordKind::Prompt)
        .map(|e| format!("{USER_PREFIX}{}", e.content))
}

/// Holder for the executor bound through the tool-binding capability.
#[derive(Default)]
pub struct ToolSlot {
    executor: RwLock<Option<Arc<dyn ToolExecutor>>>,
}

impl ToolSlot {
    pub fn bind(&self, executor: Arc<dyn ToolExecutor>) {
        *self.executor.write() = Some(executor);
    }

    /// Definitions to advertise, or none when tools are disabled for this
    /// call or nothing is bound.
    pub fn definitions(&self, disable_tools: bool) -> Vec<ToolDefinition> {
        if disable_tools {
            return Vec::new();
        }
        self.executor
            .read()
            .as_ref()
            .map(|exec| exec.definitions())
            .unwrap_or_default()
    }
}

/// Convert definitions with `convert` for structured specs. Raw payloads
/// pass through untouched.
pub fn tool_payloads<F>(definitions: Vec<ToolDefinition>, convert: F) -> Vec<Value>
where
    F: Fn(&ctxwin_core::builder::ToolSpec) -> Value,
{
    definitions
        .into_iter()
        .map(|def| match def.schema {
            ToolSchema::Spec(spec) => convert(&spec),
            ToolSchema::Raw { definition } => definition,
        })
        .collect()
}

/// Read an API key from the environment.
pub fn api_key_from_env(var: &str) -> Result<SecretString, AdapterError> {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(SecretString::from(key)),
        _ => Err(AdapterError::AuthenticationFailed(format!(
            "environment variable {var} is not set"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ctxwin_core::builder::ToolBuilder;
    use ctxwin_core::tools::{ToolContext, ToolError};
    use serde_json::json;

    struct Fixed(Vec<ToolDefinition>);

    #[async_trait]
    impl ToolExecutor for Fixed {
        async fn execute(
            &self,
            name: &str,
            _args: &str,
            _ctx: &ToolContext,
        ) -> Result<String, ToolError> {
            Err(ToolError::NotFound(name.to_string()))
        }

        fn definitions(&self) -> Vec<ToolDefinition> {
            self.0.clone()
        }
    }

    #[test]
    fn transcript_puts_system_first() {
        let history = vec![
            Entry::prompt("hello"),
            Entry::model_response("hi", None),
            Entry::system("be brief"),
            Entry::tool_call("echo", "{}"),
            Entry::tool_output("{}"),
        ];
        assert_eq!(
            transcript(&history),
            "System: be brief\nUser: hello\nAssistant: hi\nTool Call: echo({})\nTool Output: {}"
        );
    }

    #[test]
    fn latest_prompt_picks_newest() {
        let history = vec![
            Entry::prompt("first"),
            Entry::model_response("ok", None),
            Entry::prompt("second"),
            Entry::model_response("ok", None),
        ];
        assert_eq!(latest_prompt(&history).as_deref(), Some("User: second"));
        assert_eq!(latest_prompt(&[Entry::system("s")]), None);
    }

    #[test]
    fn slot_respects_disable_tools() {
        let slot = ToolSlot::default();
        assert!(slot.definitions(false).is_empty());

        let spec = ToolBuilder::new("echo", "Echo input").build();
        slot.bind(Arc::new(Fixed(vec![ToolDefinition::from_spec(spec)])));
        assert_eq!(slot.definitions(false).len(), 1);
        assert!(slot.definitions(true).is_empty());
    }

    #[test]
    fn raw_definitions_pass_through() {
        let raw = json!({"type": "web_search"});
        let spec = ToolBuilder::new("echo", "Echo input").build();
        let payloads = tool_payloads(
            vec![
                ToolDefinition::raw("search", raw.clone()),
                ToolDefinition::from_spec(spec),
            ],
            |s| s.to_openai(),
        );
        assert_eq!(payloads[0], raw);
        assert_eq!(payloads[1]["name"], "echo");
        assert_eq!(payloads[1]["type"], "function");
    }

    #[test]
    fn missing_key_is_auth_failure() {
        let err = api_key_from_env("CTXWIN_TEST_KEY_THAT_IS_NEVER_SET").unwrap_err();
        assert!(matches!(err, AdapterError::AuthenticationFailed(_)));
    }
}
