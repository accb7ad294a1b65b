use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ContextId, RecordId};

/// Kind of history entry. The integer codes are the persisted `kind` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Prompt,
    ModelResponse,
    ToolCall,
    ToolOutput,
    SystemPrompt,
}

impl RecordKind {
    pub fn code(self) -> i64 {
        match self {
            Self::Prompt => 0,
            Self::ModelResponse => 1,
            Self::ToolCall => 2,
            Self::ToolOutput => 3,
            Self::SystemPrompt => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Prompt),
            1 => Some(Self::ModelResponse),
            2 => Some(Self::ToolCall),
            3 => Some(Self::ToolOutput),
            4 => Some(Self::SystemPrompt),
            _ => None,
        }
    }

    /// Tool traffic cannot be replayed through a server-side thread.
    pub fn is_tool_traffic(self) -> bool {
        matches!(self, Self::ToolCall | Self::ToolOutput)
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prompt => write!(f, "prompt"),
            Self::ModelResponse => write!(f, "model_response"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::ToolOutput => write!(f, "tool_output"),
            Self::SystemPrompt => write!(f, "system_prompt"),
        }
    }
}

/// One persisted history entry. Content is immutable; only `live` changes,
/// and only from true to false.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub context_id: ContextId,
    pub timestamp: DateTime<Utc>,
    pub kind: RecordKind,
    pub content: String,
    pub live: bool,
    pub est_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
}

impl Record {
    pub fn entry(&self) -> Entry {
        Entry {
            kind: self.kind,
            content: self.content.clone(),
            continuation_token: self.continuation_token.clone(),
        }
    }

    /// True when this is a model response carrying a non-empty token.
    pub fn has_continuation_token(&self) -> bool {
        self.continuation_token
            .as_deref()
            .is_some_and(|t| !t.is_empty())
    }
}

/// Unpersisted history entry: what adapters read, and what the session
/// hands to the store for appending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: RecordKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
}

impl Entry {
    pub fn new(kind: RecordKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            continuation_token: None,
        }
    }

    pub fn prompt(content: impl Into<String>) -> Self {
        Self::new(RecordKind::Prompt, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(RecordKind::SystemPrompt, content)
    }

    pub fn model_response(content: impl Into<String>, token: Option<String>) -> Self {
        Self {
            kind: RecordKind::ModelResponse,
            content: content.into(),
            continuation_token: token,
        }
    }

    /// Tool invocation rendered as `name(args)`.
    pub fn tool_call(name: &str, args: &str) -> Self {
        Self::new(RecordKind::ToolCall, format_tool_call(name, args))
    }

    pub fn tool_output(content: impl Into<String>) -> Self {
        Self::new(RecordKind::ToolOutput, content)
    }
}

pub fn format_tool_call(name: &str, args: &str) -> String {
    format!("{name}({args})")
}
