use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ContextId;
use crate::record::Record;

/// A named, isolated conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub id: ContextId,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub server_side_threading: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_continuation_token: Option<String>,
}

/// Aggregate read over one context's records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStats {
    pub total_records: u64,
    pub live_records: u64,
    pub live_tokens: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Persisted tool-name hint for a context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolHint {
    pub id: i64,
    pub context_id: ContextId,
    pub tool_name: String,
    pub created_at: DateTime<Utc>,
}

/// A complete context with every record and tool hint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextExport {
    pub context: Context,
    pub records: Vec<Record>,
    pub tools: Vec<ToolHint>,
}
