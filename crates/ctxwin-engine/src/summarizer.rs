//! Compaction: replace a context's live history with one summary record.
//!
//! `summarize` only reads. Nothing changes until the caller accepts the
//! result, and acceptance retires the replaced records and appends the
//! summary in a single transaction.

use tracing::{info, instrument};

use ctxwin_core::adapter::{CallOptions, ModelHandle};
use ctxwin_core::errors::AdapterError;
use ctxwin_core::ids::{ContextId, RecordId};
use ctxwin_core::record::{Entry, Record};
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::session::Session;

pub const DEFAULT_SUMMARIZER_PROMPT: &str = "\
Summarize the conversation that follows so it can replace the original \
history. Keep facts, decisions, open questions, names, numbers and any \
instructions the user gave. Drop greetings and repetition. Write in plain \
prose, addressed to the assistant that will continue the conversation.";

/// Candidate replacement, not yet applied.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SummaryResult {
    pub context_id: ContextId,
    pub context_name: String,
    pub summary: String,
    /// Records the summary would retire, in history order.
    pub replaced: Vec<RecordId>,
    pub original_tokens: u64,
    pub summary_tokens: u64,
}

impl Session {
    pub fn set_summarizer(&self, summarizer: ModelHandle) {
        *self.summarizer.write() = Some(summarizer);
    }

    /// Override the summarization prompt. `None` restores the default.
    pub fn set_summarizer_prompt(&self, prompt: Option<String>) {
        *self.summarizer_prompt.write() = prompt;
    }

    pub fn summarizer_prompt(&self) -> String {
        self.summarizer_prompt
            .read()
            .clone()
            .unwrap_or_else(|| DEFAULT_SUMMARIZER_PROMPT.to_string())
    }

    pub async fn summarize(&self) -> Result<SummaryResult> {
        self.summarize_context(&self.current_context()).await
    }

    /// Ask the summarizer to condense the live records of `name`.
    #[instrument(skip(self))]
    pub async fn summarize_context(&self, name: &str) -> Result<SummaryResult> {
        let summarizer = self
            .summarizer
            .read()
            .clone()
            .ok_or(EngineError::NoConfiguration)?;

        let ctx = self.get_context(name)?;
        let live = self
            .records
            .list_live(&ctx.id)
            .map_err(EngineError::storage("summarize"))?;
        if live.is_empty() {
            return Err(EngineError::PreconditionFailed(format!(
                "context '{name}' has no live records to summarize"
            )));
        }

        let original_tokens: u64 = live.iter().map(|r| u64::from(r.est_tokens)).sum();
        let mut history = Vec::with_capacity(live.len() + 1);
        history.push(Entry::prompt(self.summarizer_prompt()));
        history.extend(live.iter().map(Record::entry));

        let turn = summarizer
            .call(history, CallOptions::without_tools())
            .await
            .map_err(EngineError::adapter("summarize"))?;
        if turn.text.trim().is_empty() {
            return Err(EngineError::adapter("summarize")(
                AdapterError::InvalidResponse("summarizer returned no text".into()),
            ));
        }
        let _ = self.shared.meter.add(turn.tokens_used);

        let summary_tokens = u64::from(self.records.counter().count(&turn.text));
        info!(
            replaced = live.len(),
            original_tokens, summary_tokens, "summary ready for review"
        );
        Ok(SummaryResult {
            context_id: ctx.id,
            context_name: ctx.name,
            summary: turn.text,
            replaced: live.iter().map(|r| r.id).collect(),
            original_tokens,
            summary_tokens,
        })
    }

    /// Apply a summary to the context it was computed from.
    #[instrument(skip_all, fields(context = %result.context_name, replaced = result.replaced.len()))]
    pub fn accept_summary(&self, result: SummaryResult) -> Result<Record> {
        self.records
            .retire_and_append(
                &result.context_id,
                &result.replaced,
                &Entry::model_response(result.summary, None),
            )
            .map_err(EngineError::storage("accept_summary"))
    }

    /// Discard a summary. Live records are untouched.
    pub fn reject_summary(&self, result: SummaryResult) {
        drop(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use ctxwin_core::record::RecordKind;
    use ctxwin_core::tokens::WordCounter;
    use ctxwin_llm::mock::{MockResponse, ScriptedAdapter};
    use ctxwin_store::Database;
    use std::sync::Arc;

    fn session() -> Session {
        Session::open_with_counter(
            Database::in_memory().unwrap(),
            Arc::new(ScriptedAdapter::new(vec![])).into_handle(),
            SessionConfig::default(),
            Arc::new(WordCounter),
        )
        .unwrap()
    }

    fn summarizer(text: &str) -> Arc<ScriptedAdapter> {
        Arc::new(ScriptedAdapter::new(vec![MockResponse::text(text, 11)]))
    }

    #[tokio::test]
    async fn summarize_without_summarizer_fails() {
        let session = session();
        session.add_prompt("hello").unwrap();
        let err = session.summarize().await.unwrap_err();
        assert!(matches!(err, EngineError::NoConfiguration));
    }

    #[tokio::test]
    async fn summarize_empty_context_fails() {
        let session = session();
        session.set_summarizer(summarizer("s").into_handle());
        let err = session.summarize().await.unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn summarize_builds_candidate() {
        let session = session();
        let model = summarizer("This is a test summary");
        session.set_summarizer(model.clone().into_handle());
        session.add_prompt("first question about rust lifetimes").unwrap();
        session.add_prompt("second question about borrowing rules").unwrap();
        session.add_prompt("third question about trait objects").unwrap();

        let result = session.summarize().await.unwrap();
        assert_eq!(result.summary, "This is a test summary");
        assert_eq!(result.replaced.len(), 3);
        assert_eq!(result.original_tokens, 15);
        assert_eq!(result.summary_tokens, 5);
        assert_eq!(session.total_tokens(), 11);

        let call = &model.calls()[0];
        assert_eq!(call.history[0], Entry::prompt(DEFAULT_SUMMARIZER_PROMPT));
        assert_eq!(call.history.len(), 4);
        assert!(call.disable_tools);

        assert_eq!(session.live_records().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn accept_replaces_live_history() {
        let session = session();
        session.set_summarizer(summarizer("short").into_handle());
        session.add_prompt("hello").unwrap();
        session.add_prompt("world").unwrap();

        let result = session.summarize().await.unwrap();
        session.accept_summary(result).unwrap();

        let live = session.live_records().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].kind, RecordKind::ModelResponse);
        assert_eq!(live[0].content, "short");
        assert_eq!(session.all_records().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn reject_leaves_history_alone() {
        let session = session();
        session.set_summarizer(summarizer("short").into_handle());
        session.add_prompt("hello").unwrap();
        session.add_prompt("world").unwrap();
        let before = session.live_records().unwrap();

        let result = session.summarize().await.unwrap();
        session.reject_summary(result);
        assert_eq!(session.live_records().unwrap(), before);
    }

    #[tokio::test]
    async fn accept_targets_summarized_context() {
        let session = session();
        session.set_summarizer(summarizer("digest").into_handle());
        session.switch_context("notes").unwrap();
        session.add_prompt("remember this").unwrap();
        session.switch_context("default").unwrap();
        session.add_prompt("unrelated").unwrap();

        let result = session.summarize_context("notes").await.unwrap();
        session.accept_summary(result).unwrap();

        assert_eq!(session.live_records().unwrap()[0].content, "unrelated");
        session.switch_context("notes").unwrap();
        let live = session.live_records().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].content, "digest");
    }

    #[tokio::test]
    async fn prompt_override_is_used() {
        let session = session();
        let model = summarizer("s");
        session.set_summarizer(model.clone().into_handle());
        session.set_summarizer_prompt(Some("Be terse.".into()));
        session.add_prompt("hello").unwrap();

        session.summarize().await.unwrap();
        assert_eq!(model.calls()[0].history[0], Entry::prompt("Be terse."));

        session.set_summarizer_prompt(None);
        assert_eq!(session.summarizer_prompt(), DEFAULT_SUMMARIZER_PROMPT);
    }

    #[tokio::test]
    async fn blank_summary_is_rejected() {
        let session = session();
        session.set_summarizer(summarizer("   ").into_handle());
        session.add_prompt("hello").unwrap();
        let err = session.summarize().await.unwrap_err();
        assert!(matches!(err, EngineError::Adapter { op: "summarize", .. }));
    }
}
