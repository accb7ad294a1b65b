//! Read-only view of a session for observer tasks.
//!
//! A reader follows the session's current context and shares its token
//! meter and budget. It never writes. Reads running alongside session
//! writes see whole records only.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ctxwin_core::context::{Context, ContextStats};
use ctxwin_core::record::Record;
use ctxwin_core::tokens::TokenUsage;
use ctxwin_store::{ContextRepo, RecordRepo};

use crate::error::{EngineError, Result};
use crate::session::SharedState;

#[derive(Clone)]
pub struct SessionReader {
    contexts: ContextRepo,
    records: RecordRepo,
    shared: Arc<SharedState>,
}

impl SessionReader {
    pub(crate) fn new(contexts: ContextRepo, records: RecordRepo, shared: Arc<SharedState>) -> Self {
        Self {
            contexts,
            records,
            shared,
        }
    }

    pub fn current_context(&self) -> String {
        self.shared.current.read().clone()
    }

    pub fn current_context_info(&self) -> Result<Context> {
        self.get_context(&self.current_context())
    }

    pub fn get_context(&self, name: &str) -> Result<Context> {
        self.contexts
            .get_by_name(name)
            .map_err(EngineError::storage("get_context"))
    }

    pub fn list_contexts(&self) -> Result<Vec<Context>> {
        self.contexts
            .list()
            .map_err(EngineError::storage("list_contexts"))
    }

    pub fn live_records(&self) -> Result<Vec<Record>> {
        let ctx = self.current_context_info()?;
        self.records
            .list_live(&ctx.id)
            .map_err(EngineError::storage("live_records"))
    }

    pub fn all_records(&self) -> Result<Vec<Record>> {
        let ctx = self.current_context_info()?;
        self.records
            .list_all(&ctx.id)
            .map_err(EngineError::storage("all_records"))
    }

    pub fn live_tokens(&self) -> Result<u64> {
        let ctx = self.current_context_info()?;
        self.records
            .live_tokens(&ctx.id)
            .map_err(EngineError::storage("live_tokens"))
    }

    pub fn total_tokens(&self) -> u64 {
        self.shared.meter.total()
    }

    pub fn max_tokens(&self) -> u64 {
        self.shared.max_tokens.load(Ordering::Relaxed)
    }

    pub fn token_usage(&self) -> Result<TokenUsage> {
        Ok(TokenUsage::new(
            self.live_tokens()?,
            self.total_tokens(),
            self.max_tokens(),
        ))
    }

    pub fn get_context_stats(&self, name: &str) -> Result<ContextStats> {
        let ctx = self.get_context(name)?;
        self.contexts
            .stats(&ctx.id)
            .map_err(EngineError::storage("get_context_stats"))
    }
}

impl std::fmt::Debug for SessionReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionReader")
            .field("current", &self.current_context())
            .finish()
    }
}
