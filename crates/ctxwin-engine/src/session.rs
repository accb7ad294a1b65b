//! The conversation session: one current context, a model handle and the
//! tool registry, driving the model call protocol.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, instrument};

use ctxwin_core::adapter::{CallOptions, ModelHandle, ModelTurn, ThreadedRequest};
use ctxwin_core::context::{Context, ContextExport, ContextStats};
use ctxwin_core::ids::generated_context_name;
use ctxwin_core::record::{Entry, Record, RecordKind};
use ctxwin_core::tokens::{load_token_counter, TokenCounter, TokenMeter, TokenUsage};
use ctxwin_core::tools::{Middleware, ToolContext, ToolDefinition, ToolExecutor, ToolRunner};
use ctxwin_store::{Atomicity, ContextRepo, Database, RecordRepo, ToolHintRepo};

use crate::error::{EngineError, Result};
use crate::reader::SessionReader;
use crate::registry::ToolRegistry;
use crate::threading;

/// Name used when the current context is deleted and no other remains.
pub const FALLBACK_CONTEXT: &str = "default";

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Context selected at open. Empty means a generated name.
    pub default_context: String,
    /// Threading mode forced onto the context selected at open. `None`
    /// keeps a resumed context's stored mode. Contexts the session creates
    /// start with `unwrap_or(false)`.
    pub server_side_threading: Option<bool>,
    /// Advisory live-token budget, reported by usage only.
    pub max_tokens: u64,
    /// Cap on tool round trips per call. `None` is unlimited.
    pub max_tool_iterations: Option<usize>,
    pub summarizer_prompt: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_context: FALLBACK_CONTEXT.to_string(),
            server_side_threading: None,
            max_tokens: 4096,
            max_tool_iterations: Some(50),
            summarizer_prompt: None,
        }
    }
}

/// State shared with [`SessionReader`].
pub(crate) struct SharedState {
    pub(crate) current: RwLock<String>,
    pub(crate) max_tokens: AtomicU64,
    pub(crate) meter: TokenMeter,
}

pub struct Session {
    pub(crate) contexts: ContextRepo,
    pub(crate) records: RecordRepo,
    hints: ToolHintRepo,
    model: ModelHandle,
    tools: Arc<ToolRegistry>,
    pub(crate) summarizer: RwLock<Option<ModelHandle>>,
    pub(crate) summarizer_prompt: RwLock<Option<String>>,
    pub(crate) shared: Arc<SharedState>,
    /// Threading mode for contexts this session creates.
    default_threading: bool,
    max_tool_iterations: Option<usize>,
}

impl Session {
    /// Open a session with the process tokenizer.
    pub fn open(db: Database, model: ModelHandle, config: SessionConfig) -> Result<Self> {
        Self::open_with_counter(db, model, config, load_token_counter())
    }

    /// Open a session, resuming or creating the configured context.
    #[instrument(skip_all, fields(context = %config.default_context, adapter = model.name()))]
    pub fn open_with_counter(
        db: Database,
        model: ModelHandle,
        config: SessionConfig,
        counter: Arc<dyn TokenCounter>,
    ) -> Result<Self> {
        let name = if config.default_context.is_empty() {
            generated_context_name()
        } else {
            config.default_context
        };

        let default_threading = config.server_side_threading.unwrap_or(false);
        let contexts = ContextRepo::new(db.clone());
        let opened = match config.server_side_threading {
            Some(mode) => contexts.resume_or_create(&name, mode),
            None => contexts.get_or_create(&name, default_threading),
        };
        opened.map_err(EngineError::storage("open_session"))?;

        let tools = Arc::new(ToolRegistry::new());
        let executor: Arc<dyn ToolExecutor> = tools.clone();
        if !model.bind_tools(executor) {
            debug!("adapter has no tool binding, tools dispatched by session only");
        }
        info!(context = %name, tokenizer = counter.name(), "session opened");

        Ok(Self {
            contexts,
            records: RecordRepo::new(db.clone(), counter),
            hints: ToolHintRepo::new(db),
            model,
            tools,
            summarizer: RwLock::new(None),
            summarizer_prompt: RwLock::new(config.summarizer_prompt),
            shared: Arc::new(SharedState {
                current: RwLock::new(name),
                max_tokens: AtomicU64::new(config.max_tokens),
                meter: TokenMeter::new(),
            }),
            default_threading,
            max_tool_iterations: config.max_tool_iterations,
        })
    }

    /// Read-only view sharing this session's current context and counters.
    pub fn reader(&self) -> SessionReader {
        SessionReader::new(
            self.contexts.clone(),
            self.records.clone(),
            Arc::clone(&self.shared),
        )
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn current_context(&self) -> String {
        self.shared.current.read().clone()
    }

    pub fn current_context_info(&self) -> Result<Context> {
        let name = self.current_context();
        self.contexts
            .get_by_name(&name)
            .map_err(EngineError::storage("current_context"))
    }

    // ── records ──────────────────────────────────────────────────────

    fn append(&self, op: &'static str, entry: Entry) -> Result<Record> {
        let ctx = self.current_context_info()?;
        self.records
            .append(&ctx.id, &entry, true)
            .map_err(EngineError::storage(op))
    }

    pub fn add_prompt(&self, text: &str) -> Result<Record> {
        self.append("add_prompt", Entry::prompt(text))
    }

    /// Record a tool invocation by hand, stored as `name(args)`.
    pub fn add_tool_call(&self, name: &str, args: &str) -> Result<Record> {
        self.append("add_tool_call", Entry::tool_call(name, args))
    }

    pub fn add_tool_output(&self, output: &str) -> Result<Record> {
        self.append("add_tool_output", Entry::tool_output(output))
    }

    /// Replace the live system prompt atomically.
    pub fn set_system_prompt(&self, text: &str) -> Result<Record> {
        let ctx = self.current_context_info()?;
        self.records
            .replace_system_prompt(&ctx.id, text)
            .map_err(EngineError::storage("set_system_prompt"))
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

    // ── contexts ─────────────────────────────────────────────────────

    /// Make `name` current, creating it if needed. An existing context
    /// keeps its stored threading mode.
    #[instrument(skip(self))]
    pub fn switch_context(&self, name: &str) -> Result<Context> {
        check_name(name)?;
        let ctx = self
            .contexts
            .get_or_create(name, self.default_threading)
            .map_err(EngineError::storage("switch_context"))?;
        *self.shared.current.write() = ctx.name.clone();
        Ok(ctx)
    }

    /// Make `name` current and force its threading mode.
    #[instrument(skip(self))]
    pub fn switch_context_with_threading(&self, name: &str, enabled: bool) -> Result<Context> {
        check_name(name)?;
        self.check_threading_capability(enabled)?;
        let ctx = self
            .contexts
            .resume_or_create(name, enabled)
            .map_err(EngineError::storage("switch_context"))?;
        *self.shared.current.write() = ctx.name.clone();
        Ok(ctx)
    }

    /// Strict create. Does not change the current context.
    pub fn create_context(&self, name: &str) -> Result<Context> {
        check_name(name)?;
        self.contexts
            .create(name, self.default_threading)
            .map_err(EngineError::storage("create_context"))
    }

    pub fn list_contexts(&self) -> Result<Vec<Context>> {
        self.contexts
            .list()
            .map_err(EngineError::storage("list_contexts"))
    }

    pub fn get_context(&self, name: &str) -> Result<Context> {
        self.contexts
            .get_by_name(name)
            .map_err(EngineError::storage("get_context"))
    }

    /// Delete a context and everything in it. Deleting the current context
    /// moves the session to another context, or to a fresh
    /// [`FALLBACK_CONTEXT`] when none remain.
    #[instrument(skip(self))]
    pub fn delete_context(&self, name: &str) -> Result<()> {
        let ctx = self.get_context(name)?;
        self.contexts
            .delete(&ctx.id)
            .map_err(EngineError::storage("delete_context"))?;

        if self.current_context() != name {
            return Ok(());
        }
        let next = match self.list_contexts()?.into_iter().next() {
            Some(other) => other,
            None => self
                .contexts
                .get_or_create(FALLBACK_CONTEXT, self.default_threading)
                .map_err(EngineError::storage("delete_context"))?,
        };
        info!(deleted = name, current = %next.name, "current context reassigned");
        *self.shared.current.write() = next.name;
        Ok(())
    }

    pub fn export_context(&self, name: &str) -> Result<ContextExport> {
        let ctx = self.get_context(name)?;
        self.contexts
            .export(&ctx.id)
            .map_err(EngineError::storage("export_context"))
    }

    pub fn export_context_json(&self, name: &str) -> Result<String> {
        let ctx = self.get_context(name)?;
        self.contexts
            .export_json(&ctx.id)
            .map_err(EngineError::storage("export_context"))
    }

    pub fn get_context_stats(&self, name: &str) -> Result<ContextStats> {
        let ctx = self.get_context(name)?;
        self.contexts
            .stats(&ctx.id)
            .map_err(EngineError::storage("get_context_stats"))
    }

    // ── threading ────────────────────────────────────────────────────

    /// Toggle server-side threading for the current context. The mode is
    /// stored on the context and survives switches and reopens. Enabling it
    /// on an adapter without the threading capability is rejected.
    pub fn set_server_side_threading(&self, enabled: bool) -> Result<()> {
        self.check_threading_capability(enabled)?;
        let ctx = self.current_context_info()?;
        self.contexts
            .set_threading(&ctx.id, enabled)
            .map_err(EngineError::storage("set_server_side_threading"))
    }

    fn check_threading_capability(&self, enabled: bool) -> Result<()> {
        if enabled && !self.model.supports_threading() {
            return Err(EngineError::InvalidArgument(format!(
                "adapter {} does not support server-side threading",
                self.model.name()
            )));
        }
        Ok(())
    }

    pub fn is_server_side_threading_enabled(&self) -> Result<bool> {
        Ok(self.current_context_info()?.server_side_threading)
    }

    // ── tools ────────────────────────────────────────────────────────

    /// Register a handler and persist `name` as a hint on the current
    /// context.
    pub fn register_tool(
        &self,
        name: &str,
        definition: ToolDefinition,
        runner: Arc<dyn ToolRunner>,
    ) -> Result<()> {
        if definition.name != name {
            return Err(EngineError::InvalidArgument(format!(
                "tool '{name}' has a definition named '{}'",
                definition.name
            )));
        }
        let ctx = self.current_context_info()?;
        self.hints
            .add(&ctx.id, name)
            .map_err(EngineError::storage("register_tool"))?;
        self.tools
            .register(name, definition, runner)
            .map_err(|e| EngineError::InvalidArgument(e.to_string()))
    }

    /// Tool names persisted on the current context, in registration order.
    pub fn list_tools(&self) -> Result<Vec<String>> {
        let ctx = self.current_context_info()?;
        self.hints
            .names(&ctx.id)
            .map_err(EngineError::storage("list_tools"))
    }

    pub fn has_tool(&self, name: &str) -> Result<bool> {
        let ctx = self.current_context_info()?;
        self.hints
            .has(&ctx.id, name)
            .map_err(EngineError::storage("has_tool"))
    }

    /// Drop the handler and the current context's hint. True if either
    /// existed.
    pub fn remove_tool(&self, name: &str) -> Result<bool> {
        let had_handler = self.tools.unregister(name);
        let ctx = self.current_context_info()?;
        let had_hint = self
            .hints
            .remove(&ctx.id, name)
            .map_err(EngineError::storage("remove_tool"))?;
        Ok(had_handler || had_hint)
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Replace the observers around tool dispatch. Adapters that dispatch
    /// tools on their own receive the same list.
    pub fn set_middleware(&self, middleware: Vec<Arc<dyn Middleware>>) {
        self.tools.set_middleware(middleware.clone());
        if !self.model.set_middleware(middleware) {
            debug!(adapter = self.model.name(), "adapter has no middleware capability");
        }
    }

    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        let mut all = self.tools.middleware();
        all.push(middleware);
        self.set_middleware(all);
    }

    // ── accounting ───────────────────────────────────────────────────

    pub fn max_tokens(&self) -> u64 {
        self.shared.max_tokens.load(Ordering::Relaxed)
    }

    pub fn set_max_tokens(&self, max: u64) {
        self.shared.max_tokens.store(max, Ordering::Relaxed);
    }

    pub fn total_tokens(&self) -> u64 {
        self.shared.meter.total()
    }

    pub fn live_tokens(&self) -> Result<u64> {
        let ctx = self.current_context_info()?;
        self.records
            .live_tokens(&ctx.id)
            .map_err(EngineError::storage("live_tokens"))
    }

    pub fn token_usage(&self) -> Result<TokenUsage> {
        Ok(TokenUsage::new(
            self.live_tokens()?,
            self.total_tokens(),
            self.max_tokens(),
        ))
    }

    // ── model call protocol ──────────────────────────────────────────

    pub async fn call_model(&self) -> Result<String> {
        self.call_model_with(CallOptions::default()).await
    }

    /// Send the live history to the model, run any requested tools, then
    /// persist the tool traffic and the final response.
    ///
    /// Records are written only after the tool loop finishes, one insert at
    /// a time: a store failure leaves earlier inserts in place.
    #[instrument(skip_all, fields(context = %self.current_context()))]
    pub async fn call_model_with(&self, options: CallOptions) -> Result<String> {
        let ctx = self.current_context_info()?;
        let live = self
            .records
            .list_live(&ctx.id)
            .map_err(EngineError::storage("call_model"))?;
        let mut history: Vec<Entry> = live.iter().map(Record::entry).collect();

        let mut turn = self.invoke(&ctx, &live, history.clone(), options.clone()).await?;
        let mut tokens_used = turn.tokens_used;

        let tool_ctx = ToolContext {
            context_name: ctx.name.clone(),
            cancel: options.cancel.clone(),
        };
        let mut produced = Vec::new();
        let mut rounds = 0usize;
        while turn.wants_tools() {
            rounds += 1;
            if let Some(cap) = self.max_tool_iterations {
                if rounds > cap {
                    error!(cap, "tool loop exceeded iteration cap, nothing persisted");
                    return Err(EngineError::ToolLoopExceeded(cap));
                }
            }
            for call in &turn.tool_calls {
                debug!(tool = %call.name, call_id = %call.id, "dispatching tool call");
                let output = self
                    .tools
                    .dispatch(&call.name, &call.arguments, &tool_ctx)
                    .await;
                let pair = [
                    Entry::tool_call(&call.name, &call.arguments),
                    Entry::tool_output(output),
                ];
                history.extend(pair.iter().cloned());
                produced.extend(pair);
            }
            debug!(round = rounds, entries = history.len(), "continuing after tool round");
            turn = self.continue_after_tools(&ctx, history.clone(), options.clone()).await?;
            tokens_used = tokens_used.saturating_add(turn.tokens_used);
        }

        let total = self.shared.meter.add(tokens_used);
        debug!(tokens_used, total, "token meter updated");

        let token = turn.continuation_token.filter(|t| !t.is_empty());
        produced.push(Entry::model_response(turn.text.clone(), token.clone()));
        self.records
            .append_batch(&ctx.id, &produced, Atomicity::PerRecord)
            .map_err(|e| {
                error!(error = %e, "failed to persist model call records");
                EngineError::storage("call_model")(e)
            })?;

        if let Some(token) = token {
            self.contexts
                .update_continuation_token(&ctx.id, &token)
                .map_err(EngineError::storage("call_model"))?;
        }
        Ok(turn.text)
    }

    /// First request of a call. Picks server-side or client-side mode.
    async fn invoke(
        &self,
        ctx: &Context,
        live: &[Record],
        history: Vec<Entry>,
        options: CallOptions,
    ) -> Result<ModelTurn> {
        if !ctx.server_side_threading {
            return self
                .model
                .call(history, options)
                .await
                .map_err(EngineError::adapter("call_model"));
        }
        if !self.model.supports_threading() {
            return Err(EngineError::InvalidArgument(format!(
                "context '{}' uses server-side threading but adapter {} does not support it",
                ctx.name,
                self.model.name()
            )));
        }

        let last_token = ctx
            .last_continuation_token
            .clone()
            .filter(|t| !t.is_empty());
        let use_server_side = match (&last_token, threading::check(live)) {
            (None, _) => {
                debug!("no continuation token yet, sending full history");
                false
            }
            (Some(_), Err(reason)) => {
                debug!(%reason, "threading ineligible, sending full history");
                false
            }
            (Some(_), Ok(())) => {
                let has_prompt = live.iter().any(|r| r.kind == RecordKind::Prompt);
                if !has_prompt {
                    debug!("no prompt to send with continuation token, sending full history");
                }
                has_prompt
            }
        };

        self.model
            .call_threaded(ThreadedRequest {
                use_server_side,
                last_token,
                history,
                options,
            })
            .await
            .map_err(EngineError::adapter("call_model"))
    }

    /// Tool-loop continuation. Always sends the full history.
    async fn continue_after_tools(
        &self,
        ctx: &Context,
        history: Vec<Entry>,
        options: CallOptions,
    ) -> Result<ModelTurn> {
        let result = if ctx.server_side_threading && self.model.supports_threading() {
            self.model
                .call_threaded(ThreadedRequest {
                    use_server_side: false,
                    last_token: None,
                    history,
                    options,
                })
                .await
        } else {
            self.model.call(history, options).await
        };
        result.map_err(EngineError::adapter("call_model"))
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::InvalidArgument(
            "context name must not be empty".into(),
        ));
    }
    Ok(())
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("current", &self.current_context())
            .field("model", &self.model)
            .field("tools", &self.tools.names())
            .finish()
    }
}
