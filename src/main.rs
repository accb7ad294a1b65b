use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing::Level;

use ctxwin_core::adapter::ModelHandle;
use ctxwin_engine::{Session, SessionConfig};
use ctxwin_llm::{AnthropicAdapter, MockResponse, OpenAiResponsesAdapter, ScriptedAdapter};
use ctxwin_settings::{ProviderKind, Settings};
use ctxwin_store::Database;
use ctxwin_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "ctxwin")]
#[command(about = "Persistent conversation contexts for LLM calls")]
#[command(version)]
struct Cli {
    /// Context to operate on. Created if missing.
    #[arg(long, short, global = true)]
    context: Option<String>,

    /// Database file, overriding settings.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a prompt and call the model
    Prompt {
        text: String,
    },
    /// List contexts, newest first
    Contexts,
    /// Print the records of the current context
    Show {
        /// Include retired records
        #[arg(long)]
        all: bool,
    },
    /// Print a context as JSON
    Export {
        name: String,
    },
    /// Delete a context and its records
    Delete {
        name: String,
    },
    /// Token usage of the current context
    Usage,
    /// Summarize the current context
    Summarize {
        /// Replace live history with the summary
        #[arg(long)]
        accept: bool,
    },
    /// Replace the system prompt
    System {
        text: String,
    },
    /// Toggle server-side threading for the current context
    Threading {
        #[arg(value_parser = ["on", "off"])]
        mode: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = ctxwin_settings::load_settings().context("loading settings")?;
    if let Some(db) = cli.db {
        settings.database.path = db;
    }

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: settings.logging.level.parse().unwrap_or(Level::WARN),
        module_levels: Vec::new(),
        json: settings.logging.json,
    });

    let model = build_model(&settings)?;
    let db = Database::open(&settings.database.path)
        .with_context(|| format!("opening {}", settings.database.path.display()))?;
    let config = SessionConfig {
        default_context: cli
            .context
            .unwrap_or_else(|| settings.session.default_context.clone()),
        server_side_threading: settings.session.server_side_threading,
        max_tokens: settings.session.max_tokens,
        max_tool_iterations: settings.session.tool_iteration_cap(),
        summarizer_prompt: settings.session.summarizer_prompt.clone(),
    };
    let session = Session::open(db, model.clone(), config)?;
    session.set_summarizer(model);
    tracing::debug!(context = %session.current_context(), "ready");

    match cli.command {
        Commands::Prompt { text } => {
            session.add_prompt(&text)?;
            match session.call_model().await {
                Ok(reply) => println!("{reply}"),
                Err(e) if e.is_retryable() => {
                    return Err(e)
                        .context("provider is temporarily unavailable, the prompt is kept");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Contexts => {
            let current = session.current_context();
            for ctx in session.list_contexts()? {
                let marker = if ctx.name == current { "*" } else { " " };
                let stats = session.get_context_stats(&ctx.name)?;
                println!(
                    "{marker} {:<24} {:>5} live {:>7} tokens  {}",
                    ctx.name,
                    stats.live_records,
                    stats.live_tokens,
                    ctx.start_time.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Show { all } => {
            let records = if all {
                session.all_records()?
            } else {
                session.live_records()?
            };
            for record in records {
                let state = if record.live { "" } else { " (retired)" };
                println!("[{}]{state} {}", record.kind, record.content);
            }
        }
        Commands::Export { name } => println!("{}", session.export_context_json(&name)?),
        Commands::Delete { name } => {
            session.delete_context(&name)?;
            println!("deleted {name}, current context is {}", session.current_context());
        }
        Commands::Usage => {
            let usage = session.token_usage()?;
            println!(
                "live {} / max {} ({:.1}%), total reported {}",
                usage.live, usage.max, usage.percent, usage.total
            );
        }
        Commands::Summarize { accept } => {
            let result = session.summarize().await?;
            println!("{}", result.summary);
            println!(
                "-- {} records, {} tokens -> {} tokens",
                result.replaced.len(),
                result.original_tokens,
                result.summary_tokens
            );
            if accept {
                session.accept_summary(result)?;
                println!("-- applied");
            } else {
                session.reject_summary(result);
            }
        }
        Commands::System { text } => {
            session.set_system_prompt(&text)?;
        }
        Commands::Threading { mode } => {
            session.set_server_side_threading(mode == "on")?;
        }
    }
    Ok(())
}

fn build_model(settings: &Settings) -> anyhow::Result<ModelHandle> {
    let provider = &settings.provider;
    let handle = match provider.kind {
        ProviderKind::OpenAi => OpenAiResponsesAdapter::from_env(
            provider.model.clone(),
            provider.api_key_env(),
            provider.base_url.clone(),
        )?
        .into_handle(),
        ProviderKind::Anthropic => AnthropicAdapter::from_env(
            provider.model.clone(),
            provider.api_key_env(),
            provider.base_url.clone(),
        )?
        .into_handle(),
        ProviderKind::Mock => {
            let reply = format!("[{}] ok", provider.model);
            Arc::new(ScriptedAdapter::new(vec![MockResponse::text(&reply, 0)])).into_handle()
        }
    };
    Ok(handle)
}
