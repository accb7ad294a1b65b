//! # ctxwin-engine
//!
//! The conversation session over a context store: record lifecycle, the
//! model call protocol with its tool loop, threading eligibility,
//! summarization and a read-only observer view.

pub mod error;
pub mod reader;
pub mod registry;
pub mod session;
pub mod summarizer;
pub mod threading;

pub use error::{EngineError, Result};
pub use reader::SessionReader;
pub use registry::ToolRegistry;
pub use session::{Session, SessionConfig, FALLBACK_CONTEXT};
pub use summarizer::{SummaryResult, DEFAULT_SUMMARIZER_PROMPT};
