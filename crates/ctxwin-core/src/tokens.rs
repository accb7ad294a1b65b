//! Token estimation and cumulative usage accounting.
//!
//! Every record's `est_tokens` comes from one [`TokenCounter`] chosen at
//! startup. Switching tokenizers changes persisted counts, so a process
//! never mixes counters.

use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tiktoken_rs::CoreBPE;
use tracing::warn;

/// The BPE vocabulary could not be built.
#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("bpe vocabulary unavailable: {0}")]
    Unavailable(String),
}

/// Deterministic content -> token count estimation.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> u32;

    /// Name recorded in logs so operators can tell which vocabulary is active.
    fn name(&self) -> &'static str;
}

/// `cl100k_base` BPE vocabulary.
pub struct Cl100kCounter {
    bpe: CoreBPE,
}

impl Cl100kCounter {
    pub fn load() -> Result<Self, TokenizerError> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| TokenizerError::Unavailable(e.to_string()))?;
        Ok(Self { bpe })
    }
}

impl TokenCounter for Cl100kCounter {
    fn count(&self, text: &str) -> u32 {
        u32::try_from(self.bpe.encode_ordinary(text).len()).unwrap_or(u32::MAX)
    }

    fn name(&self) -> &'static str {
        "cl100k_base"
    }
}

/// Whitespace word count. Used when the BPE vocabulary cannot be loaded.
#[derive(Clone, Copy, Debug, Default)]
pub struct WordCounter;

impl TokenCounter for WordCounter {
    fn count(&self, text: &str) -> u32 {
        u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
    }

    fn name(&self) -> &'static str {
        "whitespace"
    }
}

static PROCESS_COUNTER: LazyLock<Arc<dyn TokenCounter>> =
    LazyLock::new(|| match Cl100kCounter::load() {
        Ok(counter) => Arc::new(counter),
        Err(e) => {
            warn!(error = %e, "tokenizer unavailable, falling back to word counts");
            Arc::new(WordCounter)
        }
    });

/// The counter for this process: cl100k if it loads, otherwise words.
/// The vocabulary is built on first use and shared afterwards.
pub fn load_token_counter() -> Arc<dyn TokenCounter> {
    Arc::clone(&PROCESS_COUNTER)
}

/// Cumulative tokens consumed by model calls. Shared between the session
/// and read-only observers.
#[derive(Clone, Debug, Default)]
pub struct TokenMeter {
    total: Arc<Mutex<u64>>,
}

impl TokenMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` and return the new total.
    pub fn add(&self, n: u64) -> u64 {
        let mut total = self.total.lock();
        *total = total.saturating_add(n);
        *total
    }

    pub fn total(&self) -> u64 {
        *self.total.lock()
    }
}

/// Snapshot returned by `token_usage`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Sum of live records' estimates in the current context.
    pub live: u64,
    /// Cumulative tokens reported by model calls.
    pub total: u64,
    pub max: u64,
    /// `live / max * 100`, 0 when `max` is 0.
    pub percent: f64,
}

impl TokenUsage {
    pub fn new(live: u64, total: u64, max: u64) -> Self {
        let percent = if max == 0 {
            0.0
        } else {
            live as f64 / max as f64 * 100.0
        };
        Self {
            live,
            total,
            max,
            percent,
        }
    }
}
