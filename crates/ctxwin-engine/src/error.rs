use ctxwin_core::errors::AdapterError;
use ctxwin_store::StoreError;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{op}: storage failure: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("{op}: adapter failure: {source}")]
    Adapter {
        op: &'static str,
        #[source]
        source: AdapterError,
    },

    #[error("no summarizer configured")]
    NoConfiguration,

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("tool loop exceeded {0} iterations")]
    ToolLoopExceeded(usize),
}

impl EngineError {
    /// Wrap a store error with the failing operation. Missing rows surface
    /// as [`EngineError::NotFound`], uniqueness conflicts as
    /// [`EngineError::InvalidArgument`].
    pub fn storage(op: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| match source {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::InvalidArgument(what),
            source => Self::Storage { op, source },
        }
    }

    /// Wrap an adapter error with the failing operation. The session does
    /// not retry, so the classification is only logged for the caller.
    pub fn adapter(op: &'static str) -> impl FnOnce(AdapterError) -> Self {
        move |source| {
            warn!(
                op,
                kind = source.error_kind(),
                retryable = source.is_retryable(),
                fatal = source.is_fatal(),
                "adapter call failed"
            );
            Self::Adapter { op, source }
        }
    }

    /// True when the wrapped adapter failure is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Adapter { source, .. } if source.is_retryable())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
