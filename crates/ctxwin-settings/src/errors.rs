use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// The merged document does not fit the settings schema, e.g. an
    /// unknown provider kind.
    #[error("invalid settings: {0}")]
    Schema(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;
