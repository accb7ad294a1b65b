//! Settings type definitions.
//!
//! Every section is `#[serde(default)]`, so a partial JSON file only needs
//! the keys it changes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub session: SessionSettings,
    pub provider: ProviderSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: ctxwin_dir().join("contexts.db"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Context selected when none is named.
    pub default_context: String,
    /// Forces the threading mode of the startup context and seeds new
    /// contexts. Unset keeps whatever each context has stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_side_threading: Option<bool>,
    /// Advisory live-token budget reported by usage.
    pub max_tokens: u64,
    /// Cap on tool round trips per model call. 0 means unlimited.
    pub max_tool_iterations: u32,
    /// Replaces the built-in summarization prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summarizer_prompt: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_context: "default".to_string(),
            server_side_threading: None,
            max_tokens: 4096,
            max_tool_iterations: 50,
            summarizer_prompt: None,
        }
    }
}

impl SessionSettings {
    pub fn tool_iteration_cap(&self) -> Option<usize> {
        (self.max_tool_iterations > 0).then_some(self.max_tool_iterations as usize)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Mock,
}

impl std::str::FromStr for ProviderKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "mock" => Ok(Self::Mock),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Env var holding the API key. Each provider has its own default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            model: "gpt-4.1-mini".to_string(),
            base_url: None,
            api_key_env: None,
        }
    }
}

impl ProviderSettings {
    pub fn api_key_env(&self) -> &str {
        match (&self.api_key_env, self.kind) {
            (Some(name), _) => name,
            (None, ProviderKind::Anthropic) => "ANTHROPIC_API_KEY",
            (None, _) => "OPENAI_API_KEY",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

/// `~/.ctxwin`, falling back to `/tmp/.ctxwin` without a HOME.
pub fn ctxwin_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".ctxwin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.session.default_context, "default");
        assert_eq!(settings.session.max_tokens, 4096);
        assert_eq!(settings.session.tool_iteration_cap(), Some(50));
        assert_eq!(settings.session.server_side_threading, None);
        assert_eq!(settings.provider.kind, ProviderKind::OpenAi);
        assert!(settings.database.path.ends_with(".ctxwin/contexts.db"));
    }

    #[test]
    fn zero_iterations_is_unlimited() {
        let session = SessionSettings {
            max_tool_iterations: 0,
            ..SessionSettings::default()
        };
        assert_eq!(session.tool_iteration_cap(), None);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"session": {"max_tokens": 8000}}"#).unwrap();
        assert_eq!(settings.session.max_tokens, 8000);
        assert_eq!(settings.session.default_context, "default");
        assert_eq!(settings.logging.level, "warn");
    }

    #[test]
    fn provider_kind_serde() {
        let kind: ProviderKind = serde_json::from_str("\"anthropic\"").unwrap();
        assert_eq!(kind, ProviderKind::Anthropic);
        assert_eq!(serde_json::to_string(&ProviderKind::OpenAi).unwrap(), "\"openai\"");
        assert_eq!("Mock".parse::<ProviderKind>().unwrap(), ProviderKind::Mock);
        assert!("gemini".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn api_key_env_defaults_per_provider() {
        let mut provider = ProviderSettings::default();
        assert_eq!(provider.api_key_env(), "OPENAI_API_KEY");
        provider.kind = ProviderKind::Anthropic;
        assert_eq!(provider.api_key_env(), "ANTHROPIC_API_KEY");
        provider.api_key_env = Some("MY_KEY".into());
        assert_eq!(provider.api_key_env(), "MY_KEY");
    }
}
