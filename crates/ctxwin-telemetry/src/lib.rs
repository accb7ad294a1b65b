use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "ctxwin_llm" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of compact text.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::WARN,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

/// Keeps the filter reload handle for runtime level changes.
pub struct TelemetryGuard {
    base: String,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(&self.base, &levels)
        };

        if let Some(handle) = &self.handle {
            if let Err(e) = handle.reload(EnvFilter::new(&directives)) {
                tracing::warn!(error = %e, "failed to reload log filter");
            }
        }
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }
}

/// Build an `EnvFilter` directive string: the base followed by per-module
/// overrides.
pub fn filter_directives(base: &str, module_levels: &[(String, Level)]) -> String {
    let mut filter = base.to_string();
    for (module, level) in module_levels {
        if !filter.is_empty() {
            filter.push(',');
        }
        filter.push_str(&format!("{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// Initialize the telemetry subsystem. Call once at startup; later calls
/// leave the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let base = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| config.log_level.to_string().to_lowercase());
    let directives = filter_directives(&base, &config.module_levels);
    let env_filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("warn"));
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
    });

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .is_ok();

    TelemetryGuard {
        base,
        level_filter: Arc::new(RwLock::new(config.module_levels)),
        handle: installed.then_some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_with_overrides() {
        let levels = vec![
            ("ctxwin_llm".to_string(), Level::DEBUG),
            ("ctxwin_store".to_string(), Level::TRACE),
        ];
        assert_eq!(
            filter_directives("info", &levels),
            "info,ctxwin_llm=debug,ctxwin_store=trace"
        );
        assert_eq!(filter_directives("warn", &[]), "warn");
        assert_eq!(
            filter_directives("", &levels[..1]),
            "ctxwin_llm=debug"
        );
    }

    #[test]
    fn guard_tracks_module_levels() {
        let guard = TelemetryGuard {
            base: "info".into(),
            level_filter: Arc::new(RwLock::new(Vec::new())),
            handle: None,
        };
        guard.set_module_level("ctxwin_engine", Level::DEBUG);
        guard.set_module_level("ctxwin_engine", Level::TRACE);
        assert_eq!(
            guard.module_levels(),
            vec![("ctxwin_engine".to_string(), Level::TRACE)]
        );
    }

    #[test]
    fn default_config_is_quiet_text() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::WARN);
        assert!(!config.json);
    }
}
