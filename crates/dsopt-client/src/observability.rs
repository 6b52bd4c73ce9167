//! Process-wide tracing setup for binaries built on the client.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub const ENABLED_VAR: &str = "DSOPT_OBSERVABILITY_ENABLED";
pub const LOG_LEVEL_VAR: &str = "DSOPT_LOG_LEVEL";
pub const JSON_LOG_PATH_VAR: &str = "DSOPT_JSON_LOG_PATH";
const DEFAULT_JSON_LOG_FILE: &str = "dsopt.logs.jsonl";

static INIT: OnceCell<()> = OnceCell::new();

/// Logging settings resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub enabled: bool,
    /// Explicit filter directive; falls back to `RUST_LOG`, then `info`.
    pub level: Option<String>,
    /// JSON lines destination. Console output on stderr when unset.
    pub json_path: Option<PathBuf>,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            enabled: non_empty(ENABLED_VAR)
                .map(|v| parse_bool_env(&v).unwrap_or(true))
                .unwrap_or(true),
            level: non_empty(LOG_LEVEL_VAR),
            json_path: non_empty(JSON_LOG_PATH_VAR).map(PathBuf::from),
        }
    }

    fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        if let Some(level) = &self.level
            && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
        {
            return filter;
        }
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    }
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Splits a log path into the directory and file name the appender wants.
fn log_target(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_JSON_LOG_FILE)
        .to_string();
    (dir, file)
}

/// Installs the tracing subscriber once per process.
///
/// Reads `DSOPT_OBSERVABILITY_ENABLED`, `DSOPT_LOG_LEVEL` (or `RUST_LOG`)
/// and `DSOPT_JSON_LOG_PATH`. Console logs go to stderr so command output
/// on stdout stays clean. Later calls are no-ops, as is calling this after
/// another subscriber was installed.
pub fn init_observability() {
    INIT.get_or_init(|| install(LogSettings::from_env()));
}

fn install(settings: LogSettings) {
    if !settings.enabled {
        return;
    }
    let env_filter = settings.env_filter();
    match &settings.json_path {
        Some(path) => {
            let (dir, file) = log_target(path);
            let _ = std::fs::create_dir_all(&dir);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(false)
                .with_writer(tracing_appender::rolling::never(dir, file));
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        }
        None => {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    }
}
