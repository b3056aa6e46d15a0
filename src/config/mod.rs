use serde::Deserialize;
use std::path::{Path, PathBuf};

use tracing::error;

const DEFAULT_PORT: u16 = 4300;
const DEFAULT_MAX_CONNECTIONS_PER_MIN: usize = 10;
const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 64;

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket server port (default: 4300).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,alarmd=trace" (default: "info").
    log: Option<String>,
    /// Max new connections per source IP per minute (default: 10).
    max_connections_per_min: Option<usize>,
    /// Bounded per-session outbound queue depth (default: 64).
    outbound_queue_depth: Option<usize>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub max_connections_per_min: usize,
    pub outbound_queue_depth: usize,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        max_connections_per_min: Option<usize>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let max_connections_per_min = max_connections_per_min
            .or(toml.max_connections_per_min)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_MIN);
        let outbound_queue_depth = toml
            .outbound_queue_depth
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE_DEPTH);

        Self {
            port,
            data_dir,
            log,
            max_connections_per_min,
            outbound_queue_depth,
        }
    }

    pub fn token_file(&self) -> PathBuf {
        self.data_dir.join("tokens.json")
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("alarmd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("alarmd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("alarmd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("alarmd");
        }
    }
    PathBuf::from(".alarmd")
}
