//! Gateway configuration: defaults, then an optional TOML file, then `PARLEY_*` environment.

use parley_voice::SessionConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Directory for format-conversion staging files (default: system temp dir).
    pub staging_dir: Option<PathBuf>,
    /// ffmpeg binary used for container encodings.
    pub ffmpeg: String,
    pub session: SessionConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            staging_dir: None,
            ffmpeg: "ffmpeg".to_string(),
            session: SessionConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from `PARLEY_CONFIG` (default `config/gateway.toml`, skipped when absent) and the
    /// environment, e.g. `PARLEY_PORT=9000` or `PARLEY_SESSION__HISTORY_WINDOW=10`.
    pub fn load() -> Result<Self, config::ConfigError> {
        let path = std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .set_default("host", "127.0.0.1")?
            .set_default("port", 8000_i64)?
            .set_default("ffmpeg", "ffmpeg")?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        builder
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
