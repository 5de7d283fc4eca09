use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::relay::{AccessToken, RelayConfig, Resolution};

/// Prefix of environment overrides, e.g. `LIVE_RELAY__RELAY__SERVER`
pub const ENV_PREFIX: &str = "LIVE_RELAY";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelaySettings,
    pub http: HttpSettings,
    pub output: OutputSettings,
}

/// Persisted receiver settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub client_id: String,
    pub server: String,
    /// `<channel>-<token1>-<token2>`; empty until logged in
    pub access_token: String,
    pub resolution: Resolution,
    /// RTMP buffer in milliseconds
    pub buffering: u32,
    /// Seconds without a segment before the transcoder is restarted
    pub timeout_secs: u64,
    pub transcoder: PathBuf,
}

impl Default for RelaySettings {
    fn default() -> Self {
        let defaults = RelayConfig::default();
        Self {
            client_id: defaults.client_id,
            server: String::new(),
            access_token: String::new(),
            resolution: defaults.resolution,
            buffering: defaults.buffering,
            timeout_secs: defaults.timeout.as_secs(),
            transcoder: defaults.transcoder,
        }
    }
}

impl RelaySettings {
    /// Build the session configuration for an access token.
    pub fn relay_config(&self, token: &AccessToken) -> RelayConfig {
        RelayConfig {
            transcoder: self.transcoder.clone(),
            client_id: self.client_id.clone(),
            server: self.server.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            resolution: self.resolution,
            buffering: self.buffering,
            ..RelayConfig::default()
        }
        .with_access_token(token)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8089,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Where per-track fMP4 files are written; recording is off when unset
    pub directory: Option<PathBuf>,
}

impl Config {
    /// Load settings from `path` (optional) and `LIVE_RELAY__*` variables.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        settings
            .try_deserialize()
            .context("Failed to parse configuration")
    }
}
