use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::error::RelayError;

/// Stream variant requested from the relay server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[default]
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "540p")]
    P540,
    #[serde(rename = "360p")]
    P360,
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [Self::P1080, Self::P720, Self::P540, Self::P360];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P540 => "540p",
            Self::P360 => "360p",
        }
    }

    /// Suffix appended to the channel name; the full resolution has none
    pub fn channel_suffix(&self) -> String {
        match self {
            Self::P1080 => String::new(),
            other => format!("-{}", other.as_str()),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| RelayError::UnknownResolution(s.to_string()))
    }
}

/// Access token handed out by the relay: `<channel>-<token1>-<token2>`.
///
/// The channel may itself contain hyphens; the two token parts may not.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub channel: String,
    pub token1: String,
    pub token2: String,
}

impl AccessToken {
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let mut parts = raw.trim().rsplitn(3, '-');
        let token2 = parts.next().unwrap_or_default();
        let token1 = parts.next().unwrap_or_default();
        let channel = parts.next().unwrap_or_default();

        if channel.is_empty() || token1.is_empty() || token2.is_empty() {
            return Err(RelayError::InvalidAccessToken);
        }

        Ok(Self {
            channel: channel.to_string(),
            token1: token1.to_string(),
            token2: token2.to_string(),
        })
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Everything needed to run one relay session
#[derive(Clone)]
pub struct RelayConfig {
    /// Transcoder executable; a bare name is resolved on `PATH`
    pub transcoder: PathBuf,

    /// Identifies this receiver to the relay (e.g., output file names)
    pub client_id: String,

    /// Relay server host, optionally with port
    pub server: String,

    pub channel: String,

    pub token1: String,

    pub token2: String,

    /// Maximum time without a segment before the transcoder is restarted
    /// Default: 20 seconds
    pub timeout: Duration,

    pub resolution: Resolution,

    /// RTMP buffer length in milliseconds
    /// Default: 2000
    pub buffering: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            transcoder: PathBuf::from("ffmpeg"),
            client_id: uuid::Uuid::new_v4().to_string(),
            server: String::new(),
            channel: String::new(),
            token1: String::new(),
            token2: String::new(),
            timeout: Duration::from_secs(20),
            resolution: Resolution::P1080,
            buffering: 2000,
        }
    }
}

impl RelayConfig {
    /// Fill in channel and tokens from a parsed access token
    pub fn with_access_token(mut self, token: &AccessToken) -> Self {
        self.channel = token.channel.clone();
        self.token1 = token.token1.clone();
        self.token2 = token.token2.clone();
        self
    }

    /// `rtmps://<server>/stream/<channel>[-<resolution>]?key=<token1>-<token2>`
    pub fn source_url(&self) -> String {
        format!(
            "rtmps://{}/stream/{}{}?key={}-{}",
            self.server,
            self.channel,
            self.resolution.channel_suffix(),
            self.token1,
            self.token2
        )
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.server.trim().is_empty() {
            return Err(RelayError::InvalidConfig("relay server is empty".into()));
        }
        if self.channel.is_empty() {
            return Err(RelayError::InvalidConfig("channel is empty".into()));
        }
        if self.token1.is_empty() || self.token2.is_empty() {
            return Err(RelayError::InvalidConfig("access token is empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(RelayError::InvalidConfig("timeout must be positive".into()));
        }
        if self.transcoder.as_os_str().is_empty() {
            return Err(RelayError::InvalidConfig("transcoder path is empty".into()));
        }
        Ok(())
    }
}

// Keep the stream key out of logs
impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("transcoder", &self.transcoder)
            .field("client_id", &self.client_id)
            .field("server", &self.server)
            .field("channel", &self.channel)
            .field("timeout", &self.timeout)
            .field("resolution", &self.resolution)
            .field("buffering", &self.buffering)
            .finish_non_exhaustive()
    }
}
