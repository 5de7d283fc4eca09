use std::path::PathBuf;
use thiserror::Error;

/// Errors returned synchronously by the relay.
///
/// Problems that happen while streaming (transcoder diagnostics, malformed
/// bytes) are reported as [`RelayEvent::Error`](super::RelayEvent::Error)
/// instead.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The transcoder executable could not be spawned.
    #[error("failed to launch transcoder {}: {source}", path.display())]
    LaunchFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid relay configuration: {0}")]
    InvalidConfig(String),

    /// Not of the form `<channel>-<token1>-<token2>`.
    #[error("invalid access token")]
    InvalidAccessToken,

    #[error("unknown resolution {0:?} (expected one of 1080p, 720p, 540p, 360p)")]
    UnknownResolution(String),
}
