//! Error types for the fragmented MP4 segmenter.

use super::boxes::FourCc;
use thiserror::Error;

/// Result type for segmenter operations.
pub type Result<T> = std::result::Result<T, MuxError>;

/// Errors raised while re-segmenting the transcoder's byte stream.
///
/// None of these are fatal: the segmenter resynchronises on the next
/// movie fragment and keeps accepting bytes.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Bytes could not be parsed as ISO-BMFF.
    #[error("malformed stream: {0}")]
    MalformedStream(String),

    /// A chunk was appended past the end of the buffered stream.
    #[error("stream discontinuity: expected offset {expected}, got {got}")]
    Discontinuity { expected: u64, got: u64 },

    /// A box declared a size larger than the segmenter is willing to buffer.
    #[error("box {fourcc} of {size} bytes exceeds maximum {max}")]
    BoxTooLarge { fourcc: FourCc, size: u64, max: u64 },
}

impl MuxError {
    /// Create a malformed stream error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedStream(msg.into())
    }
}
