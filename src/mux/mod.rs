//! Fragmented MP4 re-segmentation.
//!
//! Turns the transcoder's single multi-track fMP4 byte stream into
//! per-track init and media segments for progressive playback.

mod boxes;
mod codec;
mod error;
mod fragment;
mod segmenter;
mod track;

pub use boxes::{BoxHeader, FourCc};
pub use codec::codec_string;
pub use error::{MuxError, Result};
pub use fragment::Sample;
pub use segmenter::{MuxEvent, SegmentOptions, Segmenter, MAX_BOX_SIZE};
pub use track::{Segment, SegmentKind, TrackDescriptor, TrackKind};
