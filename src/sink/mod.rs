mod recorder;

pub use recorder::{RecorderConfig, SegmentRecorder, TrackFileMetadata};
