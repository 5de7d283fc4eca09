pub mod config;
pub mod http;
pub mod mux;
pub mod relay;
pub mod sink;

pub use config::Config;
pub use http::{create_router, AppState};
pub use mux::{MuxError, MuxEvent, Segment, SegmentKind, Segmenter, TrackDescriptor, TrackKind};
pub use relay::{
    AccessToken, LifecycleState, RelayConfig, RelayError, RelayEvent, RelayLifecycle, RelayStatus,
    Resolution,
};
pub use sink::{RecorderConfig, SegmentRecorder, TrackFileMetadata};
