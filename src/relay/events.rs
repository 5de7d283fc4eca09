use crate::mux::{Segment, TrackDescriptor};
use std::sync::Arc;

/// Events delivered to the embedder while a session is active.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Segment(Segment),
    /// Diagnostic line from the transcoder or a segmenter error
    Error(String),
    /// The transcoder closed its output
    End,
}

/// Notification from a session task to the lifecycle dispatcher.
#[derive(Debug)]
pub(crate) enum Notification {
    Session {
        generation: u64,
        event: SessionEvent,
    },
    /// The watchdog elapsed for the given arm epoch
    Starved { epoch: u64 },
}

#[derive(Debug)]
pub(crate) enum SessionEvent {
    Ready(Vec<Arc<TrackDescriptor>>),
    Segment(Segment),
    Error(String),
    End,
}
