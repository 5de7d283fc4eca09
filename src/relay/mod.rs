//! The stream relay: transcoder supervision, starvation watchdog and the
//! lifecycle facade tying them to the segmenter.

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod supervisor;
pub mod watchdog;

pub use config::{AccessToken, RelayConfig, Resolution};
pub use error::RelayError;
pub use events::RelayEvent;
pub use lifecycle::{LifecycleState, RelayLifecycle, RelayStatus};
pub use supervisor::{transcoder_args, Transcoder, GRACE_PERIOD};
pub use watchdog::StarvationWatchdog;
