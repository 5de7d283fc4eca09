use crate::config::RelaySettings;
use crate::relay::RelayLifecycle;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The relay controlled by this API
    pub relay: Arc<RelayLifecycle>,

    /// Settings used to build each session (login overrides are kept)
    pub settings: Arc<RwLock<RelaySettings>>,
}

impl AppState {
    pub fn new(relay: Arc<RelayLifecycle>, settings: RelaySettings) -> Self {
        Self {
            relay,
            settings: Arc::new(RwLock::new(settings)),
        }
    }
}
