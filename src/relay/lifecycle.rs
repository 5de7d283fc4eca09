use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::{RelayConfig, Resolution};
use super::error::RelayError;
use super::events::{Notification, RelayEvent, SessionEvent};
use super::supervisor::Transcoder;
use super::watchdog::StarvationWatchdog;
use crate::mux::TrackDescriptor;

/// Relay lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Starting,
    Active,
    Stopping,
}

/// Snapshot of the relay for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub state: LifecycleState,

    /// Incremented on every (re)start
    pub generation: u64,

    /// Watchdog restarts since the last explicit start
    pub restarts: u64,

    /// Segments delivered in the current session
    pub segments: u64,

    pub started_at: Option<DateTime<Utc>>,

    pub channel: Option<String>,

    pub resolution: Option<Resolution>,

    pub tracks: Vec<TrackDescriptor>,
}

struct Session {
    transcoder: Transcoder,
    started_at: DateTime<Utc>,
    segments: u64,
    tracks: Vec<Arc<TrackDescriptor>>,
}

struct Inner {
    state: LifecycleState,
    generation: u64,
    restarts: u64,
    config: Option<RelayConfig>,
    session: Option<Session>,
    watchdog: StarvationWatchdog,
}

struct Shared {
    inner: Mutex<Inner>,

    /// Handed to each session's tasks
    notifier: UnboundedSender<Notification>,

    /// Embedder-facing events
    events: UnboundedSender<RelayEvent>,
}

/// The relay facade: owns the transcoder, segmenter and watchdog of the
/// current session and serialises start, stop and watchdog restarts.
pub struct RelayLifecycle {
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
}

impl RelayLifecycle {
    /// Create an idle relay and the receiver its events are delivered on.
    ///
    /// Must be called within a tokio runtime.
    pub fn new() -> (Self, UnboundedReceiver<RelayEvent>) {
        let (notifier, notifications) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        let starved = notifier.clone();
        let watchdog = StarvationWatchdog::new(move |epoch| {
            let _ = starved.send(Notification::Starved { epoch });
        });

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: LifecycleState::Idle,
                generation: 0,
                restarts: 0,
                config: None,
                session: None,
                watchdog,
            }),
            notifier,
            events,
        });

        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&shared), notifications));

        (Self { shared, dispatcher }, events_rx)
    }

    /// Start a session, stopping the current one first.
    ///
    /// Returns once the transcoder has been spawned; whether it actually
    /// streams is reported through events.
    pub async fn start(&self, config: RelayConfig) -> Result<(), RelayError> {
        config.validate()?;

        let mut inner = self.shared.inner.lock().await;
        if inner.state != LifecycleState::Idle {
            info!("Relay already running, restarting with new configuration");
            inner.stop_session().await;
        }
        inner.restarts = 0;
        inner.start_session(config, &self.shared.notifier)
    }

    /// Stop the current session. Stopping an idle relay is a no-op.
    ///
    /// No event of the stopped session is delivered after this returns.
    pub async fn stop(&self) -> Result<(), RelayError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state == LifecycleState::Idle {
            debug!("Relay already stopped");
            return Ok(());
        }
        inner.stop_session().await;
        Ok(())
    }

    pub async fn state(&self) -> LifecycleState {
        self.shared.inner.lock().await.state
    }

    pub async fn is_active(&self) -> bool {
        self.state().await == LifecycleState::Active
    }

    pub async fn status(&self) -> RelayStatus {
        let inner = self.shared.inner.lock().await;
        let session = inner.session.as_ref();
        RelayStatus {
            state: inner.state,
            generation: inner.generation,
            restarts: inner.restarts,
            segments: session.map_or(0, |s| s.segments),
            started_at: session.map(|s| s.started_at),
            channel: inner.config.as_ref().map(|c| c.channel.clone()),
            resolution: inner.config.as_ref().map(|c| c.resolution),
            tracks: session
                .map(|s| s.tracks.iter().map(|t| (**t).clone()).collect())
                .unwrap_or_default(),
        }
    }
}

impl Drop for RelayLifecycle {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl Inner {
    fn start_session(
        &mut self,
        config: RelayConfig,
        notifier: &UnboundedSender<Notification>,
    ) -> Result<(), RelayError> {
        self.state = LifecycleState::Starting;
        self.generation += 1;

        let transcoder = match Transcoder::launch(&config, self.generation, notifier.clone()) {
            Ok(transcoder) => transcoder,
            Err(e) => {
                error!("Failed to start relay: {}", e);
                self.state = LifecycleState::Idle;
                self.config = None;
                return Err(e);
            }
        };

        info!(
            "Relay active: channel {} at {} ({}), timeout {}s",
            config.channel,
            config.server,
            config.resolution,
            config.timeout.as_secs()
        );

        self.watchdog.arm(config.timeout);
        self.session = Some(Session {
            transcoder,
            started_at: Utc::now(),
            segments: 0,
            tracks: Vec::new(),
        });
        self.config = Some(config);
        self.state = LifecycleState::Active;
        Ok(())
    }

    async fn stop_session(&mut self) {
        self.state = LifecycleState::Stopping;
        self.watchdog.disarm();
        if let Some(mut session) = self.session.take() {
            session.transcoder.terminate().await;
            info!(
                "Relay session {} stopped after {} segments",
                session.transcoder.generation(),
                session.segments
            );
        }
        self.state = LifecycleState::Idle;
    }
}

impl Shared {
    async fn on_session_event(&self, generation: u64, event: SessionEvent) {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::Active || inner.generation != generation {
            debug!("Dropping event from stale session {}", generation);
            return;
        }

        let forward = match event {
            SessionEvent::Ready(tracks) => {
                inner.watchdog.reset();
                if let Some(session) = inner.session.as_mut() {
                    session.tracks = tracks;
                }
                None
            }
            SessionEvent::Segment(segment) => {
                inner.watchdog.reset();
                if let Some(session) = inner.session.as_mut() {
                    session.segments += 1;
                }
                Some(RelayEvent::Segment(segment))
            }
            SessionEvent::Error(message) => {
                debug!("Relay error: {}", message);
                Some(RelayEvent::Error(message))
            }
            SessionEvent::End => {
                info!("Transcoder output ended");
                Some(RelayEvent::End)
            }
        };

        if let Some(event) = forward {
            let _ = self.events.send(event);
        }
    }

    async fn on_starved(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::Active || !inner.watchdog.is_current(epoch) {
            return;
        }
        let Some(config) = inner.config.clone() else {
            return;
        };

        warn!(
            "data receiving timeout ({}s) -- restarting transcoder",
            config.timeout.as_secs()
        );
        inner.restarts += 1;
        inner.stop_session().await;

        if let Err(e) = inner.start_session(config, &self.notifier) {
            let _ = self.events.send(RelayEvent::Error(format!("restart failed: {e}")));
        }
    }
}

async fn dispatch(shared: Weak<Shared>, mut notifications: UnboundedReceiver<Notification>) {
    while let Some(notification) = notifications.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match notification {
            Notification::Session { generation, event } => {
                shared.on_session_event(generation, event).await
            }
            Notification::Starved { epoch } => shared.on_starved(epoch).await,
        }
    }
}
