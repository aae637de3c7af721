//! Publish lifecycle controller
//!
//! Drives `Idle → Acquiring → Negotiating → Live`, with `Closed` reachable
//! from every state. Each (re)start tears the previous session down
//! completely, then creates a fresh connection and spawns the attempt.
//!
//! The controller state sits behind one async mutex that is held for the
//! whole teardown-then-start sequence, and attempts take the same mutex
//! before they report progress. An attempt that finds its generation
//! superseded, or its session torn down, drops its result silently.

use crate::auth::bearer_token_from_path;
use crate::capture::{CaptureSource, MediaDevices, MediaTrack};
use crate::config::PublisherConfig;
use crate::constraints::{from_query_string, MediaConstraints, PublishSettings};
use crate::errors::PublishError;
use crate::negotiator::{negotiate, WhipClient};
use crate::peer::PeerConnectionFactory;
use crate::session::{Session, SessionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Everything fixed for the controller's lifetime.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub constraints: MediaConstraints,
    pub settings: PublishSettings,
    /// Full WHIP endpoint URL
    pub endpoint: String,
    pub publish_segment: String,
}

impl ControllerOptions {
    pub fn new(endpoint: impl Into<String>, constraints: MediaConstraints, settings: PublishSettings) -> Self {
        Self {
            constraints,
            settings,
            endpoint: endpoint.into(),
            publish_segment: crate::auth::DEFAULT_PUBLISH_SEGMENT.to_string(),
        }
    }

    /// Options for `config` with constraints parsed from `query`.
    pub fn from_config(config: &PublisherConfig, query: &str) -> Self {
        let (constraints, settings) = from_query_string(query);
        Self {
            constraints,
            settings,
            endpoint: config.whip_endpoint(),
            publish_segment: config.auth.publish_segment.clone(),
        }
    }
}

/// What the display layer gets to see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishStatus {
    pub session_id: Option<String>,
    pub state: SessionState,
    pub error: Option<PublishError>,
    /// Publish succeeded for the current session
    pub live: bool,
    pub display_capture: bool,
    pub live_since: Option<DateTime<Utc>>,
}

impl PublishStatus {
    fn idle(display_capture: bool) -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            error: None,
            live: false,
            display_capture,
            live_since: None,
        }
    }

    /// Error name for the display layer's message lookup.
    pub fn error_name(&self) -> Option<&'static str> {
        self.error.as_ref().map(|e| e.name())
    }
}

struct ControllerState {
    generation: u64,
    path: Option<String>,
    display_capture: bool,
    session: Option<Arc<Session>>,
}

struct Inner {
    options: ControllerOptions,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    http: reqwest::Client,
    state: Mutex<ControllerState>,
    status: watch::Sender<PublishStatus>,
    attempts: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the publisher. Clones share one controller.
#[derive(Clone)]
pub struct PublishController {
    inner: Arc<Inner>,
}

impl PublishController {
    pub fn new(
        options: ControllerOptions,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let display_capture = options.settings.use_display_capture;
        let (status, _) = watch::channel(PublishStatus::idle(display_capture));

        Self {
            inner: Arc::new(Inner {
                options,
                devices,
                peers,
                http: reqwest::Client::new(),
                state: Mutex::new(ControllerState {
                    generation: 0,
                    path: None,
                    display_capture,
                    session: None,
                }),
                status,
                attempts: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.inner.options
    }

    /// Start publishing for `path`, replacing any current session.
    pub async fn start(&self, path: &str) -> Result<String, PublishError> {
        let mut state = self.inner.state.lock().await;
        self.inner.restart(&mut state, path.to_string()).await
    }

    /// Restart when the navigation path changed. Returns the new session id.
    pub async fn navigate(&self, path: &str) -> Result<Option<String>, PublishError> {
        let mut state = self.inner.state.lock().await;
        if state.path.as_deref() == Some(path) {
            return Ok(None);
        }
        self.inner.restart(&mut state, path.to_string()).await.map(Some)
    }

    /// Flip between camera/microphone and screen capture. Returns the new mode.
    pub async fn toggle_capture_mode(&self) -> Result<bool, PublishError> {
        let mut state = self.inner.state.lock().await;
        let display = !state.display_capture;
        self.inner.switch_capture_mode(&mut state, display).await?;
        Ok(display)
    }

    /// Select the capture mode, restarting only on a change.
    pub async fn set_capture_mode(&self, display: bool) -> Result<Option<String>, PublishError> {
        let mut state = self.inner.state.lock().await;
        if state.display_capture == display {
            return Ok(None);
        }
        self.inner.switch_capture_mode(&mut state, display).await
    }

    /// Tear the current session down and detach.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(session) = state.session.take() {
            log::info!("Stopping session {}", session.id());
            session.teardown().await;
        }
        state.generation += 1;
        state.path = None;

        self.inner.status.send_modify(|status| {
            status.state = SessionState::Closed;
            status.error = None;
            status.live = false;
            status.live_since = None;
        });
    }

    pub fn status(&self) -> PublishStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PublishStatus> {
        self.inner.status.subscribe()
    }

    /// Tracks of the current session for local rendering.
    pub async fn preview(&self) -> Vec<MediaTrack> {
        let state = self.inner.state.lock().await;
        state
            .session
            .as_ref()
            .map(|session| session.preview_tracks())
            .unwrap_or_default()
    }

    /// Wait until the current session is live or closed.
    pub async fn settled(&self) -> PublishStatus {
        let mut rx = self.inner.status.subscribe();
        let settled = rx
            .wait_for(|status| status.state.is_settled())
            .await
            .map(|status| status.clone());
        settled.unwrap_or_else(|_| self.status())
    }

    /// Wait for every spawned attempt, including superseded ones, to finish.
    pub async fn join_attempts(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut attempts = self
                .inner
                .attempts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            attempts.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("Publish attempt task failed: {}", e);
            }
        }
    }
}

impl Inner {
    async fn restart(self: &Arc<Self>, state: &mut ControllerState, path: String) -> Result<String, PublishError> {
        if let Some(previous) = state.session.take() {
            log::info!("Tearing down session {} before restart", previous.id());
            previous.teardown().await;
        }

        state.generation += 1;
        let generation = state.generation;
        let session_id = uuid::Uuid::new_v4().to_string();
        let token = bearer_token_from_path(&path, &self.options.publish_segment);
        let source = CaptureSource::from_display_flag(state.display_capture);
        state.path = Some(path);

        self.status.send_replace(PublishStatus {
            session_id: Some(session_id.clone()),
            state: SessionState::Acquiring,
            error: None,
            live: false,
            display_capture: state.display_capture,
            live_since: None,
        });

        let peer = match self.peers.create(session_id.clone()).await {
            Ok(peer) => peer,
            Err(e) => {
                let error = PublishError::from(e);
                log::warn!("Failed to create peer for session {}: {}", session_id, error);
                self.status.send_modify(|status| {
                    status.state = SessionState::Closed;
                    status.error = Some(error.clone());
                });
                return Err(error);
            }
        };

        let session = Arc::new(Session::new(session_id.clone(), source, peer));
        state.session = Some(Arc::clone(&session));

        log::info!(
            "Starting session {} ({:?} capture) towards {}",
            session_id,
            source,
            self.options.endpoint
        );
        let client = WhipClient::with_client(self.http.clone(), self.options.endpoint.clone(), token);
        let handle = tokio::spawn(Arc::clone(self).run_attempt(session, generation, client));

        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        attempts.retain(|h| !h.is_finished());
        attempts.push(handle);

        Ok(session_id)
    }

    async fn switch_capture_mode(
        self: &Arc<Self>,
        state: &mut ControllerState,
        display: bool,
    ) -> Result<Option<String>, PublishError> {
        state.display_capture = display;
        log::info!("Capture mode set to {}", if display { "display" } else { "user" });

        match state.path.clone() {
            Some(path) => self.restart(state, path).await.map(Some),
            None => {
                self.status.send_modify(|status| status.display_capture = display);
                Ok(None)
            }
        }
    }

    async fn run_attempt(self: Arc<Self>, session: Arc<Session>, generation: u64, client: WhipClient) {
        let acquired = self
            .devices
            .acquire(&self.options.constraints, session.source())
            .await;
        let capture = match acquired {
            Ok(capture) => capture,
            Err(e) => {
                log::warn!("Capture failed for session {}: {}", session.id(), e);
                self.fail(&session, generation, e.into()).await;
                return;
            }
        };

        let tracks = match session.adopt_capture(capture) {
            Ok(tracks) => tracks,
            Err(abort) => {
                log::debug!("Session {}: {}", session.id(), abort);
                return;
            }
        };

        let negotiating = self
            .publish_if_current(&session, generation, |status| {
                status.state = SessionState::Negotiating;
            })
            .await;
        if !negotiating {
            return;
        }

        let kbps = self.options.settings.target_bitrate_kbps;
        match negotiate(session.peer().as_ref(), &tracks, kbps, &client).await {
            Ok(_) => {
                let live = self
                    .publish_if_current(&session, generation, |status| {
                        status.state = SessionState::Live;
                        status.live = true;
                        status.live_since = Some(Utc::now());
                    })
                    .await;
                if live {
                    log::info!("Session {} is live", session.id());
                }
            }
            Err(e) => {
                log::warn!("Negotiation failed for session {}: {}", session.id(), e);
                self.fail(&session, generation, e.into()).await;
            }
        }
    }

    async fn publish_if_current<F>(&self, session: &Session, generation: u64, update: F) -> bool
    where
        F: FnOnce(&mut PublishStatus),
    {
        let state = self.state.lock().await;
        if state.generation != generation || session.is_torn_down() {
            log::debug!("Discarding progress of superseded session {}", session.id());
            return false;
        }
        self.status.send_modify(update);
        drop(state);
        true
    }

    /// Close `session` and report `error` if it is still the current one.
    async fn fail(&self, session: &Session, generation: u64, error: PublishError) {
        let mut state = self.state.lock().await;
        session.teardown().await;
        if state.generation != generation {
            log::debug!("Dropping error of superseded session {}: {}", session.id(), error);
            return;
        }

        state.session = None;
        self.status.send_modify(|status| {
            status.state = SessionState::Closed;
            status.error = Some(error);
            status.live = false;
            status.live_since = None;
        });
    }
}
