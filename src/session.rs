//! One publish attempt's resources
//!
//! A [`Session`] owns the connection handle created for the attempt and, once
//! capture resolves, the captured tracks. Teardown closes the connection and
//! stops every track the session ever adopted. Capture that resolves after
//! teardown is refused and released on the spot.

use crate::capture::{CaptureResult, CaptureSource, MediaTrack};
use crate::errors::RaceAbort;
use crate::peer::PeerConnection;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Lifecycle position of the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Acquiring,
    Negotiating,
    Live,
    Closed,
}

impl SessionState {
    /// No further transition happens without a new start.
    pub fn is_settled(&self) -> bool {
        matches!(self, SessionState::Live | SessionState::Closed)
    }
}

pub struct Session {
    id: String,
    source: CaptureSource,
    peer: Arc<dyn PeerConnection>,
    capture: Mutex<Option<CaptureResult>>,
    torn_down: AtomicBool,
}

impl Session {
    pub fn new(id: impl Into<String>, source: CaptureSource, peer: Arc<dyn PeerConnection>) -> Self {
        Self {
            id: id.into(),
            source,
            peer,
            capture: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> CaptureSource {
        self.source
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn slot(&self) -> MutexGuard<'_, Option<CaptureResult>> {
        self.capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take ownership of resolved capture and return the tracks to attach.
    ///
    /// Fails with [`RaceAbort`] if the session was torn down or its connection
    /// closed while capture was pending; the capture is released first.
    pub fn adopt_capture(&self, capture: CaptureResult) -> Result<Vec<MediaTrack>, RaceAbort> {
        let mut slot = self.slot();
        if self.is_torn_down() || self.peer.is_closed() {
            let stopped = capture.stop_all();
            log::debug!(
                "Session {} closed before capture resolved, released {} track(s)",
                self.id,
                stopped
            );
            return Err(RaceAbort);
        }

        let tracks = capture.tracks().to_vec();
        *slot = Some(capture);
        Ok(tracks)
    }

    /// Tracks for local preview. The session keeps ownership.
    pub fn preview_tracks(&self) -> Vec<MediaTrack> {
        self.slot()
            .as_ref()
            .map(|capture| capture.tracks().to_vec())
            .unwrap_or_default()
    }

    /// Close the connection and stop every adopted track. Idempotent.
    pub async fn teardown(&self) {
        let capture = {
            let mut slot = self.slot();
            self.torn_down.store(true, Ordering::SeqCst);
            slot.take()
        };

        if let Some(capture) = capture {
            let stopped = capture.stop_all();
            log::debug!("Session {} stopped {} track(s)", self.id, stopped);
        }

        if let Err(e) = self.peer.close().await {
            log::warn!("Failed to close peer for session {}: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("peer_state", &self.peer.connection_state())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MediaKind;
    use crate::testing::LoopbackPeer;

    fn session() -> (Session, Arc<LoopbackPeer>) {
        let peer = Arc::new(LoopbackPeer::new("s1"));
        let session = Session::new("s1", CaptureSource::User, Arc::clone(&peer) as Arc<dyn PeerConnection>);
        (session, peer)
    }

    fn capture() -> (CaptureResult, Vec<MediaTrack>) {
        let tracks = vec![
            MediaTrack::new(MediaKind::Audio, "mic"),
            MediaTrack::new(MediaKind::Video, "cam"),
        ];
        (CaptureResult::new(CaptureSource::User, tracks.clone()), tracks)
    }

    #[tokio::test]
    async fn test_teardown_stops_tracks_and_closes_peer() {
        let (session, peer) = session();
        let (result, tracks) = capture();

        let adopted = session.adopt_capture(result).unwrap();
        assert_eq!(adopted.len(), 2);
        assert_eq!(session.preview_tracks().len(), 2);

        session.teardown().await;
        assert!(tracks.iter().all(|t| t.is_stopped()));
        assert!(peer.is_closed());
        assert!(session.preview_tracks().is_empty());

        session.teardown().await;
    }

    #[tokio::test]
    async fn test_capture_after_teardown_is_released() {
        let (session, _peer) = session();
        session.teardown().await;

        let (result, tracks) = capture();
        assert!(matches!(session.adopt_capture(result), Err(RaceAbort)));
        assert!(tracks.iter().all(|t| t.is_stopped()));
    }

    #[tokio::test]
    async fn test_capture_after_peer_closed_is_released() {
        let (session, peer) = session();
        peer.close().await.unwrap();

        let (result, tracks) = capture();
        assert!(session.adopt_capture(result).is_err());
        assert!(tracks.iter().all(|t| t.is_stopped()));
        assert!(peer.transceivers().is_empty());
    }

    #[test]
    fn test_settled_states() {
        assert!(SessionState::Live.is_settled());
        assert!(SessionState::Closed.is_settled());
        assert!(!SessionState::Negotiating.is_settled());
    }
}
