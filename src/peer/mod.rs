//! Peer connection abstraction used by the negotiator
//!
//! [`PeerConnection`] is the small slice of a WebRTC peer connection the
//! publish path needs: send-only transceivers with encoding parameters, an
//! offer, and an answer. [`rtc::RtcPeerConnection`] implements it on top of
//! webrtc-rs; tests use the in-memory peer from [`crate::testing`].
//!
//! Once a track is attached, [`spawn_sample_pump`] copies its encoded samples
//! into the peer's outbound track until the capture track stops.

pub mod rtc;
pub mod sdp;

pub use rtc::{IceServer, RtcConfiguration, RtcPeerConnection, RtcPeerFactory};

use crate::capture::{MediaSample, MediaTrack};
use crate::errors::PeerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// WebRTC peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// SDP (Session Description Protocol) type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Transceiver direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransceiverDirection {
    Sendrecv,
    Sendonly,
    Recvonly,
    Inactive,
}

impl TransceiverDirection {
    pub fn as_sdp_attribute(&self) -> &'static str {
        match self {
            TransceiverDirection::Sendrecv => "sendrecv",
            TransceiverDirection::Sendonly => "sendonly",
            TransceiverDirection::Recvonly => "recvonly",
            TransceiverDirection::Inactive => "inactive",
        }
    }
}

/// One outbound encoding layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEncoding {
    pub rid: String,
    /// Ceiling in bits per second, `None` leaves the rate to the congestion controller.
    pub max_bitrate_bps: Option<u64>,
}

/// Parameters for attaching a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransceiverInit {
    pub direction: TransceiverDirection,
    pub send_encodings: Vec<SendEncoding>,
}

impl TransceiverInit {
    pub fn send_only() -> Self {
        Self {
            direction: TransceiverDirection::Sendonly,
            send_encodings: Vec::new(),
        }
    }

    pub fn with_encoding(mut self, encoding: SendEncoding) -> Self {
        self.send_encodings.push(encoding);
        self
    }

    /// Lowest cap across the encodings, if any carries one.
    pub fn max_bitrate_bps(&self) -> Option<u64> {
        self.send_encodings
            .iter()
            .filter_map(|e| e.max_bitrate_bps)
            .min()
    }
}

/// Peer connection as seen by the negotiator. One instance per attempt.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn id(&self) -> &str;

    /// Attach `track` with the given direction and encodings.
    async fn add_transceiver(&self, track: &MediaTrack, init: TransceiverInit) -> Result<(), PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Local description as it should go on the wire.
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    fn connection_state(&self) -> ConnectionState;

    fn is_closed(&self) -> bool {
        self.connection_state() == ConnectionState::Closed
    }

    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates a fresh connection handle for every attempt.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, id: String) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// Outbound half of an attached track.
#[async_trait]
pub trait SampleWriter: Send + Sync {
    async fn write_sample(&self, sample: &MediaSample) -> Result<(), PeerError>;
}

/// Forward `track`'s samples into `writer` until the track stops or the
/// writer reports the connection closed. Resolves to the number of samples
/// written.
///
/// The subscription is taken before this returns, so nothing the backend
/// pushes after attachment is missed.
pub fn spawn_sample_pump<W>(track: &MediaTrack, writer: W) -> JoinHandle<u64>
where
    W: SampleWriter + 'static,
{
    let mut samples = track.subscribe();
    let track = track.clone();

    tokio::spawn(async move {
        let mut written = 0u64;
        loop {
            match samples.recv().await {
                Ok(sample) => match writer.write_sample(&sample).await {
                    Ok(()) => written += 1,
                    Err(PeerError::Closed) => break,
                    Err(e) => log::debug!("Dropped {} sample: {}", track.kind(), e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("{} track {} lagged, skipped {} sample(s)", track.kind(), track.id(), skipped);
                    track.request_keyframe();
                }
                Err(RecvError::Closed) => break,
            }
        }
        log::debug!("Sample pump for track {} finished after {} sample(s)", track.id(), written);
        written
    })
}
