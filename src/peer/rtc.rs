use super::sdp::apply_bitrate_cap;
use super::{
    spawn_sample_pump, ConnectionState, PeerConnection, PeerConnectionFactory, SampleWriter,
    SdpType, SessionDescription, TransceiverDirection, TransceiverInit,
};
use crate::capture::{MediaKind, MediaSample, MediaTrack};
use crate::errors::PeerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// WebRTC peer connection configuration
///
/// The default carries no ICE servers: the ingest side is expected to be
/// reachable directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
}

/// ICE server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl From<IceServer> for webrtc::ice_transport::ice_server::RTCIceServer {
    fn from(server: IceServer) -> Self {
        webrtc::ice_transport::ice_server::RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => ConnectionState::New,
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            RTCPeerConnectionState::Unspecified => ConnectionState::New,
        }
    }
}

impl From<TransceiverDirection> for RTCRtpTransceiverDirection {
    fn from(direction: TransceiverDirection) -> Self {
        match direction {
            TransceiverDirection::Sendrecv => RTCRtpTransceiverDirection::Sendrecv,
            TransceiverDirection::Sendonly => RTCRtpTransceiverDirection::Sendonly,
            TransceiverDirection::Recvonly => RTCRtpTransceiverDirection::Recvonly,
            TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
        }
    }
}

impl From<RTCSdpType> for SdpType {
    fn from(sdp_type: RTCSdpType) -> Self {
        match sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Rollback => SdpType::Rollback,
            RTCSdpType::Unspecified => SdpType::Offer,
        }
    }
}

impl TryFrom<SessionDescription> for RTCSessionDescription {
    type Error = PeerError;

    fn try_from(desc: SessionDescription) -> Result<Self, Self::Error> {
        let parsed = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpType::Rollback => {
                return Err(PeerError::Backend("Rollback SDP type not supported".to_string()))
            }
        };
        parsed.map_err(|e| PeerError::Backend(format!("Invalid SDP {:?}: {}", desc.sdp_type, e)))
    }
}

impl From<RTCSessionDescription> for SessionDescription {
    fn from(desc: RTCSessionDescription) -> Self {
        SessionDescription {
            sdp_type: desc.sdp_type.into(),
            sdp: desc.sdp,
        }
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line:
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_owned(),
            ..Default::default()
        },
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            ..Default::default()
        },
    }
}

/// Writes capture samples into a webrtc-rs sample track, which packetizes
/// them for the codec negotiated on the transceiver.
struct StaticSampleWriter {
    local: Arc<TrackLocalStaticSample>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SampleWriter for StaticSampleWriter {
    async fn write_sample(&self, sample: &MediaSample) -> Result<(), PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PeerError::Closed);
        }
        self.local
            .write_sample(&Sample {
                data: sample.data.clone(),
                duration: sample.duration,
                ..Default::default()
            })
            .await
            .map_err(|e| PeerError::Backend(format!("Failed to write sample: {}", e)))
    }
}

/// Drain RTCP for one sender. Reading is what lets the interceptors (NACK,
/// reports) run; picture loss feedback becomes a keyframe request.
async fn read_rtcp(sender: Arc<RTCRtpSender>, track: MediaTrack) {
    while let Ok((packets, _)) = sender.read_rtcp().await {
        let wants_keyframe = packets.iter().any(|packet| {
            let packet = packet.as_any();
            packet.is::<PictureLossIndication>() || packet.is::<FullIntraRequest>()
        });
        if wants_keyframe {
            log::debug!("Keyframe requested for track {}", track.id());
            track.request_keyframe();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// webrtc-rs backed peer connection.
///
/// Encoding caps are carried to the remote as `b=AS`/`b=TIAS` lines on the
/// matching media section of the local description. Every attached capture
/// track is pumped into an H.264 or Opus sample track until either side
/// closes.
pub struct RtcPeerConnection {
    id: String,
    peer_connection: Arc<RTCPeerConnection>,
    closed: Arc<AtomicBool>,
    video_cap_bps: Mutex<Option<u64>>,
    media_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RtcPeerConnection {
    /// Create a new peer connection
    pub async fn new(id: String, config: RtcConfiguration) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Backend(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PeerError::Backend(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = webrtc::peer_connection::configuration::RTCConfiguration {
            ice_servers: config.ice_servers.into_iter().map(|s| s.into()).collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| PeerError::Backend(format!("Failed to create peer connection: {}", e)))?,
        );

        let peer_id = id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            log::info!("Peer {} connection state: {}", peer_id, state);
            Box::pin(async {})
        }));

        Ok(Self {
            id,
            peer_connection,
            closed: Arc::new(AtomicBool::new(false)),
            video_cap_bps: Mutex::new(None),
            media_tasks: Mutex::new(Vec::new()),
        })
    }

    fn backend_error(&self, context: &str, err: webrtc::Error) -> PeerError {
        if self.is_closed() {
            PeerError::Closed
        } else {
            PeerError::Backend(format!("{}: {}", context, err))
        }
    }

    fn video_cap(&self) -> Option<u64> {
        *lock(&self.video_cap_bps)
    }

    /// Number of forwarding tasks still running.
    pub fn active_media_tasks(&self) -> usize {
        lock(&self.media_tasks)
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add_transceiver(&self, track: &MediaTrack, init: TransceiverInit) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }

        log::info!(
            "Adding {} transceiver ({:?}) for track {} on peer {}",
            track.kind(),
            init.direction,
            track.id(),
            self.id
        );

        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_owned(),
            format!("crabwhip-{}", self.id),
        ));

        let transceiver = self
            .peer_connection
            .add_transceiver_from_track(
                Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: init.direction.into(),
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| self.backend_error("Failed to add transceiver", e))?;

        if track.kind() == MediaKind::Video {
            if let Some(cap) = init.max_bitrate_bps() {
                *lock(&self.video_cap_bps) = Some(cap);
            }
        }

        let sender = transceiver.sender().await;
        let pump = spawn_sample_pump(
            track,
            StaticSampleWriter {
                local,
                closed: Arc::clone(&self.closed),
            },
        );
        let feedback = tokio::spawn(read_rtcp(sender, track.clone()));

        let mut tasks = lock(&self.media_tasks);
        tasks.push(tokio::spawn(async move {
            let _ = pump.await;
        }));
        tasks.push(feedback);

        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        log::info!("Creating SDP offer for peer {}", self.id);

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| self.backend_error("Failed to create offer", e))?;

        Ok(offer.into())
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let rtc_desc: RTCSessionDescription = desc.try_into()?;

        // Non-trickle: the offer leaves with every candidate gathered.
        let mut gathering_done = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection
            .set_local_description(rtc_desc)
            .await
            .map_err(|e| self.backend_error("Failed to set local description", e))?;
        let _ = gathering_done.recv().await;

        log::debug!("ICE gathering complete for peer {}", self.id);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let mut desc: SessionDescription = self.peer_connection.local_description().await?.into();
        if let Some(cap) = self.video_cap() {
            desc.sdp = apply_bitrate_cap(&desc.sdp, MediaKind::Video, cap);
        }
        Some(desc)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        log::info!("Setting remote description for peer {}", self.id);

        let rtc_desc: RTCSessionDescription = desc.try_into()?;
        self.peer_connection
            .set_remote_description(rtc_desc)
            .await
            .map_err(|e| self.backend_error("Failed to set remote description", e))
    }

    fn connection_state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            return ConnectionState::Closed;
        }
        self.peer_connection.connection_state().into()
    }

    async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("Closing peer connection {}", self.id);

        for task in lock(&self.media_tasks).drain(..) {
            task.abort();
        }
        self.peer_connection
            .close()
            .await
            .map_err(|e| PeerError::Backend(format!("Failed to close peer connection: {}", e)))
    }
}

/// Factory for [`RtcPeerConnection`]s sharing one configuration.
#[derive(Debug, Clone, Default)]
pub struct RtcPeerFactory {
    config: RtcConfiguration,
}

impl RtcPeerFactory {
    pub fn new(config: RtcConfiguration) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(&self, id: String) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = RtcPeerConnection::new(id, self.config.clone()).await?;
        Ok(Arc::new(peer))
    }
}
