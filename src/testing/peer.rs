//! In-memory peer connection
//!
//! Records what the negotiator attaches and builds a small but well-formed
//! SDP offer from it. Applying any SDP answer moves the peer to `Connected`.
//! Samples of attached tracks are collected as if they had been sent.

use super::lock;
use crate::capture::{MediaKind, MediaSample, MediaTrack};
use crate::errors::PeerError;
use crate::peer::sdp::{apply_bitrate_cap, looks_like_sdp};
use crate::peer::{
    spawn_sample_pump, ConnectionState, PeerConnection, PeerConnectionFactory, SampleWriter,
    SdpType, SessionDescription, TransceiverInit,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// A track attached to a [`LoopbackPeer`] and the parameters it was attached with.
#[derive(Debug, Clone)]
pub struct AttachedTrack {
    pub track: MediaTrack,
    pub init: TransceiverInit,
}

/// Everything the loopback peer "sent".
struct SentMedia {
    closed: AtomicBool,
    samples: Mutex<Vec<(MediaKind, MediaSample)>>,
    count: watch::Sender<usize>,
}

struct LoopbackWriter {
    kind: MediaKind,
    media: Arc<SentMedia>,
}

#[async_trait]
impl SampleWriter for LoopbackWriter {
    async fn write_sample(&self, sample: &MediaSample) -> Result<(), PeerError> {
        if self.media.closed.load(Ordering::SeqCst) {
            return Err(PeerError::Closed);
        }
        let total = {
            let mut samples = lock(&self.media.samples);
            samples.push((self.kind, sample.clone()));
            samples.len()
        };
        self.media.count.send_replace(total);
        Ok(())
    }
}

pub struct LoopbackPeer {
    id: String,
    state: Mutex<ConnectionState>,
    transceivers: Mutex<Vec<AttachedTrack>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    media: Arc<SentMedia>,
}

impl LoopbackPeer {
    pub fn new(id: impl Into<String>) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            id: id.into(),
            state: Mutex::new(ConnectionState::New),
            transceivers: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            media: Arc::new(SentMedia {
                closed: AtomicBool::new(false),
                samples: Mutex::new(Vec::new()),
                count,
            }),
        }
    }

    /// Samples forwarded from attached tracks, in arrival order.
    pub fn sent_samples(&self) -> Vec<(MediaKind, MediaSample)> {
        lock(&self.media.samples).clone()
    }

    /// Wait until at least `n` samples have been forwarded.
    pub async fn wait_for_samples(&self, n: usize) {
        let mut rx = self.media.count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    pub fn transceivers(&self) -> Vec<AttachedTrack> {
        lock(&self.transceivers).clone()
    }

    pub fn attached_kinds(&self) -> Vec<MediaKind> {
        lock(&self.transceivers).iter().map(|t| t.track.kind()).collect()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.remote).clone()
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    fn build_offer(&self) -> String {
        let transceivers = lock(&self.transceivers);
        let payload_type = |kind: MediaKind| match kind {
            MediaKind::Audio => 111,
            MediaKind::Video => 96,
        };

        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            transceivers.len()
        );
        for (mid, attached) in transceivers.iter().enumerate() {
            let kind = attached.track.kind();
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF {}\r\nc=IN IP4 0.0.0.0\r\na=mid:{}\r\na={}\r\na=msid:{} {}\r\n",
                kind,
                payload_type(kind),
                mid,
                attached.init.direction.as_sdp_attribute(),
                self.id,
                attached.track.id()
            ));
            for encoding in &attached.init.send_encodings {
                sdp.push_str(&format!("a=rid:{} send\r\n", encoding.rid));
            }
        }

        if let Some(cap) = transceivers
            .iter()
            .filter(|t| t.track.kind() == MediaKind::Video)
            .find_map(|t| t.init.max_bitrate_bps())
        {
            sdp = apply_bitrate_cap(&sdp, MediaKind::Video, cap);
        }
        sdp
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add_transceiver(&self, track: &MediaTrack, init: TransceiverInit) -> Result<(), PeerError> {
        self.ensure_open()?;
        lock(&self.transceivers).push(AttachedTrack {
            track: track.clone(),
            init,
        });
        spawn_sample_pump(
            track,
            LoopbackWriter {
                kind: track.kind(),
                media: Arc::clone(&self.media),
            },
        );
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(self.build_offer()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        *lock(&self.local) = Some(desc);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.local).clone()
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        if desc.sdp_type != SdpType::Answer {
            return Err(PeerError::Backend(format!(
                "expected an answer, got {:?}",
                desc.sdp_type
            )));
        }
        if !looks_like_sdp(&desc.sdp) {
            return Err(PeerError::Backend("remote description is not SDP".to_string()));
        }

        *lock(&self.remote) = Some(desc);
        *lock(&self.state) = ConnectionState::Connected;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.media.closed.store(true, Ordering::SeqCst);
        *lock(&self.state) = ConnectionState::Closed;
        Ok(())
    }
}

/// Hands out [`LoopbackPeer`]s and keeps them for inspection.
#[derive(Default)]
pub struct LoopbackPeerFactory {
    peers: Mutex<Vec<Arc<LoopbackPeer>>>,
    open_at_create: Mutex<Vec<usize>>,
}

impl LoopbackPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        lock(&self.peers).clone()
    }

    pub fn last_peer(&self) -> Option<Arc<LoopbackPeer>> {
        lock(&self.peers).last().cloned()
    }

    /// For each `create` call, how many earlier peers were still open.
    pub fn open_peers_at_create(&self) -> Vec<usize> {
        lock(&self.open_at_create).clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackPeerFactory {
    async fn create(&self, id: String) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = Arc::new(LoopbackPeer::new(id));
        {
            let mut peers = lock(&self.peers);
            let open = peers.iter().filter(|p| !p.is_closed()).count();
            lock(&self.open_at_create).push(open);
            peers.push(Arc::clone(&peer));
        }
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::SendEncoding;

    #[tokio::test]
    async fn test_offer_reflects_transceivers() {
        let peer = LoopbackPeer::new("loop");
        peer.add_transceiver(&MediaTrack::new(MediaKind::Audio, "mic"), TransceiverInit::send_only())
            .await
            .unwrap();
        peer.add_transceiver(
            &MediaTrack::new(MediaKind::Video, "cam"),
            TransceiverInit::send_only().with_encoding(SendEncoding {
                rid: "high".to_string(),
                max_bitrate_bps: Some(1_024_000),
            }),
        )
        .await
        .unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.sdp.starts_with("v=0\r\n"));
        assert_eq!(offer.sdp.matches("a=sendonly").count(), 2);
        assert!(offer.sdp.contains("a=rid:high send"));
        assert!(offer.sdp.contains("b=TIAS:1024000"));
    }

    #[tokio::test]
    async fn test_answer_connects_and_close_rejects_work() {
        let peer = LoopbackPeer::new("loop");
        assert!(peer
            .set_remote_description(SessionDescription::answer("garbage"))
            .await
            .is_err());

        peer.set_remote_description(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();
        assert_eq!(peer.connection_state(), ConnectionState::Connected);

        peer.close().await.unwrap();
        assert!(peer.is_closed());
        assert_eq!(peer.create_offer().await, Err(PeerError::Closed));
    }

    #[tokio::test]
    async fn test_attached_tracks_forward_samples_until_close() {
        let peer = LoopbackPeer::new("loop");
        let mic = MediaTrack::new(MediaKind::Audio, "mic");
        peer.add_transceiver(&mic, TransceiverInit::send_only())
            .await
            .unwrap();

        let packet = MediaSample::new(vec![0xf8, 0xff, 0xfe], std::time::Duration::from_millis(20));
        assert!(mic.sink().push(packet.clone()));
        peer.wait_for_samples(1).await;
        assert_eq!(peer.sent_samples(), vec![(MediaKind::Audio, packet.clone())]);

        peer.close().await.unwrap();
        mic.sink().push(packet);
        tokio::task::yield_now().await;
        assert_eq!(peer.sent_samples().len(), 1);
    }

    #[tokio::test]
    async fn test_factory_counts_open_peers() {
        let factory = LoopbackPeerFactory::new();
        let first = factory.create("a".to_string()).await.unwrap();
        factory.create("b".to_string()).await.unwrap();
        first.close().await.unwrap();
        factory.create("c".to_string()).await.unwrap();

        assert_eq!(factory.open_peers_at_create(), vec![0, 1, 1]);
        assert_eq!(factory.last_peer().map(|p| p.id().to_string()), Some("c".to_string()));
    }
}
