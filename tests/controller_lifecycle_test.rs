//! Publish lifecycle tests against a mocked WHIP endpoint
//!
//! Capture runs on synthetic devices and the connection is the in-memory
//! loopback peer, so these cover the controller's ordering and cleanup
//! guarantees without hardware or a network stack.

use crabwhip::capture::{CaptureSource, MediaDevices, MediaKind, MediaSample};
use crabwhip::errors::{NegotiationError, PublishError};
use crabwhip::peer::{PeerConnection, PeerConnectionFactory};
use crabwhip::testing::{LoopbackPeerFactory, SyntheticDevices};
use crabwhip::{from_query_string, ControllerOptions, PublishController, SessionState};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ANSWER: &str = "v=0\r\no=- 7 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

async fn whip_server(token: &str, status: u16, expected_posts: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/whip"))
        .and(header("Authorization", format!("Bearer {}", token).as_str()))
        .and(header("Content-Type", "application/sdp"))
        .respond_with(ResponseTemplate::new(status).set_body_string(if status < 300 {
            ANSWER
        } else {
            "ingest unavailable"
        }))
        .expect(expected_posts)
        .mount(&server)
        .await;
    server
}

fn controller(
    server: &MockServer,
    query: &str,
    devices: &Arc<SyntheticDevices>,
    peers: &Arc<LoopbackPeerFactory>,
) -> PublishController {
    let (constraints, settings) = from_query_string(query);
    let options = ControllerOptions::new(format!("{}/api/whip", server.uri()), constraints, settings);
    PublishController::new(
        options,
        Arc::clone(devices) as Arc<dyn MediaDevices>,
        Arc::clone(peers) as Arc<dyn PeerConnectionFactory>,
    )
}

#[tokio::test]
async fn test_successful_exchange_goes_live() {
    let server = whip_server("abc", 201, 1).await;
    let devices = Arc::new(SyntheticDevices::new());
    let peers = Arc::new(LoopbackPeerFactory::new());
    let ctl = controller(&server, "", &devices, &peers);

    let session_id = ctl.start("/publish/abc").await.unwrap();
    let status = ctl.settled().await;

    assert_eq!(status.state, SessionState::Live);
    assert!(status.live);
    assert!(status.error.is_none());
    assert!(status.live_since.is_some());
    assert_eq!(status.session_id.as_deref(), Some(session_id.as_str()));

    let peer = peers.last_peer().unwrap();
    assert_eq!(peer.remote_description().map(|d| d.sdp), Some(ANSWER.to_string()));
    assert_eq!(ctl.preview().await.len(), 2);

    ctl.stop().await;
    let status = ctl.status();
    assert_eq!(status.state, SessionState::Closed);
    assert!(!status.live);
    assert!(peer.is_closed());
    assert_eq!(devices.live_track_count(), 0);
    assert!(ctl.preview().await.is_empty());
}

#[tokio::test]
async fn test_http_500_closes_with_negotiation_error() {
    let server = whip_server("abc", 500, 1).await;
    let devices = Arc::new(SyntheticDevices::new());
    let peers = Arc::new(LoopbackPeerFactory::new());
    let ctl = controller(&server, "", &devices, &peers);

    ctl.start("/publish/abc").await.unwrap();
    let status = ctl.settled().await;

    assert_eq!(status.state, SessionState::Closed);
    assert!(!status.live);
    assert_eq!(status.error_name(), Some("NegotiationError"));
    assert!(matches!(
        status.error,
        Some(PublishError::Negotiation(NegotiationError::Status { status: 500, .. }))
    ));
    assert!(peers.last_peer().unwrap().is_closed());
    assert_eq!(devices.live_track_count(), 0);
}

#[tokio::test]
async fn test_toggle_tears_down_before_next_capture() {
    let server = whip_server("abc", 200, 2).await;
    let devices = Arc::new(SyntheticDevices::new());
    let peers = Arc::new(LoopbackPeerFactory::new());
    let ctl = controller(&server, "", &devices, &peers);

    ctl.start("/publish/abc").await.unwrap();
    assert_eq!(ctl.settled().await.state, SessionState::Live);
    let first_tracks = devices.issued_tracks();

    assert!(ctl.toggle_capture_mode().await.unwrap());
    let status = ctl.settled().await;
    assert_eq!(status.state, SessionState::Live);
    assert!(status.display_capture);

    let requests = devices.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].source, CaptureSource::User);
    assert_eq!(requests[1].source, CaptureSource::Display);
    assert_eq!(requests[1].live_tracks_at_request, 0);

    assert!(first_tracks.iter().all(|t| t.is_stopped()));
    assert_eq!(peers.open_peers_at_create(), vec![0, 0]);
    assert!(peers.peers()[0].is_closed());

    ctl.stop().await;
}

#[tokio::test]
async fn test_teardown_while_capture_pending() {
    let server = whip_server("abc", 200, 0).await;
    let devices = Arc::new(SyntheticDevices::new().held());
    let peers = Arc::new(LoopbackPeerFactory::new());
    let ctl = controller(&server, "", &devices, &peers);

    ctl.start("/publish/abc").await.unwrap();
    devices.wait_for_requests(1).await;
    assert_eq!(ctl.status().state, SessionState::Acquiring);

    ctl.stop().await;
    devices.release(1);
    ctl.join_attempts().await;

    let issued = devices.issued_tracks();
    assert_eq!(issued.len(), 2);
    assert!(issued.iter().all(|t| t.is_stopped()));

    let peer = peers.last_peer().unwrap();
    assert!(peer.transceivers().is_empty());
    assert!(peer.is_closed());

    let status = ctl.status();
    assert_eq!(status.state, SessionState::Closed);
    assert!(status.error.is_none());
}

#[tokio::test]
async fn test_teardown_while_exchange_in_flight() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/whip"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_string(ANSWER)
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let devices = Arc::new(SyntheticDevices::new());
    let peers = Arc::new(LoopbackPeerFactory::new());
    let ctl = controller(&server, "", &devices, &peers);

    let mut updates = ctl.subscribe();
    ctl.start("/publish/abc").await.unwrap();
    updates
        .wait_for(|status| status.state == SessionState::Negotiating)
        .await
        .unwrap();
    // The offer is with the endpoint and the answer is still pending.
    while server.received_requests().await.unwrap_or_default().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ctl.status().state, SessionState::Negotiating);

    ctl.stop().await;
    ctl.join_attempts().await;

    let status = ctl.status();
    assert_eq!(status.state, SessionState::Closed);
    assert!(status.error.is_none());
    assert!(!status.live);
    assert!(status.live_since.is_none());
    assert_eq!(devices.live_track_count(), 0);

    let peer = peers.last_peer().unwrap();
    assert!(peer.is_closed());
    assert!(peer.remote_description().is_none());
}

#[tokio::test]
async fn test_live_session_forwards_samples_until_stop() {
    let server = whip_server("abc", 201, 1).await;
    let devices = Arc::new(SyntheticDevices::new());
    let peers = Arc::new(LoopbackPeerFactory::new());
    let ctl = controller(&server, "", &devices, &peers);

    ctl.start("/publish/abc").await.unwrap();
    assert_eq!(ctl.settled().await.state, SessionState::Live);

    let tracks = ctl.preview().await;
    let camera = tracks.iter().find(|t| t.kind() == MediaKind::Video).unwrap();
    let microphone = tracks.iter().find(|t| t.kind() == MediaKind::Audio).unwrap();
    let frame = MediaSample::new(vec![0, 0, 0, 1, 0x65], Duration::from_millis(33));
    let packet = MediaSample::new(vec![0xf8, 0xff, 0xfe], Duration::from_millis(20));
    assert!(camera.sink().take_keyframe_request());
    assert!(camera.sink().push(frame));
    assert!(microphone.sink().push(packet));

    let peer = peers.last_peer().unwrap();
    peer.wait_for_samples(2).await;
    let mut kinds: Vec<MediaKind> = peer.sent_samples().into_iter().map(|(kind, _)| kind).collect();
    kinds.sort_by_key(|kind| kind.as_str());
    assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);

    let camera_sink = camera.sink();
    ctl.stop().await;
    assert!(!camera_sink.is_live());
    assert!(!camera_sink.push(MediaSample::new(vec![0, 0, 1, 0x41], Duration::from_millis(33))));
}

#[tokio::test]
async fn test_navigation_during_capture_supersedes_attempt() {
    let server = whip_server("second", 200, 1).await;
    let devices = Arc::new(SyntheticDevices::new().held());
    let peers = Arc::new(LoopbackPeerFactory::new());
    let ctl = controller(&server, "", &devices, &peers);

    ctl.start("/publish/first").await.unwrap();
    devices.wait_for_requests(1).await;
    let second = ctl.navigate("/publish/second").await.unwrap();
    assert!(second.is_some());
    devices.wait_for_requests(2).await;

    devices.release(2);
    let status = ctl.settled().await;
    ctl.join_attempts().await;

    assert_eq!(status.state, SessionState::Live);
    assert_eq!(status.session_id, second);

    let first_peer = &peers.peers()[0];
    assert!(first_peer.is_closed());
    assert!(first_peer.transceivers().is_empty());
    assert_eq!(devices.live_track_count(), 2);

    ctl.stop().await;
    assert_eq!(devices.live_track_count(), 0);
}

#[tokio::test]
async fn test_video_disabled_attaches_audio_only() {
    let server = whip_server("abc", 200, 1).await;
    let devices = Arc::new(SyntheticDevices::new());
    let peers = Arc::new(LoopbackPeerFactory::new());
    let ctl = controller(&server, "fm=user&a=16_9&br=1000&ve=0", &devices, &peers);

    ctl.start("/publish/abc").await.unwrap();
    assert_eq!(ctl.settled().await.state, SessionState::Live);

    let peer = peers.last_peer().unwrap();
    assert_eq!(peer.attached_kinds(), vec![MediaKind::Audio]);
    assert_eq!(devices.requests()[0].constraints["video"], serde_json::json!(false));

    ctl.stop().await;
}

#[tokio::test]
async fn test_bitrate_parameter_caps_video() {
    let server = whip_server("abc", 200, 1).await;
    let devices = Arc::new(SyntheticDevices::new());
    let peers = Arc::new(LoopbackPeerFactory::new());
    let ctl = controller(&server, "br=2000", &devices, &peers);

    ctl.start("/publish/abc").await.unwrap();
    assert_eq!(ctl.settled().await.state, SessionState::Live);

    let peer = peers.last_peer().unwrap();
    let video = peer
        .transceivers()
        .into_iter()
        .find(|t| t.track.kind() == MediaKind::Video)
        .unwrap();
    assert_eq!(video.init.max_bitrate_bps(), Some(2_048_000));
    assert_eq!(video.init.send_encodings[0].rid, "high");

    let audio = peer
        .transceivers()
        .into_iter()
        .find(|t| t.track.kind() == MediaKind::Audio)
        .unwrap();
    assert!(audio.init.send_encodings.is_empty());

    let requests = server.received_requests().await.unwrap();
    let offer = String::from_utf8(requests[0].body.clone()).unwrap();
    assert!(offer.contains("b=TIAS:2048000"));
    assert!(offer.contains("a=sendonly"));

    ctl.stop().await;
}

#[tokio::test]
async fn test_missing_camera_reports_not_found_without_posting() {
    let server = whip_server("abc", 200, 0).await;
    let devices = Arc::new(SyntheticDevices::new().without_camera());
    let peers = Arc::new(LoopbackPeerFactory::new());
    let ctl = controller(&server, "", &devices, &peers);

    ctl.start("/publish/abc").await.unwrap();
    let status = ctl.settled().await;

    assert_eq!(status.state, SessionState::Closed);
    assert_eq!(status.error_name(), Some("NotFoundError"));
    assert_eq!(devices.live_track_count(), 0);
}

#[tokio::test]
async fn test_display_capture_from_parameters() {
    let server = whip_server("abc", 200, 1).await;
    let devices = Arc::new(SyntheticDevices::new());
    let peers = Arc::new(LoopbackPeerFactory::new());
    let ctl = controller(&server, "gdm=true&ae=0", &devices, &peers);

    assert!(ctl.status().display_capture);
    ctl.start("/publish/abc").await.unwrap();
    assert_eq!(ctl.settled().await.state, SessionState::Live);

    assert_eq!(devices.requests()[0].source, CaptureSource::Display);
    assert_eq!(peers.last_peer().unwrap().attached_kinds(), vec![MediaKind::Video]);

    // Same mode again is a no-op.
    assert_eq!(ctl.set_capture_mode(true).await.unwrap(), None);
    assert_eq!(devices.requests().len(), 1);

    ctl.stop().await;
}
