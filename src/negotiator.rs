//! Offer/answer exchange over HTTP
//!
//! One attempt: attach the captured tracks send-only, create and set the
//! offer, POST it to the WHIP endpoint, apply the response body as the
//! answer. Every step returns a [`NegotiationError`] on failure; nothing is
//! retried here.

use crate::capture::{MediaKind, MediaTrack};
use crate::errors::NegotiationError;
use crate::peer::sdp::looks_like_sdp;
use crate::peer::{PeerConnection, SendEncoding, SessionDescription, TransceiverInit};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};

pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Name of the single video encoding layer.
pub const ENCODING_RID: &str = "high";

/// HTTP side of the exchange: one endpoint, one bearer token.
#[derive(Debug, Clone)]
pub struct WhipClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl WhipClient {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint, token)
    }

    pub fn with_client(http: reqwest::Client, endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// POST `offer_sdp` and return the answer SDP text.
    pub async fn post_offer(&self, offer_sdp: &str) -> Result<String, NegotiationError> {
        log::info!("Posting SDP offer to {}", self.endpoint);

        let response = self
            .http
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(offer_sdp.to_owned())
            .send()
            .await
            .map_err(|e| NegotiationError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("WHIP endpoint {} answered {}", self.endpoint, status);
            return Err(NegotiationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| NegotiationError::Network(e.to_string()))?;
        let answer = String::from_utf8(bytes.to_vec())
            .map_err(|_| NegotiationError::MalformedAnswer("answer body is not UTF-8".to_string()))?;
        if !looks_like_sdp(&answer) {
            return Err(NegotiationError::MalformedAnswer(
                "answer body is not an SDP document".to_string(),
            ));
        }

        log::debug!("Received SDP answer ({} bytes)", answer.len());
        Ok(answer)
    }
}

/// Video cap in bits per second for a kbps target, `None` when the target is unusable.
pub fn video_bitrate_cap_bps(target_bitrate_kbps: f64) -> Option<u64> {
    if target_bitrate_kbps.is_finite() && target_bitrate_kbps > 0.0 {
        Some((target_bitrate_kbps * 1024.0) as u64)
    } else {
        None
    }
}

/// Transceiver parameters for one track.
pub fn transceiver_init_for(kind: MediaKind, target_bitrate_kbps: f64) -> TransceiverInit {
    match kind {
        MediaKind::Audio => TransceiverInit::send_only(),
        MediaKind::Video => TransceiverInit::send_only().with_encoding(SendEncoding {
            rid: ENCODING_RID.to_string(),
            max_bitrate_bps: video_bitrate_cap_bps(target_bitrate_kbps),
        }),
    }
}

/// Attach every track to `peer` send-only.
pub async fn attach_tracks(
    peer: &dyn PeerConnection,
    tracks: &[MediaTrack],
    target_bitrate_kbps: f64,
) -> Result<(), NegotiationError> {
    for track in tracks {
        let init = transceiver_init_for(track.kind(), target_bitrate_kbps);
        peer.add_transceiver(track, init).await?;
    }
    Ok(())
}

/// Run the full exchange and return the applied answer.
pub async fn negotiate(
    peer: &dyn PeerConnection,
    tracks: &[MediaTrack],
    target_bitrate_kbps: f64,
    client: &WhipClient,
) -> Result<SessionDescription, NegotiationError> {
    attach_tracks(peer, tracks, target_bitrate_kbps).await?;

    let offer = peer.create_offer().await?;
    peer.set_local_description(offer.clone()).await?;
    let local = peer.local_description().await.unwrap_or(offer);
    log::debug!("Local offer for peer {}:\n{}", peer.id(), local.sdp);

    let answer = SessionDescription::answer(client.post_offer(&local.sdp).await?);
    peer.set_remote_description(answer.clone()).await?;

    log::info!("Negotiation complete for peer {}", peer.id());
    Ok(answer)
}
