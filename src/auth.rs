//! Bearer credentials and stream keys
//!
//! The publish link carries its own credential: the navigation path with the
//! publish segment removed is sent verbatim as the bearer token, and the same
//! removal turns a publish link into the viewer link.
//!
//! [`StreamKeyCodec`] signs and verifies stream keys for ingest servers that
//! expect HMAC-authenticated keys (`live_<key>.<mac>` for publishing,
//! `play_<key>.<mac>` for playback).

use crate::errors::StreamKeyError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Path segment that distinguishes a publish link from a viewer link.
pub const DEFAULT_PUBLISH_SEGMENT: &str = "publish/";

pub const PREFIX_WHIP: &str = "live_";
pub const PREFIX_WHEP: &str = "play_";

const BEARER: &str = "Bearer ";

/// Bearer token for a navigation path.
///
/// Drops the leading `/` and the first occurrence of `segment` wherever it
/// appears, so `/publish/abc` and `/abc` both give `abc`.
pub fn bearer_token_from_path(path: &str, segment: &str) -> String {
    let path = path.strip_prefix('/').unwrap_or(path);
    if segment.is_empty() {
        return path.to_string();
    }
    path.replacen(segment, "", 1)
}

/// Viewer link for a publish link.
pub fn subscribe_url(publish_url: &str, segment: &str) -> String {
    if segment.is_empty() {
        return publish_url.to_string();
    }
    publish_url.replacen(segment, "", 1)
}

/// HMAC-SHA256 stream key signer.
#[derive(Clone)]
pub struct StreamKeyCodec {
    key: Vec<u8>,
}

impl std::fmt::Debug for StreamKeyCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamKeyCodec")
            .field("key_len", &self.key.len())
            .finish()
    }
}

impl StreamKeyCodec {
    /// Codec for a hex encoded key.
    pub fn from_hex(hex_key: &str) -> Result<Self, StreamKeyError> {
        let key = hex::decode(hex_key.trim()).map_err(|e| StreamKeyError::InvalidHmacKey(e.to_string()))?;
        if key.is_empty() {
            return Err(StreamKeyError::NoHmacKey);
        }
        Ok(Self { key })
    }

    /// Codec for the hex key in `HMAC_KEY`.
    pub fn from_env() -> Result<Self, StreamKeyError> {
        let hex_key = std::env::var("HMAC_KEY").unwrap_or_default();
        Self::from_hex(&hex_key)
    }

    pub fn encode_whip(&self, stream_key: &str) -> Result<String, StreamKeyError> {
        self.encode(stream_key, PREFIX_WHIP)
    }

    pub fn encode_whep(&self, stream_key: &str) -> Result<String, StreamKeyError> {
        self.encode(stream_key, PREFIX_WHEP)
    }

    /// Verify an `Authorization` header value and return the bare key.
    pub fn decode_whip(&self, header: &str) -> Result<String, StreamKeyError> {
        self.decode(header, PREFIX_WHIP)
    }

    pub fn decode_whep(&self, header: &str) -> Result<String, StreamKeyError> {
        self.decode(header, PREFIX_WHEP)
    }

    fn mac(&self) -> Result<HmacSha256, StreamKeyError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| StreamKeyError::InvalidHmacKey(e.to_string()))
    }

    fn encode(&self, stream_key: &str, prefix: &str) -> Result<String, StreamKeyError> {
        let signed = format!("{}{}", prefix, stream_key);
        let mut mac = self.mac()?;
        mac.update(signed.as_bytes());
        let tag = mac.finalize().into_bytes();
        Ok(format!("{}.{}", signed, URL_SAFE_NO_PAD.encode(tag)))
    }

    fn decode(&self, header: &str, prefix: &str) -> Result<String, StreamKeyError> {
        let key = header.strip_prefix(BEARER).ok_or(StreamKeyError::MissingBearer)?;
        if !key.starts_with(prefix) {
            return Err(StreamKeyError::UnsupportedPrefix);
        }
        let (signed, authenticator) = key.rsplit_once('.').ok_or(StreamKeyError::NoAuthenticator)?;

        let expected = URL_SAFE_NO_PAD
            .decode(authenticator)
            .map_err(|e| StreamKeyError::Encoding(e.to_string()))?;

        let mut mac = self.mac()?;
        mac.update(signed.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| StreamKeyError::BadAuthenticator)?;

        Ok(signed[prefix.len()..].to_string())
    }
}
