use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a capture request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureErrorKind {
    PermissionDenied,
    NotFound,
    Other,
}

impl CaptureErrorKind {
    fn describe(&self) -> &'static str {
        match self {
            CaptureErrorKind::PermissionDenied => "Permission denied",
            CaptureErrorKind::NotFound => "Device not found",
            CaptureErrorKind::Other => "Capture error",
        }
    }
}

/// Failure raised by a capture backend. Terminal for the attempt that hit it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}: {}", CaptureErrorKind::describe(.kind), .message)]
pub struct CaptureError {
    pub kind: CaptureErrorKind,
    pub message: String,
}

impl CaptureError {
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self {
            kind: CaptureErrorKind::PermissionDenied,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: CaptureErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: CaptureErrorKind::Other,
            message: message.into(),
        }
    }

    /// DOM-style error name, used by display layers to key their message tables.
    pub fn name(&self) -> &'static str {
        match self.kind {
            CaptureErrorKind::PermissionDenied => "NotAllowedError",
            CaptureErrorKind::NotFound => "NotFoundError",
            CaptureErrorKind::Other => "Error",
        }
    }
}

/// Errors reported by a peer connection backend.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PeerError {
    #[error("peer connection is closed")]
    Closed,
    #[error("peer connection error: {0}")]
    Backend(String),
}

/// Failures of the offer/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum NegotiationError {
    #[error("WHIP request failed: {0}")]
    Network(String),
    #[error("WHIP endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed SDP answer: {0}")]
    MalformedAnswer(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// An attempt's capture resolved after its session was already torn down.
///
/// Never shown to the user; the acquired tracks have been stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session closed before capture resolved")]
pub struct RaceAbort;

/// Stream key signing and verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StreamKeyError {
    #[error("Invalid stream key - missing bearer prefix")]
    MissingBearer,
    #[error("Invalid stream key - unsupported prefix")]
    UnsupportedPrefix,
    #[error("Invalid stream key - no authenticator")]
    NoAuthenticator,
    #[error("Invalid stream key - bad authenticator")]
    BadAuthenticator,
    #[error("Invalid stream key - authenticator is not base64: {0}")]
    Encoding(String),
    #[error("Invalid HMAC key: {0}")]
    InvalidHmacKey(String),
    #[error("No HMAC key set")]
    NoHmacKey,
}

/// Top-level error for the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PublishError {
    #[error("{0}")]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    StreamKey(#[from] StreamKeyError),
}

impl PublishError {
    /// Error name surfaced to the display layer next to the message.
    pub fn name(&self) -> &'static str {
        match self {
            PublishError::Capture(e) => e.name(),
            PublishError::Negotiation(_) => "NegotiationError",
            PublishError::Config(_) => "ConfigError",
            PublishError::StreamKey(_) => "StreamKeyError",
        }
    }
}

impl From<PeerError> for PublishError {
    fn from(err: PeerError) -> Self {
        PublishError::Negotiation(NegotiationError::Peer(err))
    }
}
