#[cfg(test)]
mod error_tests {
    use crabwhip::errors::{
        CaptureError, CaptureErrorKind, NegotiationError, PeerError, PublishError, RaceAbort,
        StreamKeyError,
    };
    use std::error::Error;

    #[test]
    fn test_capture_error_permission_denied() {
        let error = CaptureError::permission_denied("Access denied");
        assert_eq!(error.kind, CaptureErrorKind::PermissionDenied);
        assert_eq!(error.name(), "NotAllowedError");
        assert!(error.to_string().contains("Permission denied"));
        assert!(error.to_string().contains("Access denied"));
    }

    #[test]
    fn test_capture_error_names() {
        assert_eq!(CaptureError::not_found("no camera").name(), "NotFoundError");
        assert_eq!(CaptureError::other("boom").name(), "Error");
    }

    #[test]
    fn test_capture_error_messages_per_kind() {
        assert_eq!(
            CaptureError::not_found("no camera").to_string(),
            "Device not found: no camera"
        );
        assert_eq!(
            CaptureError::other("display unsupported").to_string(),
            "Capture error: display unsupported"
        );
        assert_eq!(
            PublishError::from(CaptureError::permission_denied("blocked")).to_string(),
            "Permission denied: blocked"
        );
    }

    #[test]
    fn test_capture_error_implements_error_trait() {
        let error = CaptureError::other("Error trait test");
        let _error_trait: &dyn Error = &error;
        assert!(error.source().is_none());
    }

    #[test]
    fn test_negotiation_error_display() {
        let error = NegotiationError::Status {
            status: 503,
            body: "busy".to_string(),
        };
        assert_eq!(error.to_string(), "WHIP endpoint returned HTTP 503: busy");

        let peer: NegotiationError = PeerError::Closed.into();
        assert_eq!(peer.to_string(), "peer connection is closed");
    }

    #[test]
    fn test_publish_error_conversions_and_names() {
        let capture: PublishError = CaptureError::not_found("no mic").into();
        assert_eq!(capture.name(), "NotFoundError");

        let negotiation: PublishError = NegotiationError::Network("refused".to_string()).into();
        assert_eq!(negotiation.name(), "NegotiationError");

        let peer: PublishError = PeerError::Backend("ice".to_string()).into();
        assert!(matches!(
            peer,
            PublishError::Negotiation(NegotiationError::Peer(PeerError::Backend(_)))
        ));

        let key: PublishError = StreamKeyError::NoHmacKey.into();
        assert_eq!(key.name(), "StreamKeyError");
        assert_eq!(key.to_string(), "No HMAC key set");

        assert_eq!(PublishError::Config("bad".to_string()).name(), "ConfigError");
    }

    #[test]
    fn test_publish_error_serializes_for_display_layer() {
        let error: PublishError = CaptureError::permission_denied("blocked").into();
        let json = serde_json::to_value(&error).unwrap();
        let back: PublishError = serde_json::from_value(json).unwrap();
        assert_eq!(back, error);
    }

    #[test]
    fn test_race_abort_message() {
        assert!(RaceAbort.to_string().contains("closed"));
    }
}
