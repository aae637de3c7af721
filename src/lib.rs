//! crabwhip: publish local camera, microphone or screen media over WHIP
//!
//! This crate drives a single outbound WebRTC session towards an ingest
//! endpoint: media constraints are parsed from query-style parameters, local
//! media is captured, a send-only offer is POSTed over HTTP with a bearer
//! token and the answer is applied. Restarts (navigation, capture-mode
//! switches) always tear the previous session down first.
//!
//! # Features
//! - Query-parameter constraint builder with open attribute maps
//! - Send-only audio/video transceivers with a video bitrate cap
//! - Lifecycle controller with explicit capture and negotiation errors
//! - HMAC stream key signing for ingest servers that require it
//! - Optional native capture (`native-capture`) and Tauri plugin (`plugin`)
//!
//! # Usage
//! ```rust,ignore
//! use crabwhip::{ControllerOptions, PublishController, PublisherConfig};
//! use crabwhip::peer::RtcPeerFactory;
//! use std::sync::Arc;
//!
//! let config = PublisherConfig::load_or_default();
//! let options = ControllerOptions::from_config(&config, "fm=user&br=2000");
//! let controller = PublishController::new(options, devices, Arc::new(RtcPeerFactory::default()));
//! controller.start("/publish/my-stream").await?;
//! ```
pub mod auth;
pub mod capture;
pub mod config;
pub mod constraints;
pub mod controller;
pub mod errors;
pub mod negotiator;
pub mod peer;
pub mod session;

// Testing utilities - synthetic devices and an in-memory peer
pub mod testing;

#[cfg(feature = "plugin")]
pub mod commands;

// Re-exports for convenience
pub use auth::{bearer_token_from_path, subscribe_url, StreamKeyCodec};
pub use capture::{
    CaptureResult, CaptureSource, MediaDevices, MediaKind, MediaSample, MediaTrack, SampleSink,
};
pub use self::config::PublisherConfig;
pub use constraints::{build_constraints, from_query_string, MediaConstraints, PublishSettings};
pub use controller::{ControllerOptions, PublishController, PublishStatus};
pub use errors::{CaptureError, CaptureErrorKind, NegotiationError, PublishError};
pub use session::SessionState;

#[cfg(feature = "plugin")]
use tauri::{
    plugin::{Builder, TauriPlugin},
    Runtime,
};

/// Initialize the crabwhip plugin around `controller`
#[cfg(feature = "plugin")]
pub fn init<R: Runtime>(controller: PublishController) -> TauriPlugin<R> {
    Builder::new("crabwhip")
        .invoke_handler(tauri::generate_handler![
            commands::publish::start_publishing,
            commands::publish::stop_publishing,
            commands::publish::toggle_capture_mode,
            commands::publish::navigate,
            commands::publish::get_publish_status,
        ])
        .setup(move |_app, _api| {
            commands::publish::install_controller(controller.clone());
            log::info!("crabwhip plugin ready");
            Ok(())
        })
        .build()
}

/// Initialize logging for the publisher
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "crabwhip=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        native_capture: cfg!(feature = "native-capture"),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub native_capture: bool,
}
