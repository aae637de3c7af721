//! Synthetic capture devices
//!
//! Deterministic stand-ins for a camera, a microphone and a screen source.
//! Every request is recorded together with the number of tracks that were
//! still live when it arrived, which is what ordering assertions need.

use super::lock;
use crate::capture::{check_request, CaptureResult, CaptureSource, MediaDevices, MediaKind, MediaTrack};
use crate::constraints::MediaConstraints;
use crate::errors::CaptureError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};

/// One call to [`MediaDevices::acquire`] as the devices saw it.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub source: CaptureSource,
    pub constraints: serde_json::Value,
    /// Issued tracks not yet stopped when the request arrived.
    pub live_tracks_at_request: usize,
}

#[derive(Default)]
struct DeviceLog {
    requests: Vec<CaptureRequest>,
    issued: Vec<MediaTrack>,
}

/// In-process capture backend for tests and the CLI's synthetic mode.
pub struct SyntheticDevices {
    camera: bool,
    microphone: bool,
    display: bool,
    deny_permission: bool,
    gate: Option<Arc<Semaphore>>,
    log: Mutex<DeviceLog>,
    request_count: watch::Sender<usize>,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevices {
    /// Camera, microphone and display all present, capture resolves at once.
    pub fn new() -> Self {
        let (request_count, _) = watch::channel(0);
        Self {
            camera: true,
            microphone: true,
            display: true,
            deny_permission: false,
            gate: None,
            log: Mutex::new(DeviceLog::default()),
            request_count,
        }
    }

    pub fn without_camera(mut self) -> Self {
        self.camera = false;
        self
    }

    pub fn without_microphone(mut self) -> Self {
        self.microphone = false;
        self
    }

    pub fn without_display(mut self) -> Self {
        self.display = false;
        self
    }

    /// Every request fails as if the user dismissed the prompt.
    pub fn deny_permission(mut self) -> Self {
        self.deny_permission = true;
        self
    }

    /// Keep each request pending until [`SyntheticDevices::release`] lets it through.
    pub fn held(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `n` pending (or future) requests resolve.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn requests(&self) -> Vec<CaptureRequest> {
        lock(&self.log).requests.clone()
    }

    /// Every track ever handed out, in order.
    pub fn issued_tracks(&self) -> Vec<MediaTrack> {
        lock(&self.log).issued.clone()
    }

    pub fn live_track_count(&self) -> usize {
        lock(&self.log).issued.iter().filter(|t| !t.is_stopped()).count()
    }

    /// Wait until at least `n` requests have arrived.
    pub async fn wait_for_requests(&self, n: usize) {
        let mut rx = self.request_count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    fn record_request(&self, constraints: &MediaConstraints, source: CaptureSource) {
        let total = {
            let mut log = lock(&self.log);
            let live = log.issued.iter().filter(|t| !t.is_stopped()).count();
            log.requests.push(CaptureRequest {
                source,
                constraints: constraints.to_json(),
                live_tracks_at_request: live,
            });
            log.requests.len()
        };
        self.request_count.send_replace(total);
    }

    fn issue(&self, result: &mut CaptureResult, kind: MediaKind, label: String) {
        let track = MediaTrack::new(kind, label);
        lock(&self.log).issued.push(track.clone());
        result.push(track);
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
        source: CaptureSource,
    ) -> Result<CaptureResult, CaptureError> {
        self.record_request(constraints, source);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| CaptureError::other("synthetic device gate closed"))?
                .forget();
        }

        check_request(constraints, source)?;
        if self.deny_permission {
            return Err(CaptureError::permission_denied("Permission denied by user"));
        }

        let mut result = CaptureResult::new(source, Vec::new());
        match source {
            CaptureSource::Display => {
                if !self.display {
                    return Err(CaptureError::not_found("no display source available"));
                }
                self.issue(&mut result, MediaKind::Video, "Synthetic display".to_string());
                if constraints.audio_enabled() {
                    self.issue(&mut result, MediaKind::Audio, "Synthetic system audio".to_string());
                }
            }
            CaptureSource::User => {
                if constraints.audio_enabled() {
                    if !self.microphone {
                        return Err(CaptureError::not_found("Requested device not found"));
                    }
                    self.issue(&mut result, MediaKind::Audio, "Synthetic microphone".to_string());
                }
                if constraints.video_enabled() {
                    if !self.camera {
                        return Err(CaptureError::not_found("Requested device not found"));
                    }
                    let facing = constraints
                        .video_attr("facingMode")
                        .and_then(|v| v.as_str())
                        .unwrap_or("user")
                        .to_string();
                    self.issue(&mut result, MediaKind::Video, format!("Synthetic camera ({})", facing));
                }
            }
        }

        log::debug!(
            "Synthetic capture for {:?} issued {} track(s)",
            source,
            result.tracks().len()
        );
        Ok(result)
    }
}
