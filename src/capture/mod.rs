//! Local media capture
//!
//! A [`MediaDevices`] backend turns a [`MediaConstraints`] descriptor into a
//! [`CaptureResult`] holding live [`MediaTrack`]s. Backends may suspend for as
//! long as the platform needs (permission prompts, device warmup); there is
//! no timeout at this layer.
//!
//! Each track carries a feed of encoded [`MediaSample`]s. The backend writes
//! through a [`SampleSink`]; the peer connection subscribes when the track is
//! attached and forwards what it receives onto the wire.

#[cfg(feature = "native-capture")]
pub mod encode;
#[cfg(feature = "native-capture")]
pub mod native;

use crate::constraints::MediaConstraints;
use crate::errors::CaptureError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

/// Encoded samples buffered per track before slow consumers start lagging.
const SAMPLE_BUFFER: usize = 64;

/// Media kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the local media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureSource {
    /// Camera and microphone.
    User,
    /// Screen, window or tab.
    Display,
}

impl CaptureSource {
    pub fn from_display_flag(use_display_capture: bool) -> Self {
        if use_display_capture {
            CaptureSource::Display
        } else {
            CaptureSource::User
        }
    }

    pub fn is_display(&self) -> bool {
        matches!(self, CaptureSource::Display)
    }
}

/// One encoded frame: an H.264 access unit in Annex B form, or one Opus packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

impl MediaSample {
    pub fn new(data: impl Into<Bytes>, duration: Duration) -> Self {
        Self {
            data: data.into(),
            duration,
        }
    }
}

type StopHook = Box<dyn FnOnce() + Send>;

struct TrackInner {
    id: String,
    kind: MediaKind,
    label: String,
    stopped: AtomicBool,
    stop_hook: Mutex<Option<StopHook>>,
    samples: Mutex<Option<broadcast::Sender<MediaSample>>>,
    keyframe_requested: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared handle to one live capture track.
///
/// Clones refer to the same track. Stopping is idempotent and runs the
/// backend's release hook exactly once.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self::build(kind, label.into(), None)
    }

    /// Track whose device is released by `hook` when the track stops.
    pub fn with_stop_hook<F>(kind: MediaKind, label: impl Into<String>, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(kind, label.into(), Some(Box::new(hook)))
    }

    fn build(kind: MediaKind, label: String, hook: Option<StopHook>) -> Self {
        let (samples, _) = broadcast::channel(SAMPLE_BUFFER);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                label,
                stopped: AtomicBool::new(false),
                stop_hook: Mutex::new(hook),
                samples: Mutex::new(Some(samples)),
                keyframe_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop the track. Returns `true` if this call did the stopping.
    pub fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }

        // Closing the feed ends every consumer's stream.
        lock(&self.inner.samples).take();
        let hook = lock(&self.inner.stop_hook).take();
        if let Some(hook) = hook {
            hook();
        }

        log::debug!("Stopped {} track {} ({})", self.kind(), self.id(), self.label());
        true
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Receive the samples the backend produces from now on.
    ///
    /// A new consumer cannot decode from the middle of a group of pictures,
    /// so subscribing also asks the producer for a keyframe. The stream ends
    /// when the track stops.
    pub fn subscribe(&self) -> broadcast::Receiver<MediaSample> {
        self.request_keyframe();
        match lock(&self.inner.samples).as_ref() {
            Some(samples) => samples.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn request_keyframe(&self) {
        self.inner.keyframe_requested.store(true, Ordering::SeqCst);
    }

    /// Producer side of the sample feed, for the capture backend.
    pub fn sink(&self) -> SampleSink {
        SampleSink {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Where a capture backend delivers encoded samples for one track.
///
/// Holds the track weakly, so a producer thread never keeps a track alive.
#[derive(Clone)]
pub struct SampleSink {
    inner: Weak<TrackInner>,
}

impl SampleSink {
    /// Hand `sample` to every current consumer. Returns `false` once the
    /// track has stopped, which is the producer's signal to shut down.
    pub fn push(&self, sample: MediaSample) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let samples = lock(&inner.samples);
        let delivered = match samples.as_ref() {
            Some(sender) => {
                // No consumer yet is fine: the sample is simply not wanted.
                let _ = sender.send(sample);
                true
            }
            None => false,
        };
        delivered
    }

    pub fn is_live(&self) -> bool {
        self.inner
            .upgrade()
            .map(|inner| !inner.stopped.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Take a pending keyframe request, clearing it.
    pub fn take_keyframe_request(&self) -> bool {
        self.inner
            .upgrade()
            .map(|inner| inner.keyframe_requested.swap(false, Ordering::SeqCst))
            .unwrap_or(false)
    }
}

impl fmt::Debug for SampleSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleSink").field("live", &self.is_live()).finish()
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Tracks produced by one capture request.
///
/// Owns its tracks: dropping the result stops anything still live, so every
/// exit path releases the devices.
#[derive(Debug)]
pub struct CaptureResult {
    source: CaptureSource,
    tracks: Vec<MediaTrack>,
}

impl CaptureResult {
    pub fn new(source: CaptureSource, tracks: Vec<MediaTrack>) -> Self {
        Self { source, tracks }
    }

    pub fn push(&mut self, track: MediaTrack) {
        self.tracks.push(track);
    }

    pub fn source(&self) -> CaptureSource {
        self.source
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn track_of(&self, kind: MediaKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Stop every track. Returns how many were still live.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

impl Drop for CaptureResult {
    fn drop(&mut self) {
        let stopped = self.stop_all();
        if stopped > 0 {
            log::debug!("Released {} capture track(s) on drop", stopped);
        }
    }
}

/// Capture backend.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire tracks for the enabled kinds of `constraints` from `source`.
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
        source: CaptureSource,
    ) -> Result<CaptureResult, CaptureError>;
}

/// Reject requests the capture API itself would refuse.
pub fn check_request(
    constraints: &MediaConstraints,
    source: CaptureSource,
) -> Result<(), CaptureError> {
    if !constraints.audio_enabled() && !constraints.video_enabled() {
        return Err(CaptureError::other(
            "at least one of audio or video must be requested",
        ));
    }
    if source.is_display() && !constraints.video_enabled() {
        return Err(CaptureError::other("display capture requires video"));
    }
    Ok(())
}
