//! Camera and microphone capture on the host
//!
//! Cameras go through `nokhwa`, the default input device through `cpal`.
//! Each track owns a dedicated encoder thread: camera frames are decoded to
//! RGB and encoded to H.264, microphone PCM is encoded to Opus, and the
//! results are pushed into the track's sample sink. Stopping the track
//! closes the device and joins the thread.

use super::encode::{H264Encoder, OpusEncoder, RgbFrame, OPUS_SAMPLE_RATE};
use super::{
    check_request, CaptureResult, CaptureSource, MediaDevices, MediaKind, MediaTrack, SampleSink,
};
use crate::constraints::MediaConstraints;
use crate::errors::CaptureError;
use async_trait::async_trait;
use crossbeam_channel::{bounded, RecvTimeoutError};
use nokhwa::{
    pixel_format::RgbFormat,
    query,
    utils::{ApiBackend, CameraIndex, CameraInfo, RequestedFormat, RequestedFormatType},
    Buffer, CallbackCamera,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Decoded frames waiting for the encoder. Frames arriving while it is
/// full are dropped.
const FRAME_QUEUE: usize = 2;
/// About five seconds of PCM callbacks.
const PCM_QUEUE: usize = 256;
/// How often an idle encoder thread checks whether its track stopped.
const IDLE_POLL: Duration = Duration::from_millis(100);
const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(33);

type WorkerSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

fn join_worker(slot: &WorkerSlot) {
    let handle = slot
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(handle) = handle {
        if handle.join().is_err() {
            log::warn!("Capture worker panicked");
        }
    }
}

fn set_worker(slot: &WorkerSlot, handle: JoinHandle<()>) {
    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
}

/// Host capture backend.
#[derive(Debug, Default, Clone)]
pub struct NativeDevices;

impl NativeDevices {
    pub fn new() -> Self {
        Self
    }
}

fn map_nokhwa_error(context: &str, err: nokhwa::NokhwaError) -> CaptureError {
    let message = format!("{}: {}", context, err);
    let lowered = message.to_lowercase();
    if lowered.contains("permission") || lowered.contains("denied") || lowered.contains("not authorized") {
        CaptureError::permission_denied(message)
    } else {
        CaptureError::other(message)
    }
}

/// Pick a camera: `deviceId` matches index or name, otherwise the first one.
fn select_camera(cameras: Vec<CameraInfo>, constraints: &MediaConstraints) -> Option<CameraInfo> {
    let wanted = constraints
        .video_attr("deviceId")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    match wanted {
        Some(id) => cameras
            .into_iter()
            .find(|c| c.index().to_string() == id || c.human_name() == id),
        None => cameras.into_iter().next(),
    }
}

fn open_camera(info: CameraInfo) -> Result<MediaTrack, CaptureError> {
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
    let index: CameraIndex = info.index().clone();
    let (frames_tx, frames_rx) = bounded::<RgbFrame>(FRAME_QUEUE);

    let mut camera = CallbackCamera::new(index, requested, move |buffer: Buffer| {
        match buffer.decode_image::<RgbFormat>() {
            Ok(image) => {
                let frame = RgbFrame {
                    width: image.width(),
                    height: image.height(),
                    data: image.into_raw(),
                };
                let _ = frames_tx.try_send(frame);
            }
            Err(e) => log::debug!("Dropping undecodable camera frame: {}", e),
        }
    })
    .map_err(|e| map_nokhwa_error("Failed to initialize camera", e))?;
    camera
        .open_stream()
        .map_err(|e| map_nokhwa_error("Failed to open camera stream", e))?;

    let camera = Arc::new(Mutex::new(camera));
    let worker: WorkerSlot = Arc::new(Mutex::new(None));
    let label = info.human_name();
    log::info!("Opened camera {} ({})", label, info.index());

    let track = {
        let camera = Arc::clone(&camera);
        let worker = Arc::clone(&worker);
        MediaTrack::with_stop_hook(MediaKind::Video, label, move || {
            if let Ok(mut camera) = camera.lock() {
                let _ = camera.stop_stream();
            }
            join_worker(&worker);
        })
    };

    let sink = track.sink();
    let handle = thread::Builder::new()
        .name("crabwhip-video".to_string())
        .spawn(move || encode_video(frames_rx, sink))
        .map_err(|e| CaptureError::other(format!("Failed to start video encoder: {}", e)))?;
    set_worker(&worker, handle);

    Ok(track)
}

fn encode_video(frames: crossbeam_channel::Receiver<RgbFrame>, sink: SampleSink) {
    let mut encoder = H264Encoder::new();
    let mut last_frame: Option<Instant> = None;

    while sink.is_live() {
        let frame = match frames.recv_timeout(IDLE_POLL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let now = Instant::now();
        let duration = last_frame
            .map(|at| now.duration_since(at))
            .unwrap_or(DEFAULT_FRAME_DURATION);
        last_frame = Some(now);

        let force_keyframe = sink.take_keyframe_request();
        match encoder.encode(&frame, force_keyframe, duration) {
            Ok(Some(sample)) => {
                if !sink.push(sample) {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("{}", e),
        }
    }
    log::debug!("Video encoder finished after {} frame(s)", encoder.frames_encoded());
}

fn open_microphone() -> Result<MediaTrack, CaptureError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::not_found("no audio input device available"))?;
    let label = device
        .name()
        .unwrap_or_else(|_| "Default microphone".to_string());
    let channels = device
        .default_input_config()
        .map(|config| config.channels().clamp(1, 2))
        .unwrap_or(1);

    let stop = Arc::new(AtomicBool::new(false));
    let worker: WorkerSlot = Arc::new(Mutex::new(None));
    let track = {
        let stop = Arc::clone(&stop);
        let worker = Arc::clone(&worker);
        MediaTrack::with_stop_hook(MediaKind::Audio, label.clone(), move || {
            stop.store(true, Ordering::SeqCst);
            join_worker(&worker);
        })
    };

    // cpal streams are not Send, so the stream lives and dies on its thread.
    let (ready_tx, ready_rx) = mpsc::sync_channel(1);
    let sink = track.sink();
    let handle = thread::Builder::new()
        .name("crabwhip-audio".to_string())
        .spawn(move || run_microphone(device, channels, sink, stop, ready_tx))
        .map_err(|e| CaptureError::other(format!("Failed to start audio capture: {}", e)))?;
    set_worker(&worker, handle);

    match ready_rx.recv() {
        Ok(Ok(())) => {
            log::info!("Opened microphone {} ({} channel(s))", label, channels);
            Ok(track)
        }
        Ok(Err(e)) => {
            track.stop();
            Err(e)
        }
        Err(_) => {
            track.stop();
            Err(CaptureError::other("audio capture thread exited"))
        }
    }
}

fn run_microphone(
    device: cpal::Device,
    channels: u16,
    sink: SampleSink,
    stop: Arc<AtomicBool>,
    ready: mpsc::SyncSender<Result<(), CaptureError>>,
) {
    use cpal::traits::{DeviceTrait, StreamTrait};

    let mut encoder = match OpusEncoder::new(channels) {
        Ok(encoder) => encoder,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(OPUS_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let (pcm_tx, pcm_rx) = bounded::<Vec<f32>>(PCM_QUEUE);
    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let _ = pcm_tx.try_send(data.to_vec());
        },
        |err| log::error!("Audio capture error: {}", err),
        None,
    );
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(map_audio_error("Failed to open microphone at 48 kHz", e)));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(CaptureError::other(format!(
            "Failed to start microphone: {}",
            e
        ))));
        return;
    }
    let _ = ready.send(Ok(()));

    let mut packets = 0u64;
    'capture: while !stop.load(Ordering::SeqCst) {
        let pcm = match pcm_rx.recv_timeout(IDLE_POLL) {
            Ok(pcm) => pcm,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match encoder.encode(&pcm) {
            Ok(encoded) => {
                for sample in encoded {
                    if !sink.push(sample) {
                        break 'capture;
                    }
                    packets += 1;
                }
            }
            Err(e) => log::warn!("{}", e),
        }
    }

    drop(stream);
    log::debug!("Audio encoder finished after {} packet(s)", packets);
}

fn map_audio_error(context: &str, err: cpal::BuildStreamError) -> CaptureError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            CaptureError::not_found(format!("{}: device not available", context))
        }
        other => CaptureError::other(format!("{}: {}", context, other)),
    }
}

#[async_trait]
impl MediaDevices for NativeDevices {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
        source: CaptureSource,
    ) -> Result<CaptureResult, CaptureError> {
        check_request(constraints, source)?;

        if source.is_display() {
            return Err(CaptureError::other(
                "display capture is not supported by the native backend",
            ));
        }

        // Tracks already pushed are released if a later device fails.
        let mut result = CaptureResult::new(source, Vec::new());

        if constraints.audio_enabled() {
            let track = tokio::task::spawn_blocking(open_microphone)
                .await
                .map_err(|e| CaptureError::other(format!("microphone open task failed: {}", e)))??;
            result.push(track);
        }

        if constraints.video_enabled() {
            let cameras = query(ApiBackend::Auto)
                .map_err(|e| map_nokhwa_error("Failed to query cameras", e))?;
            let info = select_camera(cameras, constraints)
                .ok_or_else(|| CaptureError::not_found("no matching camera found"))?;

            let track = tokio::task::spawn_blocking(move || open_camera(info))
                .await
                .map_err(|e| CaptureError::other(format!("camera open task failed: {}", e)))??;
            result.push(track);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::build_constraints;

    fn cameras() -> Vec<CameraInfo> {
        vec![
            CameraInfo::new("Front", "", "", CameraIndex::Index(0)),
            CameraInfo::new("USB Capture", "", "", CameraIndex::Index(1)),
        ]
    }

    #[test]
    fn test_select_camera_by_device_id() {
        let (by_name, _) = build_constraints([("vs.deviceId", "USB Capture")]);
        assert_eq!(
            select_camera(cameras(), &by_name).map(|c| c.human_name()),
            Some("USB Capture".to_string())
        );

        let (by_index, _) = build_constraints([("vs.deviceId", "0")]);
        assert_eq!(
            select_camera(cameras(), &by_index).map(|c| c.human_name()),
            Some("Front".to_string())
        );

        let (missing, _) = build_constraints([("vs.deviceId", "Rear")]);
        assert!(select_camera(cameras(), &missing).is_none());
    }

    #[test]
    fn test_unavailable_microphone_is_not_found() {
        let err = map_audio_error("open", cpal::BuildStreamError::DeviceNotAvailable);
        assert_eq!(err.name(), "NotFoundError");
    }
}
