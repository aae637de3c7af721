//! Encoders feeding the native capture tracks
//!
//! Camera frames become H.264 access units through openh264, microphone PCM
//! becomes 20 ms Opus packets through libopus. Both produce [`MediaSample`]s
//! ready for a WebRTC sample track.

use super::MediaSample;
use crate::errors::CaptureError;
use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;
use std::time::Duration;

/// 20 ms at 48 kHz, per channel.
pub const OPUS_FRAME_SAMPLES: usize = 960;
pub const OPUS_SAMPLE_RATE: u32 = 48_000;
const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);
const OPUS_MAX_PACKET: usize = 4000;
/// OPUS_APPLICATION_AUDIO
const OPUS_APPLICATION: i32 = 2049;
const OPUS_BITRATE: i32 = 64_000;

/// One decoded camera frame, packed RGB24.
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// H.264 encoder for one camera track.
///
/// The encoder is created for the first frame's size and rebuilt if the
/// camera changes resolution. Odd edges are cropped, 4:2:0 needs even sizes.
pub struct H264Encoder {
    encoder: Option<Encoder>,
    width: u32,
    height: u32,
    frames: u64,
}

impl H264Encoder {
    pub fn new() -> Self {
        Self {
            encoder: None,
            width: 0,
            height: 0,
            frames: 0,
        }
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames
    }

    /// Encode one frame. `None` when the encoder skipped it.
    pub fn encode(
        &mut self,
        frame: &RgbFrame,
        force_keyframe: bool,
        duration: Duration,
    ) -> Result<Option<MediaSample>, CaptureError> {
        let width = frame.width & !1;
        let height = frame.height & !1;
        if width == 0 || height == 0 {
            return Err(CaptureError::other("camera frame is empty"));
        }
        if frame.data.len() < (frame.width * frame.height * 3) as usize {
            return Err(CaptureError::other(format!(
                "camera frame is {} bytes, expected {}x{} RGB",
                frame.data.len(),
                frame.width,
                frame.height
            )));
        }

        if self.encoder.is_none() || width != self.width || height != self.height {
            log::info!("Starting H.264 encoder at {}x{}", width, height);
            let encoder = Encoder::new()
                .map_err(|e| CaptureError::other(format!("Failed to create H.264 encoder: {}", e)))?;
            self.encoder = Some(encoder);
            self.width = width;
            self.height = height;
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(None);
        };

        if force_keyframe {
            encoder.force_intra_frame();
        }

        let yuv = rgb_to_i420(&frame.data, frame.width, width, height);
        let source = YUVBuffer::from_vec(yuv, width as usize, height as usize);
        let bitstream = encoder
            .encode(&source)
            .map_err(|e| CaptureError::other(format!("H.264 encoding failed: {}", e)))?;

        if matches!(bitstream.frame_type(), FrameType::Skip) {
            return Ok(None);
        }
        let data = bitstream.to_vec();
        if data.is_empty() {
            return Ok(None);
        }

        self.frames += 1;
        Ok(Some(MediaSample::new(data, duration)))
    }
}

impl Default for H264Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// BT.601 RGB24 to planar I420, reading a `stride_width` wide source and
/// writing the top-left `width` x `height` (both even).
pub fn rgb_to_i420(rgb: &[u8], stride_width: u32, width: u32, height: u32) -> Vec<u8> {
    let (stride, w, h) = (stride_width as usize, width as usize, height as usize);
    let luma = w * h;
    let chroma = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; luma + 2 * chroma];
    let (y_plane, uv) = yuv.split_at_mut(luma);
    let (u_plane, v_plane) = uv.split_at_mut(chroma);

    for row in 0..h {
        for col in 0..w {
            let px = (row * stride + col) * 3;
            let (r, g, b) = (rgb[px] as i32, rgb[px + 1] as i32, rgb[px + 2] as i32);
            y_plane[row * w + col] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8;

            if row % 2 == 0 && col % 2 == 0 {
                let at = (row / 2) * (w / 2) + col / 2;
                u_plane[at] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
                v_plane[at] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
            }
        }
    }
    yuv
}

/// Opus encoder for one microphone track.
///
/// Accepts interleaved f32 PCM at 48 kHz in any chunk size and emits one
/// packet per complete 20 ms frame.
///
/// Not `Sync`: libopus encoder state must only be touched from one thread.
pub struct OpusEncoder {
    encoder: *mut libopus_sys::OpusEncoder,
    channels: u16,
    pending: Vec<f32>,
}

// SAFETY: the libopus state is owned exclusively by this value and is never
// shared; moving it to the capture thread is sound without `Sync`.
unsafe impl Send for OpusEncoder {}

impl OpusEncoder {
    pub fn new(channels: u16) -> Result<Self, CaptureError> {
        if channels != 1 && channels != 2 {
            return Err(CaptureError::other(format!(
                "Opus supports mono or stereo, got {} channels",
                channels
            )));
        }

        let mut error: i32 = 0;
        let encoder = unsafe {
            libopus_sys::opus_encoder_create(
                OPUS_SAMPLE_RATE as i32,
                channels as i32,
                OPUS_APPLICATION,
                &mut error,
            )
        };
        if encoder.is_null() || error != 0 {
            return Err(CaptureError::other(format!(
                "Failed to create Opus encoder: error code {}",
                error
            )));
        }

        let result = unsafe {
            libopus_sys::opus_encoder_ctl(
                encoder,
                libopus_sys::OPUS_SET_BITRATE_REQUEST as i32,
                OPUS_BITRATE,
            )
        };
        if result != 0 {
            unsafe { libopus_sys::opus_encoder_destroy(encoder) };
            return Err(CaptureError::other(format!(
                "Failed to set Opus bitrate: error code {}",
                result
            )));
        }

        Ok(Self {
            encoder,
            channels,
            pending: Vec::with_capacity(OPUS_FRAME_SAMPLES * channels as usize * 2),
        })
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Buffer `pcm` and encode every complete frame.
    pub fn encode(&mut self, pcm: &[f32]) -> Result<Vec<MediaSample>, CaptureError> {
        self.pending.extend_from_slice(pcm);

        let frame_len = OPUS_FRAME_SAMPLES * self.channels as usize;
        let mut packets = Vec::new();
        while self.pending.len() >= frame_len {
            let mut packet = vec![0u8; OPUS_MAX_PACKET];
            let written = unsafe {
                libopus_sys::opus_encode_float(
                    self.encoder,
                    self.pending.as_ptr(),
                    OPUS_FRAME_SAMPLES as i32,
                    packet.as_mut_ptr(),
                    packet.len() as i32,
                )
            };
            self.pending.drain(..frame_len);

            if written < 0 {
                return Err(CaptureError::other(format!(
                    "Opus encoding failed: error code {}",
                    written
                )));
            }
            packet.truncate(written as usize);
            packets.push(MediaSample::new(packet, OPUS_FRAME_DURATION));
        }
        Ok(packets)
    }
}

impl Drop for OpusEncoder {
    fn drop(&mut self) {
        unsafe { libopus_sys::opus_encoder_destroy(self.encoder) };
    }
}
