//! Testing utilities for crabwhip
//!
//! In-process capture devices and an in-memory peer connection so the whole
//! publish path can run offline, without cameras or a WebRTC stack.

pub mod devices;
pub mod peer;

pub use devices::{CaptureRequest, SyntheticDevices};
pub use peer::{AttachedTrack, LoopbackPeer, LoopbackPeerFactory};

use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
