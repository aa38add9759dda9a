//! Microphone capture.
//!
//! A [`Microphone`] hands out [`CaptureStream`]s that hold their device
//! exclusively until dropped. Opening a device that is still held by another
//! stream fails with [`RealtimeError::DeviceBusy`], so transports must drop
//! the previous stream before acquiring a new one.

#[cfg(feature = "cpal")]
mod cpal_mic;
mod virtual_mic;

#[cfg(feature = "cpal")]
pub use cpal_mic::CpalMicrophone;
pub use virtual_mic::{Signal, VirtualMicrophone};

use crate::Result;
use newme_realtime_types::{AudioDevice, AudioFrame};
use std::fmt;
use tokio::sync::mpsc;

/// Source of capture streams.
pub trait Microphone: Send + Sync {
    /// Lists the devices that can be passed to [`Microphone::open`].
    fn devices(&self) -> Result<Vec<AudioDevice>>;

    /// Acquires a device, or the default device when `device_id` is `None`.
    fn open(&self, device_id: Option<&str>) -> Result<CaptureStream>;
}

/// A live capture. Frames arrive continuously until the stream is dropped.
pub struct CaptureStream {
    device: AudioDevice,
    frames: mpsc::Receiver<AudioFrame>,
    guard: CaptureGuard,
}

impl CaptureStream {
    pub fn new(device: AudioDevice, frames: mpsc::Receiver<AudioFrame>, guard: CaptureGuard) -> Self {
        Self {
            device,
            frames,
            guard,
        }
    }

    pub fn device(&self) -> &AudioDevice {
        &self.device
    }

    /// Waits for the next captured frame; `None` once the device stops.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }

    pub fn into_parts(self) -> (AudioDevice, mpsc::Receiver<AudioFrame>, CaptureGuard) {
        (self.device, self.frames, self.guard)
    }
}

impl fmt::Debug for CaptureStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureStream")
            .field("device", &self.device.id)
            .finish()
    }
}

/// Releases the underlying device when dropped.
pub struct CaptureGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CaptureGuard {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for CaptureGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CaptureGuard")
    }
}
