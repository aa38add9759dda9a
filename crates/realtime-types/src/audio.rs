use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Samples per channel in one captured frame.
pub const FRAME_SIZE: usize = 4096;

/// A block of captured microphone samples, interleaved when multi-channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: channels.max(1),
            sample_rate,
        }
    }

    /// A mono frame of `FRAME_SIZE` zero samples.
    pub fn silence(sample_rate: u32) -> Self {
        Self::new(vec![0.0; FRAME_SIZE], 1, sample_rate)
    }

    /// Number of samples per channel.
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_count() as f64 / self.sample_rate as f64)
    }
}

/// A selectable capture device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}
