use super::{CaptureGuard, CaptureStream, Microphone};
use crate::{RealtimeError, Result};
use newme_realtime_types::{AudioDevice, AudioFrame, FRAME_SIZE};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// What a virtual device produces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Silence,
    Tone { frequency: f32, amplitude: f32 },
}

struct DeviceTable {
    devices: Vec<AudioDevice>,
    held: HashSet<String>,
    denied: bool,
}

/// A software microphone producing paced mono frames.
///
/// Devices are locked exactly like physical ones: a second `open` of a held
/// device fails until the first stream is dropped.
#[derive(Clone)]
pub struct VirtualMicrophone {
    table: Arc<Mutex<DeviceTable>>,
    sample_rate: u32,
    signal: Signal,
}

impl Default for VirtualMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMicrophone {
    pub fn new() -> Self {
        Self::with_devices(vec![AudioDevice {
            id: "virtual-default".to_string(),
            name: "Virtual Microphone".to_string(),
            is_default: true,
        }])
    }

    pub fn with_devices(devices: Vec<AudioDevice>) -> Self {
        Self {
            table: Arc::new(Mutex::new(DeviceTable {
                devices,
                held: HashSet::new(),
                denied: false,
            })),
            sample_rate: DEFAULT_SAMPLE_RATE,
            signal: Signal::Silence,
        }
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = signal;
        self
    }

    /// Makes every subsequent `open` fail as if permission was refused.
    pub fn deny_access(&self, denied: bool) {
        self.table.lock().denied = denied;
    }

    pub fn is_held(&self, device_id: &str) -> bool {
        self.table.lock().held.contains(device_id)
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(FRAME_SIZE as f64 / self.sample_rate as f64)
    }
}

impl Microphone for VirtualMicrophone {
    fn devices(&self) -> Result<Vec<AudioDevice>> {
        Ok(self.table.lock().devices.clone())
    }

    fn open(&self, device_id: Option<&str>) -> Result<CaptureStream> {
        let device = {
            let mut table = self.table.lock();
            if table.denied {
                return Err(RealtimeError::DeviceAcquisition(
                    "microphone permission denied".to_string(),
                ));
            }
            let device = match device_id {
                Some(id) => table.devices.iter().find(|d| d.id == id),
                None => table
                    .devices
                    .iter()
                    .find(|d| d.is_default)
                    .or_else(|| table.devices.first()),
            }
            .cloned()
            .ok_or_else(|| {
                RealtimeError::DeviceAcquisition(format!(
                    "no capture device matching {:?}",
                    device_id.unwrap_or("default")
                ))
            })?;
            if !table.held.insert(device.id.clone()) {
                return Err(RealtimeError::DeviceBusy(device.id));
            }
            device
        };

        info!(device = %device.id, "Virtual microphone opened");

        let (tx, rx) = mpsc::channel(8);
        let sample_rate = self.sample_rate;
        let signal = self.signal;
        let interval = self.frame_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut phase = 0.0f32;
            loop {
                ticker.tick().await;
                let frame = match signal {
                    Signal::Silence => AudioFrame::silence(sample_rate),
                    Signal::Tone {
                        frequency,
                        amplitude,
                    } => {
                        let step = TAU * frequency / sample_rate as f32;
                        let samples = (0..FRAME_SIZE)
                            .map(|_| {
                                let s = amplitude * phase.sin();
                                phase = (phase + step) % TAU;
                                s
                            })
                            .collect();
                        AudioFrame::new(samples, 1, sample_rate)
                    }
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let table = self.table.clone();
        let device_id = device.id.clone();
        let guard = CaptureGuard::new(move || {
            task.abort();
            table.lock().held.remove(&device_id);
            debug!(device = %device_id, "Virtual microphone released");
        });

        Ok(CaptureStream::new(device, rx, guard))
    }
}
