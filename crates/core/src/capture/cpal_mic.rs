use super::{CaptureGuard, CaptureStream, Microphone};
use crate::{RealtimeError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use newme_realtime_types::{AudioDevice, AudioFrame, FRAME_SIZE};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Microphone backed by the host's audio input devices.
///
/// `cpal::Stream` is not `Send`, so each capture owns a dedicated thread that
/// builds the stream, plays it, and parks until the guard is dropped.
#[derive(Clone, Default)]
pub struct CpalMicrophone {
    held: Arc<Mutex<HashSet<String>>>,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_device(device_id: Option<&str>) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match device_id {
            None => host.default_input_device().ok_or_else(|| {
                RealtimeError::DeviceAcquisition("No input device available".to_string())
            }),
            Some(id) => host
                .input_devices()
                .map_err(|e| RealtimeError::DeviceAcquisition(e.to_string()))?
                .find(|d| d.name().map(|n| n == id).unwrap_or(false))
                .ok_or_else(|| {
                    RealtimeError::DeviceAcquisition(format!("no capture device named {}", id))
                }),
        }
    }
}

impl Microphone for CpalMicrophone {
    fn devices(&self) -> Result<Vec<AudioDevice>> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let devices = host
            .input_devices()
            .map_err(|e| RealtimeError::DeviceAcquisition(e.to_string()))?
            .filter_map(|d| d.name().ok())
            .map(|name| AudioDevice {
                is_default: default_name.as_deref() == Some(name.as_str()),
                id: name.clone(),
                name,
            })
            .collect();
        Ok(devices)
    }

    fn open(&self, device_id: Option<&str>) -> Result<CaptureStream> {
        let device = Self::find_device(device_id)?;
        let name = device
            .name()
            .map_err(|e| RealtimeError::DeviceAcquisition(e.to_string()))?;
        if !self.held.lock().insert(name.clone()) {
            return Err(RealtimeError::DeviceBusy(name));
        }

        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(16);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::spawn(move || {
            let stream = match build_stream(&device, frame_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            // Blocks until the guard drops the sender.
            let _ = stop_rx.recv();
            drop(stream);
        });

        let started = ready_rx.recv().unwrap_or_else(|_| {
            Err(RealtimeError::DeviceAcquisition(
                "capture thread exited before starting".to_string(),
            ))
        });
        if let Err(e) = started {
            self.held.lock().remove(&name);
            return Err(e);
        }

        info!(device = %name, "Audio capture stream started");

        let held = self.held.clone();
        let released = name.clone();
        let guard = CaptureGuard::new(move || {
            drop(stop_tx);
            held.lock().remove(&released);
        });
        let info = AudioDevice {
            id: name.clone(),
            name,
            is_default: device_id.is_none(),
        };
        Ok(CaptureStream::new(info, frame_rx, guard))
    }
}

fn build_stream(device: &cpal::Device, frames: mpsc::Sender<AudioFrame>) -> Result<cpal::Stream> {
    let config = device
        .default_input_config()
        .map_err(|e| RealtimeError::DeviceAcquisition(e.to_string()))?;
    let channels = config.channels();
    let sample_rate = config.sample_rate().0;
    let block = FRAME_SIZE * channels as usize;

    let mut pending: Vec<f32> = Vec::with_capacity(block * 2);
    let mut push = move |samples: &mut dyn Iterator<Item = f32>| {
        pending.extend(samples);
        while pending.len() >= block {
            let chunk: Vec<f32> = pending.drain(..block).collect();
            if frames
                .try_send(AudioFrame::new(chunk, channels, sample_rate))
                .is_err()
            {
                warn!("Capture consumer is behind, dropping frame");
            }
        }
    };

    let on_error = |err: cpal::StreamError| error!("Audio input error: {}", err);
    let stream_config: cpal::StreamConfig = config.clone().into();
    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| push(&mut data.iter().copied()),
            on_error,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                push(&mut data.iter().map(|&s| s as f32 / 32768.0))
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                push(&mut data.iter().map(|&s| (s as i32 - 32768) as f32 / 32768.0))
            },
            on_error,
            None,
        ),
        other => {
            return Err(RealtimeError::DeviceAcquisition(format!(
                "Unsupported input sample format {:?}",
                other
            )));
        }
    }
    .map_err(|e| RealtimeError::DeviceAcquisition(format!("Failed to build input stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| RealtimeError::DeviceAcquisition(format!("Failed to start input stream: {}", e)))?;
    Ok(stream)
}
