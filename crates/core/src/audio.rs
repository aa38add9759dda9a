use bytes::Bytes;
use newme_realtime_types::AudioFrame;
use rubato::{FastFixedIn, PolynomialDegree};

/// Sample rate of the PCMU track attached to peer connections.
pub const PCMU_SAMPLE_RATE: f64 = 8000.0;

/// Smoothing factor of the level meter; the share of the previous level kept
/// on every new frame.
pub const LEVEL_SMOOTHING: f32 = 0.8;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )?;
    Ok(resampler)
}

/// Averages interleaved channels into a single mono channel.
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Converts f32 samples to i16.
///
/// Negative samples scale by 32768 and positive ones by 32767, so both -1.0
/// and 1.0 land exactly on the i16 range ends.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| {
            let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * i16::MAX as f32) as i16
            }
        })
        .collect()
}

/// Encodes f32 samples as little-endian 16-bit PCM.
pub fn encode_pcm16_le(pcm32: &[f32]) -> Bytes {
    let pcm16: Vec<u8> = convert_f32_to_i16(pcm32)
        .into_iter()
        .flat_map(i16::to_le_bytes)
        .collect();
    Bytes::from(pcm16)
}

/// The binary payload sent by the fallback transport for one captured frame.
pub fn frame_to_pcm16(frame: &AudioFrame) -> Bytes {
    encode_pcm16_le(&downmix_to_mono(&frame.samples, frame.channels))
}

/// G.711 mu-law encoding of one linear sample.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    pcm = pcm.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

pub fn encode_mulaw(pcm32: &[f32]) -> Bytes {
    Bytes::from(
        convert_f32_to_i16(pcm32)
            .into_iter()
            .map(linear_to_mulaw)
            .collect::<Vec<u8>>(),
    )
}

/// Running, smoothed signal level in `0.0..=1.0`.
#[derive(Debug, Clone, Default)]
pub struct LevelMeter {
    level: f32,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one frame into the running level and returns the new value.
    pub fn update(&mut self, frame: &AudioFrame) -> f32 {
        let mono = downmix_to_mono(&frame.samples, frame.channels);
        let rms = if mono.is_empty() {
            0.0
        } else {
            (mono.iter().map(|s| s * s).sum::<f32>() / mono.len() as f32).sqrt()
        };
        let instant = if rms.is_finite() { rms.clamp(0.0, 1.0) } else { 0.0 };
        self.level = LEVEL_SMOOTHING * self.level + (1.0 - LEVEL_SMOOTHING) * instant;
        self.level
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}
