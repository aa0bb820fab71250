use std::f64::consts::PI;

use crate::config::{ToneConfig, Waveform};

/// Frequency, length and rate of one synthesised tone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneParameters {
    pub frequency_hz: f64,
    pub duration_seconds: f64,
    pub sample_rate_hz: u32,
}

impl ToneParameters {
    /// Maps a distance onto a tone. The frequency never drops below the
    /// configured floor; a NaN distance also yields the floor.
    pub fn for_distance(distance: f64, config: &ToneConfig) -> Self {
        Self {
            frequency_hz: distance.max(config.floor_hz),
            duration_seconds: config.duration_seconds,
            sample_rate_hz: config.sample_rate_hz,
        }
    }

    pub fn num_samples(&self) -> usize {
        (self.duration_seconds * f64::from(self.sample_rate_hz)).round() as usize
    }
}

/// Encodes one sample as 16-bit little-endian PCM.
pub fn encode_sample(sample: i16) -> [u8; 2] {
    sample.to_le_bytes()
}

pub fn decode_sample(bytes: [u8; 2]) -> i16 {
    i16::from_le_bytes(bytes)
}

/// Maps a value in `[-1, 1]` onto the signed 16-bit range. Values outside
/// the range are clipped; non-finite values become silence.
pub fn quantize(value: f64) -> i16 {
    if !value.is_finite() {
        return 0;
    }
    (value.clamp(-1.0, 1.0) * f64::from(i16::MAX)) as i16
}

/// Mono signed 16-bit little-endian PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    bytes: Vec<u8>,
    sample_rate_hz: u32,
}

impl PcmBuffer {
    pub fn from_samples(samples: &[f64], sample_rate_hz: u32) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for &value in samples {
            bytes.extend_from_slice(&encode_sample(quantize(value)));
        }
        Self {
            bytes,
            sample_rate_hz,
        }
    }

    /// Wraps already-encoded PCM. A trailing odd byte is ignored by the
    /// sample accessors.
    pub fn from_bytes(bytes: Vec<u8>, sample_rate_hz: u32) -> Self {
        Self {
            bytes,
            sample_rate_hz,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    pub fn len_samples(&self) -> usize {
        self.bytes.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn sample(&self, index: usize) -> Option<i16> {
        let offset = index.checked_mul(2)?;
        let pair = self.bytes.get(offset..offset.checked_add(2)?)?;
        Some(decode_sample([pair[0], pair[1]]))
    }

    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.bytes
            .chunks_exact(2)
            .map(|pair| decode_sample([pair[0], pair[1]]))
    }
}

/// Evaluates `waveform` at sample `index` of a tone at `frequency_hz`.
pub fn waveform_value(waveform: Waveform, index: usize, frequency_hz: f64, sample_rate_hz: u32) -> f64 {
    let phase = 2.0 * PI * index as f64 * frequency_hz / f64::from(sample_rate_hz);
    match waveform {
        Waveform::Sine => phase.sin(),
        Waveform::Tangent => phase.tan().clamp(-1.0, 1.0),
    }
}

/// Turns distances into PCM tones, reusing its floating-point scratch buffer
/// between calls.
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    config: ToneConfig,
    scratch: Vec<f64>,
}

impl ToneGenerator {
    pub fn new(config: ToneConfig) -> Self {
        Self {
            scratch: Vec::with_capacity(config.num_samples()),
            config,
        }
    }

    pub fn config(&self) -> &ToneConfig {
        &self.config
    }

    pub fn parameters(&self, distance: f64) -> ToneParameters {
        ToneParameters::for_distance(distance, &self.config)
    }

    pub fn generate(&mut self, distance: f64) -> (ToneParameters, PcmBuffer) {
        let params = self.parameters(distance);
        let pcm = self.synthesize(&params);
        (params, pcm)
    }

    pub fn synthesize(&mut self, params: &ToneParameters) -> PcmBuffer {
        let count = params.num_samples();
        self.scratch.clear();
        self.scratch.extend((0..count).map(|index| {
            self.config.amplitude
                * waveform_value(
                    self.config.waveform,
                    index,
                    params.frequency_hz,
                    params.sample_rate_hz,
                )
        }));
        PcmBuffer::from_samples(&self.scratch, params.sample_rate_hz)
    }
}
