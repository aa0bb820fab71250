use std::{f64::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex64, RealFftPlanner, RealToComplex};

use crate::{EchoError, PcmBuffer, Result};

/// Measures the pitch of generated tones. Plans and buffers are kept between
/// calls and rebuilt only when the analysed length changes.
pub struct SpectrumProbe {
    planner: RealFftPlanner<f64>,
    fft: Option<FftResources>,
}

impl SpectrumProbe {
    pub fn new() -> Self {
        Self {
            planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Frequency of the strongest bin of the Hann-windowed buffer.
    pub fn dominant_frequency(&mut self, pcm: &PcmBuffer) -> Result<f64> {
        let len = pcm.len_samples();
        if len < 2 {
            return Err(EchoError::InvalidInput(
                "spectrum requires at least two samples",
            ));
        }

        let fft = self.prepare_fft(len);
        for (index, sample) in pcm.samples().enumerate() {
            fft.input[index] = f64::from(sample) / f64::from(i16::MAX) * hann_value(index, len);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let peak = fft
            .spectrum
            .iter()
            .enumerate()
            .skip(1)
            .map(|(bin, value)| (bin, value.norm()))
            .fold((0, 0.0), |best, candidate| {
                if candidate.1 > best.1 {
                    candidate
                } else {
                    best
                }
            });

        let bin_hz = f64::from(pcm.sample_rate_hz()) / len as f64;
        Ok(peak.0 as f64 * bin_hz)
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        let fft = match self.fft.take() {
            Some(fft) if fft.size == size => fft,
            _ => {
                let plan = self.planner.plan_fft_forward(size);
                FftResources {
                    size,
                    scratch: plan.make_scratch_vec(),
                    spectrum: plan.make_output_vec(),
                    input: plan.make_input_vec(),
                    plan,
                }
            }
        };

        self.fft.insert(fft)
    }
}

impl Default for SpectrumProbe {
    fn default() -> Self {
        Self::new()
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f64>>,
    scratch: Vec<Complex64>,
    spectrum: Vec<Complex64>,
    input: Vec<f64>,
}

impl fmt::Debug for SpectrumProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumProbe")
            .field("size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f64 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f64) / (len as f64 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ToneConfig, ToneGenerator};

    #[test]
    fn finds_the_generated_pitch() {
        let mut generator = ToneGenerator::new(ToneConfig::default());
        let mut probe = SpectrumProbe::new();

        for distance in [40.0, 250.0, 1_000.0] {
            let (params, pcm) = generator.generate(distance);
            let measured = probe.dominant_frequency(&pcm).unwrap();
            assert!(
                (measured - params.frequency_hz).abs() <= 1.0,
                "expected {} got {measured}",
                params.frequency_hz
            );
        }
    }

    #[test]
    fn rejects_tiny_buffers() {
        let pcm = PcmBuffer::from_samples(&[0.5], 10_000);
        assert!(SpectrumProbe::new().dominant_frequency(&pcm).is_err());
    }
}
