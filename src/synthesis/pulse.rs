//! One excitation pulse: a minimum-phase periodic response plus a burst of
//! shaped noise, rendered into a single real response.

use std::f64::consts::TAU;

use rand::Rng;
use rand_pcg::Pcg32;
use rustfft::{num_complex::Complex, num_traits::Zero};

use crate::{
    cepstrum::minimum_phase,
    error::{Error, Result},
    fft::{fix_scale, Fft},
    scratch,
};

const RESPONSE_FLOOR: f64 = 1e-15;
/// Half-width of a zero-mean uniform distribution with unit variance.
const UNIT_UNIFORM: f64 = 1.732_050_807_568_877_2;

/// Parameters of one pulse, borrowed from the analysis frame nearest to it.
#[derive(Debug, Clone, Copy)]
pub struct Pulse<'a> {
    /// Absolute sample position, fractional part included.
    pub position: f64,
    /// Samples until the next pulse.
    pub interval: f64,
    pub voiced: bool,
    pub envelope: &'a [f64],
    pub aperiodicity: &'a [f64],
    pub gain: f64,
}

#[derive(Clone)]
pub struct PulseRenderer {
    fft: Fft<f64>,
    magnitude: Vec<f64>,
    periodic: Vec<Complex<f64>>,
    shape: Vec<Complex<f64>>,
    noise: Vec<Complex<f64>>,
    response: Vec<f64>,
}

impl PulseRenderer {
    pub fn new(fft_size: usize) -> Result<Self> {
        let fft = Fft::new(fft_size)?;
        let mut magnitude = Vec::new();
        scratch::ensure_len(&mut magnitude, fft.spectrum_len(), 0.0, "pulse magnitude")?;
        let mut noise = Vec::new();
        scratch::ensure_len(&mut noise, fft_size, Complex::zero(), "noise spectrum")?;
        let mut response = Vec::new();
        scratch::ensure_len(&mut response, fft_size, 0.0, "pulse response")?;
        Ok(Self {
            fft,
            magnitude,
            periodic: Vec::new(),
            shape: Vec::new(),
            noise,
            response,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft.size()
    }

    /// Renders `pulse` and returns its response truncated to
    /// `fft_size >> level` samples. Truncated responses fade out over their
    /// last eighth.
    pub fn render(&mut self, pulse: &Pulse<'_>, rng: &mut Pcg32, level: u8) -> Result<&[f64]> {
        let size = self.fft.size();
        let bins = self.fft.spectrum_len();
        if pulse.envelope.len() != bins || pulse.aperiodicity.len() != bins {
            return Err(Error::invalid_arg(
                "pulse",
                format!(
                    "frame has {} envelope and {} aperiodicity bins, expected {bins}",
                    pulse.envelope.len(),
                    pulse.aperiodicity.len()
                ),
            ));
        }

        let burst = (pulse.interval.round() as usize).clamp(1, size);
        for (k, x) in self.noise.iter_mut().enumerate() {
            let value = if k < burst {
                rng.gen_range(-UNIT_UNIFORM..UNIT_UNIFORM)
            } else {
                0.0
            };
            *x = Complex::new(value, 0.0);
        }
        self.fft.forward(&mut self.noise);

        for ((m, &e), &a) in self.magnitude.iter_mut().zip(pulse.envelope).zip(pulse.aperiodicity) {
            *m = e * a.clamp(0.0, 1.0).sqrt() * pulse.gain;
        }
        minimum_phase(&self.fft, &self.magnitude, RESPONSE_FLOOR, &mut self.shape);
        for (x, h) in self.noise.iter_mut().zip(self.shape.iter()) {
            *x = *x * *h;
        }

        if pulse.voiced {
            let scale = pulse.gain * pulse.interval.sqrt();
            for ((m, &e), &a) in self.magnitude.iter_mut().zip(pulse.envelope).zip(pulse.aperiodicity) {
                *m = e * (1.0 - a).clamp(0.0, 1.0).sqrt() * scale;
            }
            minimum_phase(&self.fft, &self.magnitude, RESPONSE_FLOOR, &mut self.periodic);
            // Linear phase moves the pulse to its fractional position.
            let fraction = pulse.position.fract();
            for (k, (x, h)) in self.noise.iter_mut().zip(self.periodic.iter()).enumerate() {
                let signed = if k <= size / 2 { k as f64 } else { k as f64 - size as f64 };
                *x = *x + *h * Complex::from_polar(1.0, -TAU * signed * fraction / size as f64);
            }
        }

        self.fft.inverse(&mut self.noise);
        fix_scale(&mut self.noise);
        for (r, x) in self.response.iter_mut().zip(self.noise.iter()) {
            *r = x.re;
        }

        let len = size >> level;
        if level > 0 {
            let fade = (len / 8).max(1);
            for (i, r) in self.response[len - fade..len].iter_mut().enumerate() {
                *r *= (fade - i) as f64 / fade as f64;
            }
        }
        Ok(&self.response[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn flat(bins: usize, value: f64) -> Vec<f64> {
        vec![value; bins]
    }

    #[test]
    fn test_unit_uniform_has_unit_variance() {
        assert!((UNIT_UNIFORM - 3f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_periodic_pulse_of_flat_envelope_is_an_impulse() {
        let mut renderer = PulseRenderer::new(256).unwrap();
        let envelope = flat(129, 1.0);
        let aperiodicity = flat(129, 0.0);
        let pulse = Pulse {
            position: 10.0,
            interval: 64.0,
            voiced: true,
            envelope: &envelope,
            aperiodicity: &aperiodicity,
            gain: 0.5,
        };
        let mut rng = Pcg32::seed_from_u64(1);
        let response = renderer.render(&pulse, &mut rng, 0).unwrap();
        assert_eq!(response.len(), 256);
        assert!((response[0] - 0.5 * 8.0).abs() < 1e-6);
        assert!(response[1..].iter().all(|x| x.abs() < 1e-6));
    }

    #[test]
    fn test_truncation_and_fade() {
        let mut renderer = PulseRenderer::new(256).unwrap();
        let envelope = flat(129, 1.0);
        let aperiodicity = flat(129, 1.0);
        let pulse = Pulse {
            position: 0.0,
            interval: 32.0,
            voiced: false,
            envelope: &envelope,
            aperiodicity: &aperiodicity,
            gain: 1.0,
        };
        let mut rng = Pcg32::seed_from_u64(1);
        let response = renderer.render(&pulse, &mut rng, 2).unwrap();
        assert_eq!(response.len(), 64);
        // A flat noise shape passes the burst through unchanged.
        assert!(response[..32].iter().all(|x| x.abs() <= 3f64.sqrt() + 1e-9));
        assert!(response[32..56].iter().all(|x| x.abs() < 1e-9));
    }

    #[test]
    fn test_rejects_mismatched_bins() {
        let mut renderer = PulseRenderer::new(256).unwrap();
        let short = flat(10, 1.0);
        let pulse = Pulse {
            position: 0.0,
            interval: 32.0,
            voiced: false,
            envelope: &short,
            aperiodicity: &short,
            gain: 1.0,
        };
        let mut rng = Pcg32::seed_from_u64(1);
        assert!(renderer.render(&pulse, &mut rng, 0).is_err());
    }
}
