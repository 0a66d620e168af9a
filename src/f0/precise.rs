use rustfft::num_complex::Complex;

use super::{peak, PreparedSignal};
use crate::{
    config::ExtractorConfig,
    error::Result,
    fft::Fft,
    kernels, scratch,
    scratch::Scratch,
    windows::blackman_window,
};

const WINDOW_PERIODS: f64 = 4.0;
const PEAK_FLOOR: f64 = 0.1;
const MAX_CANDIDATES: usize = 4;
const SEARCH_SPAN: f64 = 0.2;
const MIN_CORRELATION: f64 = 0.3;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    frequency: f64,
    reliability: f64,
}

#[derive(Clone, Default)]
pub struct PreciseScratch {
    state: Scratch,
    fft: Option<Fft<f64>>,
    window: Vec<f64>,
    spectrum: Vec<Complex<f64>>,
    magnitude: Vec<f64>,
    windowed: Vec<f64>,
    candidates: Vec<Candidate>,
}

impl PreciseScratch {
    fn ensure(&mut self, sample_rate: u32, window_len: usize) -> Result<()> {
        if !self.state.needs_rebuild(sample_rate, window_len) && self.fft.is_some() {
            return Ok(());
        }
        let size = window_len.next_power_of_two().max(crate::fft::MIN_FFT_SIZE);
        self.fft = Some(Fft::new(size)?);
        self.window = blackman_window(window_len);
        scratch::ensure_len(&mut self.magnitude, size / 2 + 1, 0.0, "peak magnitude")?;
        scratch::ensure_len(&mut self.windowed, window_len, 0.0, "windowed segment")?;
        self.spectrum.clear();
        self.spectrum
            .try_reserve_exact(size)
            .map_err(|_| crate::error::Error::out_of_memory("peak spectrum", size))?;
        self.state.mark_built("precise f0", sample_rate, window_len);
        Ok(())
    }
}

pub fn window_len(config: &ExtractorConfig, sample_rate: u32) -> usize {
    (WINDOW_PERIODS * sample_rate as f64 / config.f0_floor).round() as usize
}

pub fn estimate_frame(
    config: &ExtractorConfig,
    signal: &PreparedSignal,
    frame: usize,
    scratch: &mut PreciseScratch,
) -> Result<f64> {
    let sample_rate = signal.sample_rate;
    let len = window_len(config, sample_rate);
    let center = (frame as f64 * config.frame_period / 1000.0 * signal.rate).round() as usize;
    let Some(start) = center.checked_sub(len / 2) else {
        return Ok(0.0);
    };
    if start + len > signal.samples.len() {
        return Ok(0.0);
    }
    let segment = &signal.samples[start..start + len];
    if kernels::dot(segment, segment) <= f64::MIN_POSITIVE {
        return Ok(0.0);
    }

    scratch.ensure(sample_rate, len)?;
    let PreciseScratch {
        fft,
        window,
        spectrum,
        magnitude,
        windowed,
        candidates,
        ..
    } = scratch;
    let Some(fft) = fft.as_ref() else {
        return Ok(0.0);
    };

    for ((w, &x), &win) in windowed.iter_mut().zip(segment).zip(window.iter()) {
        *w = x * win;
    }
    fft.forward_real(windowed, spectrum);
    for (m, x) in magnitude.iter_mut().zip(spectrum.iter()) {
        *m = x.norm();
    }

    let resolution = sample_rate as f64 / fft.size() as f64;
    let lo = ((config.f0_floor / resolution).ceil() as usize).max(1);
    let hi = ((config.f0_ceil / resolution).floor() as usize).min(magnitude.len() - 2);
    if lo > hi {
        return Ok(0.0);
    }
    let strongest = magnitude[lo..=hi].iter().fold(0.0f64, |m, &x| m.max(x));
    if strongest <= 0.0 {
        return Ok(0.0);
    }

    candidates.clear();
    for i in lo..=hi {
        let (a, b, c) = (magnitude[i - 1], magnitude[i], magnitude[i + 1]);
        if b < PEAK_FLOOR * strongest || !(b > a && b >= c) {
            continue;
        }
        let (offset, _) = peak::parabolic_peak(a, b, c);
        let position = i as f64 + offset;
        let harmonics = (2..=5)
            .map(|h| {
                let bin = (position * h as f64).round() as usize;
                if bin + 1 >= magnitude.len() {
                    0.0
                } else {
                    magnitude[bin - 1].max(magnitude[bin]).max(magnitude[bin + 1])
                }
            })
            .sum::<f64>()
            / 4.0;
        candidates.push(Candidate {
            frequency: position * resolution,
            reliability: (b + harmonics) / strongest,
        });
    }
    candidates.sort_by(|a, b| b.reliability.total_cmp(&a.reliability));
    candidates.truncate(MAX_CANDIDATES);

    for candidate in candidates.iter() {
        if let Some(f) = refine(segment, sample_rate as f64, candidate.frequency) {
            return Ok(f);
        }
    }
    Ok(0.0)
}

/// Time-domain refinement of a spectral candidate over ±20% of its period.
fn refine(segment: &[f64], sample_rate: f64, frequency: f64) -> Option<f64> {
    let period = sample_rate / frequency;
    let lo = ((period * (1.0 - SEARCH_SPAN)).floor() as usize).max(2);
    let hi = ((period * (1.0 + SEARCH_SPAN)).ceil() as usize).min(segment.len() / 2);
    if lo + 2 > hi {
        return None;
    }
    let span = segment.len() - hi - 1;
    let corr = |lag: usize| kernels::normalized_correlation(segment, lag, span);

    let mut best = (lo, f64::MIN);
    for lag in lo..=hi {
        let r = corr(lag);
        if r > best.1 {
            best = (lag, r);
        }
    }
    let (lag, r) = best;
    let (offset, r) = if lag > lo && lag < hi {
        peak::parabolic_peak(corr(lag - 1), r, corr(lag + 1))
    } else {
        (0.0, r)
    };
    (r > MIN_CORRELATION).then(|| sample_rate / (lag as f64 + offset))
}
