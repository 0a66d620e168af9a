use super::{peak, PreparedSignal};
use crate::{config::ExtractorConfig, error::Result, kernels, scratch};

/// Pitch periods covered by one analysis window.
const WINDOW_PERIODS: f64 = 3.0;
const WEIGHT_CENTER_HZ: f64 = 150.0;
const WEIGHT_SPREAD: f64 = 0.25;
const SUBHARMONIC_RATIO: f64 = 0.9;
const SUBHARMONIC_PENALTY: f64 = 0.25;
const THRESHOLD_RISE: f64 = 0.1;

/// Decimation factor keeping at least eight samples per shortest period.
pub fn decimation_factor(sample_rate: u32, f0_ceil: f64) -> usize {
    ((sample_rate as f64 / (8.0 * f0_ceil)).floor() as usize).clamp(1, 4)
}

/// Single-pole low-pass at 0.9 of the post-decimation Nyquist, then decimate.
pub fn prepare(audio: &[f64], sample_rate: u32, f0_ceil: f64) -> Result<(Vec<f64>, f64)> {
    let factor = decimation_factor(sample_rate, f0_ceil);
    let rate = sample_rate as f64 / factor as f64;
    let cutoff = 0.9 * rate / 2.0;
    let dt = 1.0 / sample_rate as f64;
    let rc = 1.0 / (std::f64::consts::TAU * cutoff);
    let alpha = dt / (rc + dt);

    let mut out = Vec::new();
    scratch::ensure_len(&mut out, audio.len().div_ceil(factor), 0.0, "decimated signal")?;
    let mut state = 0.0;
    for (i, &x) in audio.iter().enumerate() {
        state += alpha * (x - state);
        if i % factor == 0 {
            out[i / factor] = state;
        }
    }
    Ok((out, rate))
}

/// Log-spaced candidate frequencies between floor and ceil.
pub fn candidates(config: &ExtractorConfig) -> Vec<f64> {
    let octaves = (config.f0_ceil / config.f0_floor).log2();
    let count = (config.channels_in_octave * octaves).floor() as usize + 1;
    (0..count)
        .map(|i| config.f0_floor * 2f64.powf(i as f64 / config.channels_in_octave))
        .collect()
}

/// Per-instance correlation cache, indexed by lag.
#[derive(Debug, Clone, Default)]
pub struct FastScratch {
    corr: Vec<f64>,
}

struct Frame<'a> {
    segment: &'a [f64],
    corr: &'a mut [f64],
}

impl Frame<'_> {
    fn correlation(&mut self, lag: usize) -> f64 {
        if lag >= self.corr.len() {
            return 0.0;
        }
        if self.corr[lag].is_nan() {
            let len = self.segment.len() - lag;
            self.corr[lag] = kernels::normalized_correlation(self.segment, lag, len);
        }
        self.corr[lag]
    }
}

fn weight(f: f64) -> f64 {
    let octaves = (f / WEIGHT_CENTER_HZ).log2();
    1.0 / (1.0 + WEIGHT_SPREAD * octaves * octaves)
}

pub fn estimate_frame(
    config: &ExtractorConfig,
    candidates: &[f64],
    signal: &PreparedSignal,
    frame: usize,
    scratch: &mut FastScratch,
) -> Result<f64> {
    let rate = signal.rate;
    let window = (WINDOW_PERIODS * rate / config.f0_floor).ceil() as usize;
    let center = (frame as f64 * config.frame_period / 1000.0 * rate).round() as usize;
    let Some(start) = center.checked_sub(window / 2) else {
        return Ok(0.0);
    };
    if start + window > signal.samples.len() {
        return Ok(0.0);
    }

    let half_cell = 2f64.powf(0.5 / config.channels_in_octave);
    let min_lag = ((rate / config.f0_ceil / half_cell).floor() as usize).max(2);
    let max_lag = ((rate / config.f0_floor * half_cell).ceil() as usize).min(window / 2 + window / 4);
    scratch::ensure_len(&mut scratch.corr, max_lag + 2, f64::NAN, "correlation cache")?;
    let mut frame_data = Frame {
        segment: &signal.samples[start..start + window],
        corr: &mut scratch.corr,
    };

    let stride = config.speed.max(1);
    let mut best = (0.0, 0.0);
    for (index, &candidate) in candidates.iter().enumerate() {
        let period = rate / candidate;
        // The outermost cells stretch to the ends of the admissible lag range.
        let lo = if index + 1 == candidates.len() {
            min_lag
        } else {
            ((period / half_cell).floor() as usize).clamp(min_lag, max_lag)
        };
        let hi = if index == 0 {
            max_lag
        } else {
            ((period * half_cell).ceil() as usize).clamp(min_lag, max_lag)
        };

        let mut lag = lo;
        let mut coarse = (lo, f64::MIN);
        while lag <= hi {
            let r = frame_data.correlation(lag);
            if r > coarse.1 {
                coarse = (lag, r);
            }
            lag += stride;
        }
        let mut peak_lag = coarse.0;
        let mut peak_r = coarse.1;
        for lag in coarse.0.saturating_sub(stride - 1).max(lo)..=(coarse.0 + stride - 1).min(hi) {
            let r = frame_data.correlation(lag);
            if r > peak_r {
                peak_lag = lag;
                peak_r = r;
            }
        }

        let (a, c) = (frame_data.correlation(peak_lag - 1), frame_data.correlation(peak_lag + 1));
        if peak_r <= 0.0 || !peak::is_local_max(a, peak_r, c) {
            continue;
        }
        let (offset, r) = peak::parabolic_peak(a, peak_r, c);
        let f = rate / (peak_lag as f64 + offset);

        let mut score = r.min(1.0) * weight(f);
        for k in 2..=4 {
            let sub = (peak_lag as f64 / k as f64).round() as usize;
            if sub < min_lag {
                break;
            }
            if frame_data.correlation(sub) >= SUBHARMONIC_RATIO * r {
                score *= SUBHARMONIC_PENALTY;
                break;
            }
        }
        if score > best.1 {
            best = (f, score);
        }
    }

    let threshold = config.voicing_threshold
        + THRESHOLD_RISE * frame as f64 / signal.frame_count.max(1) as f64;
    Ok(if best.1 > threshold { best.0 } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_grid() {
        let c = candidates(&ExtractorConfig::default());
        assert_eq!(c.len(), 7);
        assert_eq!(c[0], 71.0);
        assert!((c[2] - 142.0).abs() < 1e-9);
        assert!(c.iter().all(|&f| f <= 800.0));
    }

    #[test]
    fn test_decimation_bounds() {
        assert_eq!(decimation_factor(44100, 800.0), 4);
        assert_eq!(decimation_factor(16000, 800.0), 2);
        assert_eq!(decimation_factor(8000, 800.0), 1);
        assert_eq!(decimation_factor(96000, 400.0), 4);
    }

    #[test]
    fn test_prepare_passes_low_frequencies() {
        let audio: Vec<f64> = (0..44100)
            .map(|i| (std::f64::consts::TAU * 200.0 * i as f64 / 44100.0).sin())
            .collect();
        let (samples, rate) = prepare(&audio, 44100, 800.0).unwrap();
        assert_eq!(rate, 11025.0);
        assert_eq!(samples.len(), 11025);
        let peak = samples[5000..].iter().fold(0.0f64, |m, x| m.max(x.abs()));
        assert!(peak > 0.95 && peak < 1.05);
    }

    #[test]
    fn test_weight_prefers_speech_range() {
        assert!((weight(150.0) - 1.0).abs() < 1e-12);
        assert!(weight(600.0) < weight(300.0));
        assert!(weight(75.0) < 1.0);
    }
}
