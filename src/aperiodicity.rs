//! Band-wise aperiodicity from the consistency of the group delay.
//!
//! A periodic frame analysed through a zero-phase window has a flat,
//! near-zero group delay around every strong partial, while noise makes it
//! scatter from bin to bin. The scatter around a local moving average is
//! squashed through a band-specific sigmoid.

use std::f64::consts::{FRAC_PI_8, TAU};

use rustfft::num_complex::Complex;

use crate::{
    config::{AperiodicityConfig, F0Range, Quality},
    error::{ensure_positive, Error, Result},
    fft::{Fft, MAX_FFT_SIZE},
    params::{Matrix, MAX_APERIODICITY, MIN_APERIODICITY, UNVOICED_APERIODICITY},
    scratch::{self, Scratch},
    windows::symmetric_hann_window,
};

pub const BAND_COUNT: usize = 5;
const WINDOW_PERIODS: f64 = 3.0;
const MIN_SMOOTHING_BINS: usize = 3;
const MAX_SMOOTHING_BINS: usize = 15;
const MAX_FRAME_CHANGE: f64 = 0.1;
/// Bins quieter than this, relative to the loudest bin of the frame, carry
/// no group delay weight.
const RELATIVE_POWER_FLOOR: f64 = 1e-6;

/// Upper bin edge of each band; band `b` spans `edges[b - 1]..edges[b]`.
pub fn band_edges(fft_size: usize) -> [usize; BAND_COUNT] {
    let nyquist = fft_size / 2;
    let mut edges = [0; BAND_COUNT];
    for (b, edge) in edges.iter_mut().enumerate() {
        let exponent = b as i32 - BAND_COUNT as i32 + 1;
        *edge = (nyquist as f64 * 2f64.powi(exponent)).round() as usize;
    }
    edges
}

#[derive(Debug, Clone, Copy)]
struct BandShape {
    threshold: f64,
    steepness: f64,
    floor: f64,
}

impl BandShape {
    fn new(threshold: f64, band: usize) -> Self {
        let b = band as f64;
        Self {
            threshold: threshold * FRAC_PI_8 / (1.0 + 0.15 * b),
            steepness: 4.0 + 2.0 * b,
            floor: MIN_APERIODICITY + 0.05 * b,
        }
    }

    fn aperiodicity(&self, deviation: f64) -> f64 {
        let x = self.steepness * (deviation / self.threshold - 1.0);
        (1.0 / (1.0 + (-x).exp())).clamp(self.floor, MAX_APERIODICITY)
    }
}

/// Group delay in samples from a seven-point difference of the complex
/// spectrum, read every `stride` bins. `spectrum` holds the full transform
/// so the stencil wraps around DC and Nyquist.
pub fn spectral_group_delay(spectrum: &[Complex<f64>], stride: usize, power: &[f64], out: &mut [f64]) {
    let size = spectrum.len() as isize;
    let bin_angle = TAU / size as f64;
    let at = |k: isize| spectrum[k.rem_euclid(size) as usize];
    let diff = |j: isize, d: isize| at(j + d) - at(j - d);
    for (i, (delay, &p)) in out.iter_mut().zip(power).enumerate() {
        let j = (i * stride) as isize;
        let slope = (diff(j, 1) * 45.0 - diff(j, 2) * 9.0 + diff(j, 3)) / (60.0 * bin_angle);
        *delay = if p > 0.0 { -(slope * at(j).conj()).im / p } else { 0.0 };
    }
}

/// Group delay in samples from the spectrum of the time-ramped segment:
/// `Re(ramped · conj(plain)) / |plain|²`.
pub fn ramped_group_delay(plain: &[Complex<f64>], ramped: &[Complex<f64>], power: &[f64], out: &mut [f64]) {
    for (((delay, x), y), &p) in out.iter_mut().zip(plain).zip(ramped).zip(power) {
        *delay = if p > 0.0 { (*y * x.conj()).re / p } else { 0.0 };
    }
}

/// Cross-fade weight of the band starting at `edge`: 0 below, 1 above.
fn fade_in(bin: usize, edge: usize, width: usize) -> f64 {
    if width == 0 {
        return if bin >= edge { 1.0 } else { 0.0 };
    }
    let start = edge as f64 - width as f64 / 2.0;
    ((bin as f64 + 0.5 - start) / width as f64).clamp(0.0, 1.0)
}

/// Weight of `band` (spanning `lower..upper`) at `bin` before normalization.
fn band_weight(band: usize, bin: usize, lower: usize, upper: usize, fade: usize) -> f64 {
    let rise = if band == 0 { 1.0 } else { fade_in(bin, lower, fade) };
    let fall = if band + 1 == BAND_COUNT { 1.0 } else { 1.0 - fade_in(bin, upper, fade) };
    rise * fall
}

#[derive(Clone)]
pub struct AperiodicityAnalyzer {
    config: AperiodicityConfig,
    range: F0Range,
    state: Scratch,
    fft: Option<Fft<f64>>,
    wide_fft: Option<Fft<f64>>,
    fft_size: usize,
    window: Vec<f64>,
    windowed: Vec<f64>,
    ramped: Vec<f64>,
    buf: Vec<Complex<f64>>,
    ramp_buf: Vec<Complex<f64>>,
    power: Vec<f64>,
    group_delay: Vec<f64>,
    weighted: Vec<f64>,
    prefix: Vec<f64>,
    scatter: Vec<f64>,
    scatter_prefix: Vec<f64>,
    coverage: Vec<f64>,
}

impl AperiodicityAnalyzer {
    pub fn new(config: AperiodicityConfig, range: F0Range) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            range,
            state: Scratch::default(),
            fft: None,
            wide_fft: None,
            fft_size: 0,
            window: Vec::new(),
            windowed: Vec::new(),
            ramped: Vec::new(),
            buf: Vec::new(),
            ramp_buf: Vec::new(),
            power: Vec::new(),
            group_delay: Vec::new(),
            weighted: Vec::new(),
            prefix: Vec::new(),
            scatter: Vec::new(),
            scatter_prefix: Vec::new(),
            coverage: Vec::new(),
        })
    }

    /// Sizes the instance for `fft_size`-point analysis at `sample_rate`.
    /// The fast variant may transform at twice that size.
    pub fn prepare(&mut self, sample_rate: u32, fft_size: usize) -> Result<()> {
        if self.fft.is_some() && self.fft_size == fft_size && !self.state.needs_rebuild(sample_rate, fft_size) {
            return Ok(());
        }
        let fft = Fft::new(fft_size)?;
        let wide_fft = (fft_size * 2 <= MAX_FFT_SIZE).then(|| Fft::new(fft_size * 2)).transpose()?;
        let bins = fft.spectrum_len();
        scratch::ensure_len(&mut self.windowed, fft_size * 2, 0.0, "aperiodicity segment")?;
        scratch::ensure_len(&mut self.ramped, fft_size, 0.0, "ramped segment")?;
        scratch::ensure_len(&mut self.power, bins, 0.0, "band power")?;
        scratch::ensure_len(&mut self.group_delay, bins, 0.0, "group delay")?;
        scratch::ensure_len(&mut self.weighted, bins, 0.0, "weighted group delay")?;
        scratch::ensure_len(&mut self.prefix, bins + 1, 0.0, "group delay prefix")?;
        scratch::ensure_len(&mut self.scatter, bins, 0.0, "group delay scatter")?;
        scratch::ensure_len(&mut self.scatter_prefix, bins + 1, 0.0, "scatter prefix")?;
        scratch::ensure_len(&mut self.coverage, bins, 0.0, "band coverage")?;
        for (buf, what) in [(&mut self.buf, "aperiodicity spectrum"), (&mut self.ramp_buf, "ramped spectrum")] {
            buf.clear();
            buf.try_reserve_exact(fft_size * 2)
                .map_err(|_| Error::out_of_memory(what, fft_size * 2))?;
        }
        self.window.clear();
        self.fft = Some(fft);
        self.wide_fft = wide_fft;
        self.fft_size = fft_size;
        self.state.mark_built("aperiodicity", sample_rate, fft_size);
        Ok(())
    }

    pub fn analyze_frame(
        &mut self,
        audio: &[f64],
        center: usize,
        f0: f64,
        sample_rate: u32,
        fft_size: usize,
    ) -> Result<Vec<f64>> {
        let mut out = scratch::try_zeroed(fft_size / 2 + 1, "aperiodicity")?;
        self.analyze_frame_into(audio, center, f0, sample_rate, Quality::Precise, &mut out)?;
        Ok(out)
    }

    /// Writes one frame's aperiodicity into `out`, whose length fixes the
    /// transform size (`out.len() == fft_size / 2 + 1`).
    ///
    /// The precise variant takes the group delay exactly from a second,
    /// time-ramped transform. The fast variant differentiates a single
    /// spectrum, oversampled to at least twice the window length, and
    /// smooths with running sums.
    pub fn analyze_frame_into(
        &mut self,
        audio: &[f64],
        center: usize,
        f0: f64,
        sample_rate: u32,
        quality: Quality,
        out: &mut [f64],
    ) -> Result<()> {
        if audio.is_empty() {
            return Err(Error::invalid_arg("audio", "empty buffer"));
        }
        ensure_positive("sample_rate", sample_rate as f64)?;
        self.range.check(f0)?;
        if out.len() < 2 {
            return Err(Error::invalid_arg("aperiodicity", "needs at least two bins"));
        }
        if f0 <= 0.0 {
            out.fill(UNVOICED_APERIODICITY);
            return Ok(());
        }
        let fft_size = (out.len() - 1) * 2;
        self.prepare(sample_rate, fft_size)?;

        let len = ((WINDOW_PERIODS * sample_rate as f64 / f0).round() as usize)
            .clamp(fft_size / 4, fft_size);
        match quality {
            Quality::Fast => {
                let stride = if 2 * len > fft_size && self.wide_fft.is_some() { 2 } else { 1 };
                self.load_segment(audio, center, len, fft_size * stride, false);
                self.transform_differenced(stride)?;
            }
            Quality::Precise => {
                self.load_segment(audio, center, len, fft_size, true);
                self.transform_ramped()?;
            }
        }

        let resolution = sample_rate as f64 / fft_size as f64;
        let width = smoothing_width(f0, resolution);
        let edges = band_edges(fft_size);
        let fade = self.config.crossfade_bins;
        let bins = out.len();
        // Phase error accumulated across the Hann main lobe, in radians per
        // sample of group delay.
        let scale = 4.0 * TAU / len as f64;
        let quiet = RELATIVE_POWER_FLOOR * self.power.iter().cloned().fold(0.0, f64::max);
        out.fill(0.0);
        self.coverage.fill(0.0);

        let mut lower: usize = 0;
        for (band, &upper) in edges.iter().enumerate() {
            let start = if band == 0 { 0 } else { lower.saturating_sub(fade / 2 + 1) };
            let end = if band + 1 == BAND_COUNT { bins } else { (upper + fade / 2 + 1).min(bins) };
            let shape = BandShape::new(self.config.threshold, band);
            self.weight_delay(start, end, scale, quiet);
            self.measure_scatter(quality, width, start, end);
            for i in start..end {
                let weight = band_weight(band, i, lower, upper, fade);
                if weight > 0.0 {
                    let deviation = match quality {
                        Quality::Fast => window_mean(&self.scatter_prefix, i, width, start, end),
                        Quality::Precise => direct_mean(&self.scatter, i, width, start, end),
                    };
                    out[i] += weight * shape.aperiodicity(deviation.sqrt());
                    self.coverage[i] += weight;
                }
            }
            lower = upper;
        }
        for (a, &total) in out.iter_mut().zip(self.coverage.iter()) {
            if total > 0.0 {
                *a /= total;
            }
            *a = a.clamp(MIN_APERIODICITY, MAX_APERIODICITY);
        }
        Ok(())
    }

    /// Loads `len` windowed samples around `center` into the first `size`
    /// slots of `windowed`, and the time-ramped copy into `ramped`.
    fn load_segment(&mut self, audio: &[f64], center: usize, len: usize, size: usize, ramp: bool) {
        if self.window.len() != len {
            self.window = symmetric_hann_window(len);
        }
        // Zero-phase layout: the frame centre lands on index 0 and the left
        // half wraps to the end of the buffer.
        self.windowed[..size].fill(0.0);
        if ramp {
            self.ramped[..size].fill(0.0);
        }
        let half = len / 2;
        for (k, &w) in self.window.iter().enumerate() {
            let index = center as isize + k as isize - half as isize;
            if index < 0 || index as usize >= audio.len() {
                continue;
            }
            let slot = (k + size - half) % size;
            let x = audio[index as usize] * w;
            self.windowed[slot] = x;
            if ramp {
                self.ramped[slot] = x * (k as f64 - half as f64);
            }
        }
    }

    fn transform_differenced(&mut self, stride: usize) -> Result<()> {
        let fft = if stride == 1 { self.fft.as_ref() } else { self.wide_fft.as_ref() };
        let Some(fft) = fft else {
            return Err(Error::InvalidState("aperiodicity transform not planned"));
        };
        fft.forward_real(&self.windowed[..fft.size()], &mut self.buf);
        for (i, p) in self.power.iter_mut().enumerate() {
            *p = self.buf[i * stride].norm_sqr();
        }
        spectral_group_delay(&self.buf, stride, &self.power, &mut self.group_delay);
        Ok(())
    }

    fn transform_ramped(&mut self) -> Result<()> {
        let Some(fft) = self.fft.as_ref() else {
            return Err(Error::InvalidState("aperiodicity transform not planned"));
        };
        let size = fft.size();
        fft.forward_real(&self.windowed[..size], &mut self.buf);
        fft.forward_real(&self.ramped[..size], &mut self.ramp_buf);
        for (p, x) in self.power.iter_mut().zip(self.buf.iter()) {
            *p = x.norm_sqr();
        }
        ramped_group_delay(&self.buf, &self.ramp_buf, &self.power, &mut self.group_delay);
        Ok(())
    }

    /// Converts the group delay in `start..end` to radians and weights it
    /// by power relative to the band mean. Refreshes the running sums.
    fn weight_delay(&mut self, start: usize, end: usize, scale: f64, quiet: f64) {
        let mean = self.power[start..end].iter().sum::<f64>() / (end - start).max(1) as f64;
        let reference = mean.max(f64::MIN_POSITIVE) + quiet;
        let mut total = 0.0;
        self.prefix[start] = 0.0;
        for i in start..end {
            let p = self.power[i];
            let weighted = self.group_delay[i] * scale * (p / (p + reference));
            self.weighted[i] = weighted;
            total += weighted;
            self.prefix[i + 1] = total;
        }
    }

    /// Squared distance of each weighted delay from its moving average.
    fn measure_scatter(&mut self, quality: Quality, width: usize, start: usize, end: usize) {
        let mut total = 0.0;
        self.scatter_prefix[start] = 0.0;
        for i in start..end {
            let smoothed = match quality {
                Quality::Fast => window_mean(&self.prefix, i, width, start, end),
                Quality::Precise => direct_mean(&self.weighted, i, width, start, end),
            };
            let d = self.weighted[i] - smoothed;
            self.scatter[i] = d * d;
            total += d * d;
            self.scatter_prefix[i + 1] = total;
        }
    }
}

fn window_bounds(i: usize, width: usize, start: usize, end: usize) -> (usize, usize) {
    let half = width / 2;
    (i.saturating_sub(half).max(start), (i + half + 1).min(end))
}

/// Moving average from running sums; `prefix[k]` sums values `start..k`.
fn window_mean(prefix: &[f64], i: usize, width: usize, start: usize, end: usize) -> f64 {
    let (lo, hi) = window_bounds(i, width, start, end);
    (prefix[hi] - prefix[lo]) / (hi - lo) as f64
}

fn direct_mean(values: &[f64], i: usize, width: usize, start: usize, end: usize) -> f64 {
    let (lo, hi) = window_bounds(i, width, start, end);
    values[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
}

/// Moving-average width: about one harmonic spacing, odd, within [3, 15].
pub fn smoothing_width(f0: f64, resolution: f64) -> usize {
    let bins = (f0 / resolution).round() as usize;
    let odd = bins | 1;
    odd.clamp(MIN_SMOOTHING_BINS, MAX_SMOOTHING_BINS)
}

/// Averages each bin over three consecutive voiced frames and limits the
/// frame-to-frame change to 10% of the previous frame's value.
pub fn smooth_across_frames(aperiodicity: &mut Matrix, f0: &[f64]) {
    let frames = aperiodicity.rows().min(f0.len());
    if frames < 3 {
        return;
    }
    // Rows as they were before this pass.
    let mut unsmoothed_prev = aperiodicity.row(0).to_vec();
    let mut unsmoothed_cur = vec![0.0; aperiodicity.cols()];
    for i in 1..frames - 1 {
        unsmoothed_cur.copy_from_slice(aperiodicity.row(i));
        if f0[i - 1] > 0.0 && f0[i] > 0.0 && f0[i + 1] > 0.0 {
            let (prev, cur, next) = aperiodicity.neighbours_mut(i);
            for j in 0..cur.len() {
                let average = (unsmoothed_prev[j] + unsmoothed_cur[j] + next[j]) / 3.0;
                let limit = prev[j] * MAX_FRAME_CHANGE;
                cur[j] = average
                    .clamp(prev[j] - limit, prev[j] + limit)
                    .clamp(MIN_APERIODICITY, MAX_APERIODICITY);
            }
        }
        std::mem::swap(&mut unsmoothed_prev, &mut unsmoothed_cur);
    }
}
