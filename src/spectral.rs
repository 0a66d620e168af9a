//! F0-adaptive spectral envelope estimation (CheapTrick-style).

use rustfft::num_complex::Complex;

use crate::{
    cepstrum::{lift_spectrum, low_pass_lifter},
    config::{F0Range, SpectrumConfig},
    error::{ensure_positive, Error, Result},
    fft::Fft,
    params::ENVELOPE_FLOOR,
    power,
    scratch::{self, Scratch},
    windows::symmetric_hann_window,
};

const WINDOW_PERIODS: f64 = 3.0;
const MAGNITUDE_FLOOR: f64 = 1e-12;

#[derive(Clone)]
pub struct SpectralAnalyzer {
    config: SpectrumConfig,
    range: F0Range,
    state: Scratch,
    fft: Option<Fft<f64>>,
    buf: Vec<Complex<f64>>,
    windowed: Vec<f64>,
    window: Vec<f64>,
    paired: Vec<f64>,
    paired_window: Vec<f64>,
}

impl SpectralAnalyzer {
    pub fn new(config: SpectrumConfig, range: F0Range) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            range,
            state: Scratch::default(),
            fft: None,
            buf: Vec::new(),
            windowed: Vec::new(),
            window: Vec::new(),
            paired: Vec::new(),
            paired_window: Vec::new(),
        })
    }

    /// Plans the transform for `sample_rate` and returns the FFT size.
    pub fn prepare(&mut self, sample_rate: u32) -> Result<usize> {
        let size = self.config.resolve_fft_size(sample_rate, self.range.floor)?;
        if self.fft.is_none() || self.state.needs_rebuild(sample_rate, size) {
            self.fft = Some(Fft::new(size)?);
            scratch::ensure_len(&mut self.windowed, size, 0.0, "envelope segment")?;
            scratch::ensure_len(&mut self.paired, size, 0.0, "paired envelope segment")?;
            self.buf.clear();
            self.buf
                .try_reserve_exact(size)
                .map_err(|_| Error::out_of_memory("envelope spectrum", size))?;
            self.window.clear();
            self.paired_window.clear();
            self.state.mark_built("spectral", sample_rate, size);
        }
        Ok(size)
    }

    pub fn fft_size(&self) -> Option<usize> {
        self.fft.as_ref().map(Fft::size)
    }

    fn window_len(&self, f0: f64, sample_rate: u32, size: usize) -> usize {
        if f0 <= 0.0 {
            return size / 2;
        }
        ((WINDOW_PERIODS * sample_rate as f64 / f0).round() as usize).clamp(size / 4, size)
    }

    /// Loads the Hann-windowed segment around `center` into `self.windowed`.
    fn load_segment(&mut self, audio: &[f64], center: usize, len: usize) {
        load_windowed(&mut self.windowed, &mut self.window, audio, center, len);
    }

    fn check_frame(&self, audio: &[f64], f0: f64, sample_rate: u32) -> Result<()> {
        if audio.is_empty() {
            return Err(Error::invalid_arg("audio", "empty buffer"));
        }
        ensure_positive("sample_rate", sample_rate as f64)?;
        self.range.check(f0)
    }

    pub fn analyze_frame(
        &mut self,
        audio: &[f64],
        center: usize,
        f0: f64,
        sample_rate: u32,
    ) -> Result<Vec<f64>> {
        let size = self.prepare(sample_rate)?;
        let mut envelope = scratch::try_zeroed(size / 2 + 1, "envelope")?;
        self.analyze_frame_into(audio, center, f0, sample_rate, &mut envelope)?;
        Ok(envelope)
    }

    pub fn analyze_frame_into(
        &mut self,
        audio: &[f64],
        center: usize,
        f0: f64,
        sample_rate: u32,
        envelope: &mut [f64],
    ) -> Result<()> {
        self.check_frame(audio, f0, sample_rate)?;
        let size = self.prepare(sample_rate)?;
        if envelope.len() != size / 2 + 1 {
            return Err(Error::invalid_arg(
                "envelope",
                format!("{} bins, expected {}", envelope.len(), size / 2 + 1),
            ));
        }
        if f0 <= 0.0 {
            envelope.fill(ENVELOPE_FLOOR);
            return Ok(());
        }

        let len = self.window_len(f0, sample_rate, size);
        self.load_segment(audio, center, len);
        let Some(fft) = self.fft.as_ref() else {
            return Err(Error::InvalidState("spectral transform not planned"));
        };
        fft.forward_real(&self.windowed, &mut self.buf);
        for x in self.buf.iter_mut() {
            *x = Complex::new(x.norm().max(MAGNITUDE_FLOOR).ln(), 0.0);
        }

        let cutoff = lifter_cutoff(f0, sample_rate, size);
        lift_spectrum(fft, &mut self.buf, |c| low_pass_lifter(c, cutoff));
        for (e, x) in envelope.iter_mut().zip(self.buf.iter()) {
            *e = x.re.exp();
        }
        self.shape(envelope, f0, sample_rate, size);
        Ok(())
    }

    /// Envelopes of two frames at the cost of one. The first segment rides
    /// on the real part of each transform and the second on the imaginary
    /// part; `out` holds both rows back to back.
    pub fn analyze_pair_into(
        &mut self,
        audio: &[f64],
        centers: [usize; 2],
        f0: [f64; 2],
        sample_rate: u32,
        out: &mut [f64],
    ) -> Result<()> {
        let size = self.prepare(sample_rate)?;
        let bins = size / 2 + 1;
        if out.len() != 2 * bins {
            return Err(Error::invalid_arg(
                "envelope",
                format!("{} values, expected {}", out.len(), 2 * bins),
            ));
        }
        let (first, second) = out.split_at_mut(bins);
        if f0[0] <= 0.0 || f0[1] <= 0.0 {
            self.analyze_frame_into(audio, centers[0], f0[0], sample_rate, first)?;
            return self.analyze_frame_into(audio, centers[1], f0[1], sample_rate, second);
        }
        for &f in &f0 {
            self.check_frame(audio, f, sample_rate)?;
        }

        self.load_segment(audio, centers[0], self.window_len(f0[0], sample_rate, size));
        let len = self.window_len(f0[1], sample_rate, size);
        load_windowed(&mut self.paired, &mut self.paired_window, audio, centers[1], len);
        let Some(fft) = self.fft.as_ref() else {
            return Err(Error::InvalidState("spectral transform not planned"));
        };
        self.buf.clear();
        self.buf
            .extend(self.windowed.iter().zip(&self.paired).map(|(&a, &b)| Complex::new(a, b)));
        fft.forward(&mut self.buf);

        // Split the packed spectrum by conjugate symmetry; the log
        // magnitudes park in the output rows.
        for k in 0..bins {
            let z = self.buf[k];
            let mirror = self.buf[(size - k) % size].conj();
            let a = (z + mirror) * 0.5;
            let b = (z - mirror) * Complex::new(0.0, -0.5);
            first[k] = a.norm().max(MAGNITUDE_FLOOR).ln();
            second[k] = b.norm().max(MAGNITUDE_FLOOR).ln();
        }
        for (k, x) in self.buf.iter_mut().enumerate() {
            let m = k.min(size - k);
            *x = Complex::new(first[m], second[m]);
        }

        let cutoffs = f0.map(|f| lifter_cutoff(f, sample_rate, size));
        lift_spectrum(fft, &mut self.buf, |cepstrum| {
            for (q, c) in cepstrum.iter_mut().enumerate() {
                let quefrency = q.min(size - q);
                let re = if quefrency < cutoffs[0] { c.re } else { 0.0 };
                let im = if quefrency < cutoffs[1] { c.im } else { 0.0 };
                *c = Complex::new(re, im);
            }
        });
        for ((a, b), x) in first.iter_mut().zip(second.iter_mut()).zip(self.buf.iter()) {
            *a = x.re.exp();
            *b = x.im.exp();
        }
        self.shape(first, f0[0], sample_rate, size);
        self.shape(second, f0[1], sample_rate, size);
        Ok(())
    }

    /// Normalizes, applies the Q1 tilt above `f0` and normalizes again.
    fn shape(&self, envelope: &mut [f64], f0: f64, sample_rate: u32, size: usize) {
        normalize(envelope);
        let resolution = sample_rate as f64 / size as f64;
        for (i, e) in envelope.iter_mut().enumerate() {
            let ratio = (i as f64 * resolution).max(f0) / f0;
            *e *= ratio.powf(self.config.q1);
        }
        normalize(envelope);
    }

    /// RMS amplitude of the segment seen by [`Self::analyze_frame`],
    /// compensated for the window's own energy.
    pub fn frame_level(&mut self, audio: &[f64], center: usize, f0: f64, sample_rate: u32) -> Result<f64> {
        let size = self.prepare(sample_rate)?;
        let len = self.window_len(f0, sample_rate, size);
        self.load_segment(audio, center, len);
        let window_rms = power(&self.window);
        if window_rms <= 0.0 {
            return Ok(0.0);
        }
        // `windowed` is zero-padded to `size`; rescale to the window length.
        let signal_rms = power(&self.windowed) * (size as f64 / len as f64).sqrt();
        Ok(signal_rms / window_rms)
    }
}

/// Quefrency cutoff of the envelope lifter: half a pitch period.
fn lifter_cutoff(f0: f64, sample_rate: u32, size: usize) -> usize {
    ((sample_rate as f64 / (2.0 * f0)).floor() as usize).clamp(1, size / 8)
}

/// Writes `len` Hann-windowed samples around `center` to the front of `dst`
/// and zero-fills the rest. `window` caches the taper between calls.
fn load_windowed(dst: &mut [f64], window: &mut Vec<f64>, audio: &[f64], center: usize, len: usize) {
    if window.len() != len {
        *window = symmetric_hann_window(len);
    }
    dst.fill(0.0);
    let start = center as isize - (len / 2) as isize;
    for (k, (d, &w)) in dst.iter_mut().zip(window.iter()).enumerate() {
        let index = start + k as isize;
        if index >= 0 && (index as usize) < audio.len() {
            *d = audio[index as usize] * w;
        }
    }
}

/// Scales so the maximum is 1, then applies the floor.
pub fn normalize(envelope: &mut [f64]) {
    let max = envelope.iter().fold(0.0f64, |m, &x| m.max(x));
    if max > 0.0 && max.is_finite() {
        for e in envelope.iter_mut() {
            *e /= max;
        }
    }
    for e in envelope.iter_mut() {
        *e = if e.is_finite() { e.max(ENVELOPE_FLOOR) } else { ENVELOPE_FLOOR };
    }
}

/// Root mean square of an envelope row, used to turn a frame level into a gain.
pub fn envelope_rms(envelope: &[f64]) -> f64 {
    power(envelope)
}
