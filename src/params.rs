use crate::{
    error::{ensure_positive, Error, Result},
    scratch::try_zeroed,
};

/// Floor applied to every envelope value.
pub const ENVELOPE_FLOOR: f64 = 1e-10;
pub const MIN_APERIODICITY: f64 = 0.001;
pub const MAX_APERIODICITY: f64 = 0.999;
/// Aperiodicity of a wholly unvoiced frame.
pub const UNVOICED_APERIODICITY: f64 = 1.0;

/// Row-major frame × bin matrix in one contiguous buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, fill: f64, what: &'static str) -> Result<Self> {
        let len = rows
            .checked_mul(cols)
            .ok_or_else(|| Error::out_of_memory(what, usize::MAX))?;
        let mut data = try_zeroed(len, what)?;
        if fill != 0.0 {
            data.fill(fill);
        }
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, frame: usize, bin: usize) -> Option<f64> {
        if frame < self.rows && bin < self.cols {
            Some(self.data[frame * self.cols + bin])
        } else {
            None
        }
    }

    pub fn row(&self, frame: usize) -> &[f64] {
        &self.data[frame * self.cols..(frame + 1) * self.cols]
    }

    pub fn row_mut(&mut self, frame: usize) -> &mut [f64] {
        &mut self.data[frame * self.cols..(frame + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        // `max(1)` keeps `chunks_exact` valid for zero-width matrices.
        self.data.chunks_exact(self.cols.max(1))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Rows `frame - 1` and `frame + 1` for reading around a mutable row
    /// `frame`. Panics unless `0 < frame < rows - 1`.
    pub fn neighbours_mut(&mut self, frame: usize) -> (&[f64], &mut [f64], &[f64]) {
        let cols = self.cols;
        let (head, tail) = self.data.split_at_mut(frame * cols);
        let (cur, rest) = tail.split_at_mut(cols);
        (&head[(frame - 1) * cols..], cur, &rest[..cols])
    }
}

/// Number of frames covering `audio_length` samples at `frame_period` ms.
pub fn frame_count_for(audio_length: usize, sample_rate: u32, frame_period: f64) -> usize {
    if audio_length == 0 || sample_rate == 0 {
        return 0;
    }
    let frames = (audio_length as f64 * 1000.0) / (sample_rate as f64 * frame_period);
    frames.ceil() as usize + 1
}

/// Sample index a frame is centred on.
pub fn frame_center(frame: usize, frame_period: f64, sample_rate: u32) -> usize {
    (frame as f64 * frame_period / 1000.0 * sample_rate as f64).round() as usize
}

/// Analysis parameters of one utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub sample_rate: u32,
    pub audio_length: usize,
    /// Milliseconds between frames.
    pub frame_period: f64,
    pub fft_size: usize,
    /// Hz per frame, 0 when unvoiced.
    pub f0: Vec<f64>,
    /// Seconds per frame.
    pub time_axis: Vec<f64>,
    /// Normalized magnitude envelope, `frame_count × (fft_size/2 + 1)`.
    pub spectral_envelope: Matrix,
    pub aperiodicity: Matrix,
    /// Absolute amplitude scale of each frame's normalized envelope.
    pub gain: Vec<f64>,
}

impl AnalysisResult {
    /// Allocates a result with unvoiced fallbacks in every frame.
    pub fn new(
        sample_rate: u32,
        audio_length: usize,
        frame_period: f64,
        fft_size: usize,
        frame_count: usize,
    ) -> Result<Self> {
        ensure_positive("frame_period", frame_period)?;
        let bins = fft_size / 2 + 1;
        let time_axis = (0..frame_count)
            .map(|i| i as f64 * frame_period / 1000.0)
            .collect();
        Ok(Self {
            sample_rate,
            audio_length,
            frame_period,
            fft_size,
            f0: try_zeroed(frame_count, "f0")?,
            time_axis,
            spectral_envelope: Matrix::new(frame_count, bins, ENVELOPE_FLOOR, "spectral envelope")?,
            aperiodicity: Matrix::new(frame_count, bins, UNVOICED_APERIODICITY, "aperiodicity")?,
            gain: try_zeroed(frame_count, "gain")?,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.f0.len()
    }

    pub fn bins(&self) -> usize {
        self.fft_size / 2 + 1
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0 || self.audio_length == 0
    }

    pub fn is_voiced(&self, frame: usize) -> bool {
        self.f0.get(frame).is_some_and(|&f| f > 0.0)
    }

    /// Checks the dimensional invariant.
    pub fn validate(&self) -> Result<()> {
        let n = self.frame_count();
        let bins = self.bins();
        if self.time_axis.len() != n || self.gain.len() != n {
            return Err(Error::invalid_arg(
                "analysis",
                format!(
                    "frame arrays disagree: f0 {n}, time axis {}, gain {}",
                    self.time_axis.len(),
                    self.gain.len()
                ),
            ));
        }
        for (name, matrix) in [
            ("spectral_envelope", &self.spectral_envelope),
            ("aperiodicity", &self.aperiodicity),
        ] {
            if matrix.rows() != n || matrix.cols() != bins {
                return Err(Error::invalid_arg(
                    name,
                    format!(
                        "{}x{} does not match {n} frames of {bins} bins",
                        matrix.rows(),
                        matrix.cols()
                    ),
                ));
            }
        }
        if n > 0 {
            ensure_positive("sample_rate", self.sample_rate as f64)?;
            ensure_positive("frame_period", self.frame_period)?;
        }
        Ok(())
    }
}
