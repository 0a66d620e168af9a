//! Fundamental frequency extraction.
//!
//! Extraction runs in three phases so the per-frame part can be spread over
//! worker tasks: [`F0Extractor::prepare`] conditions the signal once,
//! [`F0Extractor::estimate_frame`] produces a raw estimate for one frame, and
//! [`F0Extractor::postprocess`] repairs the whole contour.

mod contour;
mod fast;
mod peak;
mod precise;

pub use contour::{
    clamp_voiced, correct_octave_errors, enforce_continuity, fill_single_gaps, median3,
    smooth_voiced_runs,
};
pub use peak::parabolic_peak;

use crate::{
    config::{ExtractorConfig, F0Algorithm},
    error::{ensure_positive, Error, Result, Stage},
    params::frame_count_for,
};

/// Input conditioned for one algorithm, shared read-only by frame tasks.
#[derive(Debug, Clone)]
pub struct PreparedSignal {
    pub samples: Vec<f64>,
    /// Rate of `samples`, after any decimation.
    pub rate: f64,
    pub sample_rate: u32,
    pub audio_length: usize,
    pub frame_count: usize,
    pub algorithm: F0Algorithm,
}

#[derive(Debug, Clone, PartialEq)]
pub struct F0Contour {
    pub f0: Vec<f64>,
    pub time_axis: Vec<f64>,
}

#[derive(Clone)]
pub struct F0Extractor {
    config: ExtractorConfig,
    candidates: Vec<f64>,
    fast: fast::FastScratch,
    precise: precise::PreciseScratch,
}

impl F0Extractor {
    pub fn new(config: ExtractorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            candidates: fast::candidates(&config),
            config,
            fast: Default::default(),
            precise: Default::default(),
        })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub fn frame_count(&self, audio_length: usize, sample_rate: u32) -> usize {
        frame_count_for(audio_length, sample_rate, self.config.frame_period)
    }

    pub fn prepare(&self, audio: &[f64], sample_rate: u32) -> Result<PreparedSignal> {
        if audio.is_empty() {
            return Err(Error::invalid_arg("audio", "empty buffer"));
        }
        ensure_positive("sample_rate", sample_rate as f64)?;
        if self.config.f0_ceil * 2.0 > sample_rate as f64 {
            return Err(Error::invalid_arg(
                "sample_rate",
                format!("{sample_rate} Hz cannot represent f0_ceil {}", self.config.f0_ceil),
            ));
        }

        let (samples, rate) = match self.config.algorithm {
            F0Algorithm::Fast => fast::prepare(audio, sample_rate, self.config.f0_ceil)?,
            F0Algorithm::Precise => {
                let mut samples = Vec::new();
                crate::scratch::ensure_len(&mut samples, audio.len(), 0.0, "f0 signal")?;
                samples.copy_from_slice(audio);
                (samples, sample_rate as f64)
            }
        };
        Ok(PreparedSignal {
            samples,
            rate,
            sample_rate,
            audio_length: audio.len(),
            frame_count: self.frame_count(audio.len(), sample_rate),
            algorithm: self.config.algorithm,
        })
    }

    /// Raw estimate for one frame, 0 when unvoiced or when the analysis
    /// window does not fit inside the signal.
    pub fn estimate_frame(&mut self, signal: &PreparedSignal, frame: usize) -> Result<f64> {
        match signal.algorithm {
            F0Algorithm::Fast => {
                fast::estimate_frame(&self.config, &self.candidates, signal, frame, &mut self.fast)
            }
            F0Algorithm::Precise => {
                precise::estimate_frame(&self.config, signal, frame, &mut self.precise)
            }
        }
    }

    pub fn postprocess(&self, algorithm: F0Algorithm, f0: &mut [f64]) {
        match algorithm {
            F0Algorithm::Fast => {
                enforce_continuity(f0);
                median3(f0);
                clamp_voiced(f0, self.config.f0_range());
            }
            F0Algorithm::Precise => {
                correct_octave_errors(f0);
                fill_single_gaps(f0, self.config.similarity_bounds());
                clamp_voiced(f0, self.config.f0_range());
                smooth_voiced_runs(f0);
            }
        }
    }

    pub fn time_axis(&self, frame_count: usize) -> Vec<f64> {
        (0..frame_count)
            .map(|i| i as f64 * self.config.frame_period / 1000.0)
            .collect()
    }

    /// Sequential extraction over the whole signal.
    pub fn extract(&mut self, audio: &[f64], sample_rate: u32) -> Result<F0Contour> {
        let signal = self.prepare(audio, sample_rate)?;
        let mut f0 = crate::scratch::try_zeroed(signal.frame_count, "f0")?;
        for (frame, value) in f0.iter_mut().enumerate() {
            *value = self
                .estimate_frame(&signal, frame)
                .map_err(|e| e.at(Stage::F0, frame))?;
        }
        self.postprocess(signal.algorithm, &mut f0);
        Ok(F0Contour {
            time_axis: self.time_axis(f0.len()),
            f0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn harmonic_signal(f0: f64, sample_rate: u32, seconds: f64) -> Vec<f64> {
        let len = (sample_rate as f64 * seconds) as usize;
        (0..len)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                (1..=5)
                    .map(|h| (std::f64::consts::TAU * f0 * h as f64 * t).sin() / h as f64)
                    .sum::<f64>()
                    * 0.4
            })
            .collect()
    }

    fn extractor(algorithm: F0Algorithm) -> F0Extractor {
        F0Extractor::new(ExtractorConfig {
            algorithm,
            ..ExtractorConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_input() {
        let mut extractor = extractor(F0Algorithm::Fast);
        let err = extractor.extract(&[], 44100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = extractor.extract(&[0.0; 100], 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_frame_count_and_time_axis() {
        let mut extractor = extractor(F0Algorithm::Fast);
        let contour = extractor.extract(&vec![0.0; 4410], 44100).unwrap();
        assert_eq!(contour.f0.len(), 21);
        assert_eq!(contour.time_axis.len(), 21);
        assert!((contour.time_axis[1] - 0.005).abs() < 1e-12);
        assert!(contour.f0.iter().all(|&f| f == 0.0));
    }

    #[test]
    fn test_fast_tracks_harmonic_voice() {
        let audio = harmonic_signal(180.0, 16000, 0.4);
        let contour = extractor(F0Algorithm::Fast).extract(&audio, 16000).unwrap();
        let voiced: Vec<f64> = contour.f0.iter().copied().filter(|&f| f > 0.0).collect();
        assert!(voiced.len() > contour.f0.len() / 2);
        for f in voiced {
            assert!((f - 180.0).abs() < 5.0, "fast estimate {f}");
        }
    }

    #[test]
    fn test_precise_tracks_harmonic_voice() {
        let audio = harmonic_signal(180.0, 16000, 0.4);
        let contour = extractor(F0Algorithm::Precise).extract(&audio, 16000).unwrap();
        let voiced: Vec<f64> = contour.f0.iter().copied().filter(|&f| f > 0.0).collect();
        assert!(voiced.len() > contour.f0.len() / 3);
        for f in voiced {
            assert!((f - 180.0).abs() < 5.0, "precise estimate {f}");
        }
    }

    #[test]
    fn test_edge_frames_are_unvoiced() {
        let audio = harmonic_signal(200.0, 16000, 0.3);
        for algorithm in [F0Algorithm::Fast, F0Algorithm::Precise] {
            let contour = extractor(algorithm).extract(&audio, 16000).unwrap();
            assert_eq!(contour.f0[0], 0.0);
            assert_eq!(*contour.f0.last().unwrap(), 0.0);
        }
    }
}
