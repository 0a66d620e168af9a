use std::time::Duration;

use crate::{
    error::{ensure_positive, Error, Result},
    fft,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum F0Algorithm {
    /// Autocorrelation over log-spaced candidates on a decimated signal.
    #[default]
    Fast,
    /// Spectral-peak candidates refined in the time domain.
    Precise,
}

/// Speed/quality variant of an analysis stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    Fast,
    #[default]
    Precise,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorConfig {
    /// Frame spacing in milliseconds.
    pub frame_period: f64,
    pub f0_floor: f64,
    pub f0_ceil: f64,
    /// Candidate density of the fast path, per octave.
    pub channels_in_octave: f64,
    pub algorithm: F0Algorithm,
    /// Coarse lag stride of the fast path (1 = exhaustive).
    pub speed: usize,
    /// Relative pitch tolerance for treating neighbours as "similar".
    pub allowed_range: f64,
    /// Base voicing threshold on the normalized autocorrelation score.
    pub voicing_threshold: f64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            frame_period: 5.0,
            f0_floor: 71.0,
            f0_ceil: 800.0,
            channels_in_octave: 2.0,
            algorithm: F0Algorithm::Fast,
            speed: 1,
            allowed_range: 0.1,
            voicing_threshold: 0.25,
        }
    }
}

impl ExtractorConfig {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("frame_period", self.frame_period)?;
        ensure_positive("f0_floor", self.f0_floor)?;
        ensure_positive("f0_ceil", self.f0_ceil)?;
        ensure_positive("channels_in_octave", self.channels_in_octave)?;
        if self.f0_floor >= self.f0_ceil {
            return Err(Error::invalid_arg(
                "f0_ceil",
                format!("{} is not above f0_floor {}", self.f0_ceil, self.f0_floor),
            ));
        }
        if !(1..=4).contains(&self.speed) {
            return Err(Error::invalid_arg("speed", format!("{} not in 1..=4", self.speed)));
        }
        if !(self.allowed_range > 0.0 && self.allowed_range < 0.4) {
            return Err(Error::invalid_arg(
                "allowed_range",
                format!("{} not in (0, 0.4)", self.allowed_range),
            ));
        }
        if !(0.0..1.0).contains(&self.voicing_threshold) {
            return Err(Error::invalid_arg(
                "voicing_threshold",
                format!("{} not in [0, 1)", self.voicing_threshold),
            ));
        }
        Ok(())
    }

    pub fn f0_range(&self) -> F0Range {
        F0Range {
            floor: self.f0_floor,
            ceil: self.f0_ceil,
        }
    }

    /// Inclusive bounds of the ratio between two neighbouring F0 values
    /// that still counts as the same pitch.
    pub fn similarity_bounds(&self) -> (f64, f64) {
        let upper = 1.0 + 2.5 * self.allowed_range;
        (1.0 / upper, upper)
    }
}

/// Admissible F0 band shared by all analyzers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct F0Range {
    pub floor: f64,
    pub ceil: f64,
}

impl F0Range {
    /// Rejects voiced values outside the band. Zero and negative values mean
    /// unvoiced and are always accepted.
    pub fn check(&self, f0: f64) -> Result<()> {
        if f0.is_nan() {
            return Err(Error::invalid_arg("f0", "NaN"));
        }
        if f0 > 0.0 && (f0 < self.floor || f0 > self.ceil) {
            return Err(Error::invalid_arg(
                "f0",
                format!("{f0} Hz outside [{}, {}]", self.floor, self.ceil),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumConfig {
    /// Spectral tilt correction exponent.
    pub q1: f64,
    /// 0 derives the size from the sample rate and F0 floor.
    pub fft_size: usize,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            q1: -0.15,
            fft_size: 0,
        }
    }
}

impl SpectrumConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.q1.is_finite() {
            return Err(Error::invalid_arg("q1", "must be finite"));
        }
        if self.fft_size != 0 {
            fft::check_size(self.fft_size)?;
        }
        Ok(())
    }

    pub fn resolve_fft_size(&self, sample_rate: u32, f0_floor: f64) -> Result<usize> {
        if self.fft_size != 0 {
            return Ok(self.fft_size);
        }
        ensure_positive("sample_rate", sample_rate as f64)?;
        ensure_positive("f0_floor", f0_floor)?;
        let minimum = (3.0 * sample_rate as f64 / f0_floor + 1.0).ceil() as usize;
        let size = minimum.next_power_of_two().max(fft::MIN_FFT_SIZE);
        fft::check_size(size)?;
        Ok(size)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AperiodicityConfig {
    /// Group-delay-difference sigmoid midpoint.
    pub threshold: f64,
    /// Width in bins of the linear cross-fade between adjacent bands.
    pub crossfade_bins: usize,
}

impl Default for AperiodicityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            crossfade_bins: 4,
        }
    }
}

impl AperiodicityConfig {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("threshold", self.threshold)?;
        if self.crossfade_bins > 64 {
            return Err(Error::invalid_arg(
                "crossfade_bins",
                format!("{} exceeds 64", self.crossfade_bins),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisConfig {
    /// Seed of the noise excitation generator.
    pub seed: u64,
    /// Response truncation level for streaming, 0 (exact) to 3.
    pub optimization_level: u8,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            seed: 0x5eed,
            optimization_level: 0,
        }
    }
}

impl SynthesisConfig {
    pub const MAX_OPTIMIZATION_LEVEL: u8 = 3;

    pub fn validate(&self) -> Result<()> {
        if self.optimization_level > Self::MAX_OPTIMIZATION_LEVEL {
            return Err(Error::invalid_arg(
                "optimization_level",
                format!("{} not in 0..=3", self.optimization_level),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Worker count; `None` uses the available cores, capped.
    pub workers: Option<usize>,
    /// Wall-clock budget of one analysis call; `None` disables degradation.
    pub budget: Option<Duration>,
    /// Frame count below which a stage runs on the calling thread.
    pub parallel_threshold: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            budget: Some(Duration::from_millis(100)),
            parallel_threshold: 16,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == Some(0) {
            return Err(Error::invalid_arg("workers", "must be at least 1"));
        }
        if self.budget == Some(Duration::ZERO) {
            return Err(Error::invalid_arg("budget", "must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineConfig {
    pub extractor: ExtractorConfig,
    pub spectrum: SpectrumConfig,
    pub aperiodicity: AperiodicityConfig,
    pub synthesis: SynthesisConfig,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.extractor.validate()?;
        self.spectrum.validate()?;
        self.aperiodicity.validate()?;
        self.synthesis.validate()?;
        self.scheduler.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.extractor.frame_period, 5.0);
        assert_eq!(config.extractor.f0_floor, 71.0);
        assert_eq!(config.extractor.f0_ceil, 800.0);
        assert_eq!(config.spectrum.q1, -0.15);
        assert_eq!(config.aperiodicity.threshold, 0.85);
    }

    #[test]
    fn test_fft_size_derivation() {
        let spectrum = SpectrumConfig::default();
        // 3 * 44100 / 71 + 1 = 1864.4 -> 2048
        assert_eq!(spectrum.resolve_fft_size(44100, 71.0).unwrap(), 2048);
        assert_eq!(spectrum.resolve_fft_size(16000, 71.0).unwrap(), 1024);
        let fixed = SpectrumConfig {
            fft_size: 4096,
            ..SpectrumConfig::default()
        };
        assert_eq!(fixed.resolve_fft_size(8000, 71.0).unwrap(), 4096);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut extractor = ExtractorConfig::default();
        extractor.f0_ceil = 50.0;
        assert_eq!(extractor.validate().unwrap_err().kind(), ErrorKind::InvalidArgument);

        let spectrum = SpectrumConfig {
            fft_size: 1000,
            ..SpectrumConfig::default()
        };
        assert_eq!(spectrum.validate().unwrap_err().kind(), ErrorKind::Unsupported);

        let synthesis = SynthesisConfig {
            optimization_level: 4,
            ..SynthesisConfig::default()
        };
        assert!(synthesis.validate().is_err());
    }

    #[test]
    fn test_f0_range_check() {
        let range = ExtractorConfig::default().f0_range();
        assert!(range.check(0.0).is_ok());
        assert!(range.check(220.0).is_ok());
        assert!(range.check(40.0).is_err());
        assert!(range.check(f64::NAN).is_err());
    }

    #[test]
    fn test_similarity_bounds_at_default() {
        let (low, high) = ExtractorConfig::default().similarity_bounds();
        assert!((low - 0.8).abs() < 1e-12);
        assert!((high - 1.25).abs() < 1e-12);
    }
}
