//! F0-adaptive speech analysis and resynthesis.
//!
//! [`Engine::analyze`] decomposes a waveform into a pitch contour, a
//! smoothed spectral envelope and a band aperiodicity map;
//! [`Engine::synthesize`] and the streaming calls rebuild audio from them.

pub mod aperiodicity;
pub mod cepstrum;
pub mod config;
pub mod engine;
pub mod error;
pub mod f0;
pub mod fft;
pub mod float;
pub mod kernels;
pub mod params;
pub mod scheduler;
pub mod scratch;
pub mod spectral;
pub mod synthesis;
pub mod transforms;
pub mod windows;

pub use config::{
    AperiodicityConfig, EngineConfig, ExtractorConfig, F0Algorithm, Quality, SchedulerConfig,
    SpectrumConfig, SynthesisConfig,
};
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result, Stage};
pub use params::{frame_count_for, AnalysisResult, Matrix};
pub use scheduler::{AnalysisReport, StageReport};

/// Root mean square of `buf`, 0 for an empty slice.
pub fn power<T: float::Float>(buf: &[T]) -> T {
    if buf.is_empty() {
        return T::zero();
    }
    (buf.iter().map(|&x| x.powi(2)).sum::<T>() / T::cast(buf.len())).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power() {
        assert_eq!(power::<f64>(&[]), 0.0);
        assert!((power(&[3.0f64, -3.0, 3.0, -3.0]) - 3.0).abs() < 1e-12);
        assert!((power(&[1.0f32, 0.0]) - 0.5f32.sqrt()).abs() < 1e-6);
    }
}
