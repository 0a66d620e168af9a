use std::sync::Arc;

use rustfft::{num_complex::Complex, num_traits::Zero};

use crate::{
    error::{Error, Result},
    float::Float,
};

pub const MIN_FFT_SIZE: usize = 64;
pub const MAX_FFT_SIZE: usize = 1 << 16;

/// Planned forward/inverse transform pair. Cloning shares the plans.
#[derive(Clone)]
pub struct Fft<T: Float> {
    size: usize,
    forward: Arc<dyn rustfft::Fft<T>>,
    inverse: Arc<dyn rustfft::Fft<T>>,
}

impl<T: Float> Fft<T> {
    pub fn new(size: usize) -> Result<Self> {
        check_size(size)?;
        let mut planner = rustfft::FftPlanner::new();
        Ok(Self {
            size,
            forward: planner.plan_fft_forward(size),
            inverse: planner.plan_fft_inverse(size),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn spectrum_len(&self) -> usize {
        self.size / 2 + 1
    }

    pub fn forward(&self, buffer: &mut [Complex<T>]) {
        self.forward.process(buffer);
    }

    pub fn inverse(&self, buffer: &mut [Complex<T>]) {
        self.inverse.process(buffer);
    }

    /// Transforms `input` (zero-padded to the transform size) into `spectrum`.
    pub fn forward_real(&self, input: &[T], spectrum: &mut Vec<Complex<T>>) {
        spectrum.clear();
        spectrum.extend(input.iter().take(self.size).map(|&x| Complex::from(x)));
        spectrum.resize(self.size, Complex::zero());
        self.forward(spectrum);
    }
}

pub fn check_size(size: usize) -> Result<()> {
    if !size.is_power_of_two() || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&size) {
        return Err(Error::Unsupported(format!(
            "fft size {size} (must be a power of two in {MIN_FFT_SIZE}..={MAX_FFT_SIZE})"
        )));
    }
    Ok(())
}

pub fn fix_scale<T: Float>(buf: &mut [Complex<T>]) {
    let scale = T::one() / T::cast(buf.len());
    for x in buf.iter_mut() {
        *x = *x * scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unsupported_sizes() {
        assert!(Fft::<f64>::new(1000).is_err());
        assert!(Fft::<f64>::new(32).is_err());
        assert!(Fft::<f64>::new(1 << 17).is_err());
        assert!(Fft::<f64>::new(1024).is_ok());
    }

    #[test]
    fn test_real_round_trip() {
        let fft = Fft::<f64>::new(64).unwrap();
        let input: Vec<f64> = (0..48).map(|i| (i as f64 * 0.3).sin() + 0.1).collect();
        let mut spectrum = Vec::new();
        fft.forward_real(&input, &mut spectrum);
        assert_eq!(spectrum.len(), 64);
        assert!((spectrum[5] - spectrum[59].conj()).norm() < 1e-10);
        fft.inverse(&mut spectrum);
        fix_scale(&mut spectrum);
        for (i, x) in spectrum.iter().enumerate() {
            let expected = input.get(i).copied().unwrap_or(0.0);
            assert!((x.re - expected).abs() < 1e-10 && x.im.abs() < 1e-10);
        }
    }
}
