use rustfft::{num_complex::Complex, num_traits::Zero};

use crate::{
    fft::{fix_scale, Fft},
    float::Float,
};

/// Runs `process` on the cepstrum of a log spectrum held in `buf`, then
/// transforms back. `buf` holds the (complex) log spectrum afterwards.
pub fn lift_spectrum<T: Float>(fft: &Fft<T>, buf: &mut [Complex<T>], process: impl FnOnce(&mut [Complex<T>])) {
    fft.inverse(buf);
    process(buf);
    fft.forward(buf);
    fix_scale(buf);
}

/// Fills `buf` with the full-length log spectrum of a half-spectrum magnitude.
pub fn log_spectrum<T: Float>(magnitude: &[T], floor: T, len: usize, buf: &mut Vec<Complex<T>>) {
    buf.clear();
    buf.resize(len, Complex::zero());
    for (i, &m) in magnitude.iter().enumerate().take(len / 2 + 1) {
        let value = Complex::new(m.max(floor).ln(), T::zero());
        buf[i] = value;
        if i > 0 && i < len - i {
            buf[len - i] = value;
        }
    }
}

/// Zeroes quefrencies at and above `cutoff` (and their mirror).
pub fn low_pass_lifter<T: Float>(cepstrum: &mut [Complex<T>], cutoff: usize) {
    let len = cepstrum.len();
    let cutoff = cutoff.clamp(1, len / 2);
    cepstrum[cutoff..len - cutoff + 1].fill(Complex::zero());
}

/// Folds the anti-causal half of the cepstrum onto the causal half.
pub fn fold_to_minimum_phase<T: Float>(cepstrum: &mut [Complex<T>]) {
    let len = cepstrum.len();
    let two = T::cast(2.0);
    for x in cepstrum[1..len / 2].iter_mut() {
        *x = *x * two;
    }
    cepstrum[len / 2 + 1..].fill(Complex::zero());
}

/// Minimum-phase spectrum (full length) whose magnitude matches `magnitude`.
pub fn minimum_phase<T: Float>(fft: &Fft<T>, magnitude: &[T], floor: T, buf: &mut Vec<Complex<T>>) {
    log_spectrum(magnitude, floor, fft.size(), buf);
    lift_spectrum(fft, buf, fold_to_minimum_phase);
    for x in buf.iter_mut() {
        *x = x.exp();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_phase_preserves_magnitude() {
        let fft = Fft::<f64>::new(256).unwrap();
        let magnitude: Vec<f64> = (0..129)
            .map(|i| 1.0 / (1.0 + (i as f64 / 20.0).powi(2)) + 0.01)
            .collect();
        let mut spectrum = Vec::new();
        minimum_phase(&fft, &magnitude, 1e-12, &mut spectrum);
        for i in 0..129 {
            assert!((spectrum[i].norm() - magnitude[i]).abs() < 1e-6 * magnitude[i].max(1.0));
        }
    }

    #[test]
    fn test_minimum_phase_response_is_front_loaded() {
        let fft = Fft::<f64>::new(256).unwrap();
        let magnitude: Vec<f64> = (0..129)
            .map(|i| 1.0 + 0.8 * (i as f64 * std::f64::consts::PI / 16.0).cos())
            .collect();
        let mut spectrum = Vec::new();
        minimum_phase(&fft, &magnitude, 1e-12, &mut spectrum);
        fft.inverse(&mut spectrum);
        fix_scale(&mut spectrum);
        let energy: Vec<f64> = spectrum.iter().map(|x| x.re * x.re).collect();
        let total: f64 = energy.iter().sum();
        let head: f64 = energy[..32].iter().sum();
        assert!(head > 0.95 * total);
        assert!(spectrum.iter().all(|x| x.im.abs() < 1e-9));
    }

    #[test]
    fn test_lifter_smooths_harmonic_ripple() {
        let fft = Fft::<f64>::new(512).unwrap();
        let magnitude: Vec<f64> = (0..257)
            .map(|i| (-(i as f64) / 80.0).exp() * (1.5 + (i as f64 * 0.9).cos()))
            .collect();
        let mut buf = Vec::new();
        log_spectrum(&magnitude, 1e-12, 512, &mut buf);
        lift_spectrum(&fft, &mut buf, |c| low_pass_lifter(c, 6));
        let smoothed: Vec<f64> = buf[..257].iter().map(|x| x.re).collect();
        let ripple = smoothed
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0, f64::max);
        assert!(ripple < 0.1);
        assert!(buf.iter().all(|x| x.im.abs() < 1e-9));
    }
}
