use crate::float::Float;

/// Symmetric Hann window whose peak sits on the centre sample.
pub fn symmetric_hann_window<T: Float>(size: usize) -> Vec<T> {
    if size < 2 {
        return vec![T::one(); size];
    }
    let half = T::cast(0.5);
    let denom = T::cast(size - 1);
    (0..size)
        .map(|i| half * (T::one() - (T::cast(i) * T::TAU() / denom).cos()))
        .collect()
}

pub fn blackman_window<T: Float>(size: usize) -> Vec<T> {
    if size < 2 {
        return vec![T::one(); size];
    }
    let (a0, a1, a2) = (T::cast(0.42), T::cast(0.5), T::cast(0.08));
    let denom = T::cast(size - 1);
    (0..size)
        .map(|i| {
            let phase = T::cast(i) * T::TAU() / denom;
            a0 - a1 * phase.cos() + a2 * (phase + phase).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_windows_peak_at_centre() {
        let hann: Vec<f64> = symmetric_hann_window(101);
        assert!((hann[50] - 1.0).abs() < 1e-12);
        assert!(hann[0].abs() < 1e-12);
        assert!((hann[10] - hann[90]).abs() < 1e-12);

        let blackman: Vec<f64> = blackman_window(101);
        assert!((blackman[50] - 1.0).abs() < 1e-12);
        assert!(blackman[0].abs() < 1e-12);
    }
}
