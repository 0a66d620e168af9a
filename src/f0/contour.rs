//! Whole-contour passes run after all per-frame estimates are in.

use crate::config::F0Range;

/// Halves or doubles a frame that jumps by more than an octave-ish ratio
/// from the (already corrected) previous voiced frame.
pub fn enforce_continuity(f0: &mut [f64]) {
    for i in 1..f0.len() {
        let (prev, cur) = (f0[i - 1], f0[i]);
        if prev <= 0.0 || cur <= 0.0 {
            continue;
        }
        let ratio = cur / prev;
        if ratio > 1.8 {
            f0[i] = cur / 2.0;
        } else if ratio < 0.6 {
            f0[i] = cur * 2.0;
        }
    }
}

pub fn median3(f0: &mut [f64]) {
    if f0.len() < 3 {
        return;
    }
    let mut prev = f0[0];
    for i in 1..f0.len() - 1 {
        let (a, b, c) = (prev, f0[i], f0[i + 1]);
        prev = b;
        f0[i] = a.max(b).min(a.min(b).max(c));
    }
}

/// Corrects a frame that sits an octave above or below both voiced neighbours.
pub fn correct_octave_errors(f0: &mut [f64]) {
    for i in 1..f0.len().saturating_sub(1) {
        let (prev, cur, next) = (f0[i - 1], f0[i], f0[i + 1]);
        if prev <= 0.0 || cur <= 0.0 || next <= 0.0 {
            continue;
        }
        let (up, down) = (cur / prev, cur / next);
        if up > 1.8 && down > 1.8 {
            f0[i] = cur / 2.0;
        } else if up < 0.6 && down < 0.6 {
            f0[i] = cur * 2.0;
        }
    }
}

/// Fills single unvoiced frames between two voiced neighbours whose ratio
/// lies within `bounds` with their geometric mean.
pub fn fill_single_gaps(f0: &mut [f64], bounds: (f64, f64)) {
    for i in 1..f0.len().saturating_sub(1) {
        let (prev, next) = (f0[i - 1], f0[i + 1]);
        if f0[i] > 0.0 || prev <= 0.0 || next <= 0.0 {
            continue;
        }
        let ratio = next / prev;
        if ratio > bounds.0 && ratio < bounds.1 {
            f0[i] = (prev * next).sqrt();
        }
    }
}

pub fn clamp_voiced(f0: &mut [f64], range: F0Range) {
    for f in f0.iter_mut().filter(|f| **f > 0.0) {
        *f = f.clamp(range.floor, range.ceil);
    }
}

/// Three-point moving average over frames whose neighbours are also voiced.
pub fn smooth_voiced_runs(f0: &mut [f64]) {
    if f0.len() < 3 {
        return;
    }
    let mut prev = f0[0];
    for i in 1..f0.len() - 1 {
        let (a, b, c) = (prev, f0[i], f0[i + 1]);
        prev = b;
        if a > 0.0 && b > 0.0 && c > 0.0 {
            f0[i] = (a + b + c) / 3.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_continuity_folds_octave_jumps() {
        let mut f0 = vec![200.0, 410.0, 200.0, 95.0, 0.0, 400.0];
        enforce_continuity(&mut f0);
        assert_eq!(f0, vec![200.0, 205.0, 200.0, 190.0, 0.0, 400.0]);
    }

    #[test]
    fn test_median_removes_spikes_and_isolated_frames() {
        let mut f0 = vec![100.0, 100.0, 300.0, 100.0, 0.0, 120.0, 0.0, 0.0];
        median3(&mut f0);
        assert_eq!(f0, vec![100.0, 100.0, 100.0, 100.0, 100.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_octave_correction_needs_both_neighbours() {
        let mut f0 = vec![200.0, 400.0, 200.0, 400.0, 0.0];
        correct_octave_errors(&mut f0);
        assert_eq!(f0, vec![200.0, 200.0, 200.0, 400.0, 0.0]);
    }

    #[test]
    fn test_gap_fill_uses_geometric_mean() {
        let mut f0 = vec![200.0, 0.0, 220.0, 0.0, 400.0];
        fill_single_gaps(&mut f0, (0.8, 1.25));
        assert!((f0[1] - (200.0f64 * 220.0).sqrt()).abs() < 1e-9);
        assert_eq!(f0[3], 0.0);
    }

    #[test]
    fn test_clamp_and_smooth() {
        let mut f0 = vec![0.0, 900.0, 60.0, 100.0, 110.0, 120.0, 0.0];
        clamp_voiced(&mut f0, F0Range { floor: 71.0, ceil: 800.0 });
        assert_eq!(f0[..3], [0.0, 800.0, 71.0]);
        smooth_voiced_runs(&mut f0);
        assert!((f0[4] - 110.0).abs() < 1e-12);
        assert_eq!(f0[5], 120.0);
        assert_eq!(f0[6], 0.0);
    }
}
