/// Vertex of the parabola through `(-1, a)`, `(0, b)`, `(1, c)`.
/// Returns the offset from the middle sample and the interpolated value.
pub fn parabolic_peak(a: f64, b: f64, c: f64) -> (f64, f64) {
    let t = 2.0 * (a - 2.0 * b + c);
    if t >= 0.0 {
        return (0.0, b);
    }
    let d = ((a - c) / t).clamp(-0.5, 0.5);
    (d, b - t * d * d / 4.0)
}

pub fn is_local_max(a: f64, b: f64, c: f64) -> bool {
    b >= a && b >= c && (b > a || b > c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parabola_vertex() {
        // y = 1 - (x - 0.25)^2 sampled at -1, 0, 1
        let f = |x: f64| 1.0 - (x - 0.25).powi(2);
        let (d, v) = parabolic_peak(f(-1.0), f(0.0), f(1.0));
        assert!((d - 0.25).abs() < 1e-12);
        assert!((v - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_flat_or_convex_is_not_refined() {
        assert_eq!(parabolic_peak(1.0, 1.0, 1.0), (0.0, 1.0));
        assert_eq!(parabolic_peak(2.0, 1.0, 2.0), (0.0, 1.0));
        assert!(!is_local_max(1.0, 1.0, 1.0));
        assert!(is_local_max(0.5, 1.0, 1.0));
    }
}
