//! Inner-loop kernels. The lane variants accumulate into four independent
//! partial sums so the compiler can vectorize them.

const LANES: usize = 4;

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    let len = a.len().min(b.len());
    let (a, b) = (&a[..len], &b[..len]);
    let mut acc = [0.0; LANES];
    let chunks_a = a.chunks_exact(LANES);
    let chunks_b = b.chunks_exact(LANES);
    let tail: f64 = chunks_a
        .remainder()
        .iter()
        .zip(chunks_b.remainder())
        .map(|(x, y)| x * y)
        .sum();
    for (ca, cb) in chunks_a.zip(chunks_b) {
        for lane in 0..LANES {
            acc[lane] += ca[lane] * cb[lane];
        }
    }
    (acc[0] + acc[1]) + (acc[2] + acc[3]) + tail
}

/// Correlation of `x[..len]` with `x[lag..lag + len]`, normalized by the
/// energies of both segments. Zero when either segment is silent.
pub fn normalized_correlation(x: &[f64], lag: usize, len: usize) -> f64 {
    if lag + len > x.len() || len == 0 {
        return 0.0;
    }
    let head = &x[..len];
    let tail = &x[lag..lag + len];
    let energy = dot(head, head) * dot(tail, tail);
    if energy <= f64::MIN_POSITIVE {
        return 0.0;
    }
    dot(head, tail) / energy.sqrt()
}
