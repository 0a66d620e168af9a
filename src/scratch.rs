use tracing::debug;

use crate::error::{Error, Result};

/// Tracks what an instance's scratch buffers were last sized for, so they
/// can be lazily re-initialised when the sample rate changes or a request
/// outgrows the cached capacity.
#[derive(Debug, Clone, Default)]
pub struct Scratch {
    sample_rate: u32,
    capacity: usize,
}

impl Scratch {
    /// Returns `true` when the caller must rebuild its buffers.
    pub fn needs_rebuild(&self, sample_rate: u32, len: usize) -> bool {
        self.sample_rate != sample_rate || self.capacity < len
    }

    pub fn mark_built(&mut self, owner: &'static str, sample_rate: u32, len: usize) {
        if self.sample_rate != 0 {
            debug!(
                owner,
                old_rate = self.sample_rate,
                sample_rate,
                old_capacity = self.capacity,
                capacity = len,
                "re-initialising scratch buffers"
            );
        }
        self.sample_rate = sample_rate;
        self.capacity = len;
    }
}

/// Resizes `buf` to `len` elements filled with `value`, reporting allocation
/// failure instead of aborting.
pub fn ensure_len<T: Clone>(buf: &mut Vec<T>, len: usize, value: T, what: &'static str) -> Result<()> {
    buf.clear();
    if buf.capacity() < len {
        buf.try_reserve_exact(len)
            .map_err(|_| Error::out_of_memory(what, len))?;
    }
    buf.resize(len, value);
    Ok(())
}

/// Allocates a zero-filled vector fallibly.
pub fn try_zeroed(len: usize, what: &'static str) -> Result<Vec<f64>> {
    let mut buf = Vec::new();
    ensure_len(&mut buf, len, 0.0, what)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_rebuild_on_rate_change_or_growth() {
        let mut scratch = Scratch::default();
        assert!(scratch.needs_rebuild(44100, 16));
        scratch.mark_built("test", 44100, 1024);
        assert!(!scratch.needs_rebuild(44100, 512));
        assert!(scratch.needs_rebuild(44100, 2048));
        assert!(scratch.needs_rebuild(48000, 512));
    }

    #[test]
    fn test_huge_allocation_reports_out_of_memory() {
        let mut buf: Vec<f64> = Vec::new();
        let err = ensure_len(&mut buf, usize::MAX / 4, 0.0, "huge").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ensure_len_refills() {
        let mut buf = vec![1.0; 4];
        ensure_len(&mut buf, 6, 0.0, "buf").unwrap();
        assert_eq!(buf, vec![0.0; 6]);
    }
}
