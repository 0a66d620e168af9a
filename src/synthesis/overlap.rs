use crate::{error::Result, scratch};

/// Fixed-capacity ring that accumulates overlapping responses at absolute
/// sample positions and hands finished samples out from the front.
#[derive(Debug, Clone)]
pub struct OverlapBuffer {
    buffer: Vec<f64>,
    read_pos: usize,
    /// Absolute sample index stored at `read_pos`.
    origin: usize,
}

impl OverlapBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        let mut buffer = Vec::new();
        scratch::ensure_len(&mut buffer, capacity.max(1), 0.0, "overlap buffer")?;
        Ok(Self {
            buffer,
            read_pos: 0,
            origin: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// First absolute sample index not yet read.
    pub fn origin(&self) -> usize {
        self.origin
    }

    /// Sums `src` into the ring starting at absolute sample `at`. Returns
    /// `false`, touching nothing, when the span falls outside the window.
    pub fn overlap_add(&mut self, at: usize, src: &[f64]) -> bool {
        let length = src.len();
        let buffer_length = self.buffer.len();
        if at < self.origin || at + length > self.origin + buffer_length {
            return false;
        }

        let start = (self.read_pos + (at - self.origin)) % buffer_length;
        let copy1 = std::cmp::min(buffer_length - start, length);
        for (dst, &x) in self.buffer[start..start + copy1].iter_mut().zip(&src[..copy1]) {
            *dst += x;
        }
        for (dst, &x) in self.buffer.iter_mut().zip(&src[copy1..]) {
            *dst += x;
        }
        true
    }

    /// Moves the next `dest.len()` samples out of the ring, leaving their
    /// slots zeroed for later responses.
    pub fn read(&mut self, dest: &mut [f32]) -> bool {
        let length = dest.len();
        let buffer_length = self.buffer.len();
        if length > buffer_length {
            return false;
        }

        let copy1 = std::cmp::min(buffer_length - self.read_pos, length);
        let (head, tail) = dest.split_at_mut(copy1);
        for (d, s) in head.iter_mut().zip(&mut self.buffer[self.read_pos..self.read_pos + copy1]) {
            *d = *s as f32;
            *s = 0.0;
        }
        for (d, s) in tail.iter_mut().zip(self.buffer.iter_mut()) {
            *d = *s as f32;
            *s = 0.0;
        }

        self.read_pos = (self.read_pos + length) % buffer_length;
        self.origin += length;
        true
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.read_pos = 0;
        self.origin = 0;
    }
}
