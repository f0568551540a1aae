//! FIFO byte buffer between the vchan decoder and the child's stdin.
//!
//! Remote data that the child's non-blocking stdin will not accept yet is
//! queued here and drained front-first once the descriptor turns writable.
//! The decoder stops reading frames off the vchan while the buffer is
//! non-empty, so in practice its size is bounded by the vchan ring.

use std::collections::VecDeque;

/// Pending bytes for the child's stdin, drained in arrival order.
#[derive(Debug, Default)]
pub struct Buffer {
    data: VecDeque<u8>,
}

impl Buffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Queued byte count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Append bytes behind everything already queued.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.data.extend(bytes);
    }

    /// The contiguous front run of queued bytes.
    pub fn front_chunk(&self) -> &[u8] {
        self.data.as_slices().0
    }

    /// Drop `n` bytes from the front after a successful write.
    pub fn consume(&mut self, n: usize) {
        self.data.drain(..n);
    }

    /// Discard everything queued.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}
