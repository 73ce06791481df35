//! The single shared buffer the display path reads.
//!
//! Backing storage is allocated once at the worst case (6 channels at the
//! maximum bucket count) so publishing never reallocates. Callers mutate and
//! read it under one mutex owned by the engine; no partial write is ever
//! observable outside that lock.

use crate::{MAX_BUCKETS, MAX_CHANNELS, VALUES_PER_BUCKET};

/// Total i16 cells in the backing store.
pub const BUFFER_CAPACITY: usize = MAX_CHANNELS * MAX_BUCKETS * VALUES_PER_BUCKET;

pub struct SummaryBuffer {
    data: Box<[i16]>,
    len: usize,
    channels: usize,
}

impl Default for SummaryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SummaryBuffer {
    pub fn new() -> Self {
        Self {
            data: vec![0i16; BUFFER_CAPACITY].into_boxed_slice(),
            len: 0,
            channels: 0,
        }
    }

    /// Replace the displayed summary with `cells` (bucket-major triplets).
    /// Anything beyond the copied region is zeroed so a shorter summary never
    /// shows a stale tail.
    pub fn publish(&mut self, channels: usize, cells: &[i16]) {
        let n = cells.len().min(BUFFER_CAPACITY);
        self.data[..n].copy_from_slice(&cells[..n]);
        self.data[n..].fill(0);
        self.len = n;
        self.channels = channels;
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
        self.len = 0;
        self.channels = 0;
    }

    /// Full-capacity mutable view for the cache store to deserialize into.
    /// Callers must follow up with [`set_layout`](Self::set_layout).
    pub fn cells_mut(&mut self) -> &mut [i16] {
        &mut self.data
    }

    pub fn set_layout(&mut self, channels: usize, len: usize) {
        debug_assert!(len <= BUFFER_CAPACITY);
        self.len = len.min(BUFFER_CAPACITY);
        self.channels = channels;
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The published cells, bucket-major: each bucket holds one
    /// (min, max, rms) triplet per channel.
    pub fn cells(&self) -> &[i16] {
        &self.data[..self.len]
    }

    /// Buckets currently published per channel.
    pub fn buckets(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.len / (self.channels * VALUES_PER_BUCKET)
        }
    }
}
