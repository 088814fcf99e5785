//! Lock-free sample queue between the render task and the device callback
//!
//! Backed by crossbeam's bounded `ArrayQueue`, so producer and consumer never
//! take a lock and the hot path never allocates. Overruns and underruns are
//! counted on cache-padded atomics to keep the two threads off each other's
//! cache lines.

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounded multi-producer multi-consumer queue of interleaved samples
pub struct SampleQueue {
    queue: ArrayQueue<f32>,
    /// Samples rejected because the queue was full
    dropped: CachePadded<AtomicUsize>,
    /// Samples the consumer asked for but did not get
    underrun: CachePadded<AtomicUsize>,
}

impl SampleQueue {
    /// Create a queue holding up to `capacity` samples (at least one)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: CachePadded::new(AtomicUsize::new(0)),
            underrun: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Push as many samples as fit (producer)
    ///
    /// Returns the number accepted; the rest are counted as dropped.
    pub fn push_slice(&self, samples: &[f32]) -> usize {
        let mut written = 0;
        for &sample in samples {
            if self.queue.push(sample).is_err() {
                break;
            }
            written += 1;
        }

        let rejected = samples.len() - written;
        if rejected > 0 {
            self.dropped.fetch_add(rejected, Ordering::Relaxed);
        }
        written
    }

    /// Pop into `out`, filling any shortfall with silence (consumer)
    ///
    /// Returns the number of real samples delivered.
    pub fn pop_into(&self, out: &mut [f32]) -> usize {
        let mut read = 0;
        for slot in out.iter_mut() {
            match self.queue.pop() {
                Some(sample) => {
                    *slot = sample;
                    read += 1;
                }
                None => break,
            }
        }

        if read < out.len() {
            out[read..].fill(0.0);
            self.underrun.fetch_add(out.len() - read, Ordering::Relaxed);
        }
        read
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Space left before samples start being dropped
    pub fn available_write(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn underrun(&self) -> usize {
        self.underrun.load(Ordering::Relaxed)
    }

    /// Discard everything queued
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

impl std::fmt::Debug for SampleQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("dropped", &self.dropped())
            .field("underrun", &self.underrun())
            .finish()
    }
}
