use log::warn;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::buffer::sample::Sample;

pub const DEFAULT_HISTORICAL_CAP: usize = 10_000;

/// Bounded FIFO of every sample (good or bad) awaiting bulk upload.
/// Overflow drops the oldest records and warns once per overflow event.
pub struct HistoricalBuffer {
    inner: Mutex<VecDeque<Sample>>,
    cap: usize,
}

impl HistoricalBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            cap: if cap == 0 { DEFAULT_HISTORICAL_CAP } else { cap },
        }
    }

    pub fn push(&self, sample: Sample) {
        self.push_many(std::iter::once(sample));
    }

    pub fn push_many<I: IntoIterator<Item = Sample>>(&self, samples: I) {
        let mut queue = self.inner.lock().unwrap();
        queue.extend(samples);
        if queue.len() > self.cap {
            let dropped = queue.len() - self.cap;
            queue.drain(..dropped);
            warn!(
                "⚠️  Historical buffer overflow: dropped {} oldest records (cap {})",
                dropped, self.cap
            );
        }
    }

    /// Atomically remove and return everything, preserving FIFO order. The
    /// caller owns the batch from here: it is either uploaded or spilled to
    /// the offline buffer, never lost.
    pub fn drain(&self) -> Vec<Sample> {
        let mut queue = self.inner.lock().unwrap();
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(register_id: &str, value: u16) -> Sample {
        Sample::good("dev-1", register_id, value, "2026-01-01T00:00:00.000Z")
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let buffer = HistoricalBuffer::new(10);
        buffer.push_many((0..15).map(|i| sample(&format!("r{}", i), i as u16)));

        assert_eq!(buffer.len(), 10);
        let drained = buffer.drain();
        assert_eq!(drained.first().unwrap().register_id, "r5");
        assert_eq!(drained.last().unwrap().register_id, "r14");
    }

    #[test]
    fn test_drain_empties_in_fifo_order() {
        let buffer = HistoricalBuffer::new(100);
        buffer.push(sample("r1", 1));
        buffer.push(sample("r2", 2));

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].register_id, "r1");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_zero_cap_falls_back_to_default() {
        let buffer = HistoricalBuffer::new(0);
        assert_eq!(buffer.cap, DEFAULT_HISTORICAL_CAP);
    }
}
