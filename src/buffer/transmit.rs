use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::buffer::sample::Sample;
use crate::config::polling::DEFAULT_FULL_REFRESH_INTERVAL_MS;

/// Queue of change samples awaiting the next batch window, plus the
/// full-refresh clock. A due full refresh replaces the incremental drain for
/// that cycle.
pub struct TransmitBuffer {
    inner: Mutex<TransmitState>,
}

struct TransmitState {
    queue: VecDeque<Sample>,
    last_full_refresh: Instant,
    full_refresh_interval: Duration,
}

impl TransmitBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TransmitState {
                queue: VecDeque::new(),
                last_full_refresh: Instant::now(),
                full_refresh_interval: Duration::from_millis(DEFAULT_FULL_REFRESH_INTERVAL_MS),
            }),
        }
    }

    pub fn push(&self, sample: Sample) {
        self.inner.lock().unwrap().queue.push_back(sample);
    }

    /// Remove and return all queued samples in enqueue order.
    pub fn drain(&self) -> Vec<Sample> {
        let mut state = self.inner.lock().unwrap();
        state.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().queue.clear();
    }

    pub fn set_full_refresh_interval(&self, interval_ms: u64) {
        let mut state = self.inner.lock().unwrap();
        state.full_refresh_interval = Duration::from_millis(interval_ms.max(1));
    }

    pub fn full_refresh_due(&self) -> bool {
        let state = self.inner.lock().unwrap();
        state.last_full_refresh.elapsed() >= state.full_refresh_interval
    }

    /// Reset the full-refresh clock. The caller drops any queued increments
    /// by sending the snapshot instead.
    pub fn mark_full_refresh(&self) {
        let mut state = self.inner.lock().unwrap();
        state.last_full_refresh = Instant::now();
        state.queue.clear();
    }
}

impl Default for TransmitBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(register_id: &str, value: u16) -> Sample {
        Sample::good("dev-1", register_id, value, "2026-01-01T00:00:00.000Z")
    }

    #[test]
    fn test_drain_preserves_enqueue_order() {
        let buffer = TransmitBuffer::new();
        buffer.push(sample("r1", 1));
        buffer.push(sample("r2", 2));
        buffer.push(sample("r3", 3));

        let drained = buffer.drain();
        let ids: Vec<&str> = drained.iter().map(|s| s.register_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_full_refresh_clock() {
        let buffer = TransmitBuffer::new();
        buffer.set_full_refresh_interval(0);
        assert!(buffer.full_refresh_due());

        buffer.push(sample("r1", 1));
        buffer.set_full_refresh_interval(3_600_000);
        buffer.mark_full_refresh();
        assert!(!buffer.full_refresh_due());
        assert!(buffer.is_empty(), "full refresh drops queued increments");
    }
}
