//! Throughput-measuring decorator for queues.

use super::{Channel, QueueResult, QueueStats};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default number of events kept for the windowed frequency.
pub const DEFAULT_WINDOW: usize = 100;

/// Wraps a [`Channel`], labels it and measures the rate of successful
/// operations (puts and gets) over the last `W` events.
pub struct MonitoredQueue<Q> {
    inner: Q,
    label: String,
    window_len: usize,
    window: Mutex<VecDeque<Instant>>,
}

impl<Q: Channel> MonitoredQueue<Q> {
    pub fn new(inner: Q, label: impl Into<String>, window: usize) -> Self {
        let window_len = window.max(2);
        Self {
            inner,
            label: label.into(),
            window_len,
            window: Mutex::new(VecDeque::with_capacity(window_len)),
        }
    }

    pub fn inner(&self) -> &Q {
        &self.inner
    }

    pub fn into_inner(self) -> Q {
        self.inner
    }

    fn record(&self) {
        let mut window = self.window.lock().unwrap_or_else(|p| p.into_inner());
        if window.len() == self.window_len {
            window.pop_front();
        }
        window.push_back(Instant::now());
    }

    /// Items per second over the current window; 0 with fewer than two events.
    pub fn frequency(&self) -> f64 {
        let window = self.window.lock().unwrap_or_else(|p| p.into_inner());
        match (window.front(), window.back()) {
            (Some(first), Some(last)) if window.len() > 1 => {
                let span = last.duration_since(*first);
                if span.is_zero() {
                    0.0
                } else {
                    (window.len() - 1) as f64 / span.as_secs_f64()
                }
            }
            _ => 0.0,
        }
    }

    /// Rate implied by the interval between the last two events.
    pub fn instantaneous_frequency(&self) -> f64 {
        let window = self.window.lock().unwrap_or_else(|p| p.into_inner());
        let n = window.len();
        if n < 2 {
            return 0.0;
        }
        let dt = window[n - 1].duration_since(window[n - 2]);
        if dt.is_zero() {
            0.0
        } else {
            1.0 / dt.as_secs_f64()
        }
    }

    /// Time since the most recent event.
    pub fn idle_for(&self) -> Option<Duration> {
        let window = self.window.lock().unwrap_or_else(|p| p.into_inner());
        window.back().map(|t| t.elapsed())
    }
}

impl<Q: Channel> QueueStats for MonitoredQueue<Q> {
    fn name(&self) -> &str {
        &self.label
    }

    fn qsize(&self) -> usize {
        self.inner.qsize()
    }

    fn capacity(&self) -> Option<usize> {
        self.inner.capacity()
    }

    fn num_lost(&self) -> u64 {
        self.inner.num_lost()
    }

    fn produced(&self) -> u64 {
        self.inner.produced()
    }

    fn consumed(&self) -> u64 {
        self.inner.consumed()
    }

    fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }
}

impl<Q: Channel> Channel for MonitoredQueue<Q> {
    type Item = Q::Item;

    fn put(&self, item: &Q::Item) -> QueueResult<()> {
        self.inner.put(item)?;
        self.record();
        Ok(())
    }

    fn get(&self, timeout: Duration) -> QueueResult<Option<Q::Item>> {
        let item = self.inner.get(timeout)?;
        if item.is_some() {
            self.record();
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Packet;
    use crate::queue::{RingBuffer, Schema};
    use crate::types::Sample;

    fn sample(index: i64) -> Packet {
        Packet::Sample(Sample {
            index,
            timestamp_ns: 0,
            value: 0.0,
        })
    }

    #[test]
    fn test_frequency_zero_without_events() {
        let dir = tempfile::tempdir().unwrap();
        let ring = RingBuffer::create(dir.path(), "m", Schema::Sample, 4, Duration::ZERO).unwrap();
        let q = MonitoredQueue::new(ring, "camera->tracker", 10);
        assert_eq!(q.frequency(), 0.0);
        assert_eq!(q.instantaneous_frequency(), 0.0);
        assert_eq!(q.name(), "camera->tracker");
    }

    #[test]
    fn test_frequency_tracks_rate() {
        let dir = tempfile::tempdir().unwrap();
        let ring =
            RingBuffer::create(dir.path(), "rate", Schema::Sample, 64, Duration::ZERO).unwrap();
        let q = MonitoredQueue::new(ring, "rate", 10);
        for i in 0..10 {
            q.put(&sample(i)).unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        let f = q.frequency();
        // ~100 Hz, generous bounds for loaded CI machines
        assert!(f > 20.0 && f < 110.0, "frequency {}", f);
        assert!(q.instantaneous_frequency() > 0.0);
        assert_eq!(q.produced(), 10);
    }

    #[test]
    fn test_timeouts_are_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let ring = RingBuffer::create(dir.path(), "t", Schema::Sample, 4, Duration::ZERO).unwrap();
        let q = MonitoredQueue::new(ring, "t", 10);
        assert!(q.get(Duration::from_millis(1)).unwrap().is_none());
        assert!(q.idle_for().is_none());
    }
}
