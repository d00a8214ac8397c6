//! Simulated-latency queue for outbound messages

use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Holds outbound messages until their release time
///
/// Release times never decrease because every message gets the same delay
/// relative to the moment it was queued; lowering the delay mid-stream clamps
/// new entries to the tail so send order is preserved.
#[derive(Debug, Default)]
pub struct LatencyQueue {
    delay: Duration,
    pending: VecDeque<(Instant, Bytes)>,
}

impl LatencyQueue {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: VecDeque::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    pub fn is_enabled(&self) -> bool {
        !self.delay.is_zero()
    }

    pub fn push(&mut self, message: Bytes, now: Instant) {
        let mut release = now + self.delay;
        if let Some((tail, _)) = self.pending.back() {
            release = release.max(*tail);
        }
        self.pending.push_back((release, message));
    }

    /// Release time of the oldest held message
    pub fn next_release(&self) -> Option<Instant> {
        self.pending.front().map(|(at, _)| *at)
    }

    /// Pop the oldest message if it is due
    pub fn pop_due(&mut self, now: Instant) -> Option<Bytes> {
        match self.pending.front() {
            Some((at, _)) if *at <= now => self.pending.pop_front().map(|(_, message)| message),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_after_delay() {
        let start = Instant::now();
        let mut queue = LatencyQueue::new(Duration::from_millis(100));

        queue.push(Bytes::from_static(b"a"), start);
        queue.push(Bytes::from_static(b"b"), start + Duration::from_millis(10));

        assert!(queue.pop_due(start + Duration::from_millis(99)).is_none());
        assert_eq!(
            queue.pop_due(start + Duration::from_millis(100)).unwrap().as_ref(),
            b"a"
        );
        assert!(queue.pop_due(start + Duration::from_millis(100)).is_none());
        assert_eq!(
            queue.next_release(),
            Some(start + Duration::from_millis(110))
        );
    }

    #[test]
    fn test_lowering_delay_keeps_order() {
        let start = Instant::now();
        let mut queue = LatencyQueue::new(Duration::from_millis(500));

        queue.push(Bytes::from_static(b"slow"), start);
        queue.set_delay(Duration::from_millis(10));
        queue.push(Bytes::from_static(b"fast"), start);

        let later = start + Duration::from_millis(500);
        assert_eq!(queue.pop_due(later).unwrap().as_ref(), b"slow");
        assert_eq!(queue.pop_due(later).unwrap().as_ref(), b"fast");
        assert!(queue.is_empty());
    }
}
