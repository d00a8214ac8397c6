//! Rolling channel statistics

use std::time::{Duration, Instant};

/// Snapshot delivered with every statistics event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Last measured round trip in milliseconds
    pub rtt_ms: Option<u32>,
    /// Application messages sent since the channel was opened
    pub messages_up: u64,
    /// Application messages received since the channel was opened
    pub messages_down: u64,
    /// Bytes per second sent over the last window
    pub rate_up: u64,
    /// Bytes per second received over the last window
    pub rate_down: u64,
}

/// Counts traffic and turns it into per-window rates
#[derive(Debug)]
pub struct StatsWindow {
    window_start: Instant,
    bytes_up: u64,
    bytes_down: u64,
    messages_up: u64,
    messages_down: u64,
    rtt_ms: Option<u32>,
}

impl StatsWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            bytes_up: 0,
            bytes_down: 0,
            messages_up: 0,
            messages_down: 0,
            rtt_ms: None,
        }
    }

    pub fn record_sent(&mut self, bytes: usize, is_message: bool) {
        self.bytes_up += bytes as u64;
        if is_message {
            self.messages_up += 1;
        }
    }

    pub fn record_received(&mut self, bytes: usize, is_message: bool) {
        self.bytes_down += bytes as u64;
        if is_message {
            self.messages_down += 1;
        }
    }

    pub fn record_rtt(&mut self, rtt: Duration) {
        self.rtt_ms = Some(rtt.as_millis().min(u32::MAX as u128) as u32);
    }

    /// Close the current window and return the snapshot for it
    pub fn roll(&mut self, now: Instant) -> ChannelStats {
        let elapsed_ms = now
            .saturating_duration_since(self.window_start)
            .as_millis()
            .max(1) as u64;
        let stats = ChannelStats {
            rtt_ms: self.rtt_ms,
            messages_up: self.messages_up,
            messages_down: self.messages_down,
            rate_up: self.bytes_up * 1000 / elapsed_ms,
            rate_down: self.bytes_down * 1000 / elapsed_ms,
        };
        self.window_start = now;
        self.bytes_up = 0;
        self.bytes_down = 0;
        stats
    }
}
