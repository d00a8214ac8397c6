//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout_at, Instant};

use rover_link::channel::ChannelTiming;

/// Timers short enough for loopback tests
pub fn fast_timing() -> ChannelTiming {
    ChannelTiming {
        heartbeat_interval: Duration::from_millis(50),
        idle_timeout: Duration::from_millis(300),
        stats_interval: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(50),
    }
}

/// Wait for the first event matching `pred`, discarding the rest
pub async fn wait_for<T, F>(
    events: &mut UnboundedReceiver<T>,
    within: Duration,
    mut pred: F,
) -> Option<T>
where
    F: FnMut(&T) -> bool,
{
    let deadline = Instant::now() + within;
    loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) if pred(&event) => return Some(event),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

/// Collect everything that arrives within `within`
pub async fn drain<T>(events: &mut UnboundedReceiver<T>, within: Duration) -> Vec<T> {
    let deadline = Instant::now() + within;
    let mut seen = Vec::new();
    while let Ok(Some(event)) = timeout_at(deadline, events.recv()).await {
        seen.push(event);
    }
    seen
}
