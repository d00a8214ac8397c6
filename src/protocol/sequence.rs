//! Sequence-number acceptance
//!
//! Both the device protocol and UDP channels accept an inbound packet only if
//! its sequence number is strictly greater than the last accepted one. The
//! first packet after a reset is always accepted and becomes the baseline.

use std::time::{Duration, Instant};

/// How ties and regressions are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequencePolicy {
    /// Accept only strictly increasing sequence numbers
    #[default]
    Strict,
    /// Accept repeated numbers, and accept a lower number once the last
    /// accepted packet is older than the window. Targets without loss
    /// detection use this to recover from a peer that restarted its counter.
    TolerateWithin(Duration),
}

/// Tracks the last accepted sequence number of one direction
#[derive(Debug, Clone)]
pub struct SequenceFilter {
    policy: SequencePolicy,
    last: Option<u32>,
    last_at: Option<Instant>,
    rejected: u64,
}

impl SequenceFilter {
    pub fn new(policy: SequencePolicy) -> Self {
        Self {
            policy,
            last: None,
            last_at: None,
            rejected: 0,
        }
    }

    pub fn strict() -> Self {
        Self::new(SequencePolicy::Strict)
    }

    /// Returns true and records `sequence` if it may be delivered
    pub fn accept(&mut self, sequence: u32, now: Instant) -> bool {
        let accepted = match self.last {
            None => true,
            Some(last) if sequence > last => true,
            Some(last) => match (self.policy, self.last_at) {
                (SequencePolicy::TolerateWithin(window), Some(at)) => {
                    sequence == last || now.saturating_duration_since(at) >= window
                }
                _ => false,
            },
        };

        if accepted {
            self.last = Some(sequence);
            self.last_at = Some(now);
        } else {
            self.rejected += 1;
        }
        accepted
    }

    /// Forget the baseline so the next packet is accepted unconditionally
    pub fn reset(&mut self) {
        self.last = None;
        self.last_at = None;
    }

    pub fn last(&self) -> Option<u32> {
        self.last
    }

    /// Packets discarded since construction
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

impl Default for SequenceFilter {
    fn default() -> Self {
        Self::strict()
    }
}
