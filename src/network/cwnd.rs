//! Congestion window: ceiling on outstanding unacknowledged requests
//!
//! The window is a static ceiling. It does not grow on success or shrink
//! on loss; segment pacing comes from the producer's real-time cadence, and
//! the skip policy bounds useless retransmissions.

use crate::constants::DEFAULT_MAX_CWND;

#[derive(Debug, Clone)]
pub struct CongestionWindow {
    ceiling: usize,
}

impl CongestionWindow {
    /// A window never admits fewer than one request
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
        }
    }

    /// Current capacity
    pub fn current(&self) -> usize {
        self.ceiling
    }

    /// Whether one more request may be sent with `outstanding` in flight
    pub fn admits(&self, outstanding: usize) -> bool {
        outstanding < self.ceiling
    }
}

impl Default for CongestionWindow {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CWND)
    }
}
