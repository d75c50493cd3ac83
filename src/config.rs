//! Build-time limits and their runtime carrier.

use core::time::Duration;

/// Hubs tracked at once.
pub const MAX_HUBS: usize = 8;

/// External hub tiers below the root port (USB 2.0 section 4.1.1).
pub const MAX_HUB_DEPTH: u8 = 5;

/// Ports handled per hub; the status change bitmap fits in one byte.
pub const MAX_PORTS: u8 = 7;

/// Port resets attempted per connection before the port is disabled.
pub const PORT_RESET_RETRIES: u8 = 3;

/// Pause before a port state machine retries after a failed request.
pub const PORT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Pause before re-queuing an interrupt request the transfer layer refused.
pub const INTERRUPT_REARM_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub max_hubs: usize,
    pub max_depth: u8,
    pub reset_retries: u8,
    pub retry_delay: Duration,
    pub rearm_delay: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_hubs: MAX_HUBS,
            max_depth: MAX_HUB_DEPTH,
            reset_retries: PORT_RESET_RETRIES,
            retry_delay: PORT_RETRY_DELAY,
            rearm_delay: INTERRUPT_REARM_DELAY,
        }
    }
}

impl HubConfig {
    pub fn with_max_hubs(mut self, max_hubs: usize) -> Self {
        self.max_hubs = max_hubs.max(1);
        self
    }

    /// Route strings have room for five tiers, so deeper limits are clamped.
    pub fn with_max_depth(mut self, max_depth: u8) -> Self {
        self.max_depth = max_depth.clamp(1, MAX_HUB_DEPTH);
        self
    }

    pub fn with_reset_retries(mut self, retries: u8) -> Self {
        self.reset_retries = retries.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_rearm_delay(mut self, delay: Duration) -> Self {
        self.rearm_delay = delay;
        self
    }
}
