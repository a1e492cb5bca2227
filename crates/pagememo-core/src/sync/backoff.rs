//! Link initiation policy: who dials first, and how long to wait before retrying
//!
//! ## Tie-break
//!
//! Both sides of a desired pair decide independently to link. Only the side
//! whose identity sorts lower dials; the other waits for a grace period and
//! dials only if no inbound link arrived.
//!
//! ## Backoff
//!
//! `delay(attempt) = min(base * 2^(attempt - 1), max)` with attempt starting at 1.
//! With the defaults: 10s, 20s, 40s, 60s, 60s, ...

use std::time::Duration;

use crate::types::PeerId;

/// Default first retry delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(10);

/// Default retry delay cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// True when `local` is the side that should dial `remote`
pub fn should_initiate(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (1-based; 0 is treated as 1)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        // 2^31 already overflows any sane base, so clamp the shift
        let factor = 1u32.checked_shl(exponent.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}
