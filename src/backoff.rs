//! Reconnect delays.
//!
//! [`ReconnectPolicy`] hands out exponentially growing delays between
//! connection attempts. The connection resets it after every successful
//! handshake, so that a node that was healthy for a while is retried quickly
//! the next time it drops.

use std::time::Duration;

/// Exponential backoff with an external reset.
///
/// Delays are `base * 2^n` for the `n`-th call to [`delay`](Self::delay)
/// since the last [`reset`](Self::reset), with `n` capped so that delays stop
/// growing after a while. The sequence is deterministic and non-decreasing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base: Duration,
    max_exponent: u32,
    exponent: u32,
}

impl ReconnectPolicy {
    /// Delay before the first retry.
    pub const DEFAULT_BASE: Duration = Duration::from_secs(3);

    /// `3s * 2^7` is a little over six minutes.
    pub const DEFAULT_MAX_EXPONENT: u32 = 7;

    #[must_use]
    pub fn new(base: Duration, max_exponent: u32) -> Self {
        Self {
            base,
            max_exponent,
            exponent: 0,
        }
    }

    /// Returns the delay to sleep before the next attempt and advances the
    /// sequence.
    pub fn delay(&mut self) -> Duration {
        let factor = 1_u32.checked_shl(self.exponent).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor);

        if self.exponent < self.max_exponent {
            self.exponent += 1;
        }

        delay
    }

    /// Restarts the sequence at the base delay.
    pub fn reset(&mut self) {
        self.exponent = 0;
    }

    /// The delay the sequence starts at.
    #[must_use]
    pub fn base(&self) -> Duration {
        self.base
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_MAX_EXPONENT)
    }
}
