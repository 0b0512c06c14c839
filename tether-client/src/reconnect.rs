//! Reconnect delay policies
//!
//! The manager asks its strategy for a delay every time it schedules an
//! automatic reconnect, passing the 1-indexed attempt number. `None` means
//! stop scheduling. The session still comes back on an explicit `connect`,
//! `reconnect` or health check, or when the network is restored; the
//! strategy is reset before that.
//!
//! # Built-in Strategies
//!
//! - **ExponentialBackoff**: `base * 2^(attempt - 1)` (the default)
//! - **FixedDelay**: constant delay
//! - **NoReconnect**: never reconnect automatically
//!
//! ```rust
//! use tether_client::{ExponentialBackoff, ReconnectionStrategy};
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_secs(1)).with_max_attempts(4);
//! let delays: Vec<_> = (1..=5).map(|attempt| backoff.next_delay(attempt)).collect();
//!
//! assert_eq!(delays, vec![
//!     Some(Duration::from_secs(1)),
//!     Some(Duration::from_secs(2)),
//!     Some(Duration::from_secs(4)),
//!     Some(Duration::from_secs(8)),
//!     None,
//! ]);
//! ```

use rand::Rng;
use std::time::Duration;

/// Decides how long to wait before each automatic reconnect
pub trait ReconnectionStrategy: Send + Sync {
    /// Delay before reconnect number `attempt` (starting at 1), or `None`
    /// to stop reconnecting
    fn next_delay(&mut self, attempt: u32) -> Option<Duration>;

    /// Called when a connection succeeds or the caller starts over
    fn reset(&mut self);
}

/// Doubling delay with optional cap, attempt limit and jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Option<Duration>,
    max_attempts: Option<u32>,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Unlimited attempts starting at `base_delay`
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: None,
            max_attempts: None,
            jitter: false,
        }
    }

    /// Stop after `max_attempts` scheduled reconnects
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Never wait longer than `max_delay`
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Add up to 25% random extra delay
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }
}

impl Default for ExponentialBackoff {
    /// 1s, 2s, 4s, 8s, 16s, then give up
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
            .with_max_attempts(5)
            .with_max_delay(Duration::from_secs(30))
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }

        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let mut delay = self.base_delay.saturating_mul(factor);
        if let Some(max_delay) = self.max_delay {
            delay = delay.min(max_delay);
        }

        if self.jitter {
            let quarter = (delay.as_millis() / 4) as u64;
            let extra = rand::thread_rng().gen_range(0..=quarter);
            delay = delay.saturating_add(Duration::from_millis(extra));
        }

        Some(delay)
    }

    fn reset(&mut self) {}
}

/// Constant delay between attempts
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: Option<u32>,
}

impl FixedDelay {
    /// Unlimited attempts every `delay`
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    /// Stop after `max_attempts` scheduled reconnects
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl ReconnectionStrategy for FixedDelay {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some(self.delay),
        }
    }

    fn reset(&mut self) {}
}

/// Never reconnect automatically
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReconnect;

impl ReconnectionStrategy for NoReconnect {
    fn next_delay(&mut self, _attempt: u32) -> Option<Duration> {
        None
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_sequence() {
        let mut strategy = ExponentialBackoff::new(Duration::from_millis(100));

        assert_eq!(strategy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(strategy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(strategy.next_delay(3), Some(Duration::from_millis(400)));
        assert_eq!(strategy.next_delay(6), Some(Duration::from_millis(3200)));
    }

    #[test]
    fn test_exponential_max_attempts() {
        let mut strategy = ExponentialBackoff::new(Duration::from_secs(1)).with_max_attempts(3);

        assert!(strategy.next_delay(1).is_some());
        assert!(strategy.next_delay(3).is_some());
        assert!(strategy.next_delay(4).is_none());
    }

    #[test]
    fn test_exponential_max_delay() {
        let mut strategy =
            ExponentialBackoff::new(Duration::from_millis(100)).with_max_delay(Duration::from_secs(1));

        assert_eq!(strategy.next_delay(10), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let mut strategy = ExponentialBackoff::new(Duration::from_secs(1));
        assert!(strategy.next_delay(u32::MAX).is_some());

        let mut capped =
            ExponentialBackoff::new(Duration::from_secs(1)).with_max_delay(Duration::from_secs(60));
        assert_eq!(capped.next_delay(200), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_default_gives_up_after_five() {
        let mut strategy = ExponentialBackoff::default();
        let delays: Vec<_> = (1..=6).map(|a| strategy.next_delay(a)).collect();

        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(4)),
                Some(Duration::from_secs(8)),
                Some(Duration::from_secs(16)),
                None,
            ]
        );
    }

    #[test]
    fn test_jitter_bounds() {
        let mut strategy = ExponentialBackoff::new(Duration::from_millis(100)).with_jitter();

        for _ in 0..50 {
            let delay = strategy.next_delay(1).unwrap();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_fixed_delay() {
        let mut strategy = FixedDelay::new(Duration::from_millis(50)).with_max_attempts(2);

        assert_eq!(strategy.next_delay(1), Some(Duration::from_millis(50)));
        assert_eq!(strategy.next_delay(2), Some(Duration::from_millis(50)));
        assert_eq!(strategy.next_delay(3), None);
    }

    #[test]
    fn test_no_reconnect() {
        let mut strategy = NoReconnect;
        assert_eq!(strategy.next_delay(1), None);
    }
}
