//! Application Ports
//!
//! - [`Clock`]: wall-clock time for status stamps (driven).
//! - [`BrokerdPort`]: delivery of requests to one broker adapter (driven).

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::domain::messages::BrokerdRequest;

// =============================================================================
// Clock
// =============================================================================

/// Source of status timestamps.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    /// Nanoseconds since the Unix epoch.
    fn now_ns(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> i64 {
        // Out of range only after the year 2262
        Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Clock reading `start`.
    #[must_use]
    pub const fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Jump to `now`, backwards included.
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `delta` nanoseconds.
    pub fn advance(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Brokerd
// =============================================================================

/// Broker adapter delivery failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerdPortError {
    /// The adapter's session is gone.
    #[error("broker {0} is not accepting requests")]
    Unavailable(String),
}

/// Outbound side of one broker adapter session.
///
/// `submit` only has to accept the request; the adapter's reply arrives
/// later as a brokerd event or a request failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerdPort: Send + Sync {
    /// Queue `request` for delivery, preserving submission order.
    async fn submit(&self, request: BrokerdRequest) -> Result<(), BrokerdPortError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(10);
        assert_eq!(clock.now_ns(), 10);
        clock.advance(5);
        assert_eq!(clock.now_ns(), 15);
        clock.set(3);
        assert_eq!(clock.now_ns(), 3);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_ns() > 1_577_836_800_000_000_000);
    }
}
