//! Time sources for limiters.
//!
//! Limiters never read the wall clock directly. They ask an injected [`Clock`]
//! for the current time and for blocking waits, so tests can drive time by hand.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

/// A source of wall-clock time and waits.
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);

    /// Suspend the caller for `duration`, but never longer than `max`.
    async fn sleep_max(&self, duration: Duration, max: Duration) {
        self.sleep(duration.min(max)).await;
    }
}

/// The real-time clock backed by the system time and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A manually driven clock.
///
/// `sleep` advances the clock instead of waiting, so code that waits out a
/// wait-hint observes the elapsed time immediately.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a clock frozen at the given number of milliseconds since the epoch.
    pub fn from_millis(millis: i64) -> Self {
        let start = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_default();
        Self::new(start)
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
    }

    /// Move the clock backward.
    pub fn rewind(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now -= chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
    }

    /// Pin the clock to a specific time.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Nanoseconds elapsed from `earlier` to `later`, negative if the clock went backward.
pub(crate) fn elapsed_nanos(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later - earlier).num_nanoseconds().unwrap_or(i64::MAX)
}

/// Convert a non-negative nanosecond count into a `Duration`.
pub(crate) fn duration_from_nanos(nanos: i64) -> Duration {
    Duration::from_nanos(nanos.max(0) as u64)
}
