//! Token-bucket limiter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::quota::{Decision, Quota};
use crate::clock::{duration_from_nanos, elapsed_nanos};

/// Persistable token-bucket state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    /// Tokens left; negative while denied requests hold reservations
    #[serde(default)]
    pub available: i64,
    /// Time of the last refill, unset before the first request
    #[serde(default)]
    pub last_refill: Option<DateTime<Utc>>,
}

/// A token bucket holding up to `max_requests` tokens, refilled at
/// `max_requests` per `unit`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: i64,
    unit_ns: i64,
    state: TokenState,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(quota: &Quota) -> Self {
        let capacity = i64::try_from(quota.max_requests()).unwrap_or(i64::MAX);
        Self {
            capacity,
            unit_ns: quota.unit_nanos(),
            state: TokenState {
                available: capacity,
                last_refill: None,
            },
        }
    }

    /// Tokens currently available.
    pub fn available(&self) -> i64 {
        self.state.available
    }

    /// Time for `tokens` tokens to accrue.
    fn accrual_time(&self, tokens: i64) -> Duration {
        let nanos = tokens as i128 * self.unit_ns as i128 / self.capacity as i128;
        duration_from_nanos(i64::try_from(nanos).unwrap_or(i64::MAX))
    }

    /// Add the tokens accrued since the last refill.
    fn refill(&mut self, now: DateTime<Utc>) {
        let Some(last) = self.state.last_refill else {
            self.state.last_refill = Some(now);
            return;
        };

        if self.state.available < self.capacity {
            let elapsed = elapsed_nanos(last, now).max(0) as i128;
            let accrued = elapsed * self.capacity as i128 / self.unit_ns as i128;
            let refilled = (self.state.available as i128 + accrued).min(self.capacity as i128);
            self.state.available = refilled as i64;
        }
        // Advanced even at capacity so idle time is never credited twice.
        self.state.last_refill = Some(now);
    }

    /// Try to take `n` tokens at `now`.
    ///
    /// A denied request keeps its reservation: the balance stays negative
    /// until elapsed time repays it. The wait-hint covers the debt plus one
    /// token for the retry itself.
    pub fn acquire_n(&mut self, n: u64, now: DateTime<Utc>) -> Decision {
        self.refill(now);
        self.state.available = self.state.available.saturating_sub(n as i64);

        if self.state.available >= 0 {
            return Decision::allow();
        }
        Decision::deny(self.accrual_time(1i64.saturating_sub(self.state.available)))
    }

    /// Refill to capacity and forget the refill time.
    pub fn reset(&mut self) {
        self.state = TokenState {
            available: self.capacity,
            last_refill: None,
        };
    }

    /// The current state.
    pub fn state(&self) -> &TokenState {
        &self.state
    }

    /// Replace the state with one restored from storage.
    pub fn load(&mut self, state: TokenState) {
        self.state = TokenState {
            available: state.available.min(self.capacity),
            ..state
        };
    }
}
