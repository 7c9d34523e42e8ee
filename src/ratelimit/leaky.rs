//! Leaky-bucket limiter.
//!
//! Admitted requests are spaced `unit / max_requests` apart. Arriving early
//! adds to a carried rest time, arriving late banks credit down to a floor of
//! `slack` intervals, which is the only burst the bucket will absorb.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::quota::{Decision, Quota};
use crate::clock::{duration_from_nanos, elapsed_nanos};

/// Persistable leaky-bucket state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakyState {
    /// Time of the last admitted request
    #[serde(default)]
    pub last_request: Option<DateTime<Utc>>,
    /// Carried debt in nanoseconds; negative values are banked credit
    #[serde(default)]
    pub rest_time_ns: i64,
}

/// A leaky bucket with bounded slack.
#[derive(Debug, Clone)]
pub struct LeakyBucket {
    per_request_ns: i64,
    slack_floor_ns: i64,
    state: LeakyState,
}

impl LeakyBucket {
    /// Create an empty bucket.
    pub fn new(quota: &Quota) -> Self {
        let per_request_ns = quota.interval_nanos();
        Self {
            per_request_ns,
            slack_floor_ns: -(quota.slack() as i64).saturating_mul(per_request_ns),
            state: LeakyState::default(),
        }
    }

    /// Spacing between admitted requests.
    pub fn per_request(&self) -> Duration {
        duration_from_nanos(self.per_request_ns)
    }

    /// The carried rest time in nanoseconds.
    pub fn rest_time_ns(&self) -> i64 {
        self.state.rest_time_ns
    }

    /// Try to admit `n` requests at `now`.
    pub fn acquire_n(&mut self, n: u64, now: DateTime<Utc>) -> Decision {
        let Some(last) = self.state.last_request else {
            // The first request seeds the bucket
            self.state.last_request = Some(now);
            return Decision::allow();
        };

        let cost = self.per_request_ns.saturating_mul(n as i64);
        let rest = self
            .state
            .rest_time_ns
            .saturating_add(cost)
            .saturating_sub(elapsed_nanos(last, now))
            .max(self.slack_floor_ns);

        if rest > 0 {
            // The caller is expected to wait out the debt, which empties the bucket.
            self.state.rest_time_ns = 0;
            return Decision::deny(duration_from_nanos(rest));
        }

        self.state.rest_time_ns = rest;
        self.state.last_request = Some(now);
        Decision::allow()
    }

    /// Forget all history.
    pub fn reset(&mut self) {
        self.state = LeakyState::default();
    }

    /// The current state.
    pub fn state(&self) -> &LeakyState {
        &self.state
    }

    /// Replace the state with one restored from storage.
    pub fn load(&mut self, state: LeakyState) {
        self.state = LeakyState {
            rest_time_ns: state.rest_time_ns.max(self.slack_floor_ns),
            ..state
        };
    }
}
