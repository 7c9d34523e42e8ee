//! Sliding-window counter.
//!
//! The window is split into `bucket_num` fixed time slices held in a ring
//! addressed by `(t / span) % bucket_num`. A slot left over from an earlier
//! lap is reset lazily the next time it is touched, and ignored by counts
//! once it falls out of the trailing window.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::quota::{Decision, Quota};
use crate::error::{LimiterError, Result};

/// One time slice of the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Start of the slice, in epoch milliseconds
    #[serde(default)]
    pub start_ms: i64,
    /// Events recorded in the slice
    #[serde(default)]
    pub count: u64,
}

/// Persistable counter state: the bucket ring in index order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    #[serde(default)]
    pub buckets: Vec<Bucket>,
}

/// A sliding-window counter over `bucket_num * span_ms` milliseconds.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    max_requests: u64,
    span_ms: i64,
    state: CounterState,
}

impl SlidingWindow {
    /// Create a counter with its ring laid out from `now`.
    pub fn new(quota: &Quota, now: DateTime<Utc>) -> Self {
        let bucket_num = quota.bucket_num().max(1) as i64;
        let span_ms = (quota.unit().as_millis() as i64 / bucket_num).max(1);
        let mut window = Self {
            max_requests: quota.max_requests(),
            span_ms,
            state: CounterState {
                buckets: vec![Bucket::default(); bucket_num as usize],
            },
        };
        window.reset(now);
        window
    }

    /// Milliseconds covered by one bucket.
    pub fn bucket_span(&self) -> Duration {
        Duration::from_millis(self.span_ms as u64)
    }

    fn bucket_num(&self) -> i64 {
        self.state.buckets.len() as i64
    }

    fn window_ms(&self) -> i64 {
        self.span_ms * self.bucket_num()
    }

    /// Ring slot for time `t`.
    fn index_of(&self, t: i64) -> usize {
        t.div_euclid(self.span_ms).rem_euclid(self.bucket_num()) as usize
    }

    /// Start of the slice containing time `t`.
    fn bucket_start(&self, t: i64) -> i64 {
        t - t.rem_euclid(self.span_ms)
    }

    /// The bucket to record into at time `t`, resetting it if it is from an earlier lap.
    fn current_bucket(&mut self, t: i64) -> &mut Bucket {
        let idx = self.index_of(t);
        let start = self.bucket_start(t);
        let bucket = &mut self.state.buckets[idx];

        if bucket.start_ms < start {
            bucket.start_ms = start;
            bucket.count = 0;
        }
        // A start ahead of `t` means the clock stepped backward. Keep the
        // bucket as it is rather than rewinding it.
        bucket
    }

    fn is_live(&self, bucket: &Bucket, t: i64) -> bool {
        t - bucket.start_ms < self.window_ms()
    }

    /// Events recorded in the trailing window ending at `now`.
    pub fn count(&self, now: DateTime<Utc>) -> u64 {
        let t = now.timestamp_millis();
        self.state
            .buckets
            .iter()
            .filter(|b| self.is_live(b, t))
            .map(|b| b.count)
            .sum()
    }

    /// Try to record `n` events at `now`.
    pub fn acquire_n(&mut self, n: u64, now: DateTime<Utc>) -> Decision {
        let t = now.timestamp_millis();
        self.current_bucket(t);

        let trailing = self.count(now);
        if trailing.saturating_add(n) > self.max_requests {
            return Decision::deny(self.bucket_span());
        }

        self.current_bucket(t).count += n;
        Decision::allow()
    }

    /// Clear every bucket and lay the ring out again from `now`.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        let t = now.timestamp_millis();
        let num = self.bucket_num();
        let first = self.index_of(t) as i64;
        let mut start = self.bucket_start(t);

        for offset in 0..num {
            let idx = ((first + offset) % num) as usize;
            self.state.buckets[idx] = Bucket {
                start_ms: start,
                count: 0,
            };
            start += self.span_ms;
        }
    }

    /// The current state.
    pub fn state(&self) -> &CounterState {
        &self.state
    }

    /// Replace the state with one restored from storage.
    ///
    /// An empty ring is treated as never used. A ring of a different size was
    /// written by a limiter with another configuration and is rejected.
    pub fn load(&mut self, state: CounterState, now: DateTime<Utc>) -> Result<()> {
        if state.buckets.is_empty() {
            self.reset(now);
            return Ok(());
        }
        if state.buckets.len() != self.state.buckets.len() {
            return Err(LimiterError::Serialization(format!(
                "restored counter has {} buckets, expected {}",
                state.buckets.len(),
                self.state.buckets.len()
            )));
        }
        self.state = state;
        Ok(())
    }
}
