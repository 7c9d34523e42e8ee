//! Rate limiting algorithms and the limiter facade.

mod codec;
mod counter;
mod leaky;
mod limiter;
pub(crate) mod quota;
mod token;

pub use codec::Codec;
pub use counter::{Bucket, CounterState, SlidingWindow};
pub use leaky::{LeakyBucket, LeakyState};
pub use limiter::{LimiterState, RateLimiter, RateLimiterBuilder};
pub use quota::{Algorithm, Decision, Quota};
pub use token::{TokenBucket, TokenState};
