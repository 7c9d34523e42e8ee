//! The limiter facade.
//!
//! A [`RateLimiter`] runs one algorithm against one storage handle. Every
//! operation is a critical section: take the storage lock, restore shared
//! state, step the algorithm, persist, release.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::codec::Codec;
use super::counter::{CounterState, SlidingWindow};
use super::leaky::{LeakyBucket, LeakyState};
use super::quota::{Algorithm, Decision, Quota};
use super::token::{TokenBucket, TokenState};
use crate::clock::{Clock, SystemClock};
use crate::config::{DistributedConfig, LimiterConfig, StorageConfig};
use crate::error::{LimiterError, Result};
use crate::storage::{AtomicStorage, DistributedStorage, KvBackend, LocalStorage, RetryPolicy};

/// A snapshot of a limiter's algorithm state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterState {
    Counter(CounterState),
    LeakyBucket(LeakyState),
    TokenBucket(TokenState),
}

/// The algorithm instance and its resident state.
#[derive(Debug)]
enum Engine {
    Counter(SlidingWindow),
    LeakyBucket(LeakyBucket),
    TokenBucket(TokenBucket),
}

impl Engine {
    fn new(algorithm: Algorithm, quota: &Quota, now: DateTime<Utc>) -> Self {
        match algorithm {
            Algorithm::Counter => Engine::Counter(SlidingWindow::new(quota, now)),
            Algorithm::LeakyBucket => Engine::LeakyBucket(LeakyBucket::new(quota)),
            Algorithm::TokenBucket => Engine::TokenBucket(TokenBucket::new(quota)),
        }
    }

    fn acquire_n(&mut self, n: u64, now: DateTime<Utc>) -> Decision {
        match self {
            Engine::Counter(w) => w.acquire_n(n, now),
            Engine::LeakyBucket(b) => b.acquire_n(n, now),
            Engine::TokenBucket(b) => b.acquire_n(n, now),
        }
    }

    fn reset(&mut self, now: DateTime<Utc>) {
        match self {
            Engine::Counter(w) => w.reset(now),
            Engine::LeakyBucket(b) => b.reset(),
            Engine::TokenBucket(b) => b.reset(),
        }
    }

    fn encode(&self, codec: Codec) -> Result<Vec<u8>> {
        match self {
            Engine::Counter(w) => codec.encode(w.state()),
            Engine::LeakyBucket(b) => codec.encode(b.state()),
            Engine::TokenBucket(b) => codec.encode(b.state()),
        }
    }

    /// Replace the resident state with decoded bytes. On error the state is untouched.
    fn decode(&mut self, codec: Codec, data: &[u8], now: DateTime<Utc>) -> Result<()> {
        match self {
            Engine::Counter(w) => w.load(codec.decode(data)?, now),
            Engine::LeakyBucket(b) => {
                b.load(codec.decode(data)?);
                Ok(())
            }
            Engine::TokenBucket(b) => {
                b.load(codec.decode(data)?);
                Ok(())
            }
        }
    }

    fn snapshot(&self) -> LimiterState {
        match self {
            Engine::Counter(w) => LimiterState::Counter(w.state().clone()),
            Engine::LeakyBucket(b) => LimiterState::LeakyBucket(b.state().clone()),
            Engine::TokenBucket(b) => LimiterState::TokenBucket(b.state().clone()),
        }
    }
}

/// A rate limiter enforcing one quota with one algorithm.
///
/// This struct is thread-safe and can be shared across multiple tasks. Callers
/// receive a [`Decision`] and are responsible for waiting out denied requests,
/// or can use [`RateLimiter::wait`] to have the limiter's clock do it.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    algorithm: Algorithm,
    quota: Quota,
    codec: Codec,
    clock: Arc<dyn Clock>,
    storage: Box<dyn AtomicStorage>,
    engine: Mutex<Engine>,
}

impl RateLimiter {
    /// Start building a limiter called `name`.
    pub fn builder(name: &str) -> RateLimiterBuilder {
        RateLimiterBuilder::new(name)
    }

    /// Create a limiter from configuration, using the system clock.
    ///
    /// Redis storage connects here, so this needs a running tokio runtime.
    pub async fn from_config(config: &LimiterConfig) -> Result<Self> {
        Self::assemble(config.clone(), None, Arc::new(SystemClock)).await
    }

    /// Create a limiter over a caller-supplied storage handle.
    ///
    /// The storage setting in `config` is ignored.
    pub fn with_storage(
        config: &LimiterConfig,
        storage: Box<dyn AtomicStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let quota = config.validate()?;
        let engine = Engine::new(config.algorithm, &quota, clock.now());

        debug!(
            name = %config.name,
            algorithm = %config.algorithm,
            max_requests = quota.max_requests(),
            unit_ms = config.window_ms,
            persistent = storage.is_persistent(),
            "Creating rate limiter"
        );

        Ok(Self {
            name: config.name.clone(),
            algorithm: config.algorithm,
            quota,
            codec: config.codec,
            clock,
            storage,
            engine: Mutex::new(engine),
        })
    }

    async fn assemble(
        config: LimiterConfig,
        shared: Option<Arc<dyn KvBackend>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let backend = match (shared, &config.storage) {
            (Some(backend), _) => Some(backend),
            (None, StorageConfig::Local) => None,
            (None, StorageConfig::Redis { address }) => Some(connect_redis(address).await?),
        };

        let storage: Box<dyn AtomicStorage> = match backend {
            Some(backend) => Box::new(distributed_storage(
                backend,
                &config.name,
                &config.distributed,
                clock.clone(),
            )),
            None => Box::new(LocalStorage::new()),
        };

        Self::with_storage(&config, storage, clock)
    }

    /// The limiter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The algorithm this limiter runs.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The enforced quota.
    pub fn quota(&self) -> &Quota {
        &self.quota
    }

    /// Acquire one unit of work.
    pub async fn acquire(&self) -> Result<Decision> {
        self.acquire_n(1).await
    }

    /// Acquire `n` units of work at once.
    pub async fn acquire_n(&self, n: u64) -> Result<Decision> {
        if n == 0 || n > self.quota.max_requests() {
            return Err(LimiterError::InvalidArgument(format!(
                "cannot acquire {} units from a quota of {}",
                n,
                self.quota.max_requests()
            )));
        }

        let decision = self
            .critical_section(|engine, now| engine.acquire_n(n, now))
            .await?;

        trace!(
            name = %self.name,
            n = n,
            allowed = decision.allowed,
            wait_ms = decision.wait.as_millis() as u64,
            "Rate limit decision"
        );
        if !decision.allowed {
            debug!(
                name = %self.name,
                algorithm = %self.algorithm,
                wait = ?decision.wait,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Clear all accumulated state back to a fresh limiter.
    pub async fn reset(&self) -> Result<()> {
        self.critical_section(|engine, now| engine.reset(now)).await?;
        debug!(name = %self.name, "Rate limiter reset");
        Ok(())
    }

    /// Acquire one unit, sleeping out the wait-hint if denied.
    ///
    /// Returns the decision made before sleeping.
    pub async fn wait(&self) -> Result<Decision> {
        let decision = self.acquire().await?;
        if !decision.allowed {
            self.clock.sleep(decision.wait).await;
        }
        Ok(decision)
    }

    /// Like [`RateLimiter::wait`] but sleeps at most `max`.
    pub async fn wait_max(&self, max: Duration) -> Result<Decision> {
        let decision = self.acquire().await?;
        if !decision.allowed {
            self.clock.sleep_max(decision.wait, max).await;
        }
        Ok(decision)
    }

    /// The resident algorithm state.
    ///
    /// For distributed limiters this is the state as of this instance's last
    /// critical section, which other processes may since have changed.
    pub fn state(&self) -> LimiterState {
        self.engine.lock().snapshot()
    }

    /// Events in the trailing window, for counter limiters.
    pub fn count(&self) -> Option<u64> {
        match &*self.engine.lock() {
            Engine::Counter(w) => Some(w.count(self.clock.now())),
            _ => None,
        }
    }

    /// Tokens currently available, for token-bucket limiters.
    pub fn available(&self) -> Option<i64> {
        match &*self.engine.lock() {
            Engine::TokenBucket(b) => Some(b.available()),
            _ => None,
        }
    }

    /// Carried rest time in nanoseconds, for leaky-bucket limiters.
    ///
    /// Negative values are banked credit.
    pub fn rest_time(&self) -> Option<i64> {
        match &*self.engine.lock() {
            Engine::LeakyBucket(b) => Some(b.rest_time_ns()),
            _ => None,
        }
    }

    /// Run `step` under the storage lock, releasing it on every path.
    async fn critical_section<T, F>(&self, step: F) -> Result<T>
    where
        F: FnOnce(&mut Engine, DateTime<Utc>) -> T + Send,
        T: Send,
    {
        // If this future is dropped mid-way the guard still releases the lock.
        let guard = self.storage.lock().await?;
        let outcome = self.run_locked(step).await;
        let released = self.storage.unlock(guard).await;

        let value = outcome?;
        released?;
        Ok(value)
    }

    async fn run_locked<T, F>(&self, step: F) -> Result<T>
    where
        F: FnOnce(&mut Engine, DateTime<Utc>) -> T + Send,
        T: Send,
    {
        let persistent = self.storage.is_persistent();
        let restored = if persistent {
            self.storage.restore().await?
        } else {
            None
        };

        let (value, encoded) = {
            let mut engine = self.engine.lock();
            let now = self.clock.now();

            if persistent {
                match restored {
                    Some(data) => engine.decode(self.codec, &data, now)?,
                    None => {
                        // Nothing stored, or it expired: start over.
                        trace!(name = %self.name, "No persisted state, starting fresh");
                        engine.reset(now);
                    }
                }
            }

            let value = step(&mut engine, now);
            let encoded = if persistent {
                Some(engine.encode(self.codec)?)
            } else {
                None
            };
            (value, encoded)
        };

        if let Some(data) = encoded {
            self.storage.store(data).await?;
        }
        Ok(value)
    }
}

fn distributed_storage(
    backend: Arc<dyn KvBackend>,
    name: &str,
    options: &DistributedConfig,
    clock: Arc<dyn Clock>,
) -> DistributedStorage {
    DistributedStorage::new(backend, name)
        .with_clock(clock)
        .with_retry(options.retry)
        .with_lock_ttl(options.lock_ttl())
        .with_state_ttl(options.state_ttl())
}

#[cfg(feature = "redis")]
async fn connect_redis(address: &str) -> Result<Arc<dyn KvBackend>> {
    let backend = crate::storage::RedisBackend::connect(address).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(address: &str) -> Result<Arc<dyn KvBackend>> {
    Err(LimiterError::Config(format!(
        "redis storage at {} requires the `redis` feature",
        address
    )))
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    name: String,
    algorithm: Option<Algorithm>,
    window: Duration,
    max_requests: u64,
    bucket_num: u32,
    slack: u32,
    storage: StorageConfig,
    backend: Option<Arc<dyn KvBackend>>,
    distributed: DistributedConfig,
    codec: Codec,
    clock: Arc<dyn Clock>,
}

impl RateLimiterBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            algorithm: None,
            window: Duration::from_secs(1),
            max_requests: 0,
            bucket_num: super::quota::DEFAULT_BUCKET_NUM,
            slack: super::quota::DEFAULT_SLACK,
            storage: StorageConfig::Local,
            backend: None,
            distributed: DistributedConfig::default(),
            codec: Codec::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// The algorithm to run.
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    /// The span the quota applies over.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// The ceiling of requests per window.
    pub fn max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Sliding-window bucket count.
    pub fn bucket_num(mut self, bucket_num: u32) -> Self {
        self.bucket_num = bucket_num;
        self
    }

    /// Leaky-bucket slack in requests.
    pub fn slack(mut self, slack: u32) -> Self {
        self.slack = slack;
        self
    }

    /// Keep state in this process.
    pub fn local(mut self) -> Self {
        self.storage = StorageConfig::Local;
        self.backend = None;
        self
    }

    /// Share state through `backend`.
    pub fn distributed(mut self, backend: Arc<dyn KvBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Share state through a Redis server.
    pub fn redis(mut self, address: &str) -> Self {
        self.storage = StorageConfig::Redis {
            address: address.to_string(),
        };
        self.backend = None;
        self
    }

    /// Distributed lock retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.distributed.retry = retry;
        self
    }

    /// Distributed lock expiry.
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.distributed.lock_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Distributed state expiry.
    pub fn state_ttl(mut self, ttl: Duration) -> Self {
        self.distributed.state_ttl_secs = ttl.as_secs();
        self
    }

    /// Wire format for persisted state.
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the options and create the limiter.
    pub async fn build(self) -> Result<RateLimiter> {
        let algorithm = self
            .algorithm
            .ok_or_else(|| LimiterError::Config("algorithm is required".to_string()))?;

        let config = LimiterConfig {
            name: self.name,
            algorithm,
            window_ms: self.window.as_millis() as u64,
            max_requests: self.max_requests,
            bucket_num: self.bucket_num,
            slack: self.slack,
            storage: self.storage,
            distributed: self.distributed,
            codec: self.codec,
        };
        RateLimiter::assemble(config, self.backend, self.clock).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const START_MS: i64 = 1_700_000_000_000;

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::from_millis(START_MS))
    }

    async fn local(
        algorithm: Algorithm,
        window: Duration,
        max: u64,
        clock: &Arc<ManualClock>,
    ) -> RateLimiter {
        RateLimiter::builder("test")
            .algorithm(algorithm)
            .window(window)
            .max_requests(max)
            .clock(clock.clone())
            .build()
            .await
            .unwrap()
    }

    async fn shared(
        name: &str,
        algorithm: Algorithm,
        max: u64,
        backend: &Arc<MemoryBackend>,
        clock: &Arc<ManualClock>,
    ) -> RateLimiter {
        RateLimiter::builder(name)
            .algorithm(algorithm)
            .window(Duration::from_secs(1))
            .max_requests(max)
            .distributed(backend.clone())
            .retry(RetryPolicy::new(200, Duration::from_millis(1)))
            .clock(clock.clone())
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_builder_requires_algorithm() {
        let err = RateLimiter::builder("test")
            .max_requests(10)
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_quota() {
        let err = RateLimiter::builder("")
            .algorithm(Algorithm::TokenBucket)
            .max_requests(10)
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));

        let err = RateLimiter::builder("test")
            .algorithm(Algorithm::TokenBucket)
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_redis_storage_needs_feature() {
        let err = RateLimiter::builder("test")
            .algorithm(Algorithm::Counter)
            .max_requests(10)
            .redis("127.0.0.1:6379")
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = LimiterConfig::from_yaml(
            r#"
name: orders
algorithm: counter
window_ms: 2000
max_requests: 50
bucket_num: 4
"#,
        )
        .unwrap();
        let limiter = RateLimiter::from_config(&config).await.unwrap();

        assert_eq!(limiter.name(), "orders");
        assert_eq!(limiter.algorithm(), Algorithm::Counter);
        assert_eq!(limiter.quota().unit(), Duration::from_secs(2));
        assert_eq!(limiter.quota().bucket_num(), 4);
        assert!(limiter.acquire().await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_acquire_n_argument_bounds() {
        let clock = manual_clock();
        let limiter = local(Algorithm::TokenBucket, Duration::from_secs(1), 10, &clock).await;

        assert!(matches!(
            limiter.acquire_n(0).await,
            Err(LimiterError::InvalidArgument(_))
        ));
        assert!(matches!(
            limiter.acquire_n(11).await,
            Err(LimiterError::InvalidArgument(_))
        ));
        assert!(limiter.acquire_n(10).await.unwrap().allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquires_lose_no_updates() {
        let clock = manual_clock();
        let limiter = Arc::new(
            RateLimiter::builder("concurrent")
                .algorithm(Algorithm::Counter)
                .window(Duration::from_secs(1))
                .max_requests(1000)
                .bucket_num(10)
                .clock(clock.clone())
                .build()
                .await
                .unwrap(),
        );

        let tasks: Vec<_> = (0..1000)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await.unwrap() })
            })
            .collect();

        let decisions = futures::future::join_all(tasks).await;
        let allowed = decisions
            .into_iter()
            .map(|d| d.unwrap())
            .filter(|d| d.allowed)
            .count();

        assert_eq!(allowed, 1000);
        assert_eq!(limiter.count(), Some(1000));
        assert!(!limiter.acquire().await.unwrap().allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_token_bucket_never_oversells() {
        let clock = manual_clock();
        let limiter =
            Arc::new(local(Algorithm::TokenBucket, Duration::from_secs(1), 100, &clock).await);

        let tasks: Vec<_> = (0..300)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await.unwrap() })
            })
            .collect();

        let allowed = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|d| d.as_ref().unwrap().allowed)
            .count();

        assert_eq!(allowed, 100);
        assert_eq!(limiter.available(), Some(-200));
    }

    #[tokio::test]
    async fn test_token_bucket_boundary() {
        let clock = manual_clock();
        let limiter = local(Algorithm::TokenBucket, Duration::from_secs(1), 100, &clock).await;

        for _ in 0..100 {
            assert!(limiter.acquire().await.unwrap().allowed);
        }
        assert_eq!(limiter.available(), Some(0));

        let denied = limiter.acquire().await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(limiter.available(), Some(-1));
        assert_eq!(denied.wait, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_leaky_bucket_spacing() {
        let clock = manual_clock();
        let limiter = local(Algorithm::LeakyBucket, Duration::from_secs(60), 100, &clock).await;

        for _ in 0..20 {
            assert!(limiter.acquire().await.unwrap().allowed);
            clock.advance(Duration::from_millis(600));
        }

        clock.rewind(Duration::from_millis(300));
        let denied = limiter.acquire().await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.wait, Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_counter_window_boundary() {
        let clock = manual_clock();
        let limiter = local(Algorithm::Counter, Duration::from_millis(1000), 999, &clock).await;

        for _ in 0..999 {
            assert!(limiter.acquire().await.unwrap().allowed);
            clock.advance(Duration::from_millis(1));
        }
        assert!(!limiter.acquire().await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_behaves_like_fresh_limiter() {
        for algorithm in [Algorithm::Counter, Algorithm::LeakyBucket, Algorithm::TokenBucket] {
            let clock = manual_clock();
            let limiter = local(algorithm, Duration::from_secs(1), 5, &clock).await;
            let fresh = local(algorithm, Duration::from_secs(1), 5, &clock).await;

            for _ in 0..8 {
                limiter.acquire().await.unwrap();
            }
            limiter.reset().await.unwrap();

            for i in 0..8 {
                assert_eq!(
                    limiter.acquire().await.unwrap(),
                    fresh.acquire().await.unwrap(),
                    "{} diverged at request {}",
                    algorithm,
                    i
                );
            }
        }
    }

    #[tokio::test]
    async fn test_wait_sleeps_out_the_hint() {
        let clock = manual_clock();
        let limiter = local(Algorithm::TokenBucket, Duration::from_secs(1), 10, &clock).await;
        assert!(limiter.acquire_n(10).await.unwrap().allowed);

        let before = clock.now();
        let decision = limiter.wait_max(Duration::from_millis(5)).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.wait, Duration::from_millis(200));
        assert_eq!((clock.now() - before).num_milliseconds(), 5);

        let before = clock.now();
        let decision = limiter.wait().await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.wait, Duration::from_millis(300));
        assert_eq!((clock.now() - before).num_milliseconds(), 300);
    }

    #[tokio::test]
    async fn test_wait_does_not_sleep_when_allowed() {
        let clock = manual_clock();
        let limiter = local(Algorithm::Counter, Duration::from_secs(1), 10, &clock).await;

        let before = clock.now();
        assert!(limiter.wait().await.unwrap().allowed);
        assert_eq!(clock.now(), before);
    }

    #[tokio::test]
    async fn test_distributed_instances_share_quota() {
        for algorithm in [Algorithm::Counter, Algorithm::TokenBucket] {
            let backend = Arc::new(MemoryBackend::new());
            let clock = manual_clock();
            let first = shared("orders", algorithm, 10, &backend, &clock).await;
            let second = shared("orders", algorithm, 10, &backend, &clock).await;

            let mut allowed = 0;
            for i in 0..40 {
                let limiter = if i % 2 == 0 { &first } else { &second };
                if limiter.acquire().await.unwrap().allowed {
                    allowed += 1;
                }
            }
            assert_eq!(allowed, 10, "{} admitted {} in one window", algorithm, allowed);
        }
    }

    #[tokio::test]
    async fn test_distributed_leaky_bucket_spacing_across_instances() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = manual_clock();
        let first = shared("orders", Algorithm::LeakyBucket, 10, &backend, &clock).await;
        let second = shared("orders", Algorithm::LeakyBucket, 10, &backend, &clock).await;

        assert!(first.acquire().await.unwrap().allowed);
        clock.advance(Duration::from_millis(40));
        let denied = second.acquire().await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.wait, Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_distributed_concurrent_instances() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = manual_clock();
        let limiters = [
            Arc::new(shared("burst", Algorithm::TokenBucket, 50, &backend, &clock).await),
            Arc::new(shared("burst", Algorithm::TokenBucket, 50, &backend, &clock).await),
        ];

        let tasks: Vec<_> = (0..100)
            .map(|i| {
                let limiter = limiters[i % 2].clone();
                tokio::spawn(async move { limiter.acquire().await.unwrap() })
            })
            .collect();

        let allowed = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|d| d.as_ref().unwrap().allowed)
            .count();
        assert_eq!(allowed, 50);
    }

    #[tokio::test]
    async fn test_distributed_limiters_with_different_names_are_independent() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = manual_clock();
        let orders = shared("orders", Algorithm::Counter, 2, &backend, &clock).await;
        let users = shared("users", Algorithm::Counter, 2, &backend, &clock).await;

        assert!(orders.acquire_n(2).await.unwrap().allowed);
        assert!(!orders.acquire().await.unwrap().allowed);
        assert!(users.acquire_n(2).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_distributed_state_round_trips_with_message_pack() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = manual_clock();
        let build = || {
            RateLimiter::builder("packed")
                .algorithm(Algorithm::Counter)
                .max_requests(3)
                .codec(Codec::MessagePack)
                .distributed(backend.clone())
                .clock(clock.clone())
                .build()
        };
        let first = build().await.unwrap();
        let second = build().await.unwrap();

        assert!(first.acquire_n(2).await.unwrap().allowed);
        assert!(second.acquire().await.unwrap().allowed);
        assert!(!first.acquire().await.unwrap().allowed);
        assert_eq!(first.state(), second.state());
    }

    #[tokio::test]
    async fn test_distributed_reset_is_shared() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = manual_clock();
        let first = shared("orders", Algorithm::TokenBucket, 3, &backend, &clock).await;
        let second = shared("orders", Algorithm::TokenBucket, 3, &backend, &clock).await;

        assert!(first.acquire_n(3).await.unwrap().allowed);
        assert!(!second.acquire().await.unwrap().allowed);

        first.reset().await.unwrap();
        assert!(second.acquire_n(3).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_expired_state_starts_fresh() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = manual_clock();
        let limiter = shared("orders", Algorithm::TokenBucket, 3, &backend, &clock).await;

        assert!(limiter.acquire_n(3).await.unwrap().allowed);
        assert!(!limiter.acquire().await.unwrap().allowed);

        // The store dropped the key, e.g. after its expiry
        backend.remove("orders_LimiterData");
        assert!(limiter.acquire_n(3).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_corrupt_state_is_surfaced_and_lock_released() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = manual_clock();
        let limiter = shared("orders", Algorithm::Counter, 3, &backend, &clock).await;
        assert!(limiter.acquire().await.unwrap().allowed);

        backend
            .set_with_expiry("orders_LimiterData", b"garbage".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, LimiterError::Serialization(_)));

        // Corrupt state is never overwritten silently
        assert_eq!(
            backend.get("orders_LimiterData").await.unwrap(),
            Some(b"garbage".to_vec())
        );

        // The lock was released: an operator reset recovers the limiter
        backend.remove("orders_LimiterData");
        limiter.reset().await.unwrap();
        assert!(limiter.acquire().await.unwrap().allowed);
    }

    /// A backend whose reads can be made to fail or hang.
    #[derive(Debug, Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_reads: AtomicBool,
        stall_reads: AtomicBool,
    }

    #[async_trait]
    impl KvBackend for FlakyBackend {
        async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
            self.inner.try_lock(key, owner, ttl).await
        }

        async fn unlock(&self, key: &str, owner: &str) -> Result<bool> {
            self.inner.unlock(key, owner).await
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(LimiterError::Persist("connection reset".to_string()));
            }
            if self.stall_reads.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.get(key).await
        }

        async fn set_with_expiry(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
            self.inner.set_with_expiry(key, value, ttl).await
        }
    }

    #[tokio::test]
    async fn test_persist_failure_fails_closed() {
        let backend = Arc::new(FlakyBackend::default());
        let clock = manual_clock();
        let limiter = RateLimiter::builder("orders")
            .algorithm(Algorithm::TokenBucket)
            .max_requests(5)
            .distributed(backend.clone())
            .retry(RetryPolicy::new(0, Duration::ZERO))
            .clock(clock.clone())
            .build()
            .await
            .unwrap();

        backend.fail_reads.store(true, Ordering::SeqCst);
        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, LimiterError::Persist(_)));

        // With no retries, a leaked lock would surface as a lock error here
        backend.fail_reads.store(false, Ordering::SeqCst);
        assert!(limiter.acquire().await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_lock_contention_surfaces_as_error() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = manual_clock();
        let limiter = RateLimiter::builder("orders")
            .algorithm(Algorithm::Counter)
            .max_requests(5)
            .distributed(backend.clone())
            .retry(RetryPolicy::new(2, Duration::from_millis(1)))
            .clock(clock.clone())
            .build()
            .await
            .unwrap();

        // Another process holds the lock
        assert!(backend
            .try_lock("orders_LimiterLock", "someone-else", Duration::from_secs(60))
            .await
            .unwrap());

        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, LimiterError::Lock(_)));

        backend.unlock("orders_LimiterLock", "someone-else").await.unwrap();
        assert!(limiter.acquire().await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_acquire_cancelled_during_lock_backoff_does_not_wedge_limiter() {
        let backend = Arc::new(MemoryBackend::new());
        let limiter = RateLimiter::builder("orders")
            .algorithm(Algorithm::Counter)
            .max_requests(5)
            .distributed(backend.clone())
            .retry(RetryPolicy::new(100, Duration::from_millis(5)))
            .build()
            .await
            .unwrap();

        assert!(backend
            .try_lock("orders_LimiterLock", "someone-else", Duration::from_millis(20))
            .await
            .unwrap());

        let first = tokio::time::timeout(Duration::from_millis(10), limiter.acquire()).await;
        assert!(first.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = tokio::time::timeout(Duration::from_secs(5), limiter.acquire())
            .await
            .expect("limiter stayed locked after a cancelled acquire");
        assert!(second.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_acquire_cancelled_while_holding_lock_releases_it() {
        let backend = Arc::new(FlakyBackend::default());
        let build = || {
            RateLimiter::builder("orders")
                .algorithm(Algorithm::TokenBucket)
                .max_requests(5)
                .distributed(backend.clone())
                .retry(RetryPolicy::new(100, Duration::from_millis(5)))
                .build()
        };
        let stuck = build().await.unwrap();
        let other = build().await.unwrap();

        // The backend lock is taken, then the state read never returns
        backend.stall_reads.store(true, Ordering::SeqCst);
        assert!(tokio::time::timeout(Duration::from_millis(20), stuck.acquire())
            .await
            .is_err());
        backend.stall_reads.store(false, Ordering::SeqCst);

        // Well inside the 8s lock expiry, both instances get through
        let decision = tokio::time::timeout(Duration::from_secs(2), other.acquire())
            .await
            .expect("backend lock was not released")
            .unwrap();
        assert!(decision.allowed);
        let decision = tokio::time::timeout(Duration::from_secs(2), stuck.acquire())
            .await
            .expect("local lock was not released")
            .unwrap();
        assert!(decision.allowed);
    }
}
