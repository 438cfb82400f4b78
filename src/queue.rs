//! A deduplicating, rate-limited work queue.
//!
//! Keys move through three sets: `queue` (waiting for a worker), `processing`
//! (handed out by [`WorkQueue::get`] and not yet [`done`](WorkQueue::done)),
//! and `dirty` (needs another pass). A key is in `queue` at most once, and a
//! key that is added while it is being processed is only put back into
//! `queue` once the worker holding it calls `done`, so the same key is never
//! processed by two workers at once and no wakeup is lost.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::config::ControllerConfig;

// Every critical section leaves the guarded state consistent, so a panic
// elsewhere while the lock was held does not invalidate it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decides how long a failed key waits before it is retried.
pub trait RateLimiter<K>: Send + Sync {
    /// Returns the delay for the next retry of `key` and records the failure.
    fn when(&self, key: &K) -> Duration;
    /// Clears any failure history kept for `key`.
    fn forget(&self, key: &K);
    /// Number of failures recorded for `key` since it was last forgotten.
    fn retries(&self, key: &K) -> u32;
}

/// Per-key exponential backoff: `min(max, base * 2^failures)`.
pub struct ExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> RateLimiter<K> for ExponentialFailureRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.clone()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    fn retries(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or_default()
    }
}

/// A token bucket shared by every key. Bounds the overall retry rate rather
/// than the rate of any single key.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last: Option<Instant>,
}

impl BucketRateLimiter {
    /// A non-positive or NaN `qps` disables the limiter.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: None,
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        if self.qps.is_nan() || self.qps <= 0.0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let mut bucket = lock(&self.bucket);
        if let Some(last) = bucket.last {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        }
        bucket.last = Some(now);
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&self, _key: &K) {}

    fn retries(&self, _key: &K) -> u32 {
        0
    }
}

/// Combines several limiters, waiting for the longest of their delays.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or_default()
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn retries(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.retries(key))
            .max()
            .unwrap_or_default()
    }
}

/// Per-key exponential backoff combined with an overall token bucket, using
/// the bounds from `config`.
pub fn default_controller_rate_limiter<K>(config: &ControllerConfig) -> MaxOfRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ExponentialFailureRateLimiter::new(
            config.base_delay,
            config.max_delay,
        )),
        Box::new(BucketRateLimiter::new(config.qps, config.burst)),
    ])
}

/// A cloneable handle to a shared work queue.
///
/// Delayed adds spawn onto the ambient tokio runtime, so
/// [`add_after`](Self::add_after) and [`add_rate_limited`](Self::add_rate_limited)
/// must be called from within one.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
    shutdown: CancellationToken,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Creates a queue named after `config` using
    /// [`default_controller_rate_limiter`].
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.name.clone(), default_controller_rate_limiter(config))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        lock(&self.inner.state)
    }

    /// Marks `key` as needing processing. Adding a key that is already
    /// queued is a no-op; adding a key that is being processed requeues it
    /// once the current pass is [`done`](Self::done).
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Waits for the next key and marks it as processing. Returns `None`
    /// once the queue has been shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.processing.insert(key.clone());
                    state.dirty.remove(&key);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Releases a key handed out by [`get`](Self::get).
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }

    /// Resets the backoff of `key`. Does not remove it from the queue.
    pub fn forget(&self, key: &K) {
        self.inner.rate_limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.rate_limiter.retries(key)
    }

    /// Adds `key` once the rate limiter says it may be retried.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.rate_limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Adds `key` after `delay`. While a key is waiting, a later request with
    /// an earlier deadline replaces it and one with a later deadline is
    /// dropped.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let Some(ready_at) = Instant::now().checked_add(delay) else {
            event!(
                Level::WARN,
                queue = %self.inner.name,
                key = ?key,
                "Dropping delayed add with unrepresentable deadline."
            );
            return;
        };
        {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            if matches!(state.waiting.get(&key), Some(existing) if *existing <= ready_at) {
                return;
            }
            state.waiting.insert(key.clone(), ready_at);
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = queue.inner.shutdown.cancelled() => {}
                () = tokio::time::sleep_until(ready_at) => queue.fire(key, ready_at),
            }
        });
    }

    fn fire(&self, key: K, ready_at: Instant) {
        {
            let mut state = self.state();
            if state.waiting.get(&key) != Some(&ready_at) {
                return;
            }
            state.waiting.remove(&key);
        }
        self.add(key);
    }

    /// Stops accepting new keys and drops pending delayed adds. Keys already
    /// queued are still handed out; once they are drained, [`get`](Self::get)
    /// returns `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.state();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    fn queue(base: Duration, max: Duration) -> WorkQueue<&'static str> {
        WorkQueue::new("test", ExponentialFailureRateLimiter::new(base, max))
    }

    async fn next(queue: &WorkQueue<&'static str>) -> Option<&'static str> {
        timeout(Duration::from_millis(10), queue.get()).await.ok().flatten()
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_adds_yield_once() {
        let queue = queue(Duration::from_millis(5), Duration::from_secs(1));
        for _ in 0..5 {
            queue.add("key");
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(next(&queue).await, Some("key"));
        assert_eq!(next(&queue).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn add_during_processing_requeues_after_done() {
        let queue = queue(Duration::from_millis(5), Duration::from_secs(1));
        queue.add("key");
        let key = next(&queue).await.unwrap();

        queue.add("key");
        queue.add("key");
        assert_eq!(queue.len(), 0);
        assert_eq!(next(&queue).await, None);

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(next(&queue).await, Some("key"));
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_get_wakes_on_add() {
        let queue = queue(Duration::from_millis(5), Duration::from_secs(1));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        sleep(Duration::from_millis(1)).await;
        queue.add("key");
        assert_eq!(waiter.await.unwrap(), Some("key"));
    }

    #[test]
    fn exponential_backoff_is_monotonic_and_capped() {
        let limiter = ExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1),
        );
        let delays: Vec<Duration> = (0..12).map(|_| limiter.when(&"key")).collect();
        assert_eq!(delays[0], Duration::from_millis(5));
        assert_eq!(delays[1], Duration::from_millis(10));
        assert_eq!(delays[2], Duration::from_millis(20));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(delays[11], Duration::from_secs(1));
        assert_eq!(limiter.retries(&"key"), 12);

        limiter.forget(&"key");
        assert_eq!(limiter.retries(&"key"), 0);
        assert_eq!(limiter.when(&"key"), Duration::from_millis(5));
    }

    #[test]
    fn exponential_backoff_survives_huge_exponents() {
        let limiter = ExponentialFailureRateLimiter::new(
            Duration::from_secs(1),
            Duration::from_secs(1000),
        );
        for _ in 0..100 {
            assert!(limiter.when(&"key") <= Duration::from_secs(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_limits_after_burst() {
        let limiter = BucketRateLimiter::new(1.0, 2);
        assert_eq!(RateLimiter::<()>::when(&limiter, &()), Duration::ZERO);
        assert_eq!(RateLimiter::<()>::when(&limiter, &()), Duration::ZERO);
        assert_eq!(RateLimiter::<()>::when(&limiter, &()), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn degenerate_bucket_rates_do_not_panic() {
        let tiny = BucketRateLimiter::new(f64::MIN_POSITIVE, 0);
        assert_eq!(RateLimiter::<()>::when(&tiny, &()), Duration::MAX);

        let nan = BucketRateLimiter::new(f64::NAN, 0);
        assert_eq!(RateLimiter::<()>::when(&nan, &()), Duration::ZERO);

        let queue = WorkQueue::new("tiny", BucketRateLimiter::new(f64::MIN_POSITIVE, 0));
        queue.add_rate_limited("a");
        assert!(queue.is_empty());
    }

    #[test]
    fn max_of_takes_longest_delay() {
        let limiter: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ExponentialFailureRateLimiter::new(
                Duration::from_millis(5),
                Duration::from_secs(1),
            )),
            Box::new(ExponentialFailureRateLimiter::new(
                Duration::from_millis(50),
                Duration::from_secs(1),
            )),
        ]);
        assert_eq!(limiter.when(&"key"), Duration::from_millis(50));
        assert_eq!(limiter.retries(&"key"), 1);
        limiter.forget(&"key");
        assert_eq!(limiter.retries(&"key"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_backoff() {
        let queue = queue(Duration::from_millis(100), Duration::from_secs(1));
        queue.add_rate_limited("key");
        assert_eq!(queue.num_requeues(&"key"), 1);
        assert!(queue.is_empty());

        sleep(Duration::from_millis(50)).await;
        assert!(queue.is_empty());

        let key = timeout(Duration::from_millis(100), queue.get()).await.unwrap();
        assert_eq!(key, Some("key"));

        queue.forget(&"key");
        assert_eq!(queue.num_requeues(&"key"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_delayed_add_wins() {
        let queue = queue(Duration::from_millis(5), Duration::from_secs(1));
        queue.add_after("key", Duration::from_secs(10));
        queue.add_after("key", Duration::from_millis(10));

        let key = timeout(Duration::from_millis(50), queue.get()).await.unwrap();
        assert_eq!(key, Some("key"));
        queue.done(&"key");

        sleep(Duration::from_secs(20)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shut_down_drains_then_stops() {
        let queue = queue(Duration::from_millis(5), Duration::from_secs(1));
        queue.add("a");
        queue.add("b");
        queue.add_after("c", Duration::from_millis(10));
        queue.shut_down();

        queue.add("d");
        assert!(queue.is_shutting_down());
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert_eq!(queue.get().await, None);

        sleep(Duration::from_millis(50)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shut_down_releases_blocked_getters() {
        let queue = queue(Duration::from_millis(5), Duration::from_secs(1));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        sleep(Duration::from_millis(1)).await;
        queue.shut_down();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
    }
}
