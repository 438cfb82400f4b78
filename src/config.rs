use std::time::Duration;

/// Tunables for a [`Controller`](crate::Controller) and the pieces it is
/// assembled from.
///
/// ```
/// # use std::time::Duration;
/// let config = singleton_controller::ControllerConfig::default()
///     .workers(2)
///     .resync_period(Duration::from_secs(300));
/// assert_eq!(config.workers, 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Name used for the work queue and in log events.
    pub name: String,
    /// Number of workers draining the queue.
    pub workers: usize,
    /// Interval at which every cached object is re-delivered to listeners.
    /// Zero disables resync.
    pub resync_period: Duration,
    /// Delay before the first retry of a failed item.
    pub base_delay: Duration,
    /// Ceiling for the per-item exponential backoff.
    pub max_delay: Duration,
    /// Sustained rate of the queue-wide token bucket.
    pub qps: f64,
    /// Size of the queue-wide token bucket.
    pub burst: u32,
    /// How often cache sync predicates are polled during startup.
    pub cache_sync_poll: Duration,
    /// Upper bound on a single client call.
    pub call_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "ExampleOperator".to_owned(),
            workers: 1,
            resync_period: Duration::from_secs(10 * 60),
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
            cache_sync_poll: Duration::from_millis(100),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the worker count. At least one worker is always started.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Sets the per-item backoff bounds. `max` is raised to `base` if lower.
    #[must_use]
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max.max(base);
        self
    }

    #[must_use]
    pub fn bucket(mut self, qps: f64, burst: u32) -> Self {
        self.qps = qps;
        self.burst = burst;
        self
    }

    #[must_use]
    pub fn cache_sync_poll(mut self, interval: Duration) -> Self {
        self.cache_sync_poll = interval;
        self
    }

    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}
