use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::cache::InformerSynced;
use crate::config::ControllerConfig;
use crate::error::Error;
use crate::queue::WorkQueue;

/// The [`Reconciler`] trait is implemented by whatever drives observed state
/// toward desired state. It is called by a [`Controller`] worker for each key
/// taken off the queue.
///
/// Implementations should re-read current state rather than trusting
/// whatever triggered the call: several changes may have been coalesced into
/// one key, and changes may arrive out of order. Returning `Err` requeues the
/// key with backoff; returning `Ok` resets its backoff.
#[async_trait::async_trait]
pub trait Reconciler<K>: Send + Sync + 'static {
    async fn reconcile(&self, key: &K) -> Result<(), Error>;
}

/// Lifecycle of a [`Controller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Created,
    WaitingForCacheSync,
    Running,
    ShuttingDown,
    Stopped,
}

/// The [`Controller`] drains a [`WorkQueue`] with a fixed pool of workers,
/// calling the provided [`Reconciler`] for each key.
pub struct Controller<K, R> {
    name: String,
    reconciler: Arc<R>,
    queue: WorkQueue<K>,
    cache_syncs: Vec<InformerSynced>,
    config: ControllerConfig,
    state: watch::Sender<ControllerState>,
}

impl<K, R> Controller<K, R>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    R: Reconciler<K>,
{
    /// Creates a controller that waits for every predicate in `cache_syncs`
    /// before starting workers.
    pub fn new(
        config: ControllerConfig,
        reconciler: R,
        queue: WorkQueue<K>,
        cache_syncs: Vec<InformerSynced>,
    ) -> Self {
        let (state, _) = watch::channel(ControllerState::Created);
        Self {
            name: config.name.clone(),
            reconciler: Arc::new(reconciler),
            queue,
            cache_syncs,
            config,
            state,
        }
    }

    pub fn queue(&self) -> &WorkQueue<K> {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<R> {
        &self.reconciler
    }

    /// Follows the controller through its lifecycle.
    pub fn state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    fn transition(&self, state: ControllerState) {
        event!(
            Level::DEBUG,
            controller = %self.name,
            state = ?state,
            "Controller state changed."
        );
        self.state.send_replace(state);
    }

    /// Run the controller until `stop` fires. Workers are only started once
    /// every cache has synced; if `stop` fires first, this returns
    /// [`Error::CacheSyncTimeout`]. On shutdown the queue is shut down and
    /// this waits for every worker to finish its current item.
    pub async fn run(&self, workers: usize, stop: CancellationToken) -> Result<(), Error> {
        event!(Level::INFO, controller = %self.name, "Starting {}.", self.name);
        self.transition(ControllerState::WaitingForCacheSync);

        if !self.wait_for_cache_sync(&stop).await {
            event!(
                Level::ERROR,
                controller = %self.name,
                "Timed out waiting for caches to sync."
            );
            self.queue.shut_down();
            self.transition(ControllerState::Stopped);
            return Err(Error::CacheSyncTimeout);
        }

        self.transition(ControllerState::Running);
        let mut pool = JoinSet::new();
        for id in 0..workers.max(1) {
            let worker = Worker {
                id,
                controller: self.name.clone(),
                queue: self.queue.clone(),
                reconciler: Arc::clone(&self.reconciler),
            };
            pool.spawn(worker.run());
        }

        stop.cancelled().await;
        self.transition(ControllerState::ShuttingDown);
        self.queue.shut_down();
        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                event!(
                    Level::ERROR,
                    controller = %self.name,
                    err = %err,
                    "Worker exited abnormally."
                );
            }
        }

        self.transition(ControllerState::Stopped);
        event!(Level::INFO, controller = %self.name, "Shutting down {}.", self.name);
        Ok(())
    }

    async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> bool {
        let synced = || self.cache_syncs.iter().all(|synced| synced());
        if synced() {
            return true;
        }
        event!(
            Level::INFO,
            controller = %self.name,
            caches = self.cache_syncs.len(),
            "Waiting for caches to sync."
        );
        let mut poll =
            tokio::time::interval(self.config.cache_sync_poll.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                () = stop.cancelled() => return synced(),
                _ = poll.tick() => {
                    if synced() {
                        event!(Level::INFO, controller = %self.name, "Caches are synced.");
                        return true;
                    }
                }
            }
        }
    }
}

struct Worker<K, R> {
    id: usize,
    controller: String,
    queue: WorkQueue<K>,
    reconciler: Arc<R>,
}

impl<K, R> Worker<K, R>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    R: Reconciler<K>,
{
    async fn run(self) {
        while self.process_next_work_item().await {}
        event!(
            Level::DEBUG,
            controller = %self.controller,
            worker = self.id,
            "Worker stopped."
        );
    }

    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => {
                self.queue.forget(&key);
                event!(
                    Level::DEBUG,
                    controller = %self.controller,
                    worker = self.id,
                    key = ?key,
                    "Reconciliation successful."
                );
            }
            Ok(Err(err)) => {
                event!(
                    Level::ERROR,
                    controller = %self.controller,
                    worker = self.id,
                    key = ?key,
                    err = %err,
                    retries = self.queue.num_requeues(&key),
                    "{:?} failed with: {}",
                    key,
                    err
                );
                self.queue.add_rate_limited(key.clone());
            }
            Err(panic) => {
                event!(
                    Level::ERROR,
                    controller = %self.controller,
                    worker = self.id,
                    key = ?key,
                    panic = panic_message(&*panic),
                    "Reconciler panicked."
                );
                self.queue.add_rate_limited(key.clone());
            }
        }
        self.queue.done(&key);
        true
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use crate::coalesce::ReconciliationTarget;
    use crate::queue::ExponentialFailureRateLimiter;

    const KEY: ReconciliationTarget = ReconciliationTarget::Singleton;

    /// Fails the first `failures` calls, panics on call `panic_on`.
    #[derive(Default)]
    struct Scripted {
        calls: AtomicUsize,
        failures: usize,
        panic_on: Option<usize>,
        in_flight: AtomicUsize,
        overlapped: AtomicBool,
        hold: Option<Arc<Notify>>,
    }

    #[async_trait::async_trait]
    impl Reconciler<ReconciliationTarget> for Scripted {
        async fn reconcile(&self, _key: &ReconciliationTarget) -> Result<(), Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.panic_on == Some(call) {
                panic!("scripted panic");
            }
            if call < self.failures {
                return Err(Error::UnknownState("bogus".into()));
            }
            Ok(())
        }
    }

    fn queue() -> WorkQueue<ReconciliationTarget> {
        WorkQueue::new(
            "test",
            ExponentialFailureRateLimiter::new(Duration::from_millis(10), Duration::from_secs(1)),
        )
    }

    fn controller(
        reconciler: Scripted,
        cache_syncs: Vec<InformerSynced>,
    ) -> Arc<Controller<ReconciliationTarget, Scripted>> {
        Arc::new(Controller::new(
            ControllerConfig::default().name("test"),
            reconciler,
            queue(),
            cache_syncs,
        ))
    }

    async fn wait_for_calls(controller: &Controller<ReconciliationTarget, Scripted>, calls: usize) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while controller.reconciler().calls.load(Ordering::SeqCst) < calls {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_retried_with_backoff() {
        let controller = controller(
            Scripted {
                failures: 3,
                ..Scripted::default()
            },
            Vec::new(),
        );
        let stop = CancellationToken::new();
        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            let stop = stop.clone();
            async move { controller.run(1, stop).await }
        });

        controller.queue().add(KEY);
        wait_for_calls(&controller, 4).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(controller.queue().num_requeues(&KEY), 0);

        stop.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(*controller.state().borrow(), ControllerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn panics_do_not_kill_workers() {
        let controller = controller(
            Scripted {
                panic_on: Some(0),
                ..Scripted::default()
            },
            Vec::new(),
        );
        let stop = CancellationToken::new();
        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            let stop = stop.clone();
            async move { controller.run(1, stop).await }
        });

        controller.queue().add(KEY);
        wait_for_calls(&controller, 2).await;

        stop.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn one_key_is_never_reconciled_concurrently() {
        let hold = Arc::new(Notify::new());
        let controller = controller(
            Scripted {
                hold: Some(Arc::clone(&hold)),
                ..Scripted::default()
            },
            Vec::new(),
        );
        let stop = CancellationToken::new();
        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            let stop = stop.clone();
            async move { controller.run(4, stop).await }
        });

        controller.queue().add(KEY);
        wait_for_calls(&controller, 1).await;
        controller.queue().add(KEY);
        controller.queue().add(KEY);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.reconciler().calls.load(Ordering::SeqCst), 1);

        hold.notify_one();
        wait_for_calls(&controller, 2).await;
        hold.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.reconciler().calls.load(Ordering::SeqCst), 2);
        assert!(!controller.reconciler().overlapped.load(Ordering::SeqCst));

        stop.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_caches_before_starting_workers() {
        let synced = Arc::new(AtomicBool::new(false));
        let predicate: InformerSynced = {
            let synced = Arc::clone(&synced);
            Arc::new(move || synced.load(Ordering::SeqCst))
        };
        let controller = controller(Scripted::default(), vec![predicate]);
        let mut state = controller.state();
        let stop = CancellationToken::new();
        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            let stop = stop.clone();
            async move { controller.run(1, stop).await }
        });

        controller.queue().add(KEY);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*state.borrow_and_update(), ControllerState::WaitingForCacheSync);
        assert_eq!(controller.reconciler().calls.load(Ordering::SeqCst), 0);

        synced.store(true, Ordering::SeqCst);
        wait_for_calls(&controller, 1).await;
        assert_eq!(*state.borrow_and_update(), ControllerState::Running);

        stop.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unsynced_caches_abort_startup() {
        let never: InformerSynced = Arc::new(|| false);
        let controller = controller(Scripted::default(), vec![never]);
        let stop = CancellationToken::new();
        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            let stop = stop.clone();
            async move { controller.run(1, stop).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        stop.cancel();
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::CacheSyncTimeout));
        assert!(controller.queue().is_shutting_down());
        assert_eq!(*controller.state().borrow(), ControllerState::Stopped);
        assert_eq!(controller.reconciler().calls.load(Ordering::SeqCst), 0);
    }
}
