use std::fmt;
use std::hash::Hash;

use tracing::{event, Level};

use crate::cache::{Change, EventHandler};
use crate::queue::WorkQueue;

/// What a controller reconciles. A controller scoped to one logical
/// resource only ever queues [`ReconciliationTarget::Singleton`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReconciliationTarget {
    Singleton,
}

impl fmt::Display for ReconciliationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconciliationTarget::Singleton => f.write_str("singleton"),
        }
    }
}

/// Turns every change on every collection it is subscribed to into the same
/// queue key.
///
/// No filtering is applied: unrelated field churn still triggers a full
/// reconciliation, so reconcilers fed by a coalescer need to be cheap and
/// idempotent.
pub struct Coalescer<Q> {
    queue: WorkQueue<Q>,
    key: Q,
}

impl<Q> Coalescer<Q>
where
    Q: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(queue: WorkQueue<Q>, key: Q) -> Self {
        Self { queue, key }
    }

    /// Queues the key.
    pub fn notify(&self) {
        self.queue.add(self.key.clone());
    }
}

impl<K, Q> EventHandler<K> for Coalescer<Q>
where
    Q: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    fn on_change(&self, change: Change<'_, K>) {
        let change = match change {
            Change::Added(_) => "add",
            Change::Updated { .. } => "update",
            Change::Deleted(_) => "delete",
        };
        event!(
            Level::TRACE,
            queue = self.queue.name(),
            key = ?self.key,
            change,
            "Queueing reconciliation."
        );
        self.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use k8s_openapi::api::core::v1::{ConfigMap, Secret};

    use crate::queue::ExponentialFailureRateLimiter;

    #[tokio::test]
    async fn every_change_on_every_collection_yields_one_key() {
        let queue = WorkQueue::new(
            "test",
            ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1)),
        );
        let coalescer = Arc::new(Coalescer::new(queue.clone(), ReconciliationTarget::Singleton));
        let config_maps: Arc<dyn EventHandler<ConfigMap>> = Arc::clone(&coalescer) as _;
        let secrets: Arc<dyn EventHandler<Secret>> = Arc::clone(&coalescer) as _;

        let cm = ConfigMap::default();
        let secret = Secret::default();
        config_maps.on_change(Change::Added(&cm));
        config_maps.on_change(Change::Updated { old: &cm, new: &cm });
        secrets.on_change(Change::Deleted(&secret));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(ReconciliationTarget::Singleton));
    }
}
