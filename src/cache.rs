//! Watch and cache remote resources.
//!
//! An [`Informer`] consumes a feed of [`FeedEvent`]s, keeps a local
//! [`Store`] current, and tells every subscribed [`EventHandler`] what
//! changed. Reads from the store may lag the authoritative copy.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use kube::{Resource, ResourceExt};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

/// Anything the cache can hold: a kubernetes resource with a static kind.
pub trait Object: Resource<DynamicType = ()> + Clone + fmt::Debug + Send + Sync + 'static {}

impl<K> Object for K where K: Resource<DynamicType = ()> + Clone + fmt::Debug + Send + Sync + 'static
{}

/// Identity of a cached object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// One item from a watch feed.
#[derive(Debug, Clone)]
pub enum FeedEvent<K> {
    /// An object was created or modified.
    Applied(K),
    /// An object was deleted.
    Deleted(K),
    /// The feed relisted. Holds every object currently in scope.
    Restarted(Vec<K>),
}

/// A change delivered to subscribers.
#[derive(Debug)]
pub enum Change<'a, K> {
    Added(&'a K),
    Updated { old: &'a K, new: &'a K },
    Deleted(&'a K),
}

impl<K> Clone for Change<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Change<'_, K> {}

/// Receives changes from an [`Informer`]. Called on the informer's task, so
/// implementations must not block.
pub trait EventHandler<K>: Send + Sync {
    fn on_change(&self, change: Change<'_, K>);
}

impl<K, F> EventHandler<K> for F
where
    F: Fn(Change<'_, K>) + Send + Sync,
{
    fn on_change(&self, change: Change<'_, K>) {
        self(change)
    }
}

/// Predicate reporting whether a cache has completed its initial list.
pub type InformerSynced = Arc<dyn Fn() -> bool + Send + Sync>;

/// Read handle to an informer's local cache.
pub struct Store<K> {
    objects: Arc<RwLock<HashMap<ObjectKey, Arc<K>>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
        }
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K> Store<K> {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<ObjectKey, Arc<K>>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ObjectKey, Arc<K>>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the most recently observed version of the object, if any.
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.read().get(&ObjectKey::new(namespace, name)).cloned()
    }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().get(key).cloned()
    }

    /// A snapshot of every cached object.
    pub fn state(&self) -> Vec<Arc<K>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Mirrors a watch feed into a [`Store`] and fans changes out to handlers.
pub struct Informer<K> {
    store: Store<K>,
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler<K>>>>>,
    synced: Arc<AtomicBool>,
    resync_period: Duration,
}

impl<K: Object> Informer<K> {
    /// A zero `resync_period` disables periodic resync.
    pub fn new(resync_period: Duration) -> Self {
        Self {
            store: Store::default(),
            handlers: Arc::new(RwLock::new(Vec::new())),
            synced: Arc::new(AtomicBool::new(false)),
            resync_period,
        }
    }

    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Registers `handler`. Objects already in the cache are replayed to it
    /// as additions.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler<K>>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        for obj in self.store.state() {
            handler.on_change(Change::Added(&obj));
        }
        handlers.push(handler);
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// A predicate for [`Controller::new`](crate::Controller::new).
    pub fn synced(&self) -> InformerSynced {
        let synced = Arc::clone(&self.synced);
        Arc::new(move || synced.load(Ordering::Acquire))
    }

    /// Consumes `feed` until it ends or `stop` fires.
    pub async fn run<S>(self, feed: S, stop: CancellationToken)
    where
        S: Stream<Item = FeedEvent<K>> + Send,
    {
        let kind = K::kind(&());
        let mut resync = (!self.resync_period.is_zero()).then(|| {
            let mut interval = tokio::time::interval_at(
                Instant::now() + self.resync_period,
                self.resync_period,
            );
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        futures::pin_mut!(feed);
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                event = feed.next() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        event!(
                            Level::WARN,
                            kind = %kind,
                            synced = self.has_synced(),
                            "Watch feed for {} ended.",
                            kind
                        );
                        break;
                    }
                },
                () = tick(&mut resync) => self.resync(),
            }
        }
    }

    fn notify(&self, change: Change<'_, K>) {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        for handler in handlers.iter() {
            handler.on_change(change);
        }
    }

    fn handle(&self, event: FeedEvent<K>) {
        match event {
            FeedEvent::Applied(obj) => {
                let obj = Arc::new(obj);
                let old = self.store.write().insert(ObjectKey::of(&*obj), Arc::clone(&obj));
                match old {
                    Some(old) => self.notify(Change::Updated {
                        old: &old,
                        new: &obj,
                    }),
                    None => self.notify(Change::Added(&obj)),
                }
            }
            FeedEvent::Deleted(obj) => {
                let old = self.store.write().remove(&ObjectKey::of(&obj));
                let last = old.unwrap_or_else(|| Arc::new(obj));
                self.notify(Change::Deleted(&last));
            }
            FeedEvent::Restarted(objs) => {
                let fresh: HashMap<ObjectKey, Arc<K>> = objs
                    .into_iter()
                    .map(|obj| (ObjectKey::of(&obj), Arc::new(obj)))
                    .collect();
                let previous = std::mem::replace(&mut *self.store.write(), fresh.clone());
                for (key, obj) in &fresh {
                    match previous.get(key) {
                        Some(old) => self.notify(Change::Updated { old, new: obj }),
                        None => self.notify(Change::Added(obj)),
                    }
                }
                for (key, old) in &previous {
                    if !fresh.contains_key(key) {
                        self.notify(Change::Deleted(old));
                    }
                }
                if !self.synced.swap(true, Ordering::AcqRel) {
                    event!(
                        Level::INFO,
                        kind = %K::kind(&()),
                        objects = fresh.len(),
                        "Initial list of {} complete.",
                        K::kind(&())
                    );
                }
            }
        }
    }

    fn resync(&self) {
        let objects = self.store.state();
        event!(
            Level::DEBUG,
            kind = %K::kind(&()),
            objects = objects.len(),
            "Resyncing cached objects."
        );
        for obj in &objects {
            self.notify(Change::Updated { old: obj, new: obj });
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}
