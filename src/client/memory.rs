//! An in-memory object store that behaves like a small API server: writes
//! bump a resource version, stale updates conflict, and every change is
//! published to watch feeds.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast;

use crate::cache::{FeedEvent, Object, ObjectKey};
use crate::client::ObjectClient;
use crate::error::Error;

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Update,
    Delete,
}

/// A call made through [`ObjectClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub verb: Verb,
    pub key: ObjectKey,
}

/// Cloneable handle to a shared in-memory collection of `K`.
pub struct MemoryClient<K> {
    state: Arc<Mutex<State<K>>>,
    events: broadcast::Sender<FeedEvent<K>>,
}

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    actions: Vec<Action>,
    failures: HashMap<Verb, VecDeque<Error>>,
    resource_version: u64,
}

impl<K> Clone for MemoryClient<K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        }
    }
}

impl<K: Object> Default for MemoryClient<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Object> MemoryClient<K> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State {
                objects: BTreeMap::new(),
                actions: Vec::new(),
                failures: HashMap::new(),
                resource_version: 0,
            })),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_found(key: ObjectKey) -> Error {
        Error::NotFound {
            kind: K::kind(&()).into_owned(),
            key,
        }
    }

    fn conflict(key: ObjectKey) -> Error {
        Error::Conflict {
            kind: K::kind(&()).into_owned(),
            key,
        }
    }

    /// Stores `obj` without recording an action, as if another writer had
    /// created or replaced it.
    pub fn insert(&self, obj: K) -> K {
        let mut state = self.state();
        let obj = state.store(obj);
        let _ = self.events.send(FeedEvent::Applied(obj.clone()));
        obj
    }

    /// Removes an object without recording an action.
    pub fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        let mut state = self.state();
        let removed = state.objects.remove(&ObjectKey::new(namespace, name));
        if let Some(obj) = &removed {
            let _ = self.events.send(FeedEvent::Deleted(obj.clone()));
        }
        removed
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.state()
            .objects
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    /// Every call made through [`ObjectClient`] so far, oldest first.
    pub fn actions(&self) -> Vec<Action> {
        self.state().actions.clone()
    }

    pub fn clear_actions(&self) {
        self.state().actions.clear();
    }

    /// Makes the next call with `verb` fail with `err`. Failures queue up.
    pub fn fail_next(&self, verb: Verb, err: Error) {
        self.state().failures.entry(verb).or_default().push_back(err);
    }

    /// A feed that starts with a full list and then follows every change.
    pub fn watch(&self) -> impl Stream<Item = FeedEvent<K>> + Send + 'static {
        let (initial, rx) = {
            let state = self.state();
            let objects: Vec<K> = state.objects.values().cloned().collect();
            (FeedEvent::Restarted(objects), self.events.subscribe())
        };
        let changes = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        stream::once(async move { initial }).chain(changes)
    }

    fn begin(&self, verb: Verb, key: ObjectKey) -> Result<MutexGuard<'_, State<K>>, Error> {
        let mut state = self.state();
        state.actions.push(Action { verb, key });
        match state.failures.get_mut(&verb).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }
}

impl<K: Object> State<K> {
    fn store(&mut self, mut obj: K) -> K {
        self.resource_version += 1;
        obj.meta_mut().resource_version = Some(self.resource_version.to_string());
        self.objects.insert(ObjectKey::of(&obj), obj.clone());
        obj
    }
}

#[async_trait]
impl<K: Object> ObjectClient<K> for MemoryClient<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error> {
        let key = ObjectKey::new(namespace, name);
        let state = self.begin(Verb::Get, key.clone())?;
        state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let key = ObjectKey::of(obj);
        let mut state = self.begin(Verb::Create, key.clone())?;
        if state.objects.contains_key(&key) {
            return Err(Self::conflict(key));
        }
        let created = state.store(obj.clone());
        let _ = self.events.send(FeedEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K, Error> {
        let key = ObjectKey::of(obj);
        let mut state = self.begin(Verb::Update, key.clone())?;
        let Some(existing) = state.objects.get(&key) else {
            return Err(Self::not_found(key));
        };
        let requested = obj.meta().resource_version.as_ref();
        if requested.is_some() && requested != existing.meta().resource_version.as_ref() {
            return Err(Self::conflict(key));
        }
        let updated = state.store(obj.clone());
        let _ = self.events.send(FeedEvent::Applied(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let key = ObjectKey::new(namespace, name);
        let mut state = self.begin(Verb::Delete, key.clone())?;
        let Some(removed) = state.objects.remove(&key) else {
            return Err(Self::not_found(key));
        };
        let _ = self.events.send(FeedEvent::Deleted(removed));
        Ok(())
    }
}
