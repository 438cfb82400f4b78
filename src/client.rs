//! Typed read/write access to the authoritative store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::{Object, ObjectKey};
use crate::error::Error;

pub mod memory;

/// Reads and writes objects of one kind.
///
/// Implementations report a missing object as [`Error::NotFound`] and a
/// write that lost a race as [`Error::Conflict`].
#[async_trait]
pub trait ObjectClient<K: Object>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error>;

    async fn create(&self, obj: &K) -> Result<K, Error>;

    /// Replaces an existing object. Fails with a conflict when `obj` carries
    /// a stale resource version.
    async fn update(&self, obj: &K) -> Result<K, Error>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

#[async_trait]
impl<K, C> ObjectClient<K> for Arc<C>
where
    K: Object,
    C: ObjectClient<K> + ?Sized,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error> {
        (**self).get(namespace, name).await
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        (**self).create(obj).await
    }

    async fn update(&self, obj: &K) -> Result<K, Error> {
        (**self).update(obj).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        (**self).delete(namespace, name).await
    }
}

/// Bounds every call on the wrapped client by a fixed timeout.
#[derive(Debug, Clone)]
pub struct Timed<C> {
    inner: C,
    timeout: Duration,
}

impl<C> Timed<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    async fn bounded<K, T, F>(&self, verb: &'static str, key: ObjectKey, call: F) -> Result<T, Error>
    where
        K: Object,
        F: std::future::Future<Output = Result<T, Error>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout {
                    verb,
                    kind: K::kind(&()).into_owned(),
                    key,
                    after: self.timeout,
                })
            })
    }
}

#[async_trait]
impl<K, C> ObjectClient<K> for Timed<C>
where
    K: Object,
    C: ObjectClient<K>,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error> {
        let key = ObjectKey::new(namespace, name);
        self.bounded::<K, _, _>("get", key, self.inner.get(namespace, name))
            .await
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        self.bounded::<K, _, _>("create", ObjectKey::of(obj), self.inner.create(obj))
            .await
    }

    async fn update(&self, obj: &K) -> Result<K, Error> {
        self.bounded::<K, _, _>("update", ObjectKey::of(obj), self.inner.update(obj))
            .await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let key = ObjectKey::new(namespace, name);
        self.bounded::<K, _, _>("delete", key, self.inner.delete(namespace, name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use k8s_openapi::api::core::v1::Secret;

    struct Hung;

    #[async_trait]
    impl ObjectClient<Secret> for Hung {
        async fn get(&self, _: &str, _: &str) -> Result<Secret, Error> {
            futures::future::pending().await
        }

        async fn create(&self, obj: &Secret) -> Result<Secret, Error> {
            Ok(obj.clone())
        }

        async fn update(&self, obj: &Secret) -> Result<Secret, Error> {
            Ok(obj.clone())
        }

        async fn delete(&self, _: &str, _: &str) -> Result<(), Error> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_calls_time_out() {
        let client = Timed::new(Hung, Duration::from_secs(30));
        let err = ObjectClient::<Secret>::get(&client, "ns", "name")
            .await
            .unwrap_err();
        match err {
            Error::Timeout {
                verb, kind, key, ..
            } => {
                assert_eq!(verb, "get");
                assert_eq!(kind, "Secret");
                assert_eq!(key, ObjectKey::new("ns", "name"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(ObjectClient::<Secret>::create(&client, &Secret::default())
            .await
            .is_ok());
    }
}
