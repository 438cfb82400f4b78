//! Adapters from the kube client to this crate's client and feed interfaces.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, PostParams};
use kube::core::{ErrorResponse, NamespaceResourceScope};
use kube::{Client, Resource, ResourceExt};
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::cache::{FeedEvent, Object, ObjectKey};
use crate::client::ObjectClient;
use crate::config::ControllerConfig;
use crate::error::Error;
use crate::operator::{Operator, RESOURCE_NAME, TARGET_NAMESPACE};

/// Bounds for resources reachable through [`KubeClient`] and [`watch_feed`].
pub trait KubeObject:
    Object + Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned
{
}

impl<K> KubeObject for K where
    K: Object + Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned
{
}

/// An [`ObjectClient`] backed by the Kubernetes API.
pub struct KubeClient<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for KubeClient<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> fmt::Debug for KubeClient<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeClient").finish_non_exhaustive()
    }
}

impl<K: KubeObject> KubeClient<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn api_for(&self, obj: &K) -> Api<K> {
        match obj.meta().namespace.as_deref() {
            Some(namespace) => self.api(namespace),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

fn convert<K: KubeObject>(verb: &'static str, key: ObjectKey, err: kube::Error) -> Error {
    let kind = K::kind(&()).into_owned();
    match err {
        kube::Error::Api(ErrorResponse { code: 404, .. }) => Error::NotFound { kind, key },
        kube::Error::Api(ErrorResponse { code: 409, .. }) => Error::Conflict { kind, key },
        err if verb == "get" => Error::Request {
            kind,
            key,
            source: Box::new(err),
        },
        err => Error::ApplyFailure {
            verb,
            kind,
            key,
            source: Box::new(err),
        },
    }
}

#[async_trait]
impl<K: KubeObject> ObjectClient<K> for KubeClient<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|err| convert::<K>("get", ObjectKey::new(namespace, name), err))
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        self.api_for(obj)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|err| convert::<K>("create", ObjectKey::of(obj), err))
    }

    async fn update(&self, obj: &K) -> Result<K, Error> {
        self.api_for(obj)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(|err| convert::<K>("update", ObjectKey::of(obj), err))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|err| convert::<K>("delete", ObjectKey::new(namespace, name), err))
    }
}

/// Watches `api`, relisting with backoff on errors.
pub fn watch_feed<K: KubeObject>(
    api: Api<K>,
    config: watcher::Config,
) -> impl Stream<Item = FeedEvent<K>> + Send + 'static {
    watcher(api, config)
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(watcher::Event::Applied(obj)) => Some(FeedEvent::Applied(obj)),
                Ok(watcher::Event::Deleted(obj)) => Some(FeedEvent::Deleted(obj)),
                Ok(watcher::Event::Restarted(objs)) => Some(FeedEvent::Restarted(objs)),
                Err(err) => {
                    event!(
                        Level::WARN,
                        kind = %K::kind(&()),
                        err = %err,
                        "Watch failed, retrying."
                    );
                    None
                }
            }
        })
}

/// Watches only the singleton object in the target namespace.
pub fn singleton_feed<K: KubeObject>(
    client: Client,
) -> impl Stream<Item = FeedEvent<K>> + Send + 'static {
    let api = Api::<K>::namespaced(client, TARGET_NAMESPACE);
    let selector = format!("metadata.name={RESOURCE_NAME}");
    watch_feed(api, watcher::Config::default().fields(&selector))
}

/// Runs the operator against a cluster until `stop` fires.
pub async fn run_operator(
    client: Client,
    config: ControllerConfig,
    stop: CancellationToken,
) -> Result<(), Error> {
    let operator = Operator::new(
        KubeClient::<ConfigMap>::new(client.clone()),
        KubeClient::<Secret>::new(client.clone()),
        config,
    );
    operator
        .run(
            singleton_feed::<ConfigMap>(client.clone()),
            singleton_feed::<Secret>(client),
            stop,
        )
        .await
}
