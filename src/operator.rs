//! An operator for one singleton resource.
//!
//! The operator is configured through a ConfigMap named [`RESOURCE_NAME`] in
//! [`TARGET_NAMESPACE`], whose data holds both the spec (`managementState`,
//! `version`, `value`) and the status (`taskSummary`, `currentVersion`). It
//! owns a Secret of the same name whose content is derived from the spec.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::stream::Stream;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use semver::Version;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::apply::apply;
use crate::cache::{EventHandler, FeedEvent, Informer};
use crate::client::{ObjectClient, Timed};
use crate::coalesce::{Coalescer, ReconciliationTarget};
use crate::config::ControllerConfig;
use crate::controller::{Controller, Reconciler};
use crate::error::Error;
use crate::queue::WorkQueue;
use crate::version::{parse_version, VersionRange};

pub const TARGET_NAMESPACE: &str = "example-operator";
pub const RESOURCE_NAME: &str = "instance";

pub const MANAGEMENT_STATE_KEY: &str = "managementState";
pub const VERSION_KEY: &str = "version";
pub const VALUE_KEY: &str = "value";
pub const TASK_SUMMARY_KEY: &str = "taskSummary";
pub const CURRENT_VERSION_KEY: &str = "currentVersion";

/// Summary recorded when the versions fall outside every known migration.
pub const UNRECOGNIZED_SUMMARY: &str = "unrecognized";

/// Whether and how the operator manages its owned resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementState {
    Managed,
    Unmanaged,
    Removed,
    Unknown(String),
}

impl From<&str> for ManagementState {
    fn from(state: &str) -> Self {
        match state {
            "Managed" => ManagementState::Managed,
            "Unmanaged" => ManagementState::Unmanaged,
            "Removed" => ManagementState::Removed,
            other => ManagementState::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for ManagementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagementState::Managed => f.write_str("Managed"),
            ManagementState::Unmanaged => f.write_str("Unmanaged"),
            ManagementState::Removed => f.write_str("Removed"),
            ManagementState::Unknown(state) => f.write_str(state),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSpec {
    pub management_state: ManagementState,
    pub version: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorStatus {
    pub task_summary: Option<String>,
    pub current_version: Option<String>,
}

/// Typed view of the operator's ConfigMap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorRecord {
    pub spec: OperatorSpec,
    pub status: OperatorStatus,
}

impl OperatorRecord {
    pub fn from_config_map(config: &ConfigMap) -> Self {
        let empty = BTreeMap::new();
        let data = config.data.as_ref().unwrap_or(&empty);
        let field = |key: &str| data.get(key).cloned().unwrap_or_default();
        let optional = |key: &str| data.get(key).filter(|value| !value.is_empty()).cloned();
        Self {
            spec: OperatorSpec {
                management_state: ManagementState::from(field(MANAGEMENT_STATE_KEY).as_str()),
                version: field(VERSION_KEY),
                value: field(VALUE_KEY),
            },
            status: OperatorStatus {
                task_summary: optional(TASK_SUMMARY_KEY),
                current_version: optional(CURRENT_VERSION_KEY),
            },
        }
    }
}

impl OperatorStatus {
    /// Writes the status fields into `config`, leaving other keys alone.
    pub fn write_to(&self, config: &mut ConfigMap) {
        let data = config.data.get_or_insert_with(BTreeMap::new);
        for (key, value) in [
            (TASK_SUMMARY_KEY, &self.task_summary),
            (CURRENT_VERSION_KEY, &self.current_version),
        ] {
            match value {
                Some(value) => {
                    data.insert(key.to_owned(), value.clone());
                }
                None => {
                    data.remove(key);
                }
            }
        }
    }
}

/// The Secret the operator maintains for `spec`.
pub fn owned_secret(spec: &OperatorSpec) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(RESOURCE_NAME.to_owned()),
            namespace: Some(TARGET_NAMESPACE.to_owned()),
            ..ObjectMeta::default()
        },
        string_data: Some([(spec.value.clone(), spec.version.clone())].into()),
        ..Secret::default()
    }
}

/// The only migration window the operator acts in.
pub const MIGRATION_WINDOW: VersionRange =
    VersionRange::from_ordered(Version::new(3, 10, 0), Version::new(3, 10, 1));

/// Reconciles the singleton: reads the operator ConfigMap, maintains the
/// owned Secret, and records progress back into the ConfigMap.
pub struct ExampleOperator<C, S> {
    config_maps: C,
    secrets: S,
    range: VersionRange,
}

impl<C, S> ExampleOperator<C, S>
where
    C: ObjectClient<ConfigMap>,
    S: ObjectClient<Secret>,
{
    pub fn new(config_maps: C, secrets: S) -> Self {
        Self {
            config_maps,
            secrets,
            range: MIGRATION_WINDOW,
        }
    }

    pub fn config_maps(&self) -> &C {
        &self.config_maps
    }

    pub fn secrets(&self) -> &S {
        &self.secrets
    }

    /// One level-triggered pass. Everything is derived from a fresh read of
    /// the ConfigMap.
    pub async fn sync(&self) -> Result<(), Error> {
        let config = self.config_maps.get(TARGET_NAMESPACE, RESOURCE_NAME).await?;
        let record = OperatorRecord::from_config_map(&config);

        match &record.spec.management_state {
            ManagementState::Managed => {}
            ManagementState::Unmanaged => return Ok(()),
            ManagementState::Removed => return self.remove_owned().await,
            // TODO: record a failing condition in the status once the status
            // record has somewhere to put one.
            ManagementState::Unknown(state) => return Err(Error::UnknownState(state.clone())),
        }

        let observed = record
            .status
            .current_version
            .as_deref()
            .and_then(|version| match parse_version(version) {
                Ok(version) => Some(version),
                Err(err) => {
                    event!(
                        Level::WARN,
                        err = %err,
                        "Ignoring unparseable current version."
                    );
                    None
                }
            });
        let desired = parse_version(&record.spec.version)?;

        let mut status = record.status.clone();
        let mut results = Vec::with_capacity(2);
        if self.range.contains_or_empty(observed.as_ref()) && self.range.contains(&desired) {
            let applied = apply(&self.secrets, &owned_secret(&record.spec)).await;
            if applied.is_ok() {
                status.task_summary = Some(format!("sync-{}", self.range));
                status.current_version = Some(desired.to_string());
            }
            results.push(applied.map(|_| ()));
        } else {
            status.task_summary = Some(UNRECOGNIZED_SUMMARY.to_owned());
        }

        let mut out = config;
        status.write_to(&mut out);
        results.push(apply(&self.config_maps, &out).await.map(|_| ()));

        Error::aggregate(results)
    }

    async fn remove_owned(&self) -> Result<(), Error> {
        match self.secrets.delete(TARGET_NAMESPACE, RESOURCE_NAME).await {
            Err(err) if err.is_not_found() => Ok(()),
            result => result,
        }
    }
}

#[async_trait::async_trait]
impl<C, S> Reconciler<ReconciliationTarget> for ExampleOperator<C, S>
where
    C: ObjectClient<ConfigMap> + 'static,
    S: ObjectClient<Secret> + 'static,
{
    async fn reconcile(&self, _target: &ReconciliationTarget) -> Result<(), Error> {
        self.sync().await
    }
}

/// The operator assembled: one informer per watched collection, both feeding
/// a single coalescer, and a controller running [`ExampleOperator`].
pub struct Operator<C, S> {
    config: ControllerConfig,
    controller: Controller<ReconciliationTarget, ExampleOperator<Timed<C>, Timed<S>>>,
    config_maps: Informer<ConfigMap>,
    secrets: Informer<Secret>,
}

impl<C, S> Operator<C, S>
where
    C: ObjectClient<ConfigMap> + 'static,
    S: ObjectClient<Secret> + 'static,
{
    pub fn new(config_maps: C, secrets: S, config: ControllerConfig) -> Self {
        let queue = WorkQueue::from_config(&config);
        let coalescer = Arc::new(Coalescer::new(queue.clone(), ReconciliationTarget::Singleton));

        let config_map_informer = Informer::new(config.resync_period);
        let secret_informer = Informer::new(config.resync_period);
        let shared = Arc::clone(&coalescer);
        let config_map_handler: Arc<dyn EventHandler<ConfigMap>> = shared;
        let secret_handler: Arc<dyn EventHandler<Secret>> = coalescer;
        config_map_informer.subscribe(config_map_handler);
        secret_informer.subscribe(secret_handler);

        let reconciler = ExampleOperator::new(
            Timed::new(config_maps, config.call_timeout),
            Timed::new(secrets, config.call_timeout),
        );
        let controller = Controller::new(
            config.clone(),
            reconciler,
            queue,
            vec![config_map_informer.synced(), secret_informer.synced()],
        );
        Self {
            config,
            controller,
            config_maps: config_map_informer,
            secrets: secret_informer,
        }
    }

    pub fn controller(
        &self,
    ) -> &Controller<ReconciliationTarget, ExampleOperator<Timed<C>, Timed<S>>> {
        &self.controller
    }

    /// Runs the informers and the controller until `stop` fires. Fails with
    /// [`Error::CacheSyncTimeout`] if the feeds never complete their initial
    /// list.
    pub async fn run<F, G>(
        self,
        config_map_feed: F,
        secret_feed: G,
        stop: CancellationToken,
    ) -> Result<(), Error>
    where
        F: Stream<Item = FeedEvent<ConfigMap>> + Send + 'static,
        G: Stream<Item = FeedEvent<Secret>> + Send + 'static,
    {
        let Self {
            config,
            controller,
            config_maps,
            secrets,
        } = self;
        let informers = stop.child_token();
        let config_map_task = tokio::spawn(config_maps.run(config_map_feed, informers.clone()));
        let secret_task = tokio::spawn(secrets.run(secret_feed, informers.clone()));

        let result = controller.run(config.workers, stop).await;

        informers.cancel();
        for task in [config_map_task, secret_task] {
            if let Err(err) = task.await {
                event!(
                    Level::ERROR,
                    controller = %config.name,
                    err = %err,
                    "Informer exited abnormally."
                );
            }
        }
        result
    }
}
