//! Idempotent create-or-update of owned resources.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tracing::{event, Level};

use crate::cache::{Object, ObjectKey};
use crate::client::ObjectClient;
use crate::error::Error;

/// A resource kind the applier knows how to compare and merge.
pub trait Apply: Object {
    /// The form the store holds after `self` is written.
    fn normalized(&self) -> Self {
        self.clone()
    }

    /// Copies the fields `self` declares into `existing`, returning whether
    /// `existing` changed.
    fn merge_into(&self, existing: &mut Self) -> bool;
}

/// Result of [`apply`].
#[derive(Debug, Clone)]
pub struct Applied<K> {
    /// The object as stored after the call.
    pub current: K,
    /// Whether a create or update was issued.
    pub changed: bool,
}

/// Creates `desired` if it does not exist, otherwise updates the live object
/// only when it differs from `desired`.
///
/// When `desired` carries a resource version, the update is made against
/// that version, so a `desired` built from a read that has since gone stale
/// fails with [`Error::Conflict`] instead of overwriting the newer object.
pub async fn apply<K, C>(client: &C, desired: &K) -> Result<Applied<K>, Error>
where
    K: Apply,
    C: ObjectClient<K> + ?Sized,
{
    let desired = desired.normalized();
    let key = ObjectKey::of(&desired);
    let namespace = key.namespace.as_deref().unwrap_or_default();
    match client.get(namespace, &key.name).await {
        Ok(mut existing) => {
            if !desired.merge_into(&mut existing) {
                return Ok(Applied {
                    current: existing,
                    changed: false,
                });
            }
            if let Some(version) = &desired.meta().resource_version {
                existing.meta_mut().resource_version = Some(version.clone());
            }
            let current = client.update(&existing).await?;
            event!(
                Level::DEBUG,
                kind = %K::kind(&()),
                resource = %key,
                "Updated {}.",
                K::kind(&())
            );
            Ok(Applied {
                current,
                changed: true,
            })
        }
        Err(err) if err.is_not_found() => {
            let current = client.create(&desired).await?;
            event!(
                Level::DEBUG,
                kind = %K::kind(&()),
                resource = %key,
                "Created {}.",
                K::kind(&())
            );
            Ok(Applied {
                current,
                changed: true,
            })
        }
        Err(err) => Err(err),
    }
}

// A missing map and an empty one are the same.
fn same_map<V: PartialEq>(a: &Option<BTreeMap<String, V>>, b: &Option<BTreeMap<String, V>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (Some(map), None) | (None, Some(map)) => map.is_empty(),
        (None, None) => true,
    }
}

fn merge_map(
    existing: &mut Option<BTreeMap<String, String>>,
    required: &Option<BTreeMap<String, String>>,
) -> bool {
    let Some(required) = required.as_ref().filter(|map| !map.is_empty()) else {
        return false;
    };
    let existing = existing.get_or_insert_with(BTreeMap::new);
    let mut modified = false;
    for (key, value) in required {
        if existing.get(key) != Some(value) {
            existing.insert(key.clone(), value.clone());
            modified = true;
        }
    }
    modified
}

/// Merges labels and annotations. Keys present only on the live object are
/// kept.
fn merge_metadata(required: &ObjectMeta, existing: &mut ObjectMeta) -> bool {
    let labels = merge_map(&mut existing.labels, &required.labels);
    let annotations = merge_map(&mut existing.annotations, &required.annotations);
    labels || annotations
}

impl Apply for ConfigMap {
    fn merge_into(&self, existing: &mut Self) -> bool {
        let mut modified = merge_metadata(&self.metadata, &mut existing.metadata);
        if !same_map(&existing.data, &self.data) {
            existing.data = self.data.clone();
            modified = true;
        }
        if !same_map(&existing.binary_data, &self.binary_data) {
            existing.binary_data = self.binary_data.clone();
            modified = true;
        }
        modified
    }
}

impl Apply for Secret {
    /// Folds `string_data` into `data`, as the API server does on write.
    fn normalized(&self) -> Self {
        let mut secret = self.clone();
        if let Some(string_data) = secret.string_data.take() {
            let data = secret.data.get_or_insert_with(BTreeMap::new);
            for (key, value) in string_data {
                data.insert(key, ByteString(value.into_bytes()));
            }
        }
        secret
    }

    fn merge_into(&self, existing: &mut Self) -> bool {
        let mut modified = merge_metadata(&self.metadata, &mut existing.metadata);
        if !same_map(&existing.data, &self.data) {
            existing.data = self.data.clone();
            modified = true;
        }
        if self.type_.is_some() && existing.type_ != self.type_ {
            existing.type_ = self.type_.clone();
            modified = true;
        }
        modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::client::memory::{MemoryClient, Verb};

    fn secret(data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("instance".to_owned()),
                namespace: Some("ns".to_owned()),
                labels: Some([("app".to_owned(), "example".to_owned())].into()),
                ..ObjectMeta::default()
            },
            string_data: Some(
                data.iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
            ),
            ..Secret::default()
        }
    }

    fn verbs<K: Object>(client: &MemoryClient<K>) -> Vec<Verb> {
        client.actions().into_iter().map(|action| action.verb).collect()
    }

    #[tokio::test]
    async fn creates_when_absent() {
        let client = MemoryClient::<Secret>::new();
        let applied = apply(&client, &secret(&[("k1", "v1")])).await.unwrap();
        assert!(applied.changed);
        assert_eq!(verbs(&client), vec![Verb::Get, Verb::Create]);

        let stored = client.object("ns", "instance").unwrap();
        assert!(stored.string_data.is_none());
        assert_eq!(
            stored.data.unwrap().get("k1"),
            Some(&ByteString(b"v1".to_vec()))
        );
    }

    #[tokio::test]
    async fn identical_apply_is_a_no_op() {
        let client = MemoryClient::<Secret>::new();
        apply(&client, &secret(&[("k1", "v1")])).await.unwrap();
        client.clear_actions();

        let applied = apply(&client, &secret(&[("k1", "v1")])).await.unwrap();
        assert!(!applied.changed);
        assert_eq!(verbs(&client), vec![Verb::Get]);
    }

    #[tokio::test]
    async fn updates_only_on_difference() {
        let client = MemoryClient::<Secret>::new();
        apply(&client, &secret(&[("k1", "v1")])).await.unwrap();
        client.clear_actions();

        let applied = apply(&client, &secret(&[("k2", "v2")])).await.unwrap();
        assert!(applied.changed);
        assert_eq!(verbs(&client), vec![Verb::Get, Verb::Update]);
        let data = applied.current.data.unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.contains_key("k2"));
    }

    #[tokio::test]
    async fn foreign_labels_survive() {
        let client = MemoryClient::<ConfigMap>::new();
        let mut live = ConfigMap {
            metadata: ObjectMeta {
                name: Some("instance".to_owned()),
                namespace: Some("ns".to_owned()),
                labels: Some([("owner".to_owned(), "someone".to_owned())].into()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        live = client.insert(live);

        let mut desired = live.clone();
        desired.metadata.labels = Some([("app".to_owned(), "example".to_owned())].into());
        desired.data = Some(BTreeMap::new());
        let applied = apply(&client, &desired).await.unwrap();
        assert!(applied.changed);

        let labels = applied.current.metadata.labels.unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("owner").map(String::as_str), Some("someone"));
    }

    #[tokio::test]
    async fn stale_desired_conflicts_instead_of_overwriting() {
        let client = MemoryClient::<ConfigMap>::new();
        let read = client.insert(ConfigMap {
            metadata: ObjectMeta {
                name: Some("instance".to_owned()),
                namespace: Some("ns".to_owned()),
                ..ObjectMeta::default()
            },
            data: Some([("spec".to_owned(), "old".to_owned())].into()),
            ..ConfigMap::default()
        });
        let mut newer = read.clone();
        newer.data = Some([("spec".to_owned(), "new".to_owned())].into());
        client.insert(newer);

        let mut desired = read;
        desired
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert("status".to_owned(), "done".to_owned());
        let err = apply(&client, &desired).await.unwrap_err();
        assert!(err.is_conflict());

        let live = client.object("ns", "instance").unwrap().data.unwrap();
        assert_eq!(live.get("spec").map(String::as_str), Some("new"));
        assert!(!live.contains_key("status"));
    }

    #[tokio::test]
    async fn get_failures_are_returned() {
        let client = MemoryClient::<ConfigMap>::new();
        client.fail_next(Verb::Get, Error::UnknownState("boom".into()));
        let desired = ConfigMap {
            metadata: ObjectMeta {
                name: Some("instance".to_owned()),
                namespace: Some("ns".to_owned()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        assert!(apply(&client, &desired).await.is_err());
        assert_eq!(verbs(&client), vec![Verb::Get]);
    }

    #[test]
    fn empty_and_missing_maps_compare_equal() {
        assert!(same_map::<String>(&None, &Some(BTreeMap::new())));
        assert!(!same_map(
            &None,
            &Some([("a".to_owned(), "b".to_owned())].into())
        ));
    }
}
