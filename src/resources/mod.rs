//! One generic service per resource kind.
//!
//! A [`KindDescriptor`] says how to reach a kind and how to project it into
//! a list item; [`ResourceService`] turns that into list, get, manifest,
//! delete and stream operations.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::crd_gate::{CrdGate, OptionalCrd};
use crate::error::{Error, Result};
use crate::gateway::{ClientSet, Gateway};
use crate::metrics::{self, pod_key, MetricsKind, Usage};
use crate::watch::{Subscription, WatchManager};

pub mod kinds;

const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";
const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";

/// Describes one resource kind.
pub trait KindDescriptor: Send + Sync + 'static {
    type Object: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static;
    type Item: Clone + Serialize + Debug + Send + Sync + 'static;

    const KIND: &'static str;
    const NAMESPACED: bool;

    /// The CRD that must be installed before this kind can be used.
    fn optional_crd() -> Option<OptionalCrd> {
        None
    }

    /// An API handle scoped to `namespace`, or to every namespace when
    /// `None`. Cluster-scoped kinds ignore `namespace`.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self::Object>;

    fn list_item(object: &Self::Object) -> Self::Item;

    /// Usage snapshot merged into list items, if any.
    fn metrics() -> Option<MetricsKind> {
        None
    }

    fn apply_usage(_item: &mut Self::Item, _usage: Usage) {}
}

/// Workload kinds that support a rollout restart.
pub trait Restartable: KindDescriptor {}

/// Workload kinds with a replica count.
pub trait Scalable: Restartable {}

/// `namespace/name` for namespaced objects, `name` otherwise. Matches the
/// keys of a usage snapshot.
pub fn object_key<K: Resource>(object: &K) -> String {
    let meta = object.meta();
    let name = meta.name.as_deref().unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(namespace) => pod_key(namespace, name),
        None => name.to_string(),
    }
}

/// Pretty JSON of `object` without server-side bookkeeping.
pub fn clean_manifest<K: Serialize>(object: &K) -> Result<String> {
    let mut value = serde_json::to_value(object)?;
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("managedFields");
        let now_empty = match metadata.get_mut("annotations").and_then(Value::as_object_mut) {
            Some(annotations) => {
                annotations.remove(LAST_APPLIED);
                annotations.is_empty()
            }
            None => false,
        };
        if now_empty {
            metadata.remove("annotations");
        }
    }
    Ok(serde_json::to_string_pretty(&value)?)
}

pub struct ResourceService<D> {
    gateway: Arc<Gateway>,
    crds: Arc<CrdGate>,
    watches: Arc<WatchManager>,
    kind: PhantomData<fn() -> D>,
}

impl<D: KindDescriptor> ResourceService<D> {
    pub fn new(gateway: Arc<Gateway>, crds: Arc<CrdGate>, watches: Arc<WatchManager>) -> Self {
        ResourceService {
            gateway,
            crds,
            watches,
            kind: PhantomData,
        }
    }

    async fn ensure_installed(&self) -> Result<()> {
        match D::optional_crd() {
            Some(crd) => self.crds.ensure(&crd).await,
            None => Ok(()),
        }
    }

    /// Single objects of a namespaced kind default to the context's
    /// namespace.
    fn scope(clients: &ClientSet, namespace: Option<&str>) -> Option<String> {
        if !D::NAMESPACED {
            return None;
        }
        Some(
            namespace
                .unwrap_or_else(|| clients.default_namespace())
                .to_string(),
        )
    }

    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<D::Item>> {
        self.ensure_installed().await?;
        let namespace = namespace.map(str::to_string);
        let objects = self
            .gateway
            .call(|clients| {
                let namespace = namespace.clone();
                async move {
                    let api = D::api(clients.client(), namespace.as_deref());
                    let list = api.list(&ListParams::default()).await?;
                    Ok::<_, Error>(list.items)
                }
            })
            .await?;

        let usage = match D::metrics() {
            Some(kind) => metrics::fetch_usage(&self.gateway, kind, namespace.as_deref()).await?,
            None => Default::default(),
        };
        Ok(objects
            .iter()
            .map(|object| {
                let mut item = D::list_item(object);
                if let Some(u) = usage.get(&object_key(object)) {
                    D::apply_usage(&mut item, *u);
                }
                item
            })
            .collect())
    }

    pub async fn get(&self, namespace: Option<&str>, name: &str) -> Result<D::Object> {
        self.ensure_installed().await?;
        self.gateway
            .call(|clients| async move {
                let scope = Self::scope(&clients, namespace);
                let api = D::api(clients.client(), scope.as_deref());
                Ok::<_, Error>(api.get(name).await?)
            })
            .await
    }

    pub async fn manifest(&self, namespace: Option<&str>, name: &str) -> Result<String> {
        let object = self.get(namespace, name).await?;
        clean_manifest(&object)
    }

    pub async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        self.ensure_installed().await?;
        self.gateway
            .call(|clients| async move {
                let scope = Self::scope(&clients, namespace);
                let api = D::api(clients.client(), scope.as_deref());
                api.delete(name, &DeleteParams::default()).await?;
                log::info!(
                    "resources: deleted {} {}/{name}",
                    D::KIND,
                    scope.as_deref().unwrap_or("-")
                );
                Ok::<_, Error>(())
            })
            .await
    }

    /// Opens a live stream of list items. Fails up front when the kind's
    /// extension is missing; stream failures arrive on the subscription.
    pub async fn stream(
        &self,
        namespace: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Subscription<D::Item>> {
        self.ensure_installed().await?;
        Ok(self
            .watches
            .subscribe::<D>(namespace.map(str::to_string), cancel))
    }

    async fn patch(&self, namespace: &str, name: &str, patch: Value) -> Result<()> {
        self.gateway
            .call(|clients| {
                let patch = patch.clone();
                async move {
                    let api = D::api(clients.client(), Some(namespace));
                    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?;
                    Ok::<_, Error>(())
                }
            })
            .await
    }
}

impl<D: Restartable> ResourceService<D> {
    /// Rollout restart: bumps the pod template's `restartedAt` annotation.
    pub async fn restart(&self, namespace: &str, name: &str) -> Result<()> {
        let mut annotations = serde_json::Map::new();
        annotations.insert(
            RESTARTED_AT.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        let patch = json!({
            "spec": { "template": { "metadata": { "annotations": annotations } } }
        });
        self.patch(namespace, name, patch).await?;
        log::info!("resources: restarted {} {namespace}/{name}", D::KIND);
        Ok(())
    }
}

impl<D: Scalable> ResourceService<D> {
    pub async fn scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        if replicas < 0 {
            return Err(Error::Unsupported {
                kind: D::KIND.to_string(),
                operation: format!("scale to {replicas} replicas"),
            });
        }
        self.patch(namespace, name, json!({ "spec": { "replicas": replicas } }))
            .await?;
        log::info!("resources: scaled {} {namespace}/{name} to {replicas}", D::KIND);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{ConfigMap, Node};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, ObjectMeta};

    use super::kinds::DeploymentKind;
    use super::*;
    use crate::gateway::testing;
    use crate::settings::Settings;

    #[tokio::test]
    async fn negative_scale_is_rejected_before_any_call() {
        let (gateway, connector) = testing::gateway(&["prod"]).await;
        let service: ResourceService<DeploymentKind> = ResourceService::new(
            gateway.clone(),
            Arc::new(CrdGate::new(gateway.clone())),
            Arc::new(WatchManager::new(gateway, &Settings::default())),
        );

        let err = service.scale("default", "api", -1).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported { ref kind, .. } if kind == "Deployment"));
        assert_eq!(connector.connects(), 1);
    }

    #[test]
    fn manifest_strips_bookkeeping() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(
                    [(LAST_APPLIED.to_string(), "{}".to_string())].into_iter().collect(),
                ),
                managed_fields: Some(vec![ManagedFieldsEntry {
                    manager: Some("kubectl".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };

        let manifest = clean_manifest(&cm).unwrap();
        assert!(!manifest.contains("managedFields"));
        assert!(!manifest.contains(LAST_APPLIED));
        assert!(!manifest.contains("annotations"));
        assert!(manifest.contains("\"name\": \"settings\""));
    }

    #[test]
    fn manifest_keeps_other_annotations() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                annotations: Some(
                    [
                        (LAST_APPLIED.to_string(), "{}".to_string()),
                        ("team".to_string(), "platform".to_string()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        let manifest: Value = serde_json::from_str(&clean_manifest(&cm).unwrap()).unwrap();
        assert_eq!(
            manifest["metadata"]["annotations"],
            json!({ "team": "platform" })
        );
    }

    #[test]
    fn object_keys_are_namespace_qualified() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("a".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let node = Node {
            metadata: ObjectMeta {
                name: Some("node-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(object_key(&cm), "ns/a");
        assert_eq!(object_key(&node), "node-1");
    }
}
