//! metrics.k8s.io usage snapshots.
//!
//! The metrics API is an optional add-on, so reads are best-effort: any
//! failure other than an authentication failure degrades to an empty map.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::ListParams;
use kube::core::{ClusterResourceScope, NamespaceResourceScope};
use kube::{Api, Client, Resource};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::gateway::Gateway;
use crate::quantity::{parse_cpu, parse_memory};

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct NodeMetrics {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub window: String,
    #[serde(default)]
    pub usage: BTreeMap<String, Quantity>,
}

impl Resource for NodeMetrics {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "NodeMetrics".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        "metrics.k8s.io".into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        "v1beta1".into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "nodes".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ContainerMetrics {
    pub name: String,
    #[serde(default)]
    pub usage: BTreeMap<String, Quantity>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct PodMetrics {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub window: String,
    #[serde(default)]
    pub containers: Vec<ContainerMetrics>,
}

impl Resource for PodMetrics {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "PodMetrics".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        "metrics.k8s.io".into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        "v1beta1".into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "pods".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Observed usage in millicores and bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub cpu_millicores: f64,
    pub memory_bytes: f64,
}

impl Usage {
    fn from_map(map: &BTreeMap<String, Quantity>) -> Self {
        Usage {
            cpu_millicores: parse_cpu(map.get("cpu").map(|q| q.0.as_str())),
            memory_bytes: map.get("memory").map(|q| parse_memory(&q.0)).unwrap_or(0.0),
        }
    }
}

/// Which usage snapshot a kind merges into its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsKind {
    Pods,
    Nodes,
}

/// Usage keyed by `namespace/name` for pods and by name for nodes.
pub type UsageMap = HashMap<String, Usage>;

pub fn pod_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

pub async fn list_pod_usage(client: Client, namespace: Option<&str>) -> Result<UsageMap> {
    let api: Api<PodMetrics> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let list = api.list(&ListParams::default()).await?;
    Ok(list
        .items
        .into_iter()
        .map(|m| {
            let usage = m
                .containers
                .iter()
                .map(|c| Usage::from_map(&c.usage))
                .fold(Usage::default(), |acc, u| Usage {
                    cpu_millicores: acc.cpu_millicores + u.cpu_millicores,
                    memory_bytes: acc.memory_bytes + u.memory_bytes,
                });
            let key = pod_key(
                m.metadata.namespace.as_deref().unwrap_or_default(),
                m.metadata.name.as_deref().unwrap_or_default(),
            );
            (key, usage)
        })
        .collect())
}

pub async fn list_node_usage(client: Client) -> Result<UsageMap> {
    let api: Api<NodeMetrics> = Api::all(client);
    let list = api.list(&ListParams::default()).await?;
    Ok(list
        .items
        .into_iter()
        .filter_map(|m| {
            let name = m.metadata.name.clone()?;
            Some((name, Usage::from_map(&m.usage)))
        })
        .collect())
}

/// Swallows a metrics failure unless it is an authentication failure.
pub fn best_effort(result: Result<UsageMap>) -> Result<UsageMap> {
    match result {
        Ok(map) => Ok(map),
        Err(e) if e.is_auth_expired() => Err(e),
        Err(e) => {
            log::debug!("metrics: unavailable, continuing without usage: {e}");
            Ok(UsageMap::new())
        }
    }
}

/// Fetches a usage snapshot through the gateway, best-effort.
pub async fn fetch_usage(
    gateway: &Gateway,
    kind: MetricsKind,
    namespace: Option<&str>,
) -> Result<UsageMap> {
    let namespace = namespace.map(str::to_string);
    let result = gateway
        .call(|clients| {
            let namespace = namespace.clone();
            async move {
                match kind {
                    MetricsKind::Pods => {
                        list_pod_usage(clients.client(), namespace.as_deref()).await
                    }
                    MetricsKind::Nodes => list_node_usage(clients.client()).await,
                }
            }
        })
        .await;
    best_effort(result)
}
