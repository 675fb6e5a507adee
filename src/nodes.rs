//! Node listing with blocker analysis, plus cordon, uncordon and drain.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use kube::api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::Api;
use serde::Serialize;
use serde_json::json;

use crate::blockers::{
    analyze_node, autoscaler_blockers, ConstraintTallies, NodeBlocker, NodeFacts, NodePodDetail,
};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::metrics::{self, MetricsKind, UsageMap};
use crate::models::k8s::{age, NodeListItem};
use crate::pools::{aggregate_pools, pool_name, NodePoolSummary};
use crate::quantity::Resources;
use crate::resources::kinds::node_ready;

const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
const SANDBOX_FAILURE: &str = "FailedCreatePodSandBox";
const IP_EXHAUSTION_HINTS: [&str; 4] = [
    "failed to assign an IP address",
    "no IP addresses available",
    "InsufficientFreeAddressesInSubnet",
    "failed to allocate for range",
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInventory {
    pub nodes: Vec<NodeListItem>,
    pub pools: Vec<NodePoolSummary>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainOutcome {
    /// `namespace/name` of every pod the API accepted an eviction for.
    pub evicted: Vec<String>,
    /// Pods that could not be evicted, with the error.
    pub failed: Vec<(String, String)>,
}

/// Cluster-wide networking conditions worth surfacing on every pool.
pub fn networking_warnings(events: &[Event]) -> Vec<String> {
    let exhausted: Vec<&Event> = events
        .iter()
        .filter(|e| e.reason.as_deref() == Some(SANDBOX_FAILURE))
        .filter(|e| {
            e.message
                .as_deref()
                .is_some_and(|m| IP_EXHAUSTION_HINTS.iter().any(|hint| m.contains(hint)))
        })
        .collect();
    if exhausted.is_empty() {
        return Vec::new();
    }
    let occurrences: i32 = exhausted.iter().map(|e| e.count.unwrap_or(1).max(1)).sum();
    let pods: BTreeSet<String> = exhausted
        .iter()
        .filter_map(|e| e.involved_object.name.clone())
        .collect();
    vec![format!(
        "pod IP exhaustion: {occurrences} sandbox failure(s) across {} pod(s)",
        pods.len()
    )]
}

fn pod_capacity(node: &Node) -> usize {
    node.status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get("pods"))
        .and_then(|q| q.0.parse().ok())
        .unwrap_or(0)
}

fn internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())
}

/// Joins the raw listings into analysed node rows and pool rollups.
pub fn build_inventory(
    nodes: &[Node],
    pods: &[Pod],
    usage: &UsageMap,
    events: &[Event],
    warnings: &[String],
) -> NodeInventory {
    let details: Vec<NodePodDetail> = pods.iter().map(NodePodDetail::from_pod).collect();
    let tallies = ConstraintTallies::from_pods(&details);
    let mut by_node: HashMap<&str, Vec<&NodePodDetail>> = HashMap::new();
    for detail in &details {
        if let Some(node) = detail.node_name.as_deref() {
            by_node.entry(node).or_default().push(detail);
        }
    }
    let mut autoscaler = autoscaler_blockers(events);

    let mut items: Vec<NodeListItem> = nodes
        .iter()
        .map(|node| {
            let name = node.metadata.name.clone().unwrap_or_default();
            let labels = node.metadata.labels.clone().unwrap_or_default();
            let taints = node
                .spec
                .as_ref()
                .and_then(|s| s.taints.clone())
                .unwrap_or_default();
            let allocatable = Resources::from_map(
                node.status.as_ref().and_then(|s| s.allocatable.as_ref()),
            );
            let resident = by_node.get(name.as_str()).map(Vec::as_slice).unwrap_or_default();

            let requests = resident.iter().fold(Resources::default(), |acc, p| Resources {
                cpu_millicores: acc.cpu_millicores + p.requests.cpu_millicores,
                memory_bytes: acc.memory_bytes + p.requests.memory_bytes,
            });
            let facts = NodeFacts {
                name: &name,
                labels: &labels,
                taints: &taints,
                allocatable,
            };
            let mut blockers: Vec<NodeBlocker> = autoscaler.remove(&name).into_iter().collect();
            blockers.extend(analyze_node(&facts, resident, &tallies));
            let node_usage = usage.get(&name);

            NodeListItem {
                pool: pool_name(&labels),
                zone: labels.get(ZONE_LABEL).cloned(),
                instance_type: labels.get(INSTANCE_TYPE_LABEL).cloned(),
                status: if node_ready(node) { "Ready" } else { "NotReady" }.to_string(),
                unschedulable: node
                    .spec
                    .as_ref()
                    .and_then(|s| s.unschedulable)
                    .unwrap_or(false),
                age: age(node.metadata.creation_timestamp.as_ref()),
                version: node
                    .status
                    .as_ref()
                    .and_then(|s| s.node_info.as_ref())
                    .map(|i| i.kubelet_version.clone())
                    .unwrap_or_default(),
                internal_ip: internal_ip(node),
                cpu_allocatable: allocatable.cpu_millicores,
                memory_allocatable: allocatable.memory_bytes,
                cpu_requests: requests.cpu_millicores,
                memory_requests: requests.memory_bytes,
                cpu_usage: node_usage.map(|u| u.cpu_millicores),
                memory_usage: node_usage.map(|u| u.memory_bytes),
                pod_count: resident.len(),
                pod_capacity: pod_capacity(node),
                allocated_ips: resident.iter().map(|p| p.pod_ips.len()).sum(),
                blockers,
                name,
            }
        })
        .collect();
    items.sort_by(|a, b| a.name.cmp(&b.name));

    let pools = aggregate_pools(&items, warnings);
    NodeInventory {
        nodes: items,
        pools,
    }
}

pub struct NodeService {
    gateway: Arc<Gateway>,
    drain_grace_period_secs: u32,
}

impl NodeService {
    pub fn new(gateway: Arc<Gateway>, drain_grace_period_secs: u32) -> Self {
        NodeService {
            gateway,
            drain_grace_period_secs,
        }
    }

    async fn list_all<K>(&self, params: ListParams) -> Result<Vec<K>>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        self.gateway
            .call(|clients| {
                let params = params.clone();
                async move {
                    let api: Api<K> = Api::all(clients.client());
                    Ok::<_, Error>(api.list(&params).await?.items)
                }
            })
            .await
    }

    async fn nodes(&self) -> Result<Vec<Node>> {
        self.gateway
            .call(|clients| async move {
                let api: Api<Node> = Api::all(clients.client());
                Ok::<_, Error>(api.list(&ListParams::default()).await?.items)
            })
            .await
    }

    async fn running_pods(&self) -> Result<Vec<Pod>> {
        self.list_all(ListParams::default().fields("status.phase!=Succeeded,status.phase!=Failed"))
            .await
    }

    async fn events(&self, reason: &str) -> Result<Vec<Event>> {
        self.list_all(ListParams::default().fields(&format!("reason={reason}")))
            .await
    }

    async fn warnings(&self) -> Result<Vec<String>> {
        Ok(networking_warnings(&self.events(SANDBOX_FAILURE).await?))
    }

    pub async fn list_nodes(&self) -> Result<NodeInventory> {
        let (nodes, usage, pods, events, warnings) = tokio::try_join!(
            self.nodes(),
            metrics::fetch_usage(&self.gateway, MetricsKind::Nodes, None),
            self.running_pods(),
            self.events("Unconsolidatable"),
            self.warnings(),
        )?;
        log::debug!(
            "nodes: {} node(s), {} pod(s), {} autoscaler event(s)",
            nodes.len(),
            pods.len(),
            events.len()
        );
        Ok(build_inventory(&nodes, &pods, &usage, &events, &warnings))
    }

    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        self.gateway
            .call(|clients| {
                let patch = patch.clone();
                async move {
                    let api: Api<Node> = Api::all(clients.client());
                    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?;
                    Ok::<_, Error>(())
                }
            })
            .await?;
        log::info!("nodes: {name} unschedulable = {unschedulable}");
        Ok(())
    }

    pub async fn cordon(&self, name: &str) -> Result<()> {
        self.set_unschedulable(name, true).await
    }

    pub async fn uncordon(&self, name: &str) -> Result<()> {
        self.set_unschedulable(name, false).await
    }

    async fn evict(&self, namespace: &str, name: &str) -> Result<()> {
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(self.drain_grace_period_secs),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.gateway
            .call(|clients| {
                let params = params.clone();
                async move {
                    let api: Api<Pod> = Api::namespaced(clients.client(), namespace);
                    api.evict(name, &params).await?;
                    Ok::<_, Error>(())
                }
            })
            .await
    }

    /// Cordons `name` and evicts every pod on it except DaemonSet and mirror
    /// pods. Individual eviction failures are collected, not fatal.
    pub async fn drain(&self, name: &str) -> Result<DrainOutcome> {
        self.cordon(name).await?;
        let pods: Vec<Pod> = self
            .list_all(ListParams::default().fields(&format!("spec.nodeName={name}")))
            .await?;
        let targets: Vec<NodePodDetail> = pods
            .iter()
            .map(NodePodDetail::from_pod)
            .filter(NodePodDetail::is_evictable)
            .collect();
        log::info!(
            "nodes: draining {name}, {} of {} pod(s) to evict",
            targets.len(),
            pods.len()
        );

        let results = join_all(
            targets
                .iter()
                .map(|pod| async move { (pod, self.evict(&pod.namespace, &pod.name).await) }),
        )
        .await;

        let mut outcome = DrainOutcome::default();
        for (pod, result) in results {
            let id = format!("{}/{}", pod.namespace, pod.name);
            match result {
                Ok(()) => outcome.evicted.push(id),
                Err(e) => {
                    log::warn!("nodes: eviction of {id} failed: {e}");
                    outcome.failed.push((id, e.to_string()));
                }
            }
        }
        Ok(outcome)
    }
}
