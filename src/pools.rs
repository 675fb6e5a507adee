//! Per-pool rollups of the node listing.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::blockers::POOL_LABELS;
use crate::models::k8s::NodeListItem;

pub const DEFAULT_POOL: &str = "default";
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// The pool a node belongs to, from the first provider label with a value.
pub fn pool_name(labels: &BTreeMap<String, String>) -> String {
    POOL_LABELS
        .iter()
        .chain(["agentpool"].iter())
        .find_map(|key| labels.get(*key).filter(|v| !v.is_empty()))
        .cloned()
        .unwrap_or_else(|| DEFAULT_POOL.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceFamily {
    ComputeOptimized,
    GeneralPurpose,
    Burstable,
    MemoryOptimized,
}

impl InstanceFamily {
    /// Memory GiB per vCPU the family is built around.
    pub fn reference_ratio(self) -> f64 {
        match self {
            InstanceFamily::ComputeOptimized => 2.0,
            InstanceFamily::GeneralPurpose | InstanceFamily::Burstable => 4.0,
            InstanceFamily::MemoryOptimized => 8.0,
        }
    }

    fn normalized(self) -> Self {
        match self {
            InstanceFamily::Burstable => InstanceFamily::GeneralPurpose,
            other => other,
        }
    }

    /// Classifies AWS (`c6i.large`), GCP (`n2-highmem-4`) and Azure
    /// (`Standard_E4s_v5`) instance type names.
    pub fn of_instance_type(instance_type: &str) -> Option<Self> {
        use InstanceFamily::*;

        if let Some(size) = instance_type.strip_prefix("Standard_") {
            return match size.chars().next()? {
                'F' => Some(ComputeOptimized),
                'D' | 'A' => Some(GeneralPurpose),
                'B' => Some(Burstable),
                'E' | 'M' => Some(MemoryOptimized),
                _ => None,
            };
        }

        if instance_type.contains('-') {
            let mut parts = instance_type.split('-');
            let series = parts.next()?;
            let class = parts.next().unwrap_or_default();
            return match class {
                "highcpu" => Some(ComputeOptimized),
                "highmem" | "megamem" | "ultramem" => Some(MemoryOptimized),
                "micro" | "small" | "medium" if series == "e2" => Some(Burstable),
                _ if series.starts_with('c') => Some(ComputeOptimized),
                _ if series.starts_with('m') => Some(MemoryOptimized),
                "standard" => Some(GeneralPurpose),
                _ => None,
            };
        }

        let series: String = instance_type
            .split('.')
            .next()?
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        match series.as_str() {
            "c" => Some(ComputeOptimized),
            "m" | "a" => Some(GeneralPurpose),
            "t" => Some(Burstable),
            "r" | "x" | "z" => Some(MemoryOptimized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyRecommendation {
    pub current: InstanceFamily,
    pub recommended: InstanceFamily,
    pub actual_gib_per_core: f64,
}

/// Suggests a different instance family when observed memory per core is
/// far from what the current family is shaped for.
pub fn recommend_family(
    instance_type: &str,
    cpu_usage_millicores: f64,
    memory_usage_bytes: f64,
) -> Option<FamilyRecommendation> {
    if cpu_usage_millicores <= 0.0 {
        return None;
    }
    let current = InstanceFamily::of_instance_type(instance_type)?;
    let actual = (memory_usage_bytes / GIB) / (cpu_usage_millicores / 1000.0);

    let reference = current.reference_ratio();
    if (actual - reference).abs() / reference < 0.5 {
        return None;
    }
    let recommended = if actual < 3.0 {
        InstanceFamily::ComputeOptimized
    } else if actual < 6.0 {
        InstanceFamily::GeneralPurpose
    } else {
        InstanceFamily::MemoryOptimized
    };
    if recommended == current.normalized() {
        return None;
    }
    Some(FamilyRecommendation {
        current,
        recommended,
        actual_gib_per_core: (actual * 100.0).round() / 100.0,
    })
}

/// One reason with every node and pod that contributed it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolBlocker {
    pub reason: String,
    pub nodes: BTreeSet<String>,
    pub pods: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSummary {
    pub name: String,
    pub nodes: BTreeSet<String>,
    pub zones: BTreeSet<String>,
    pub instance_types: BTreeSet<String>,
    pub cpu_requests: f64,
    pub memory_requests: f64,
    pub cpu_allocatable: f64,
    pub memory_allocatable: f64,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub pod_count: usize,
    pub pod_capacity: usize,
    /// requests / allocatable
    pub cpu_request_ratio: Option<f64>,
    pub memory_request_ratio: Option<f64>,
    /// usage / requests
    pub cpu_usage_ratio: Option<f64>,
    pub memory_usage_ratio: Option<f64>,
    pub blockers: Vec<PoolBlocker>,
    pub recommendation: Option<FamilyRecommendation>,
}

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    (denominator > 0.0).then(|| numerator / denominator)
}

fn add_usage(total: Option<f64>, value: Option<f64>) -> Option<f64> {
    match (total, value) {
        (Some(t), Some(v)) => Some(t + v),
        (t, v) => t.or(v),
    }
}

#[derive(Default)]
struct PoolAccumulator {
    nodes: BTreeSet<String>,
    zones: BTreeSet<String>,
    instance_types: HashMap<String, usize>,
    cpu_requests: f64,
    memory_requests: f64,
    cpu_allocatable: f64,
    memory_allocatable: f64,
    cpu_usage: Option<f64>,
    memory_usage: Option<f64>,
    pod_count: usize,
    pod_capacity: usize,
    blockers: Vec<PoolBlocker>,
}

impl PoolAccumulator {
    fn blocker(&mut self, reason: &str) -> &mut PoolBlocker {
        let index = match self.blockers.iter().position(|b| b.reason == reason) {
            Some(index) => index,
            None => {
                self.blockers.push(PoolBlocker {
                    reason: reason.to_string(),
                    nodes: BTreeSet::new(),
                    pods: BTreeSet::new(),
                });
                self.blockers.len() - 1
            }
        };
        &mut self.blockers[index]
    }

    fn add(&mut self, node: &NodeListItem) {
        self.nodes.insert(node.name.clone());
        self.zones.extend(node.zone.clone());
        if let Some(instance_type) = &node.instance_type {
            *self.instance_types.entry(instance_type.clone()).or_default() += 1;
        }
        self.cpu_requests += node.cpu_requests;
        self.memory_requests += node.memory_requests;
        self.cpu_allocatable += node.cpu_allocatable;
        self.memory_allocatable += node.memory_allocatable;
        self.cpu_usage = add_usage(self.cpu_usage, node.cpu_usage);
        self.memory_usage = add_usage(self.memory_usage, node.memory_usage);
        self.pod_count += node.pod_count;
        self.pod_capacity += node.pod_capacity;

        for blocker in &node.blockers {
            let pod = match (&blocker.namespace, &blocker.pod) {
                (Some(ns), Some(pod)) => Some(format!("{ns}/{pod}")),
                (None, Some(pod)) => Some(pod.clone()),
                _ => None,
            };
            for reason in &blocker.reasons {
                let entry = self.blocker(reason);
                entry.nodes.insert(node.name.clone());
                entry.pods.extend(pod.clone());
            }
        }
    }

    fn finish(mut self, name: String, warnings: &[String]) -> NodePoolSummary {
        for warning in warnings {
            self.blocker(warning);
        }
        // most common type, ties broken by name
        let dominant_type = self
            .instance_types
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(t, _)| t.clone());
        let recommendation = match (dominant_type, self.cpu_usage, self.memory_usage) {
            (Some(t), Some(cpu), Some(memory)) => recommend_family(&t, cpu, memory),
            _ => None,
        };

        NodePoolSummary {
            name,
            cpu_request_ratio: ratio(self.cpu_requests, self.cpu_allocatable),
            memory_request_ratio: ratio(self.memory_requests, self.memory_allocatable),
            cpu_usage_ratio: self.cpu_usage.and_then(|u| ratio(u, self.cpu_requests)),
            memory_usage_ratio: self.memory_usage.and_then(|u| ratio(u, self.memory_requests)),
            nodes: self.nodes,
            zones: self.zones,
            instance_types: self.instance_types.into_keys().collect(),
            cpu_requests: self.cpu_requests,
            memory_requests: self.memory_requests,
            cpu_allocatable: self.cpu_allocatable,
            memory_allocatable: self.memory_allocatable,
            cpu_usage: self.cpu_usage,
            memory_usage: self.memory_usage,
            pod_count: self.pod_count,
            pod_capacity: self.pod_capacity,
            blockers: self.blockers,
            recommendation,
        }
    }
}

/// Groups node rows by pool. `warnings` are cluster-wide conditions added
/// to every pool.
pub fn aggregate_pools(nodes: &[NodeListItem], warnings: &[String]) -> Vec<NodePoolSummary> {
    let mut pools: BTreeMap<String, PoolAccumulator> = BTreeMap::new();
    for node in nodes {
        let pool = if node.pool.is_empty() {
            DEFAULT_POOL
        } else {
            node.pool.as_str()
        };
        pools.entry(pool.to_string()).or_default().add(node);
    }
    pools
        .into_iter()
        .map(|(name, acc)| acc.finish(name, warnings))
        .collect()
}
