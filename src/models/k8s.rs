// List-item projections handed to consumers. Field names serialize in camelCase.
use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{Deserialize, Serialize};

use crate::blockers::NodeBlocker;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeContext {
    pub name: String,
    pub cluster: String,
    pub user: String,
    pub namespace: Option<String>,
    pub is_active: bool,
    /// API server URL, used for health checks
    pub server_url: Option<String>,
    /// Absolute path of the kubeconfig file that contains this context
    pub source_file: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSummary {
    pub name: String,
    pub namespace: String,
    pub status: String,
    pub ready: String,
    pub restarts: i32,
    pub age: String,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub node: String,
    pub ip: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub name: String,
    pub status: String,
    pub unschedulable: bool,
    pub age: String,
    pub version: String,
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// A node as produced by the node listing, with analysis attached.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeListItem {
    pub name: String,
    pub pool: String,
    pub zone: Option<String>,
    pub instance_type: Option<String>,
    pub status: String,
    pub unschedulable: bool,
    pub age: String,
    pub version: String,
    pub internal_ip: Option<String>,
    pub cpu_allocatable: f64,
    pub memory_allocatable: f64,
    pub cpu_requests: f64,
    pub memory_requests: f64,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub pod_count: usize,
    pub pod_capacity: usize,
    pub allocated_ips: usize,
    pub blockers: Vec<NodeBlocker>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSummary {
    pub name: String,
    pub status: String,
    pub age: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSummary {
    pub name: String,
    pub namespace: String,
    pub ready: String,
    pub desired: i32,
    pub available: i32,
    pub age: String,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub name: String,
    pub namespace: String,
    pub service_type: String,
    pub cluster_ip: Option<String>,
    pub ports: Vec<String>,
    pub age: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    pub name: String,
    pub namespace: String,
    pub kind: String,
    pub keys: usize,
    pub age: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerSummary {
    pub name: String,
    pub namespace: String,
    pub target: String,
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
    pub current_replicas: Option<i32>,
    pub age: String,
}

/// Projection shared by every CRD-backed kind.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomObjectSummary {
    pub name: String,
    pub namespace: Option<String>,
    pub kind: String,
    pub ready: Option<String>,
    pub age: String,
}

/// Compact age like `kubectl get` prints: `45s`, `12m`, `5h`, `3d`.
pub fn age(created: Option<&Time>) -> String {
    let Some(created) = created else {
        return String::new();
    };
    let secs = (Utc::now() - created.0).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}
