//! Explains why a node resists draining or consolidation.
//!
//! The analysis is built from what the pods on the node declare (pool
//! pins, tolerations, self anti-affinity, topology spread), how much of the
//! node they consume, and the autoscaler's own events.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::{Event, NodeSelectorRequirement, Pod, Taint, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::Serialize;

use crate::quantity::{pod_requests, Resources};

/// Node labels that identify a pool across providers.
pub const POOL_LABELS: [&str; 5] = [
    "karpenter.sh/nodepool",
    "eks.amazonaws.com/nodegroup",
    "cloud.google.com/gke-nodepool",
    "kubernetes.azure.com/agentpool",
    "alpha.eksctl.io/nodegroup-name",
];

pub const DO_NOT_DISRUPT: &str = "karpenter.sh/do-not-disrupt";
const MIRROR_ANNOTATION: &str = "kubernetes.io/config.mirror";
const UNCONSOLIDATABLE: &str = "Unconsolidatable";
const SPOT_TO_SPOT_DISABLED: &str = "SpotToSpotConsolidation is disabled";
const DOMINANCE_THRESHOLD: f64 = 0.5;

/// A placement rule normalized so identical rules on different pods compare
/// equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementConstraint {
    pub namespace: String,
    pub labels: Vec<(String, String)>,
    pub topology_key: Option<String>,
}

impl PlacementConstraint {
    fn new(
        namespace: String,
        selector: Option<&LabelSelector>,
        topology_key: &str,
    ) -> Option<Self> {
        let match_labels = selector?.match_labels.as_ref()?;
        if match_labels.is_empty() {
            return None;
        }
        // BTreeMap iteration is already sorted by key
        let labels = match_labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(PlacementConstraint {
            namespace,
            labels,
            topology_key: Some(topology_key.to_string()).filter(|k| !k.is_empty()),
        })
    }

    fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// Per-pod facts the analysis needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePodDetail {
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub requests: Resources,
    pub restarts: i32,
    pub node_selector: BTreeMap<String, String>,
    pub required_node_affinity: Vec<NodeSelectorRequirement>,
    pub tolerations: Vec<Toleration>,
    pub anti_affinity: Vec<PlacementConstraint>,
    pub topology_spread: Vec<PlacementConstraint>,
    pub pod_ips: Vec<String>,
    pub owner_kind: Option<String>,
    pub mirror: bool,
    pub do_not_disrupt: bool,
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

impl NodePodDetail {
    pub fn from_pod(pod: &Pod) -> Self {
        let meta = &pod.metadata;
        let namespace = meta.namespace.clone().unwrap_or_default();
        let labels = meta.labels.clone().unwrap_or_default();
        let annotations = meta.annotations.as_ref();
        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();

        let affinity = spec.and_then(|s| s.affinity.as_ref());
        let required_node_affinity = affinity
            .and_then(|a| a.node_affinity.as_ref())
            .and_then(|n| n.required_during_scheduling_ignored_during_execution.as_ref())
            .map(|selector| {
                selector
                    .node_selector_terms
                    .iter()
                    .flat_map(|term| term.match_expressions.iter().flatten().cloned())
                    .collect()
            })
            .unwrap_or_default();

        // Only rules whose selector matches the pod itself keep replicas apart.
        let mut anti_affinity = Vec::new();
        let terms = affinity
            .and_then(|a| a.pod_anti_affinity.as_ref())
            .and_then(|p| p.required_during_scheduling_ignored_during_execution.as_ref());
        for term in terms.into_iter().flatten() {
            let mut namespaces = term.namespaces.clone().unwrap_or_default();
            namespaces.sort();
            let constraint = PlacementConstraint::new(
                namespaces.join(","),
                term.label_selector.as_ref(),
                &term.topology_key,
            );
            if let Some(constraint) = constraint.filter(|c| c.selects(&labels)) {
                push_unique(&mut anti_affinity, constraint);
            }
        }

        let mut topology_spread = Vec::new();
        let spread = spec.and_then(|s| s.topology_spread_constraints.as_ref());
        for rule in spread.into_iter().flatten() {
            if rule.when_unsatisfiable == "ScheduleAnyway" {
                continue;
            }
            let constraint = PlacementConstraint::new(
                namespace.clone(),
                rule.label_selector.as_ref(),
                &rule.topology_key,
            );
            if let Some(constraint) = constraint {
                push_unique(&mut topology_spread, constraint);
            }
        }

        let host_network = spec.and_then(|s| s.host_network).unwrap_or(false);
        let pod_ips = status
            .and_then(|s| s.pod_ip.clone())
            .filter(|_| !host_network)
            .into_iter()
            .collect();

        NodePodDetail {
            name: meta.name.clone().unwrap_or_default(),
            namespace,
            node_name: spec.and_then(|s| s.node_name.clone()),
            requests: spec.map(pod_requests).unwrap_or_default(),
            restarts: status
                .and_then(|s| s.container_statuses.as_ref())
                .map(|cs| cs.iter().map(|c| c.restart_count).sum())
                .unwrap_or(0),
            node_selector: spec
                .and_then(|s| s.node_selector.clone())
                .unwrap_or_default(),
            required_node_affinity,
            tolerations: spec.and_then(|s| s.tolerations.clone()).unwrap_or_default(),
            anti_affinity,
            topology_spread,
            pod_ips,
            owner_kind: meta
                .owner_references
                .as_ref()
                .and_then(|refs| {
                    refs.iter()
                        .find(|r| r.controller == Some(true))
                        .or(refs.first())
                })
                .map(|r| r.kind.clone()),
            mirror: annotations.is_some_and(|a| a.contains_key(MIRROR_ANNOTATION)),
            do_not_disrupt: annotations
                .and_then(|a| a.get(DO_NOT_DISRUPT))
                .is_some_and(|v| v == "true"),
            labels,
        }
    }

    /// DaemonSet pods and static (mirror) pods are never evicted by a drain.
    pub fn is_evictable(&self) -> bool {
        !self.mirror && self.owner_kind.as_deref() != Some("DaemonSet")
    }
}

/// How many pods cluster-wide declare each placement rule.
#[derive(Debug, Clone, Default)]
pub struct ConstraintTallies {
    pub anti_affinity: HashMap<PlacementConstraint, usize>,
    pub topology_spread: HashMap<PlacementConstraint, usize>,
}

impl ConstraintTallies {
    pub fn from_pods<'a>(pods: impl IntoIterator<Item = &'a NodePodDetail>) -> Self {
        let mut tallies = ConstraintTallies::default();
        for pod in pods {
            for c in &pod.anti_affinity {
                *tallies.anti_affinity.entry(c.clone()).or_default() += 1;
            }
            for c in &pod.topology_spread {
                *tallies.topology_spread.entry(c.clone()).or_default() += 1;
            }
        }
        tallies
    }
}

/// The node-side inputs of the analysis.
#[derive(Debug, Clone, Copy)]
pub struct NodeFacts<'a> {
    pub name: &'a str,
    pub labels: &'a BTreeMap<String, String>,
    pub taints: &'a [Taint],
    pub allocatable: Resources,
}

/// Why something on a node resists removal. Without a pod it is a
/// node-wide condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeBlocker {
    pub pod: Option<String>,
    pub namespace: Option<String>,
    pub reasons: Vec<String>,
}

fn pin_reasons(node: &NodeFacts, pod: &NodePodDetail, reasons: &mut Vec<String>) {
    for key in POOL_LABELS {
        let Some(node_value) = node.labels.get(key) else {
            continue;
        };
        if pod.node_selector.get(key) == Some(node_value) {
            push_unique(
                reasons,
                format!("pinned to pool by nodeSelector {key}={node_value}"),
            );
        }
        let pinned_by_affinity = pod.required_node_affinity.iter().any(|req| {
            req.key == key
                && req.operator == "In"
                && req.values.iter().flatten().any(|v| v == node_value)
        });
        if pinned_by_affinity {
            push_unique(
                reasons,
                format!("pinned to pool by required node affinity {key}={node_value}"),
            );
        }
    }
}

fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    let exists = toleration.operator.as_deref() == Some("Exists");
    match toleration.key.as_deref() {
        // an empty key with Exists tolerates every taint
        None | Some("") if exists => {}
        Some(key) if key == taint.key => {}
        _ => return false,
    }
    let value_ok = match toleration.operator.as_deref() {
        Some("Exists") => true,
        _ => toleration.value.as_deref().unwrap_or_default()
            == taint.value.as_deref().unwrap_or_default(),
    };
    let effect_ok = match toleration.effect.as_deref() {
        None | Some("") => true,
        Some(effect) => effect == taint.effect,
    };
    value_ok && effect_ok
}

fn taint_reasons(node: &NodeFacts, pod: &NodePodDetail, reasons: &mut Vec<String>) {
    let isolating = node
        .taints
        .iter()
        .filter(|t| t.effect == "NoSchedule" || t.effect == "NoExecute");
    for taint in isolating {
        if pod.tolerations.iter().any(|t| tolerates(t, taint)) {
            let reason = match taint.value.as_deref() {
                Some(value) if !value.is_empty() => {
                    format!("tolerates taint {}={} ({})", taint.key, value, taint.effect)
                }
                _ => format!("tolerates taint {} ({})", taint.key, taint.effect),
            };
            push_unique(reasons, reason);
        }
    }
}

fn dominance_reasons(node: &NodeFacts, pod: &NodePodDetail, reasons: &mut Vec<String>) {
    let checks = [
        ("CPU", pod.requests.cpu_millicores, node.allocatable.cpu_millicores),
        ("memory", pod.requests.memory_bytes, node.allocatable.memory_bytes),
    ];
    for (label, request, allocatable) in checks {
        if allocatable <= 0.0 {
            continue;
        }
        let share = request / allocatable;
        if share >= DOMINANCE_THRESHOLD {
            push_unique(
                reasons,
                format!("{label} request ~{}% of allocatable", (share * 100.0).round()),
            );
        }
    }
}

fn spread_reasons(pod: &NodePodDetail, tallies: &ConstraintTallies, reasons: &mut Vec<String>) {
    for c in &pod.anti_affinity {
        let replicas = tallies.anti_affinity.get(c).copied().unwrap_or(0);
        if replicas > 1 {
            let reason = match &c.topology_key {
                Some(key) => format!("self anti-affinity on {key} shared by {replicas} replicas"),
                None => format!("self anti-affinity shared by {replicas} replicas"),
            };
            push_unique(reasons, reason);
        }
    }
    for c in &pod.topology_spread {
        let replicas = tallies.topology_spread.get(c).copied().unwrap_or(0);
        if replicas > 1 {
            let key = c.topology_key.as_deref().unwrap_or("unknown topology");
            push_unique(
                reasons,
                format!("topology spread on {key} shared by {replicas} replicas"),
            );
        }
    }
}

/// Reasons `pod` keeps `node` from being removed, in a fixed order: pool
/// pin, taint toleration, resource dominance, anti-affinity, topology
/// spread, explicit do-not-disrupt.
pub fn pod_reasons(
    node: &NodeFacts,
    pod: &NodePodDetail,
    tallies: &ConstraintTallies,
) -> Vec<String> {
    let mut reasons = Vec::new();
    pin_reasons(node, pod, &mut reasons);
    taint_reasons(node, pod, &mut reasons);
    dominance_reasons(node, pod, &mut reasons);
    spread_reasons(pod, tallies, &mut reasons);
    if pod.do_not_disrupt {
        push_unique(&mut reasons, format!("annotated {DO_NOT_DISRUPT}"));
    }
    reasons
}

/// Blockers for every pod on `node` that has at least one reason, most
/// constrained first.
pub fn analyze_node(
    node: &NodeFacts,
    pods: &[&NodePodDetail],
    tallies: &ConstraintTallies,
) -> Vec<NodeBlocker> {
    let mut blockers: Vec<NodeBlocker> = pods
        .iter()
        .filter_map(|pod| {
            let reasons = pod_reasons(node, pod, tallies);
            (!reasons.is_empty()).then(|| NodeBlocker {
                pod: Some(pod.name.clone()),
                namespace: Some(pod.namespace.clone()),
                reasons,
            })
        })
        .collect();
    blockers.sort_by(|a, b| b.reasons.len().cmp(&a.reasons.len()));
    blockers
}

fn explain_autoscaler_message(message: &str) -> String {
    if message.contains(SPOT_TO_SPOT_DISABLED) {
        "spot node can only be replaced by on-demand capacity because \
         spot-to-spot consolidation is disabled"
            .to_string()
    } else {
        message.to_string()
    }
}

/// Node-wide blockers from autoscaler `Unconsolidatable` events, keyed by
/// node name.
pub fn autoscaler_blockers(events: &[Event]) -> HashMap<String, NodeBlocker> {
    let mut by_node: HashMap<String, NodeBlocker> = HashMap::new();
    for event in events {
        if event.reason.as_deref() != Some(UNCONSOLIDATABLE) {
            continue;
        }
        let target = &event.involved_object;
        if target.kind.as_deref() != Some("Node") {
            continue;
        }
        let (Some(node), Some(message)) = (target.name.as_ref(), event.message.as_deref()) else {
            continue;
        };
        let blocker = by_node.entry(node.clone()).or_insert_with(|| NodeBlocker {
            pod: None,
            namespace: None,
            reasons: Vec::new(),
        });
        push_unique(&mut blocker.reasons, explain_autoscaler_message(message));
    }
    by_node
}


#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ObjectReference;

    use super::fixtures::*;
    use super::*;

    fn node_facts<'a>(
        labels: &'a BTreeMap<String, String>,
        taints: &'a [Taint],
    ) -> NodeFacts<'a> {
        NodeFacts {
            name: "node-a",
            labels,
            taints,
            allocatable: Resources {
                cpu_millicores: 1000.0,
                memory_bytes: 4.0 * 1024.0 * 1024.0 * 1024.0,
            },
        }
    }

    fn reasons_for(pod: &Pod, labels: &BTreeMap<String, String>, taints: &[Taint]) -> Vec<String> {
        let detail = NodePodDetail::from_pod(pod);
        let tallies = ConstraintTallies::from_pods([&detail]);
        pod_reasons(&node_facts(labels, taints), &detail, &tallies)
    }

    #[test]
    fn dominant_cpu_request_is_reported() {
        let labels = BTreeMap::new();
        let heavy = reasons_for(&pod("heavy", "default", "node-a", "600m", "64Mi"), &labels, &[]);
        assert_eq!(heavy, vec!["CPU request ~60% of allocatable".to_string()]);

        let light = reasons_for(&pod("light", "default", "node-a", "400m", "64Mi"), &labels, &[]);
        assert!(light.is_empty());
    }

    #[test]
    fn dominant_memory_request_is_reported() {
        let labels = BTreeMap::new();
        let reasons = reasons_for(&pod("cache", "default", "node-a", "10m", "3Gi"), &labels, &[]);
        assert_eq!(reasons, vec!["memory request ~75% of allocatable".to_string()]);
    }

    #[test]
    fn matching_toleration_is_reported() {
        let labels = BTreeMap::new();
        let taints = [taint("dedicated", Some("gpu"), "NoSchedule")];

        let mut gpu = pod("trainer", "ml", "node-a", "10m", "1Mi");
        gpu.spec.as_mut().unwrap().tolerations = Some(vec![toleration(
            "dedicated",
            "Equal",
            Some("gpu"),
            Some("NoSchedule"),
        )]);
        assert_eq!(
            reasons_for(&gpu, &labels, &taints),
            vec!["tolerates taint dedicated=gpu (NoSchedule)".to_string()]
        );

        gpu.spec.as_mut().unwrap().tolerations = Some(vec![toleration(
            "dedicated",
            "Equal",
            Some("cpu"),
            Some("NoSchedule"),
        )]);
        assert!(reasons_for(&gpu, &labels, &taints).is_empty());
    }

    #[test]
    fn exists_and_unset_effect_tolerate_any_value() {
        let taint = taint("dedicated", Some("gpu"), "NoExecute");
        assert!(tolerates(&toleration("dedicated", "Exists", None, None), &taint));
        assert!(!tolerates(
            &toleration("dedicated", "Exists", None, Some("NoSchedule")),
            &taint
        ));
        assert!(!tolerates(&toleration("other", "Exists", None, None), &taint));
    }

    #[test]
    fn prefer_no_schedule_taints_are_ignored() {
        let labels = BTreeMap::new();
        let taints = [taint("spot", None, "PreferNoSchedule")];
        let mut p = pod("p", "default", "node-a", "10m", "1Mi");
        p.spec.as_mut().unwrap().tolerations = Some(vec![toleration("spot", "Exists", None, None)]);
        assert!(reasons_for(&p, &labels, &taints).is_empty());
    }

    #[test]
    fn reasons_follow_fixed_order() {
        let labels = labels(&[("karpenter.sh/nodepool", "gpu")]);
        let taints = [taint("dedicated", None, "NoSchedule")];
        let mut p = pod("p", "default", "node-a", "900m", "1Mi");
        {
            let spec = p.spec.as_mut().unwrap();
            spec.node_selector = Some(super::fixtures::labels(&[("karpenter.sh/nodepool", "gpu")]));
            spec.tolerations = Some(vec![toleration("dedicated", "Exists", None, None)]);
        }
        p.metadata.annotations = Some(super::fixtures::labels(&[(DO_NOT_DISRUPT, "true")]));

        assert_eq!(
            reasons_for(&p, &labels, &taints),
            vec![
                "pinned to pool by nodeSelector karpenter.sh/nodepool=gpu".to_string(),
                "tolerates taint dedicated (NoSchedule)".to_string(),
                "CPU request ~90% of allocatable".to_string(),
                "annotated karpenter.sh/do-not-disrupt".to_string(),
            ]
        );
    }

    #[test]
    fn selector_for_another_pool_does_not_pin() {
        let labels = labels(&[("karpenter.sh/nodepool", "general")]);
        let mut p = pod("p", "default", "node-a", "10m", "1Mi");
        p.spec.as_mut().unwrap().node_selector =
            Some(super::fixtures::labels(&[("karpenter.sh/nodepool", "gpu")]));
        assert!(reasons_for(&p, &labels, &[]).is_empty());
    }

    #[test]
    fn shared_anti_affinity_counts_replicas() {
        let a = NodePodDetail::from_pod(&with_anti_affinity(
            pod("a", "team-a", "node-a", "10m", "1Mi"),
            "kubernetes.io/hostname",
        ));
        let b = NodePodDetail::from_pod(&with_anti_affinity(
            pod("b", "team-b", "node-b", "10m", "1Mi"),
            "kubernetes.io/hostname",
        ));
        let tallies = ConstraintTallies::from_pods([&a, &b]);
        let labels = BTreeMap::new();

        assert_eq!(
            pod_reasons(&node_facts(&labels, &[]), &a, &tallies),
            vec!["self anti-affinity on kubernetes.io/hostname shared by 2 replicas".to_string()]
        );

        let alone = ConstraintTallies::from_pods([&a]);
        assert!(pod_reasons(&node_facts(&labels, &[]), &a, &alone).is_empty());
    }

    #[test]
    fn schedule_anyway_spread_is_not_a_blocker() {
        let spread = |name: &str, when: &str| {
            NodePodDetail::from_pod(&with_spread(pod(name, "ns", "n", "1m", "1Mi"), when))
        };
        let strict_a = spread("a", "DoNotSchedule");
        let strict_b = spread("b", "DoNotSchedule");
        let soft = spread("c", "ScheduleAnyway");
        assert!(soft.topology_spread.is_empty());

        let tallies = ConstraintTallies::from_pods([&strict_a, &strict_b, &soft]);
        let labels = BTreeMap::new();
        assert_eq!(
            pod_reasons(&node_facts(&labels, &[]), &strict_a, &tallies),
            vec!["topology spread on topology.kubernetes.io/zone shared by 2 replicas".to_string()]
        );
    }

    #[test]
    fn analyze_node_ranks_by_reason_count() {
        let labels = labels(&[("karpenter.sh/nodepool", "gpu")]);
        let mut pinned = pod("pinned", "default", "node-a", "700m", "1Mi");
        pinned.spec.as_mut().unwrap().node_selector =
            Some(super::fixtures::labels(&[("karpenter.sh/nodepool", "gpu")]));
        let heavy = pod("heavy", "default", "node-a", "600m", "1Mi");
        let idle = pod("idle", "default", "node-a", "1m", "1Mi");

        let details: Vec<_> = [heavy, pinned, idle].iter().map(NodePodDetail::from_pod).collect();
        let refs: Vec<_> = details.iter().collect();
        let tallies = ConstraintTallies::default();
        let blockers = analyze_node(&node_facts(&labels, &[]), &refs, &tallies);

        assert_eq!(blockers.len(), 2);
        assert_eq!(blockers[0].pod.as_deref(), Some("pinned"));
        assert_eq!(blockers[1].pod.as_deref(), Some("heavy"));
    }

    #[test]
    fn autoscaler_events_become_node_blockers() {
        let event = |node: &str, message: &str| Event {
            reason: Some("Unconsolidatable".to_string()),
            message: Some(message.to_string()),
            involved_object: ObjectReference {
                kind: Some("Node".to_string()),
                name: Some(node.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let events = vec![
            event(
                "node-a",
                "SpotToSpotConsolidation is disabled, can't replace a spot node with a spot node",
            ),
            event("node-a", "pdb default/web prevents pod evictions"),
            event("node-a", "pdb default/web prevents pod evictions"),
            event("node-b", "Can't replace with a cheaper node"),
        ];

        let blockers = autoscaler_blockers(&events);
        let a = &blockers["node-a"];
        assert!(a.pod.is_none());
        assert_eq!(a.reasons.len(), 2);
        assert!(a.reasons[0].contains("spot-to-spot consolidation is disabled"));
        assert_eq!(a.reasons[1], "pdb default/web prevents pod evictions");
        assert_eq!(
            blockers["node-b"].reasons,
            vec!["Can't replace with a cheaper node".to_string()]
        );
    }

    #[test]
    fn daemonset_and_mirror_pods_are_not_evictable() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

        let mut ds = pod("agent", "kube-system", "node-a", "1m", "1Mi");
        ds.metadata.owner_references = Some(vec![OwnerReference {
            kind: "DaemonSet".to_string(),
            name: "agent".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        assert!(!NodePodDetail::from_pod(&ds).is_evictable());

        let mut mirror = pod("etcd", "kube-system", "node-a", "1m", "1Mi");
        mirror.metadata.annotations = Some(labels(&[(MIRROR_ANNOTATION, "abc")]));
        assert!(!NodePodDetail::from_pod(&mirror).is_evictable());

        let web = pod("web", "default", "node-a", "1m", "1Mi");
        assert!(NodePodDetail::from_pod(&web).is_evictable());
    }
}
