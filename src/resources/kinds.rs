// Descriptor table: one zero-sized type per supported kind.
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, Node, Pod, PodTemplateSpec, Secret, Service,
};
use kube::api::DynamicObject;
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource};

use super::{KindDescriptor, Restartable, Scalable};
use crate::crd_gate::{
    OptionalCrd, EXTERNAL_SECRET, ISTIO_VIRTUAL_SERVICE, KARPENTER_NODE_POOL, KEDA_SCALED_OBJECT,
};
use crate::metrics::{MetricsKind, Usage};
use crate::models::k8s::{
    age, AutoscalerSummary, ConfigSummary, CustomObjectSummary, NamespaceSummary, NodeSummary,
    PodSummary, ServiceSummary, WorkloadSummary,
};
use crate::quantity::{format_cpu, format_memory};

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn name_of<K: Resource>(object: &K) -> String {
    object.meta().name.clone().unwrap_or_default()
}

fn namespace_of<K: Resource>(object: &K) -> String {
    object.meta().namespace.clone().unwrap_or_default()
}

/// Status as `kubectl get pods` shows it: a waiting or terminated container
/// reason wins over the pod phase.
pub fn pod_status(pod: &Pod) -> String {
    if pod.metadata.deletion_timestamp.is_some() {
        return "Terminating".to_string();
    }
    let Some(status) = pod.status.as_ref() else {
        return "Unknown".to_string();
    };
    let container_reason = status.container_statuses.iter().flatten().find_map(|c| {
        let state = c.state.as_ref()?;
        state
            .waiting
            .as_ref()
            .and_then(|w| w.reason.clone())
            .or_else(|| state.terminated.as_ref().and_then(|t| t.reason.clone()))
    });
    container_reason
        .or_else(|| status.reason.clone())
        .or_else(|| status.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string())
}

pub struct PodKind;

impl KindDescriptor for PodKind {
    type Object = Pod;
    type Item = PodSummary;
    const KIND: &'static str = "Pod";
    const NAMESPACED: bool = true;

    fn api(client: Client, namespace: Option<&str>) -> Api<Pod> {
        scoped(client, namespace)
    }

    fn list_item(pod: &Pod) -> PodSummary {
        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_deref())
            .unwrap_or_default();
        let total = pod.spec.as_ref().map(|s| s.containers.len()).unwrap_or(0);
        let ready = statuses.iter().filter(|c| c.ready).count();
        PodSummary {
            name: name_of(pod),
            namespace: namespace_of(pod),
            status: pod_status(pod),
            ready: format!("{ready}/{total}"),
            restarts: statuses.iter().map(|c| c.restart_count).sum(),
            age: age(pod.metadata.creation_timestamp.as_ref()),
            cpu: None,
            memory: None,
            node: pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            ip: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
        }
    }

    fn metrics() -> Option<MetricsKind> {
        Some(MetricsKind::Pods)
    }

    fn apply_usage(item: &mut PodSummary, usage: Usage) {
        item.cpu = Some(format_cpu(usage.cpu_millicores));
        item.memory = Some(format_memory(usage.memory_bytes));
    }
}

pub fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True")
}

pub struct NodeKind;

impl KindDescriptor for NodeKind {
    type Object = Node;
    type Item = NodeSummary;
    const KIND: &'static str = "Node";
    const NAMESPACED: bool = false;

    fn api(client: Client, _namespace: Option<&str>) -> Api<Node> {
        Api::all(client)
    }

    fn list_item(node: &Node) -> NodeSummary {
        NodeSummary {
            name: name_of(node),
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
            cpu: None,
            memory: None,
        }
    }

    fn metrics() -> Option<MetricsKind> {
        Some(MetricsKind::Nodes)
    }

    fn apply_usage(item: &mut NodeSummary, usage: Usage) {
        item.cpu = Some(format_cpu(usage.cpu_millicores));
        item.memory = Some(format_memory(usage.memory_bytes));
    }
}

pub struct NamespaceKind;

impl KindDescriptor for NamespaceKind {
    type Object = Namespace;
    type Item = NamespaceSummary;
    const KIND: &'static str = "Namespace";
    const NAMESPACED: bool = false;

    fn api(client: Client, _namespace: Option<&str>) -> Api<Namespace> {
        Api::all(client)
    }

    fn list_item(ns: &Namespace) -> NamespaceSummary {
        NamespaceSummary {
            name: name_of(ns),
            status: ns
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            age: age(ns.metadata.creation_timestamp.as_ref()),
        }
    }
}

fn images(template: Option<&PodTemplateSpec>) -> Vec<String> {
    template
        .and_then(|t| t.spec.as_ref())
        .map(|s| s.containers.iter().filter_map(|c| c.image.clone()).collect())
        .unwrap_or_default()
}

fn workload<K: Resource>(
    object: &K,
    ready: i32,
    desired: i32,
    available: i32,
    template: Option<&PodTemplateSpec>,
) -> WorkloadSummary {
    WorkloadSummary {
        name: name_of(object),
        namespace: namespace_of(object),
        ready: format!("{ready}/{desired}"),
        desired,
        available,
        age: age(object.meta().creation_timestamp.as_ref()),
        images: images(template),
    }
}

pub struct DeploymentKind;

impl KindDescriptor for DeploymentKind {
    type Object = Deployment;
    type Item = WorkloadSummary;
    const KIND: &'static str = "Deployment";
    const NAMESPACED: bool = true;

    fn api(client: Client, namespace: Option<&str>) -> Api<Deployment> {
        scoped(client, namespace)
    }

    fn list_item(d: &Deployment) -> WorkloadSummary {
        let status = d.status.as_ref();
        workload(
            d,
            status.and_then(|s| s.ready_replicas).unwrap_or(0),
            d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            status.and_then(|s| s.available_replicas).unwrap_or(0),
            d.spec.as_ref().map(|s| &s.template),
        )
    }
}

impl Restartable for DeploymentKind {}
impl Scalable for DeploymentKind {}

pub struct StatefulSetKind;

impl KindDescriptor for StatefulSetKind {
    type Object = StatefulSet;
    type Item = WorkloadSummary;
    const KIND: &'static str = "StatefulSet";
    const NAMESPACED: bool = true;

    fn api(client: Client, namespace: Option<&str>) -> Api<StatefulSet> {
        scoped(client, namespace)
    }

    fn list_item(s: &StatefulSet) -> WorkloadSummary {
        let status = s.status.as_ref();
        workload(
            s,
            status.and_then(|st| st.ready_replicas).unwrap_or(0),
            s.spec.as_ref().and_then(|sp| sp.replicas).unwrap_or(1),
            status.and_then(|st| st.available_replicas).unwrap_or(0),
            s.spec.as_ref().map(|sp| &sp.template),
        )
    }
}

impl Restartable for StatefulSetKind {}
impl Scalable for StatefulSetKind {}

pub struct DaemonSetKind;

impl KindDescriptor for DaemonSetKind {
    type Object = DaemonSet;
    type Item = WorkloadSummary;
    const KIND: &'static str = "DaemonSet";
    const NAMESPACED: bool = true;

    fn api(client: Client, namespace: Option<&str>) -> Api<DaemonSet> {
        scoped(client, namespace)
    }

    fn list_item(d: &DaemonSet) -> WorkloadSummary {
        let status = d.status.as_ref();
        workload(
            d,
            status.map(|s| s.number_ready).unwrap_or(0),
            status.map(|s| s.desired_number_scheduled).unwrap_or(0),
            status.and_then(|s| s.number_available).unwrap_or(0),
            d.spec.as_ref().map(|s| &s.template),
        )
    }
}

impl Restartable for DaemonSetKind {}

pub struct ServiceKind;

impl KindDescriptor for ServiceKind {
    type Object = Service;
    type Item = ServiceSummary;
    const KIND: &'static str = "Service";
    const NAMESPACED: bool = true;

    fn api(client: Client, namespace: Option<&str>) -> Api<Service> {
        scoped(client, namespace)
    }

    fn list_item(svc: &Service) -> ServiceSummary {
        let spec = svc.spec.as_ref();
        ServiceSummary {
            name: name_of(svc),
            namespace: namespace_of(svc),
            service_type: spec
                .and_then(|s| s.type_.clone())
                .unwrap_or_else(|| "ClusterIP".to_string()),
            cluster_ip: spec.and_then(|s| s.cluster_ip.clone()),
            ports: spec
                .and_then(|s| s.ports.as_ref())
                .map(|ports| {
                    ports
                        .iter()
                        .map(|p| {
                            let protocol = p.protocol.as_deref().unwrap_or("TCP");
                            match p.node_port {
                                Some(node_port) => format!("{}:{node_port}/{protocol}", p.port),
                                None => format!("{}/{protocol}", p.port),
                            }
                        })
                        .collect()
                })
                .unwrap_or_default(),
            age: age(svc.metadata.creation_timestamp.as_ref()),
        }
    }
}

pub struct ConfigMapKind;

impl KindDescriptor for ConfigMapKind {
    type Object = ConfigMap;
    type Item = ConfigSummary;
    const KIND: &'static str = "ConfigMap";
    const NAMESPACED: bool = true;

    fn api(client: Client, namespace: Option<&str>) -> Api<ConfigMap> {
        scoped(client, namespace)
    }

    fn list_item(cm: &ConfigMap) -> ConfigSummary {
        ConfigSummary {
            name: name_of(cm),
            namespace: namespace_of(cm),
            kind: Self::KIND.to_string(),
            keys: cm.data.as_ref().map_or(0, |d| d.len())
                + cm.binary_data.as_ref().map_or(0, |d| d.len()),
            age: age(cm.metadata.creation_timestamp.as_ref()),
        }
    }
}

pub struct SecretKind;

impl KindDescriptor for SecretKind {
    type Object = Secret;
    type Item = ConfigSummary;
    const KIND: &'static str = "Secret";
    const NAMESPACED: bool = true;

    fn api(client: Client, namespace: Option<&str>) -> Api<Secret> {
        scoped(client, namespace)
    }

    // only key names are ever counted; values never leave the object
    fn list_item(secret: &Secret) -> ConfigSummary {
        ConfigSummary {
            name: name_of(secret),
            namespace: namespace_of(secret),
            kind: secret.type_.clone().unwrap_or_else(|| Self::KIND.to_string()),
            keys: secret.data.as_ref().map_or(0, |d| d.len())
                + secret.string_data.as_ref().map_or(0, |d| d.len()),
            age: age(secret.metadata.creation_timestamp.as_ref()),
        }
    }
}

pub struct HorizontalPodAutoscalerKind;

impl KindDescriptor for HorizontalPodAutoscalerKind {
    type Object = HorizontalPodAutoscaler;
    type Item = AutoscalerSummary;
    const KIND: &'static str = "HorizontalPodAutoscaler";
    const NAMESPACED: bool = true;

    fn api(client: Client, namespace: Option<&str>) -> Api<HorizontalPodAutoscaler> {
        scoped(client, namespace)
    }

    fn list_item(hpa: &HorizontalPodAutoscaler) -> AutoscalerSummary {
        let spec = hpa.spec.as_ref();
        AutoscalerSummary {
            name: name_of(hpa),
            namespace: namespace_of(hpa),
            target: spec
                .map(|s| format!("{}/{}", s.scale_target_ref.kind, s.scale_target_ref.name))
                .unwrap_or_default(),
            min_replicas: spec.and_then(|s| s.min_replicas),
            max_replicas: spec.map(|s| s.max_replicas).unwrap_or(0),
            current_replicas: hpa.status.as_ref().and_then(|s| s.current_replicas),
            age: age(hpa.metadata.creation_timestamp.as_ref()),
        }
    }
}

fn dynamic_api(crd: &OptionalCrd, client: Client, namespace: Option<&str>) -> Api<DynamicObject> {
    let resource = crd.api_resource();
    match namespace {
        Some(ns) if crd.namespaced => Api::namespaced_with(client, ns, &resource),
        _ => Api::all_with(client, &resource),
    }
}

/// The `Ready` condition status, if the object reports one.
fn ready_condition(object: &DynamicObject) -> Option<String> {
    object.data["status"]["conditions"]
        .as_array()?
        .iter()
        .find(|c| c["type"] == "Ready")
        .and_then(|c| c["status"].as_str())
        .map(str::to_string)
}

fn custom_summary(kind: &str, object: &DynamicObject) -> CustomObjectSummary {
    CustomObjectSummary {
        name: name_of(object),
        namespace: object.metadata.namespace.clone(),
        kind: kind.to_string(),
        ready: ready_condition(object),
        age: age(object.metadata.creation_timestamp.as_ref()),
    }
}

macro_rules! custom_kind {
    ($name:ident, $crd:expr) => {
        pub struct $name;

        impl KindDescriptor for $name {
            type Object = DynamicObject;
            type Item = CustomObjectSummary;
            const KIND: &'static str = $crd.kind;
            const NAMESPACED: bool = $crd.namespaced;

            fn optional_crd() -> Option<OptionalCrd> {
                Some($crd)
            }

            fn api(client: Client, namespace: Option<&str>) -> Api<DynamicObject> {
                dynamic_api(&$crd, client, namespace)
            }

            fn list_item(object: &DynamicObject) -> CustomObjectSummary {
                custom_summary(Self::KIND, object)
            }
        }
    };
}

custom_kind!(VirtualServiceKind, ISTIO_VIRTUAL_SERVICE);
custom_kind!(ScaledObjectKind, KEDA_SCALED_OBJECT);
custom_kind!(ExternalSecretKind, EXTERNAL_SECRET);
custom_kind!(NodePoolKind, KARPENTER_NODE_POOL);
