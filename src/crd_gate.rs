use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{ApiResource, ListParams};
use kube::Api;

use crate::error::{Error, Result};
use crate::gateway::Gateway;

/// A custom resource kind that only exists when an extension is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionalCrd {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
    /// The product that ships the CRD, for error messages.
    pub product: &'static str,
    pub namespaced: bool,
}

impl OptionalCrd {
    /// `<plural>.<group>`, the CRD's object name.
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.plural, self.group)
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.to_string(),
            version: self.version.to_string(),
            api_version: format!("{}/{}", self.group, self.version),
            kind: self.kind.to_string(),
            plural: self.plural.to_string(),
        }
    }
}

pub const ISTIO_VIRTUAL_SERVICE: OptionalCrd = OptionalCrd {
    group: "networking.istio.io",
    version: "v1beta1",
    kind: "VirtualService",
    plural: "virtualservices",
    product: "Istio",
    namespaced: true,
};

pub const KEDA_SCALED_OBJECT: OptionalCrd = OptionalCrd {
    group: "keda.sh",
    version: "v1alpha1",
    kind: "ScaledObject",
    plural: "scaledobjects",
    product: "KEDA",
    namespaced: true,
};

pub const EXTERNAL_SECRET: OptionalCrd = OptionalCrd {
    group: "external-secrets.io",
    version: "v1beta1",
    kind: "ExternalSecret",
    plural: "externalsecrets",
    product: "External Secrets Operator",
    namespaced: true,
};

pub const KARPENTER_NODE_POOL: OptionalCrd = OptionalCrd {
    group: "karpenter.sh",
    version: "v1",
    kind: "NodePool",
    plural: "nodepools",
    product: "Karpenter",
    namespaced: false,
};

/// Cached "is this CRD installed" checks.
///
/// Answers are kept for the life of the process, per context, so a context
/// switch does not reuse another cluster's answers.
pub struct CrdGate {
    gateway: Arc<Gateway>,
    cache: Mutex<HashMap<(String, String), bool>>,
}

impl CrdGate {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        CrdGate {
            gateway,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, context: &str, crd: &str) -> Option<bool> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(context.to_string(), crd.to_string()))
            .copied()
    }

    /// Stores the outcome of one listing: every installed CRD is known
    /// present, and `checked` is present only if listed.
    fn record(&self, context: &str, checked: &str, installed: &HashSet<String>) -> bool {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        for name in installed {
            cache.insert((context.to_string(), name.clone()), true);
        }
        let present = installed.contains(checked);
        cache.insert((context.to_string(), checked.to_string()), present);
        present
    }

    pub async fn exists(&self, crd: &str) -> Result<bool> {
        let context = self.gateway.current_context();
        if let Some(hit) = self.cached(&context, crd) {
            return Ok(hit);
        }

        let listed = self
            .gateway
            .call(|clients| async move {
                let api: Api<CustomResourceDefinition> = Api::all(clients.client());
                let list = api.list_metadata(&ListParams::default()).await?;
                let names: HashSet<String> = list
                    .items
                    .into_iter()
                    .filter_map(|m| m.metadata.name)
                    .collect();
                Ok::<_, Error>(names)
            })
            .await;

        let installed = match listed {
            Ok(names) => names,
            Err(e) if e.is_absent() => {
                log::debug!("crd: listing unavailable ({e}), treating {crd} as absent");
                HashSet::new()
            }
            Err(e) => return Err(e),
        };

        let present = self.record(&context, crd, &installed);
        log::debug!("crd: {crd} installed = {present}");
        Ok(present)
    }

    /// Fails with [`Error::ExtensionNotInstalled`] unless `crd` is installed.
    pub async fn ensure(&self, crd: &OptionalCrd) -> Result<()> {
        let name = crd.crd_name();
        if self.exists(&name).await? {
            Ok(())
        } else {
            Err(Error::ExtensionNotInstalled {
                crd: name,
                product: crd.product.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::gateway::testing::{self, FakeApi};

    const CRDS: &str = "/apis/apiextensions.k8s.io/v1/customresourcedefinitions";

    fn listing(names: &[&str]) -> (StatusCode, serde_json::Value) {
        let items = names
            .iter()
            .map(|n| {
                json!({
                    "apiVersion": "meta.k8s.io/v1",
                    "kind": "PartialObjectMetadata",
                    "metadata": { "name": n },
                })
            })
            .collect();
        let (status, mut body) = testing::list("PartialObjectMetadataList", items);
        body["apiVersion"] = json!("meta.k8s.io/v1");
        (status, body)
    }

    fn answering(status: StatusCode) -> FakeApi {
        FakeApi::new(move |_, path, _| {
            assert_eq!(path, CRDS);
            if status.is_success() {
                listing(&["scaledobjects.keda.sh"])
            } else {
                testing::failure(status)
            }
        })
    }

    #[test]
    fn crd_names_follow_plural_dot_group() {
        assert_eq!(KEDA_SCALED_OBJECT.crd_name(), "scaledobjects.keda.sh");
        assert_eq!(
            ISTIO_VIRTUAL_SERVICE.api_resource().api_version,
            "networking.istio.io/v1beta1"
        );
    }

    #[tokio::test]
    async fn record_caches_every_listed_name() {
        let (gateway, _) = testing::gateway(&["prod"]).await;
        let gate = CrdGate::new(gateway);
        let installed: HashSet<String> = ["scaledobjects.keda.sh".to_string()].into();

        assert!(!gate.record("prod", "virtualservices.networking.istio.io", &installed));
        assert_eq!(gate.cached("prod", "scaledobjects.keda.sh"), Some(true));
        assert_eq!(
            gate.cached("prod", "virtualservices.networking.istio.io"),
            Some(false)
        );
        assert_eq!(gate.cached("staging", "scaledobjects.keda.sh"), None);
    }

    #[tokio::test]
    async fn ensure_uses_cache_and_names_the_product() {
        let (gateway, _) = testing::gateway(&["prod"]).await;
        let gate = CrdGate::new(gateway);
        gate.record("prod", &KEDA_SCALED_OBJECT.crd_name(), &HashSet::new());
        gate.record(
            "prod",
            &EXTERNAL_SECRET.crd_name(),
            &[EXTERNAL_SECRET.crd_name()].into(),
        );

        gate.ensure(&EXTERNAL_SECRET).await.unwrap();
        match gate.ensure(&KEDA_SCALED_OBJECT).await.unwrap_err() {
            Error::ExtensionNotInstalled { crd, product } => {
                assert_eq!(crd, "scaledobjects.keda.sh");
                assert_eq!(product, "KEDA");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn one_listing_answers_every_crd() {
        let api = answering(StatusCode::OK);
        let (gateway, _) = testing::serving(api.clone()).await;
        let gate = CrdGate::new(gateway);

        assert!(gate.exists("scaledobjects.keda.sh").await.unwrap());
        assert!(!gate.exists("nodepools.karpenter.sh").await.unwrap());
        assert!(gate.exists("scaledobjects.keda.sh").await.unwrap());
        // the miss was listed once, the hit came from the first listing
        assert_eq!(api.requests().len(), 2);
    }

    #[tokio::test]
    async fn missing_or_forbidden_listing_means_absent() {
        for status in [StatusCode::NOT_FOUND, StatusCode::FORBIDDEN] {
            let api = answering(status);
            let (gateway, _) = testing::serving(api.clone()).await;
            let gate = CrdGate::new(gateway);

            assert!(!gate.exists("scaledobjects.keda.sh").await.unwrap());
            assert!(!gate.exists("scaledobjects.keda.sh").await.unwrap());
            assert_eq!(api.requests().len(), 1, "{status}");
        }
    }

    #[tokio::test]
    async fn server_errors_are_not_cached_as_absent() {
        let api = answering(StatusCode::INTERNAL_SERVER_ERROR);
        let (gateway, _) = testing::serving(api.clone()).await;
        let gate = CrdGate::new(gateway);

        let err = gate.exists("scaledobjects.keda.sh").await.unwrap_err();
        assert!(!err.is_absent());
        assert_eq!(gate.cached("prod", "scaledobjects.keda.sh"), None);
        assert!(gate.ensure(&KEDA_SCALED_OBJECT).await.is_err());
        assert_eq!(api.requests().len(), 2);
    }
}
