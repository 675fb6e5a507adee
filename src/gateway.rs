//! The single path to the API server.
//!
//! Every call runs against an immutable [`ClientSet`]. A credential refresh
//! or a context switch builds a new set and swaps it in; calls already in
//! flight keep the set they started with.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use kube::config::KubeConfigOptions;
use kube::{Client, Config};

use crate::contexts::{self, KubeconfigSet};
use crate::error::{Error, Result};
use crate::models::k8s::KubeContext;
use crate::port_forward::{PortForwardInfo, PortForwardRequest, PortForwards};

/// Client handles bound to one context.
pub struct ClientSet {
    context: String,
    namespace: String,
    client: Client,
    generation: u64,
}

impl ClientSet {
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn default_namespace(&self) -> &str {
        &self.namespace
    }

    /// Increases every time a set is built.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Builds clients for named contexts.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Configured contexts, with `active` flagged.
    fn contexts(&self, active: &str) -> Vec<KubeContext>;

    fn has_context(&self, name: &str) -> bool;

    fn initial_context(&self) -> Option<String>;

    /// Builds a client for `context` with freshly loaded credentials.
    /// Returns the client and the context's default namespace.
    async fn connect(&self, context: &str) -> Result<(Client, String)>;

    /// Called after a switch to `context` took effect.
    fn switched(&self, _context: &str) -> Result<()> {
        Ok(())
    }
}

/// Connector backed by kubeconfig files on disk.
///
/// Credentials are re-read on every connect so rotated tokens and exec
/// plugin output are picked up on refresh.
pub struct KubeconfigConnector {
    explicit: Option<PathBuf>,
    persist_switch: bool,
    loaded: RwLock<KubeconfigSet>,
}

impl KubeconfigConnector {
    pub fn load(explicit: Option<PathBuf>, persist_switch: bool) -> Result<Self> {
        let loaded = contexts::load_kubeconfig(explicit.as_deref())?;
        Ok(KubeconfigConnector {
            explicit,
            persist_switch,
            loaded: RwLock::new(loaded),
        })
    }

    fn snapshot(&self) -> KubeconfigSet {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn reload(&self) -> KubeconfigSet {
        match contexts::load_kubeconfig(self.explicit.as_deref()) {
            Ok(set) => {
                *self.loaded.write().unwrap_or_else(PoisonError::into_inner) = set.clone();
                set
            }
            Err(e) => {
                log::warn!("kubeconfig: reload failed, using last good copy: {e}");
                self.snapshot()
            }
        }
    }
}

#[async_trait]
impl Connector for KubeconfigConnector {
    fn contexts(&self, active: &str) -> Vec<KubeContext> {
        self.snapshot().contexts(active)
    }

    fn has_context(&self, name: &str) -> bool {
        self.snapshot().has_context(name)
    }

    fn initial_context(&self) -> Option<String> {
        self.snapshot().initial_context()
    }

    async fn connect(&self, context: &str) -> Result<(Client, String)> {
        let set = self.reload();
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(set.config, &options).await?;
        let namespace = config.default_namespace.clone();
        let client = Client::try_from(config)?;
        Ok((client, namespace))
    }

    fn switched(&self, context: &str) -> Result<()> {
        if !self.persist_switch {
            return Ok(());
        }
        match contexts::primary_kubeconfig_path() {
            Some(path) => contexts::persist_current_context(&path, context),
            None => Ok(()),
        }
    }
}

pub struct Gateway {
    connector: Arc<dyn Connector>,
    active: RwLock<Arc<ClientSet>>,
    generation: AtomicU64,
    port_forwards: PortForwards,
}

impl Gateway {
    /// Connects to `context`, or to the connector's initial context.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        context: Option<String>,
    ) -> Result<Gateway> {
        let name = context
            .or_else(|| connector.initial_context())
            .ok_or(Error::NoKubeconfig)?;
        if !connector.has_context(&name) {
            return Err(Error::ContextNotFound(name));
        }
        let (client, namespace) = connector.connect(&name).await?;
        log::info!("gateway: connected to context {name}");
        Ok(Gateway {
            connector,
            active: RwLock::new(Arc::new(ClientSet {
                context: name,
                namespace,
                client,
                generation: 1,
            })),
            generation: AtomicU64::new(1),
            port_forwards: PortForwards::default(),
        })
    }

    /// The client set new calls should use.
    pub fn clients(&self) -> Arc<ClientSet> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install(&self, context: String, namespace: String, client: Client) -> Arc<ClientSet> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(ClientSet {
            context,
            namespace,
            client,
            generation,
        })
    }

    /// Runs `op`; on an authentication failure refreshes credentials once
    /// and runs it once more. Any other outcome is returned unchanged.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<ClientSet>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let clients = self.clients();
        match op(clients.clone()).await {
            Err(e) if e.is_auth_expired() => {
                log::info!(
                    "gateway: credentials for {} rejected, refreshing",
                    clients.context
                );
                let refreshed = self.refresh(&clients).await?;
                op(refreshed).await
            }
            other => other,
        }
    }

    /// Rebuilds the client set for `stale`'s context.
    ///
    /// When another caller already refreshed past `stale`, that set is
    /// returned instead of connecting again. The new set only becomes
    /// active if the context has not been switched meanwhile.
    pub async fn refresh(&self, stale: &ClientSet) -> Result<Arc<ClientSet>> {
        let current = self.clients();
        if current.context == stale.context && current.generation > stale.generation {
            return Ok(current);
        }

        let (client, namespace) = self.connector.connect(&stale.context).await?;
        let fresh = self.install(stale.context.clone(), namespace, client);

        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if active.context == fresh.context {
            *active = fresh.clone();
        }
        Ok(fresh)
    }

    pub fn current_context(&self) -> String {
        self.clients().context.clone()
    }

    pub fn list_contexts(&self) -> Vec<KubeContext> {
        self.connector.contexts(&self.current_context())
    }

    /// Makes `name` the active context.
    ///
    /// Either the switch completes, or the previous client set stays active
    /// untouched. Port-forwards are bound to the old context and are
    /// stopped; watches notice on their next authentication failure.
    pub async fn switch_context(&self, name: &str) -> Result<()> {
        if !self.connector.has_context(name) {
            return Err(Error::ContextNotFound(name.to_string()));
        }
        let (client, namespace) = self.connector.connect(name).await?;
        let fresh = self.install(name.to_string(), namespace, client);

        let previous = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *active, fresh)
        };
        let stopped = self.port_forwards.stop_all();
        log::info!(
            "gateway: switched {} -> {name} ({stopped} port-forward(s) stopped)",
            previous.context
        );

        if let Err(e) = self.connector.switched(name) {
            log::warn!("gateway: could not persist context {name}: {e}");
        }
        Ok(())
    }

    pub fn start_port_forward(&self, request: PortForwardRequest) -> Result<PortForwardInfo> {
        let context = self.current_context();
        let source_file = self
            .list_contexts()
            .into_iter()
            .find(|c| c.name == context)
            .and_then(|c| c.source_file);
        self.port_forwards
            .start(&context, source_file.as_deref(), request)
    }

    pub fn port_forwards(&self) -> &PortForwards {
        &self.port_forwards
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::testing::*;
    use super::*;
    use crate::error::api_error;

    #[tokio::test]
    async fn retries_once_after_auth_failure() {
        let (gateway, connector) = gateway(&["prod"]).await;
        let attempts = AtomicUsize::new(0);

        let result = gateway
            .call(|clients| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(api_error(401))
                    } else {
                        Ok(clients.generation())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(connector.connects(), 2);
        assert!(result > 1);
        assert_eq!(gateway.clients().generation(), result);
    }

    #[tokio::test]
    async fn second_auth_failure_propagates() {
        let (gateway, connector) = gateway(&["prod"]).await;
        let attempts = AtomicUsize::new(0);

        let err = gateway
            .call(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(api_error(401)) }
            })
            .await
            .unwrap_err();

        assert!(err.is_auth_expired());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let (gateway, connector) = gateway(&["prod"]).await;
        for code in [404, 500, 503] {
            let attempts = AtomicUsize::new(0);
            let err = gateway
                .call(|_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async move { Err::<(), _>(api_error(code)) }
                })
                .await
                .unwrap_err();
            assert!(!err.is_auth_expired());
            assert_eq!(attempts.load(Ordering::SeqCst), 1);
        }
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn unknown_context_leaves_active_set_alone() {
        let (gateway, connector) = gateway(&["prod", "staging"]).await;
        let before = gateway.clients();

        let err = gateway.switch_context("nonexistent").await.unwrap_err();
        assert!(matches!(err, Error::ContextNotFound(ref n) if n == "nonexistent"));
        assert_eq!(connector.connects(), 1);
        assert!(Arc::ptr_eq(&before, &gateway.clients()));

        let context = gateway
            .call(|clients| async move { Ok(clients.context().to_string()) })
            .await
            .unwrap();
        assert_eq!(context, "prod");
    }

    #[tokio::test]
    async fn switch_swaps_clients_and_keeps_old_handles_valid() {
        let (gateway, _) = gateway(&["prod", "staging"]).await;
        let old = gateway.clients();

        gateway.switch_context("staging").await.unwrap();

        assert_eq!(gateway.current_context(), "staging");
        assert_eq!(old.context(), "prod");
        let active: Vec<_> = gateway
            .list_contexts()
            .into_iter()
            .filter(|c| c.is_active)
            .map(|c| c.name)
            .collect();
        assert_eq!(active, vec!["staging".to_string()]);
    }

    #[tokio::test]
    async fn refresh_after_switch_does_not_reactivate_old_context() {
        let (gateway, _) = gateway(&["prod", "staging"]).await;
        let old = gateway.clients();
        gateway.switch_context("staging").await.unwrap();

        let refreshed = gateway.refresh(&old).await.unwrap();
        assert_eq!(refreshed.context(), "prod");
        assert_eq!(gateway.current_context(), "staging");
    }
}
