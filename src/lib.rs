pub mod blockers;
pub mod contexts;
pub mod crd_gate;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod models;
pub mod nodes;
pub mod pools;
pub mod port_forward;
pub mod quantity;
pub mod resources;
pub mod settings;
pub mod watch;

use std::sync::Arc;

pub use error::{Error, Result};

use crd_gate::CrdGate;
use gateway::{Gateway, KubeconfigConnector};
use nodes::NodeService;
use resources::{KindDescriptor, ResourceService};
use settings::Settings;
use watch::WatchManager;

/// Installs the global logger. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level);
    if env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init()
        .is_err()
    {
        log::debug!("logger already installed");
    }
}

/// Everything a front end needs, wired to one gateway.
pub struct Backend {
    pub settings: Settings,
    pub gateway: Arc<Gateway>,
    pub crds: Arc<CrdGate>,
    pub watches: Arc<WatchManager>,
    pub nodes: NodeService,
}

impl Backend {
    /// Loads kubeconfig and connects to the configured (or current) context.
    pub async fn connect(settings: Settings) -> Result<Backend> {
        let connector = KubeconfigConnector::load(
            settings.kubeconfig.clone(),
            settings.persist_context_switch,
        )?;
        let gateway =
            Arc::new(Gateway::connect(Arc::new(connector), settings.context.clone()).await?);
        Ok(Backend::with_gateway(gateway, settings))
    }

    pub fn with_gateway(gateway: Arc<Gateway>, settings: Settings) -> Backend {
        Backend {
            crds: Arc::new(CrdGate::new(gateway.clone())),
            watches: Arc::new(WatchManager::new(gateway.clone(), &settings)),
            nodes: NodeService::new(gateway.clone(), settings.drain_grace_period_secs),
            gateway,
            settings,
        }
    }

    /// The service for kind `D`.
    pub fn service<D: KindDescriptor>(&self) -> ResourceService<D> {
        ResourceService::new(self.gateway.clone(), self.crds.clone(), self.watches.clone())
    }
}
