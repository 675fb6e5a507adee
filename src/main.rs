use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use cluster_lens::contexts::check_cluster_health;
use cluster_lens::port_forward::PortForwardRequest;
use cluster_lens::resources::kinds::*;
use cluster_lens::resources::{KindDescriptor, Restartable, Scalable};
use cluster_lens::settings::Settings;
use cluster_lens::{init_logging, Backend, Error};

#[derive(Parser, Debug)]
#[command(name = "cluster-lens")]
#[command(about = "Inspect node pools, scheduling blockers and live resources of a cluster")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to <config_dir>/cluster-lens/settings.yaml)
    #[arg(long, global = true, value_name = "FILE", env = "CLUSTER_LENS_SETTINGS")]
    settings: Option<PathBuf>,

    /// Kubeconfig file; overrides discovery
    #[arg(long, global = true, value_name = "FILE")]
    kubeconfig: Option<PathBuf>,

    /// Context to use instead of current-context
    #[arg(long, global = true)]
    context: Option<String>,

    /// Namespace; all namespaces when omitted for listings
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured contexts
    Contexts {
        /// Probe each API server's /healthz
        #[arg(long)]
        health: bool,
    },
    /// Make a context current and write it back to kubeconfig
    UseContext { name: String },
    /// Nodes with blocker analysis and pool rollups
    Nodes,
    List { kind: Kind },
    /// Print an object without server-side bookkeeping fields
    Manifest { kind: Kind, name: String },
    Delete { kind: Kind, name: String },
    /// Stream changes as JSON lines until interrupted
    Watch { kind: Kind },
    Cordon { node: String },
    Uncordon { node: String },
    /// Cordon a node and evict its pods
    Drain { node: String },
    Scale {
        kind: Kind,
        name: String,
        replicas: i32,
    },
    /// Rollout restart
    Restart { kind: Kind, name: String },
    /// Forward a local port until interrupted
    PortForward {
        /// `pod/<name>` or `svc/<name>`
        target: String,
        /// LOCAL:REMOTE
        #[arg(value_parser = parse_ports)]
        ports: (u16, u16),
    },
}

fn parse_ports(value: &str) -> Result<(u16, u16), String> {
    let (local, remote) = value.split_once(':').unwrap_or((value, value));
    let port = |p: &str| p.parse::<u16>().map_err(|e| format!("invalid port {p:?}: {e}"));
    Ok((port(local)?, port(remote)?))
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Pods,
    Nodes,
    Namespaces,
    Deployments,
    Statefulsets,
    Daemonsets,
    Services,
    Configmaps,
    Secrets,
    Hpa,
    Virtualservices,
    Scaledobjects,
    Externalsecrets,
    Nodepools,
}

macro_rules! with_kind {
    ($kind:expr, $op:ident ( $($arg:expr),* )) => {
        match $kind {
            Kind::Pods => $op::<PodKind>($($arg),*).await,
            Kind::Nodes => $op::<NodeKind>($($arg),*).await,
            Kind::Namespaces => $op::<NamespaceKind>($($arg),*).await,
            Kind::Deployments => $op::<DeploymentKind>($($arg),*).await,
            Kind::Statefulsets => $op::<StatefulSetKind>($($arg),*).await,
            Kind::Daemonsets => $op::<DaemonSetKind>($($arg),*).await,
            Kind::Services => $op::<ServiceKind>($($arg),*).await,
            Kind::Configmaps => $op::<ConfigMapKind>($($arg),*).await,
            Kind::Secrets => $op::<SecretKind>($($arg),*).await,
            Kind::Hpa => $op::<HorizontalPodAutoscalerKind>($($arg),*).await,
            Kind::Virtualservices => $op::<VirtualServiceKind>($($arg),*).await,
            Kind::Scaledobjects => $op::<ScaledObjectKind>($($arg),*).await,
            Kind::Externalsecrets => $op::<ExternalSecretKind>($($arg),*).await,
            Kind::Nodepools => $op::<NodePoolKind>($($arg),*).await,
        }
    };
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let out = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{out}");
    Ok(())
}

fn unsupported(kind: Kind, operation: &str) -> String {
    Error::Unsupported {
        kind: format!("{kind:?}").to_lowercase(),
        operation: operation.to_string(),
    }
    .to_string()
}

async fn list<D: KindDescriptor>(backend: &Backend, namespace: Option<&str>) -> Result<(), String> {
    let items = backend
        .service::<D>()
        .list(namespace)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&items)
}

async fn manifest<D: KindDescriptor>(
    backend: &Backend,
    namespace: Option<&str>,
    name: &str,
) -> Result<(), String> {
    let manifest = backend
        .service::<D>()
        .manifest(namespace, name)
        .await
        .map_err(|e| e.to_string())?;
    println!("{manifest}");
    Ok(())
}

async fn delete<D: KindDescriptor>(
    backend: &Backend,
    namespace: Option<&str>,
    name: &str,
) -> Result<(), String> {
    backend
        .service::<D>()
        .delete(namespace, name)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({ "deleted": name }))
}

async fn watch<D: KindDescriptor>(
    backend: &Backend,
    namespace: Option<&str>,
) -> Result<(), String> {
    let cancel = CancellationToken::new();
    let mut subscription = backend
        .service::<D>()
        .stream(namespace, &cancel)
        .await
        .map_err(|e| e.to_string())?;

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    while let Some(event) = subscription.next().await {
        let event = event.map_err(|e| e.to_string())?;
        let line = serde_json::to_string(&event).map_err(|e| e.to_string())?;
        println!("{line}");
    }
    Ok(())
}

async fn scale<D: Scalable>(
    backend: &Backend,
    namespace: &str,
    name: &str,
    replicas: i32,
) -> Result<(), String> {
    backend
        .service::<D>()
        .scale(namespace, name, replicas)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({ "scaled": name, "replicas": replicas }))
}

async fn restart<D: Restartable>(
    backend: &Backend,
    namespace: &str,
    name: &str,
) -> Result<(), String> {
    backend
        .service::<D>()
        .restart(namespace, name)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({ "restarted": name }))
}

async fn contexts(backend: &Backend, health: bool) -> Result<(), String> {
    let contexts = backend.gateway.list_contexts();
    if !health {
        return print_json(&contexts);
    }
    let probes = contexts.iter().map(|c| async move {
        match &c.server_url {
            Some(url) => Some(check_cluster_health(url).await),
            None => None,
        }
    });
    let health = join_all(probes).await;
    let rows: Vec<_> = contexts
        .iter()
        .zip(health)
        .map(|(context, health)| json!({ "context": context, "health": health }))
        .collect();
    print_json(&rows)
}

async fn port_forward(
    backend: &Backend,
    namespace: &str,
    target: String,
    ports: (u16, u16),
) -> Result<(), String> {
    let info = backend
        .gateway
        .start_port_forward(PortForwardRequest {
            namespace: namespace.to_string(),
            target,
            local_port: ports.0,
            remote_port: ports.1,
        })
        .map_err(|e| e.to_string())?;
    print_json(&info)?;
    tokio::signal::ctrl_c().await.map_err(|e| e.to_string())?;
    backend.gateway.port_forwards().stop_all();
    Ok(())
}

async fn run(cli: Cli) -> Result<(), String> {
    let mut settings = Settings::load(cli.settings.as_deref()).map_err(|e| e.to_string())?;
    init_logging(&settings.log_level);
    if cli.kubeconfig.is_some() {
        settings.kubeconfig = cli.kubeconfig.clone();
    }
    if cli.context.is_some() {
        settings.context = cli.context.clone();
    }
    if matches!(cli.command, Command::UseContext { .. }) {
        settings.persist_context_switch = true;
    }

    let backend = Backend::connect(settings).await.map_err(|e| e.to_string())?;
    let namespace = cli.namespace.as_deref();
    // single objects default to the context namespace
    let target_namespace = namespace
        .map(str::to_string)
        .unwrap_or_else(|| backend.gateway.clients().default_namespace().to_string());
    let ns = target_namespace.as_str();

    match cli.command {
        Command::Contexts { health } => contexts(&backend, health).await,
        Command::UseContext { name } => {
            backend
                .gateway
                .switch_context(&name)
                .await
                .map_err(|e| e.to_string())?;
            print_json(&json!({ "currentContext": name }))
        }
        Command::Nodes => {
            let inventory = backend.nodes.list_nodes().await.map_err(|e| e.to_string())?;
            print_json(&inventory)
        }
        Command::List { kind } => with_kind!(kind, list(&backend, namespace)),
        Command::Manifest { kind, name } => with_kind!(kind, manifest(&backend, namespace, &name)),
        Command::Delete { kind, name } => with_kind!(kind, delete(&backend, namespace, &name)),
        Command::Watch { kind } => with_kind!(kind, watch(&backend, namespace)),
        Command::Cordon { node } => {
            backend.nodes.cordon(&node).await.map_err(|e| e.to_string())?;
            print_json(&json!({ "cordoned": node }))
        }
        Command::Uncordon { node } => {
            backend.nodes.uncordon(&node).await.map_err(|e| e.to_string())?;
            print_json(&json!({ "uncordoned": node }))
        }
        Command::Drain { node } => {
            let outcome = backend.nodes.drain(&node).await.map_err(|e| e.to_string())?;
            print_json(&outcome)
        }
        Command::Scale {
            kind,
            name,
            replicas,
        } => match kind {
            Kind::Deployments => scale::<DeploymentKind>(&backend, ns, &name, replicas).await,
            Kind::Statefulsets => scale::<StatefulSetKind>(&backend, ns, &name, replicas).await,
            other => Err(unsupported(other, "scale")),
        },
        Command::Restart { kind, name } => match kind {
            Kind::Deployments => restart::<DeploymentKind>(&backend, ns, &name).await,
            Kind::Statefulsets => restart::<StatefulSetKind>(&backend, ns, &name).await,
            Kind::Daemonsets => restart::<DaemonSetKind>(&backend, ns, &name).await,
            other => Err(unsupported(other, "restart")),
        },
        Command::PortForward { target, ports } => port_forward(&backend, ns, target, ports).await,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
