use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use kube::config::Kubeconfig;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::k8s::KubeContext;

// ── discovery ─────────────────────────────────────────────────────────────────

/// A merged kubeconfig plus the file each context was read from.
#[derive(Debug, Clone)]
pub struct KubeconfigSet {
    pub config: Kubeconfig,
    pub sources: HashMap<String, PathBuf>,
}

fn kubeconfig_separator() -> char {
    if cfg!(windows) {
        ';'
    } else {
        ':'
    }
}

/// Returns the first kubeconfig file path to use for writes.
/// Respects KUBECONFIG env var, then ~/.kube/config.
pub fn primary_kubeconfig_path() -> Option<PathBuf> {
    std::env::var("KUBECONFIG")
        .ok()
        .filter(|v| !v.is_empty())
        .and_then(|v| {
            v.split(kubeconfig_separator())
                .next()
                .map(|s| PathBuf::from(s.trim()))
        })
        .or_else(|| dirs::home_dir().map(|h| h.join(".kube").join("config")))
}

/// Merges `extra` into `base` by extending clusters, auth_infos, and contexts.
/// `base.current_context` wins; `extra.current_context` is used only if base has none.
fn merge_kubeconfig(mut base: Kubeconfig, extra: Kubeconfig) -> Kubeconfig {
    base.clusters.extend(extra.clusters);
    base.auth_infos.extend(extra.auth_infos);
    base.contexts.extend(extra.contexts);
    if base.current_context.is_none() {
        base.current_context = extra.current_context;
    }
    base
}

/// Returns all regular, non-hidden files in `dir`, sorted alphabetically.
fn scan_kube_dir(dir: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("kubeconfig: cannot read directory {}: {e}", dir.display());
            return paths;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();

        // Skip subdirectories (cache/, http-cache/, etc.)
        if path.is_dir() {
            continue;
        }

        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.starts_with('.') {
            continue;
        }

        paths.push(path);
    }

    paths.sort();
    paths
}

/// Tries to load each path as a kubeconfig and merges all that succeed.
fn load_from_paths(paths: &[PathBuf]) -> Option<KubeconfigSet> {
    let mut merged: Option<Kubeconfig> = None;
    let mut sources = HashMap::new();

    for path in paths {
        if !path.exists() {
            log::info!("kubeconfig: skip (not found) {}", path.display());
            continue;
        }

        match Kubeconfig::read_from(path) {
            Ok(cfg) => {
                log::info!(
                    "kubeconfig: ok ({} context(s)) {}",
                    cfg.contexts.len(),
                    path.display()
                );
                for named in &cfg.contexts {
                    // first file wins, like kubectl
                    sources
                        .entry(named.name.clone())
                        .or_insert_with(|| path.clone());
                }
                merged = Some(match merged.take() {
                    None => cfg,
                    Some(base) => merge_kubeconfig(base, cfg),
                });
            }
            Err(e) => {
                // Not a kubeconfig, expected when scanning all files in ~/.kube
                log::info!("kubeconfig: skip (parse error: {e}) {}", path.display());
            }
        }
    }

    merged.map(|config| KubeconfigSet { config, sources })
}

/// Loads the kubeconfig the backend runs against.
///
/// Resolution order:
/// 1. an explicit file, when given;
/// 2. every file listed in `KUBECONFIG`, merged with kubectl semantics;
/// 3. every parseable regular file in `~/.kube`, merged in name order. This
///    covers processes launched without the shell environment.
pub fn load_kubeconfig(explicit: Option<&Path>) -> Result<KubeconfigSet> {
    if let Some(path) = explicit {
        return load_from_paths(&[path.to_path_buf()]).ok_or(Error::NoKubeconfig);
    }

    let kube_env = std::env::var("KUBECONFIG").unwrap_or_default();
    log::debug!("kubeconfig: KUBECONFIG env = {kube_env:?}");

    let candidates: Vec<PathBuf> = if !kube_env.is_empty() {
        kube_env
            .split(kubeconfig_separator())
            .filter(|s| !s.trim().is_empty())
            .map(|s| PathBuf::from(s.trim()))
            .collect()
    } else {
        let home = dirs::home_dir().ok_or(Error::NoKubeconfig)?;
        let kube_dir = home.join(".kube");
        log::info!("kubeconfig: KUBECONFIG not set, scanning {}", kube_dir.display());
        scan_kube_dir(&kube_dir)
    };

    let set = load_from_paths(&candidates).ok_or(Error::NoKubeconfig)?;
    log::info!(
        "kubeconfig: {} total context(s) after merge",
        set.config.contexts.len()
    );
    Ok(set)
}

impl KubeconfigSet {
    pub fn has_context(&self, name: &str) -> bool {
        self.config.contexts.iter().any(|c| c.name == name)
    }

    /// The context to start with: `current-context`, else the first one.
    pub fn initial_context(&self) -> Option<String> {
        self.config
            .current_context
            .clone()
            .filter(|c| self.has_context(c))
            .or_else(|| self.config.contexts.first().map(|c| c.name.clone()))
    }

    /// Describes every configured context, flagging `active`.
    pub fn contexts(&self, active: &str) -> Vec<KubeContext> {
        // cluster-name → server-URL lookup from the clusters stanza
        let cluster_servers: HashMap<&str, &str> = self
            .config
            .clusters
            .iter()
            .filter_map(|nc| {
                let server = nc.cluster.as_ref()?.server.as_deref()?;
                Some((nc.name.as_str(), server))
            })
            .collect();

        self.config
            .contexts
            .iter()
            .filter_map(|named| {
                let ctx = named.context.as_ref()?;
                Some(KubeContext {
                    name: named.name.clone(),
                    cluster: ctx.cluster.clone(),
                    user: ctx.user.clone().unwrap_or_default(),
                    namespace: ctx.namespace.clone(),
                    is_active: named.name == active,
                    server_url: cluster_servers.get(ctx.cluster.as_str()).map(|s| s.to_string()),
                    source_file: self
                        .sources
                        .get(&named.name)
                        .map(|p| p.to_string_lossy().to_string()),
                })
            })
            .collect()
    }
}

/// Writes the new current-context into the primary kubeconfig file.
/// Preserves all other fields verbatim by parsing as serde_yaml::Value.
pub fn persist_current_context(path: &Path, context_name: &str) -> Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let mut doc: serde_yaml::Value = serde_yaml::from_str(&raw)?;

    doc["current-context"] = serde_yaml::Value::String(context_name.to_string());

    std::fs::write(path, serde_yaml::to_string(&doc)?)?;
    log::info!("kubeconfig: current-context set to {context_name} in {}", path.display());
    Ok(())
}

// ── health ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealth {
    Healthy,
    Slow,
    Unreachable,
}

/// Pings `<server_url>/healthz`:
/// - healthy: responded in < 1.5 s
/// - slow: responded in 1.5 to 5 s
/// - unreachable: timed out or connection refused
///
/// Accepts invalid / self-signed TLS certs because many clusters use them.
pub async fn check_cluster_health(server_url: &str) -> ClusterHealth {
    let client = match reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(c) => c,
        Err(_) => return ClusterHealth::Unreachable,
    };

    let url = format!("{}/healthz", server_url.trim_end_matches('/'));
    let started = Instant::now();

    match client.get(&url).send().await {
        Ok(_) if started.elapsed() > Duration::from_millis(1500) => ClusterHealth::Slow,
        Ok(_) => ClusterHealth::Healthy,
        Err(e) => {
            log::debug!("health: {url} unreachable: {e}");
            ClusterHealth::Unreachable
        }
    }
}
