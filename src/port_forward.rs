use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What to forward: `target` is `pod/<name>` or `svc/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardRequest {
    pub namespace: String,
    pub target: String,
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardInfo {
    pub id: u64,
    pub context: String,
    pub namespace: String,
    pub target: String,
    pub local_port: u16,
    pub remote_port: u16,
}

struct Session {
    info: PortForwardInfo,
    child: Child,
}

/// Book-keeping for `kubectl port-forward` child processes.
///
/// Sessions are bound to the context they were started in, so the gateway
/// stops all of them when the active context changes.
#[derive(Default)]
pub struct PortForwards {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, Session>>,
}

impl PortForwards {
    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, Session>> {
        // a panic while holding the lock leaves the map itself intact
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Starts `kubectl port-forward <target> <local>:<remote>`.
    ///
    /// `source_file` pins the kubeconfig file so a multi-path KUBECONFIG
    /// cannot resolve `context` differently from the gateway.
    pub fn start(
        &self,
        context: &str,
        source_file: Option<&str>,
        request: PortForwardRequest,
    ) -> Result<PortForwardInfo> {
        let kubectl = which::which("kubectl")
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| "kubectl".to_string());

        let mut args = vec![
            "port-forward".to_string(),
            request.target.clone(),
            format!("{}:{}", request.local_port, request.remote_port),
            "-n".to_string(),
            request.namespace.clone(),
            format!("--context={context}"),
        ];
        if let Some(file) = source_file {
            args.push(format!("--kubeconfig={file}"));
        }

        let child = Command::new(&kubectl)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::PortForward(format!("failed to spawn kubectl port-forward: {e}")))?;

        let info = PortForwardInfo {
            id: 0,
            context: context.to_string(),
            namespace: request.namespace,
            target: request.target,
            local_port: request.local_port,
            remote_port: request.remote_port,
        };
        let info = self.register(info, child);
        log::info!(
            "port-forward: #{} {}/{} {}:{}",
            info.id,
            info.namespace,
            info.target,
            info.local_port,
            info.remote_port
        );
        Ok(info)
    }

    fn register(&self, mut info: PortForwardInfo, child: Child) -> PortForwardInfo {
        info.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions().insert(
            info.id,
            Session {
                info: info.clone(),
                child,
            },
        );
        info
    }

    pub fn list(&self) -> Vec<PortForwardInfo> {
        let mut infos: Vec<_> = self.sessions().values().map(|s| s.info.clone()).collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    /// Kills one session. Returns false when the id is unknown.
    pub fn stop(&self, id: u64) -> Result<bool> {
        let Some(mut session) = self.sessions().remove(&id) else {
            return Ok(false);
        };
        session.child.kill()?;
        let _ = session.child.wait();
        Ok(true)
    }

    /// Kills every session and returns how many there were.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<Session> = self.sessions().drain().map(|(_, s)| s).collect();
        let count = drained.len();
        for mut session in drained {
            if let Err(e) = session.child.kill() {
                log::warn!("port-forward: failed to stop #{}: {e}", session.info.id);
            }
            let _ = session.child.wait();
        }
        if count > 0 {
            log::info!("port-forward: stopped {count} session(s)");
        }
        count
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sleeper(forwards: &PortForwards, context: &str) -> PortForwardInfo {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        forwards.register(
            PortForwardInfo {
                id: 0,
                context: context.to_string(),
                namespace: "default".to_string(),
                target: "svc/web".to_string(),
                local_port: 8080,
                remote_port: 80,
            },
            child,
        )
    }

    #[test]
    fn stop_all_kills_every_session() {
        let forwards = PortForwards::default();
        let first = sleeper(&forwards, "prod");
        let second = sleeper(&forwards, "prod");
        assert_ne!(first.id, second.id);
        assert_eq!(forwards.list().len(), 2);

        assert_eq!(forwards.stop_all(), 2);
        assert!(forwards.list().is_empty());
        assert_eq!(forwards.stop_all(), 0);
    }

    #[test]
    fn stop_unknown_id_is_false() {
        let forwards = PortForwards::default();
        let info = sleeper(&forwards, "prod");
        assert!(!forwards.stop(info.id + 100).unwrap());
        assert!(forwards.stop(info.id).unwrap());
    }
}
