use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Runtime settings, read from `<config_dir>/cluster-lens/settings.yaml`.
///
/// Every field has a default so a missing or partial file is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Explicit kubeconfig file; discovery is used when unset.
    pub kubeconfig: Option<PathBuf>,
    /// Context to activate at startup instead of `current-context`.
    pub context: Option<String>,
    /// Write `current-context` back to the primary kubeconfig on switch.
    pub persist_context_switch: bool,
    pub metrics_refresh_secs: u64,
    pub drain_grace_period_secs: u32,
    pub watch_channel_capacity: usize,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            kubeconfig: None,
            context: None,
            persist_context_switch: false,
            metrics_refresh_secs: 15,
            drain_grace_period_secs: 30,
            watch_channel_capacity: 256,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("cluster-lens").join("settings.yaml"))
    }

    /// Loads settings from `path`, or from [`Settings::default_path`].
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let Some(path) = path.map(Path::to_path_buf).or_else(Self::default_path) else {
            return Ok(Settings::default());
        };
        if !path.exists() {
            log::debug!("settings: {} not found, using defaults", path.display());
            return Ok(Settings::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_yaml::from_str(&raw)?;
        log::info!("settings: loaded {}", path.display());
        Ok(settings)
    }

    pub fn metrics_refresh(&self) -> Duration {
        Duration::from_secs(self.metrics_refresh_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("nope.yaml"))).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.metrics_refresh(), Duration::from_secs(15));
        assert_eq!(settings.drain_grace_period_secs, 30);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "context: staging\nmetricsRefreshSecs: 5\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.context.as_deref(), Some("staging"));
        assert_eq!(settings.metrics_refresh_secs, 5);
        assert_eq!(settings.watch_channel_capacity, 256);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "metricsRefreshSecs: [1, 2]\n").unwrap();
        assert!(Settings::load(Some(&path)).is_err());
    }
}
