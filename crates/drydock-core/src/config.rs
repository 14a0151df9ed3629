//! Application configuration for the deployment host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One egress proxy endpoint used for repository traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub address: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

/// Host-level settings: working folders, repository egress, and the
/// timing/retry knobs of the orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root folder holding one subfolder per configuration and server.
    pub deployer_folder: PathBuf,
    /// Template copied when a new server is added to a configuration.
    pub template_folder: PathBuf,
    /// Archive folder for per-server runtime logs, keyed by server record id.
    pub history_folder: PathBuf,
    /// The one file `clean` leaves behind in the deployments folder.
    pub keep_resource: String,
    /// Egress proxies rotated across repository requests.
    pub proxies: Vec<ProxyEndpoint>,
    pub max_download_attempts: u32,
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
    /// Period of the safety-net scan for pending runs.
    pub promote_scan_ms: u64,
    /// Number of runs retained per configuration, newest first.
    pub retained_runs: usize,
    pub container_name: String,
    pub container_image: String,
    /// Runtime-side path the three working directories are mounted under.
    pub container_home: String,
    /// Base URL used when building links in notification reports.
    pub server_location: String,
    /// IANA timezone the periodic trigger schedules are evaluated in.
    pub trigger_timezone: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            deployer_folder: PathBuf::from("data/servers"),
            template_folder: PathBuf::from("data/server-template"),
            history_folder: PathBuf::from("data/history"),
            keep_resource: "webm-jmsra.rar".to_string(),
            proxies: Vec::new(),
            max_download_attempts: 3,
            poll_interval_ms: 2_000,
            poll_timeout_ms: 180_000,
            promote_scan_ms: 2_000,
            retained_runs: 5,
            container_name: "deployer".to_string(),
            container_image: "jboss:6.4.17".to_string(),
            container_home: "/opt/jboss/eap-6.4.17/standalone".to_string(),
            server_location: "http://localhost:3001".to_string(),
            trigger_timezone: "Europe/Paris".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Working directory of one server for one configuration.
    pub fn server_folder(&self, config_name: &str, server_name: &str) -> PathBuf {
        self.deployer_folder.join(config_name).join(server_name)
    }

    /// Archived runtime log for one server record.
    pub fn history_log(&self, server_id: Uuid) -> PathBuf {
        self.history_folder.join(format!("{server_id}.log"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn promote_scan_period(&self) -> Duration {
        Duration::from_millis(self.promote_scan_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_orchestration_budgets() {
        let config = AppConfig::default();
        assert_eq!(config.max_download_attempts, 3);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.poll_timeout(), Duration::from_secs(180));
        assert_eq!(config.retained_runs, 5);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            deployer_folder = "/srv/deployer"
            max_download_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.deployer_folder, PathBuf::from("/srv/deployer"));
        assert_eq!(config.max_download_attempts, 5);
        assert_eq!(config.poll_timeout_ms, 180_000);
    }
}
