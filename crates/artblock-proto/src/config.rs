use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

/// Backend path serving the community blacklist.
pub const LIST_ENDPOINT: &str = "/api/list/";
/// Backend path receiving block reports.
pub const FLAG_ENDPOINT: &str = "/api/flag/";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub sites: SitesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the Spot The AI backend.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Minutes between periodic community syncs.
    #[serde(default = "default_sync_interval")]
    pub interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitesConfig {
    /// Streaming site hosts whose tabs count as players.  Matching includes
    /// subdomains, so `deezer.com` also covers `www.deezer.com`.
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_daemon_port(),
            state_file: default_state_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_sync_interval(),
        }
    }
}

impl Default for SitesConfig {
    fn default() -> Self {
        Self {
            allowed_domains: default_allowed_domains(),
        }
    }
}

fn default_base_url() -> String {
    "https://spot-the-ai.com".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("blacklist.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_port() -> u16 {
    8991
}

fn default_sync_interval() -> u64 {
    360
}

fn default_allowed_domains() -> Vec<String> {
    vec![
        "open.spotify.com".to_string(),
        "deezer.com".to_string(),
        "music.youtube.com".to_string(),
    ]
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            daemon: DaemonConfig::default(),
            http: HttpConfig::default(),
            sync: SyncConfig::default(),
            sites: SitesConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api.base_url, "https://spot-the-ai.com");
        assert_eq!(config.daemon.port, 9878);
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8991);
        assert_eq!(config.sync.interval_minutes, 360);
        assert!(config
            .sites
            .allowed_domains
            .iter()
            .any(|d| d == "music.youtube.com"));
        assert!(config.daemon.state_file.ends_with("artblock/blacklist.json"));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sync]
            interval_minutes = 60

            [api]
            base_url = "http://localhost:8000"
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.interval_minutes, 60);
        assert_eq!(config.api.base_url, "http://localhost:8000");
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.daemon.port, 9878);
        assert_eq!(config.sites.allowed_domains.len(), 3);
    }
}
