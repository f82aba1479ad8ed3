use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{WAN_IP_CONNECTION, WAN_PPP_CONNECTION};
use shared::types::Protocol;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mapping: MappingConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// The single port mapping this daemon keeps alive
#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    pub internal_port: u16,
    /// 0 requests the same port as `internal_port`
    #[serde(default)]
    pub external_port: u16,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_lifetime")]
    pub lifetime_secs: u64,
    #[serde(default = "default_renew_interval")]
    pub renew_interval_secs: u64,
    /// Poll cadence while no control service has been discovered
    #[serde(default = "default_idle_poll")]
    pub idle_poll_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// 0 retries forever
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_rebroadcast_interval")]
    pub rebroadcast_interval_secs: u64,
    #[serde(default = "default_search_targets")]
    pub search_targets: Vec<String>,
    /// Also send M-SEARCH directly to the default gateway(s)
    #[serde(default = "default_unicast_gateways")]
    pub unicast_gateways: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}

fn default_name() -> String {
    match hostname::get() {
        Ok(host) => format!("portmapd ({})", host.to_string_lossy()),
        Err(_) => "portmapd".to_string(),
    }
}

fn default_lifetime() -> u64 {
    7200
}

fn default_renew_interval() -> u64 {
    3600
}

fn default_idle_poll() -> u64 {
    1
}

fn default_initial_delay() -> u64 {
    5
}

fn default_max_delay() -> u64 {
    300
}

fn default_max_tries() -> u32 {
    10
}

fn default_rebroadcast_interval() -> u64 {
    30
}

fn default_search_targets() -> Vec<String> {
    vec![WAN_IP_CONNECTION.to_string(), WAN_PPP_CONNECTION.to_string()]
}

fn default_unicast_gateways() -> bool {
    true
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

impl MappingConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_secs)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_secs)
    }
}

impl DiscoveryConfig {
    pub fn rebroadcast_interval(&self) -> Duration {
        Duration::from_secs(self.rebroadcast_interval_secs)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            max_tries: default_max_tries(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            rebroadcast_interval_secs: default_rebroadcast_interval(),
            search_targets: default_search_targets(),
            unicast_gateways: default_unicast_gateways(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse("[mapping]\ninternal_port = 51413\n").unwrap();

        assert_eq!(config.mapping.protocol, Protocol::Tcp);
        assert_eq!(config.mapping.internal_port, 51413);
        assert_eq!(config.mapping.external_port, 0);
        assert!(config.mapping.name.starts_with("portmapd"));
        assert_eq!(config.mapping.renew_interval(), Duration::from_secs(3600));
        assert_eq!(config.backoff.max_tries, 10);
        assert_eq!(config.discovery.rebroadcast_interval(), Duration::from_secs(30));
        assert_eq!(config.discovery.search_targets.len(), 2);
        assert_eq!(config.api.listen, "127.0.0.1:8054");
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [mapping]
            protocol = "UDP"
            internal_port = 6881
            external_port = 6882
            name = "torrent"
            lifetime_secs = 600

            [backoff]
            max_tries = 0

            [discovery]
            search_targets = ["urn:schemas-upnp-org:service:WANIPConnection:1"]
            unicast_gateways = false
            "#,
        )
        .unwrap();

        assert_eq!(config.mapping.protocol, Protocol::Udp);
        assert_eq!(config.mapping.external_port, 6882);
        assert_eq!(config.mapping.name, "torrent");
        assert_eq!(config.mapping.lifetime(), Duration::from_secs(600));
        assert_eq!(config.backoff.max_tries, 0);
        assert_eq!(config.backoff.initial_delay_secs, 5);
        assert!(!config.discovery.unicast_gateways);
    }

    #[test]
    fn test_missing_internal_port_rejected() {
        assert!(Config::parse("[mapping]\nname = \"x\"\n").is_err());
    }
}
