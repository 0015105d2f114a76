//! Configuration file management.
//!
//! `config.toml` lives in the data directory (`$TRELLIS_DATA_DIR`, or
//! `~/.trellis`). Every field has a default, and a few network settings can
//! be overridden from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `TRELLIS_HOST_IP` | `network.host` |
//! | `TRELLIS_PEPPER` | `network.pepper` |
//! | `TRELLIS_BOOTNODES` | `network.bootnodes` (comma-separated) |

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use trellis_crypto::ed25519::KeyPair;
use trellis_dht::network::NetworkConfig;
use trellis_discovery::{DiscoveryConfig, Roster};

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub dht: DhtSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub roster: RosterSection,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub advanced: AdvancedSection,
}

/// Addresses and the shared secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Address this node binds and advertises.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_dht_port")]
    pub dht_port: u16,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Discovery pepper. Must be set; empty refuses to start.
    #[serde(default)]
    pub pepper: String,
    /// Bootnode IPs (probed at `discovery_port`) or full discovery addresses.
    /// Empty = scan the /24 around `host`.
    #[serde(default)]
    pub bootnodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtSection {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_alpha")]
    pub alpha: usize,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_min_bootstrap_nodes")]
    pub min_bootstrap_nodes: usize,
}

/// Hex-encoded verifying keys by role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RosterSection {
    #[serde(default)]
    pub masternodes: Vec<String>,
    #[serde(default)]
    pub delegates: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentitySection {
    /// Hex-encoded 32-byte Ed25519 seed.
    #[serde(default)]
    pub signing_key_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedSection {
    /// Log level for the `trellis` crates: "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Data directory. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,
}

// Default value functions

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_dht_port() -> u16 {
    10_100
}

fn default_discovery_port() -> u16 {
    trellis_discovery::DISCOVERY_PORT
}

fn default_k() -> usize {
    trellis_dht::K
}

fn default_alpha() -> usize {
    trellis_dht::ALPHA
}

fn default_rpc_timeout_ms() -> u64 {
    trellis_dht::RPC_TIMEOUT_MS
}

fn default_refresh_interval_secs() -> u64 {
    trellis_dht::REFRESH_INTERVAL_SECS
}

fn default_save_interval_secs() -> u64 {
    trellis_dht::SAVE_INTERVAL_SECS
}

fn default_retries() -> u32 {
    trellis_discovery::DISCOVERY_RETRIES
}

fn default_interval_ms() -> u64 {
    trellis_discovery::DISCOVERY_INTERVAL_MS
}

fn default_min_bootstrap_nodes() -> usize {
    trellis_discovery::MIN_BOOTSTRAP_NODES
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            dht_port: default_dht_port(),
            discovery_port: default_discovery_port(),
            pepper: String::new(),
            bootnodes: Vec::new(),
        }
    }
}

impl Default for DhtSection {
    fn default() -> Self {
        Self {
            k: default_k(),
            alpha: default_alpha(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            refresh_interval_secs: default_refresh_interval_secs(),
            save_interval_secs: default_save_interval_secs(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            interval_ms: default_interval_ms(),
            min_bootstrap_nodes: default_min_bootstrap_nodes(),
        }
    }
}

impl Default for AdvancedSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: String::new(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default config file location, then apply
    /// environment overrides.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("parsing {}", config_path.display()))?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply `TRELLIS_*` overrides looked up through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("TRELLIS_HOST_IP") {
            self.network.host = host;
        }
        if let Some(pepper) = var("TRELLIS_PEPPER") {
            self.network.pepper = pepper;
        }
        if let Some(bootnodes) = var("TRELLIS_BOOTNODES") {
            self.network.bootnodes = bootnodes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// Get the data directory path.
    pub fn data_dir(&self) -> PathBuf {
        if self.advanced.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.advanced.data_dir)
        }
    }

    pub fn host_ip(&self) -> anyhow::Result<IpAddr> {
        self.network
            .host
            .parse()
            .with_context(|| format!("network.host {:?} is not an IP address", self.network.host))
    }

    pub fn dht_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(SocketAddr::new(self.host_ip()?, self.network.dht_port))
    }

    pub fn discovery_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(SocketAddr::new(self.host_ip()?, self.network.discovery_port))
    }

    /// The node's keypair. A node without an identity cannot start.
    pub fn keypair(&self) -> anyhow::Result<KeyPair> {
        if self.identity.signing_key_hex.is_empty() {
            bail!("identity.signing_key_hex is not set");
        }
        KeyPair::from_hex(self.identity.signing_key_hex.trim())
            .context("identity.signing_key_hex is not a valid Ed25519 seed")
    }

    pub fn roster(&self) -> anyhow::Result<Roster> {
        Ok(Roster::from_hex(
            &self.roster.masternodes,
            &self.roster.delegates,
        )?)
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            k: self.dht.k,
            alpha: self.dht.alpha,
            rpc_timeout: Duration::from_millis(self.dht.rpc_timeout_ms),
            refresh_interval: Duration::from_secs(self.dht.refresh_interval_secs),
        }
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.dht.save_interval_secs)
    }

    pub fn discovery_config(&self) -> anyhow::Result<DiscoveryConfig> {
        let bootnodes = self
            .network
            .bootnodes
            .iter()
            .map(|entry| self.bootnode_addr(entry))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(DiscoveryConfig {
            pepper: self.network.pepper.as_bytes().to_vec(),
            retries: self.discovery.retries,
            interval: Duration::from_millis(self.discovery.interval_ms),
            min_bootstrap_nodes: self.discovery.min_bootstrap_nodes,
            bootnodes,
        })
    }

    fn bootnode_addr(&self, entry: &str) -> anyhow::Result<SocketAddr> {
        if let Ok(addr) = entry.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let ip: IpAddr = entry
            .parse()
            .with_context(|| format!("bootnode {entry:?} is not an IP or socket address"))?;
        Ok(SocketAddr::new(ip, self.network.discovery_port))
    }

    /// Get the config file path.
    fn config_path() -> PathBuf {
        Self::default_data_dir().join("config.toml")
    }

    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("TRELLIS_DATA_DIR") {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".trellis"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/trellis"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.network.discovery_port, 10_200);
        assert!(config.network.bootnodes.is_empty());
        assert_eq!(config.dht.k, 20);
        assert_eq!(config.dht.alpha, 3);
        assert_eq!(config.discovery.min_bootstrap_nodes, 1);
        assert_eq!(config.advanced.log_level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: DaemonConfig = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed.dht.save_interval_secs, config.dht.save_interval_secs);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [network]
            pepper = "cilantro"
            bootnodes = ["10.0.0.5"]

            [dht]
            k = 8
            "#,
        )
        .expect("parse");
        assert_eq!(config.network.pepper, "cilantro");
        assert_eq!(config.network.dht_port, 10_100);
        assert_eq!(config.dht.k, 8);
        assert_eq!(config.dht.alpha, 3);
        assert_eq!(config.discovery.retries, 5);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TRELLIS_HOST_IP", "10.1.1.1"),
            ("TRELLIS_PEPPER", "secret"),
            ("TRELLIS_BOOTNODES", "10.1.1.2, 10.1.1.3:9000,,"),
        ]);
        let mut config = DaemonConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.network.host, "10.1.1.1");
        assert_eq!(config.network.pepper, "secret");
        assert_eq!(config.network.bootnodes, vec!["10.1.1.2", "10.1.1.3:9000"]);

        let mut untouched = DaemonConfig::default();
        untouched.apply_overrides(|_| None);
        assert_eq!(untouched.network.host, "127.0.0.1");
    }

    #[test]
    fn test_discovery_config_bootnodes() {
        let mut config = DaemonConfig::default();
        config.network.pepper = "secret".to_string();
        config.network.bootnodes = vec!["10.0.0.1".to_string(), "10.0.0.2:9999".to_string()];

        let discovery = config.discovery_config().expect("discovery config");
        assert_eq!(discovery.pepper, b"secret");
        assert_eq!(
            discovery.bootnodes,
            vec![
                "10.0.0.1:10200".parse::<SocketAddr>().expect("addr"),
                "10.0.0.2:9999".parse::<SocketAddr>().expect("addr"),
            ]
        );

        config.network.bootnodes = vec!["not-an-ip".to_string()];
        assert!(config.discovery_config().is_err());
    }

    #[test]
    fn test_network_config() {
        let mut config = DaemonConfig::default();
        config.dht.rpc_timeout_ms = 250;
        let network = config.network_config();
        assert_eq!(network.k, 20);
        assert_eq!(network.rpc_timeout, Duration::from_millis(250));
        assert_eq!(network.refresh_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_identity_and_roster() {
        let mut config = DaemonConfig::default();
        assert!(config.keypair().is_err());

        config.identity.signing_key_hex = "11".repeat(32);
        let keypair = config.keypair().expect("keypair");

        config.roster.masternodes = vec![keypair.verifying_key.to_hex()];
        let roster = config.roster().expect("roster");
        assert!(roster.is_master(keypair.verifying_key.as_bytes()));

        config.roster.delegates = vec!["zz".to_string()];
        assert!(config.roster().is_err());
    }

    #[test]
    fn test_addresses() {
        let mut config = DaemonConfig::default();
        assert_eq!(
            config.dht_addr().expect("addr"),
            "127.0.0.1:10100".parse::<SocketAddr>().expect("addr")
        );
        config.network.host = "node-1".to_string();
        assert!(config.discovery_addr().is_err());
    }
}
