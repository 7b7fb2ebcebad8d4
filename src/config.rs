//! Chukcha Configuration
//!
//! Configuration for a single chukcha instance. Values can come from a TOML
//! file, with command-line flags taking precedence.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration of a single chukcha instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Logical cluster name. Instances only see peers registered under the
    /// same cluster, so several clusters can share one etcd installation.
    #[serde(default)]
    pub cluster: String,

    /// Unique instance name. Embedded into the chunk file names this
    /// instance creates, so it must stay stable across restarts.
    #[serde(default)]
    pub instance: String,

    /// Data directory holding one subdirectory per category
    #[serde(default)]
    pub dirname: PathBuf,

    /// Address to listen on for the HTTP API
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// etcd endpoints for peer discovery and the replication queues
    #[serde(default = "default_etcd_endpoints")]
    pub etcd: Vec<String>,

    /// Maximum size of a single chunk in bytes. A chunk is rotated before an
    /// append that would push it past this limit.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Peer registration lease TTL in seconds
    #[serde(default = "default_peer_lease_ttl_secs")]
    pub peer_lease_ttl_secs: u64,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8061".to_string()
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_max_chunk_size() -> u64 {
    20 * 1024 * 1024
}

fn default_peer_lease_ttl_secs() -> u64 {
    10
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cluster: String::new(),
            instance: String::new(),
            dirname: PathBuf::new(),
            listen_addr: default_listen_addr(),
            etcd: default_etcd_endpoints(),
            max_chunk_size: default_max_chunk_size(),
            peer_lease_ttl_secs: default_peer_lease_ttl_secs(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: NodeConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.cluster.is_empty() {
            return Err(crate::Error::Config("cluster name must not be empty".into()));
        }

        if self.instance.is_empty() {
            return Err(crate::Error::Config("instance name must not be empty".into()));
        }

        if self.dirname.as_os_str().is_empty() {
            return Err(crate::Error::Config("dirname must not be empty".into()));
        }

        if self.etcd.is_empty() {
            return Err(crate::Error::Config(
                "at least one etcd endpoint must be provided".into(),
            ));
        }

        if self.max_chunk_size == 0 {
            return Err(crate::Error::Config("max_chunk_size must be positive".into()));
        }

        Ok(())
    }

    /// Get the peer lease TTL as a Duration
    pub fn peer_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_lease_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
cluster = "prod"
instance = "moscow"
dirname = "/var/lib/chukcha"
listen_addr = "0.0.0.0:8061"
etcd = ["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
"#;

        let config = NodeConfig::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cluster, "prod");
        assert_eq!(config.instance, "moscow");
        assert_eq!(config.etcd.len(), 2);
        assert_eq!(config.max_chunk_size, 20 * 1024 * 1024);
    }

    #[test]
    fn test_validate_rejects_missing_instance() {
        let config = NodeConfig {
            cluster: "prod".into(),
            dirname: "/tmp/chukcha".into(),
            ..NodeConfig::default()
        };

        assert!(config.validate().is_err());
    }
}
