//! Peer Discovery Registry
//!
//! A strongly consistent key-value store used for peer discovery and the
//! replication queues. The replication layer only depends on this interface;
//! production deployments back it with etcd, tests run against the
//! in-process implementation.

mod etcd;
mod memory;

pub use etcd::EtcdRegistry;
pub use memory::MemoryRegistry;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::Result;

/// A key-value pair stored in the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

/// The registry operations the replication layer needs
#[async_trait]
pub trait Registry: Send + Sync {
    /// Store a key. Overwriting an existing key with the same value is how
    /// queue entries stay idempotent.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all keys under a prefix
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvPair>>;

    /// Stream puts under a prefix, starting from now. The channel closes
    /// when the underlying watch is lost; callers re-establish it and replay
    /// the prefix contents themselves.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<KvPair>>;

    /// Store a key bound to a lease of `ttl`, keeping the lease alive in the
    /// background until `shutdown` fires, then remove the key. Crashed
    /// holders disappear when their lease expires.
    async fn register(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;
}
