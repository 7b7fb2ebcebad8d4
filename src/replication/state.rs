//! Replication State
//!
//! Façade over the discovery registry: the peer list and the per-instance
//! replication and acknowledge queues. Keys are namespaced by the cluster
//! name so that several clusters can share one registry installation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::{sleep_or_shutdown, Chunk};
use crate::error::Result;
use crate::registry::Registry;

const REPLICATION_QUEUE: &str = "replication";
const ACKNOWLEDGE_QUEUE: &str = "ack";

const WATCH_RETRY_TIMEOUT: Duration = Duration::from_secs(1);

/// A peer instance known to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub instance_name: String,
    pub listen_addr: String,
}

pub struct State {
    registry: Arc<dyn Registry>,
    prefix: String,
}

impl State {
    pub fn new(registry: Arc<dyn Registry>, cluster_name: &str) -> Self {
        Self {
            registry,
            prefix: format!("{cluster_name}/"),
        }
    }

    /// Register this instance in the peer list under a lease, so that a
    /// crashed instance disappears from the list on its own.
    pub async fn register_self(
        &self,
        instance_name: &str,
        listen_addr: &str,
        ttl: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let key = format!("{}peers/{}", self.prefix, instance_name);
        self.registry.register(&key, listen_addr, ttl, shutdown).await
    }

    /// List every currently registered peer, including this instance
    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        let prefix = format!("{}peers/", self.prefix);
        let kvs = self.registry.get_prefix(&prefix).await?;

        Ok(kvs
            .into_iter()
            .filter_map(|kv| {
                kv.key.strip_prefix(&prefix).map(|name| Peer {
                    instance_name: name.to_string(),
                    listen_addr: kv.value,
                })
            })
            .collect())
    }

    pub async fn add_chunk_to_replication_queue(&self, target: &str, ch: &Chunk) -> Result<()> {
        let key = self.queue_key(REPLICATION_QUEUE, target, ch);
        self.registry.put(&key, &ch.owner).await
    }

    pub async fn delete_chunk_from_replication_queue(&self, target: &str, ch: &Chunk) -> Result<()> {
        let key = self.queue_key(REPLICATION_QUEUE, target, ch);
        self.registry.delete(&key).await
    }

    pub async fn add_chunk_to_acknowledge_queue(&self, target: &str, ch: &Chunk) -> Result<()> {
        let key = self.queue_key(ACKNOWLEDGE_QUEUE, target, ch);
        self.registry.put(&key, &ch.owner).await
    }

    pub async fn delete_chunk_from_acknowledge_queue(&self, target: &str, ch: &Chunk) -> Result<()> {
        let key = self.queue_key(ACKNOWLEDGE_QUEUE, target, ch);
        self.registry.delete(&key).await
    }

    /// Stream the chunks queued for replication to `instance`: the current
    /// queue contents first, then every subsequent addition.
    pub fn watch_replication_queue(
        &self,
        instance: &str,
        shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Chunk> {
        self.watch_queue(REPLICATION_QUEUE, instance, shutdown)
    }

    /// Same as `watch_replication_queue`, for the acknowledge queue
    pub fn watch_acknowledge_queue(
        &self,
        instance: &str,
        shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Chunk> {
        self.watch_queue(ACKNOWLEDGE_QUEUE, instance, shutdown)
    }

    fn queue_key(&self, queue: &str, target: &str, ch: &Chunk) -> String {
        format!(
            "{}{}/{}/{}/{}/{}",
            self.prefix, queue, target, ch.owner, ch.category, ch.file_name
        )
    }

    fn watch_queue(
        &self,
        queue: &str,
        instance: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Chunk> {
        let (tx, rx) = mpsc::channel(16);
        let prefix = format!("{}{}/{}/", self.prefix, queue, instance);
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }

                // Subscribe before listing so that entries added in between
                // are not lost; consumers tolerate duplicates.
                let mut events = match registry.watch_prefix(&prefix).await {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("could not watch {:?}: {}", prefix, e);
                        if sleep_or_shutdown(WATCH_RETRY_TIMEOUT, &mut shutdown).await {
                            return;
                        }
                        continue;
                    }
                };

                let snapshot = match registry.get_prefix(&prefix).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        tracing::warn!("could not list {:?}: {}", prefix, e);
                        if sleep_or_shutdown(WATCH_RETRY_TIMEOUT, &mut shutdown).await {
                            return;
                        }
                        continue;
                    }
                };

                for kv in snapshot {
                    if let Some(ch) = parse_queue_entry(&prefix, &kv.key) {
                        if tx.send(ch).await.is_err() {
                            return;
                        }
                    }
                }

                loop {
                    tokio::select! {
                        _ = async { let _ = shutdown.wait_for(|v| *v).await; } => return,
                        event = events.recv() => match event {
                            Some(kv) => {
                                if let Some(ch) = parse_queue_entry(&prefix, &kv.key) {
                                    if tx.send(ch).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            // The watch was lost; re-establish it and
                            // replay the prefix so nothing queued is missed
                            None => break,
                        }
                    }
                }
            }
        });

        rx
    }
}

fn parse_queue_entry(prefix: &str, key: &str) -> Option<Chunk> {
    let rest = key.strip_prefix(prefix)?;
    let mut parts = rest.splitn(3, '/');
    let owner = parts.next()?;
    let category = parts.next()?;
    let file_name = parts.next()?;

    if owner.is_empty() || category.is_empty() || file_name.is_empty() {
        return None;
    }

    Some(Chunk {
        owner: owner.to_string(),
        category: category.to_string(),
        file_name: file_name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn test_chunk(idx: u64) -> Chunk {
        Chunk {
            owner: "moscow".to_string(),
            category: "numbers".to_string(),
            file_name: crate::protocol::chunk_file_name("moscow", idx),
        }
    }

    #[tokio::test]
    async fn test_list_peers() {
        let state = State::new(Arc::new(MemoryRegistry::new()), "test");
        let (_tx, shutdown) = watch::channel(false);

        state
            .register_self("moscow", "127.0.0.1:8061", Duration::from_secs(10), shutdown.clone())
            .await
            .unwrap();
        state
            .register_self("voronezh", "127.0.0.1:8062", Duration::from_secs(10), shutdown)
            .await
            .unwrap();

        let mut peers = state.list_peers().await.unwrap();
        peers.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));

        assert_eq!(
            peers,
            vec![
                Peer {
                    instance_name: "moscow".to_string(),
                    listen_addr: "127.0.0.1:8061".to_string(),
                },
                Peer {
                    instance_name: "voronezh".to_string(),
                    listen_addr: "127.0.0.1:8062".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_replays_existing_entries() {
        let state = State::new(Arc::new(MemoryRegistry::new()), "test");
        let (_tx, shutdown) = watch::channel(false);

        state
            .add_chunk_to_replication_queue("voronezh", &test_chunk(0))
            .await
            .unwrap();

        let mut events = state.watch_replication_queue("voronezh", shutdown);
        assert_eq!(events.recv().await.unwrap(), test_chunk(0));

        state
            .add_chunk_to_replication_queue("voronezh", &test_chunk(1))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), test_chunk(1));
    }

    #[tokio::test]
    async fn test_watch_ignores_other_instances() {
        let state = State::new(Arc::new(MemoryRegistry::new()), "test");
        let (_tx, shutdown) = watch::channel(false);

        let mut events = state.watch_acknowledge_queue("voronezh", shutdown);

        state
            .add_chunk_to_acknowledge_queue("lipetsk", &test_chunk(0))
            .await
            .unwrap();
        state
            .add_chunk_to_acknowledge_queue("voronezh", &test_chunk(1))
            .await
            .unwrap();

        assert_eq!(events.recv().await.unwrap(), test_chunk(1));
    }

    #[test]
    fn test_parse_queue_entry() {
        let parsed = parse_queue_entry(
            "test/replication/voronezh/",
            "test/replication/voronezh/moscow/numbers/moscow-chunk000000003",
        )
        .unwrap();

        assert_eq!(parsed, test_chunk(3));
        assert!(parse_queue_entry("test/replication/voronezh/", "test/replication/voronezh/garbage").is_none());
    }
}
