//! In-Process Registry
//!
//! A registry backed by a plain map. Used by tests and single-node
//! development setups where running etcd would be overkill. Leases are not
//! expired; a registration only goes away through its shutdown signal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use super::{KvPair, Registry};
use crate::error::Result;

#[derive(Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, String>,
    subs: Vec<Subscription>,
}

struct Subscription {
    prefix: String,
    tx: mpsc::Sender<KvPair>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let senders: Vec<mpsc::Sender<KvPair>> = {
            let mut inner = self.inner.lock().await;
            inner.data.insert(key.to_string(), value.to_string());
            inner.subs.retain(|s| !s.tx.is_closed());
            inner
                .subs
                .iter()
                .filter(|s| key.starts_with(&s.prefix))
                .map(|s| s.tx.clone())
                .collect()
        };

        let pair = KvPair {
            key: key.to_string(),
            value: value.to_string(),
        };
        for tx in senders {
            let _ = tx.send(pair.clone()).await;
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().await.data.remove(key);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KvPair {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<KvPair>> {
        let (tx, rx) = mpsc::channel(256);
        self.inner.lock().await.subs.push(Subscription {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn register(
        &self,
        key: &str,
        value: &str,
        _ttl: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.put(key, value).await?;

        let registry = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let _ = shutdown.wait_for(|v| *v).await;
            let _ = registry.delete(&key).await;
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_prefix() {
        let registry = MemoryRegistry::new();
        registry.put("peers/a", "addr-a").await.unwrap();
        registry.put("peers/b", "addr-b").await.unwrap();
        registry.put("other/c", "x").await.unwrap();

        let peers = registry.get_prefix("peers/").await.unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].key, "peers/a");
        assert_eq!(peers[1].value, "addr-b");
    }

    #[tokio::test]
    async fn test_watch_sees_later_puts() {
        let registry = MemoryRegistry::new();
        let mut watch = registry.watch_prefix("queue/").await.unwrap();

        registry.put("queue/one", "1").await.unwrap();
        registry.put("elsewhere/two", "2").await.unwrap();
        registry.put("queue/three", "3").await.unwrap();

        assert_eq!(watch.recv().await.unwrap().key, "queue/one");
        assert_eq!(watch.recv().await.unwrap().key, "queue/three");
    }

    #[tokio::test]
    async fn test_register_removes_key_on_shutdown() {
        let registry = MemoryRegistry::new();
        let (tx, rx) = watch::channel(false);

        registry
            .register("peers/me", "127.0.0.1:8061", Duration::from_secs(10), rx)
            .await
            .unwrap();
        assert_eq!(registry.get_prefix("peers/").await.unwrap().len(), 1);

        tx.send(true).unwrap();
        // The deregistration runs in a background task
        for _ in 0..50 {
            if registry.get_prefix("peers/").await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registration was not removed after shutdown");
    }
}
