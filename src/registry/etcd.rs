//! etcd Registry
//!
//! Production registry backed by etcd. Peer registrations are bound to a
//! lease that is refreshed at a third of its TTL, so crashed instances fall
//! out of the peer list on their own.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use tokio::sync::{mpsc, watch};

use super::{KvPair, Registry};
use crate::error::Result;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EtcdRegistry {
    client: Client,
}

impl EtcdRegistry {
    /// Connect to the given etcd endpoints
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        // No per-request timeout: it would also apply to the long-lived
        // watch streams
        let options = ConnectOptions::new()
            .with_connect_timeout(REQUEST_TIMEOUT)
            .with_keep_alive(REQUEST_TIMEOUT, REQUEST_TIMEOUT);
        let client = Client::connect(endpoints, Some(options)).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut kv = self.client.kv_client();
        kv.put(key, value, None).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut kv = self.client.kv_client();
        kv.delete(key, None).await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut res = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            res.push(KvPair {
                key: kv.key_str()?.to_string(),
                value: kv.value_str()?.to_string(),
            });
        }
        Ok(res)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<KvPair>> {
        let mut watch_client = self.client.watch_client();
        let (watcher, mut stream) = watch_client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            // The watch is cancelled when the watcher is dropped
            let _watcher = watcher;

            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            if event.event_type() != EventType::Put {
                                continue;
                            }
                            let Some(kv) = event.kv() else { continue };
                            let (Ok(key), Ok(value)) = (kv.key_str(), kv.value_str()) else {
                                continue;
                            };
                            let pair = KvPair {
                                key: key.to_string(),
                                value: value.to_string(),
                            };
                            if tx.send(pair).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!("etcd watch failed: {}", e);
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn register(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut lease = self.client.lease_client();
        let granted = lease.grant(ttl.as_secs() as i64, None).await?;
        let lease_id = granted.id();

        let mut kv = self.client.kv_client();
        kv.put(key, value, Some(PutOptions::new().with_lease(lease_id)))
            .await?;

        let client = self.client.clone();
        let key = key.to_string();
        let value = value.to_string();
        tokio::spawn(async move {
            let refresh = ttl / 3;
            let mut lease = client.lease_client();
            let mut kv = client.kv_client();
            let mut lease_id = lease_id;

            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|v| *v).await; } => {
                        let _ = kv.delete(key.as_str(), None).await;
                        let _ = lease.revoke(lease_id).await;
                        return;
                    }
                    _ = tokio::time::sleep(refresh) => {
                        let refreshed = match lease.keep_alive(lease_id).await {
                            Ok((mut keeper, mut responses)) => {
                                keeper.keep_alive().await.is_ok()
                                    && responses.message().await.is_ok()
                            }
                            Err(e) => {
                                tracing::warn!("lease keep-alive failed: {}", e);
                                false
                            }
                        };

                        if !refreshed {
                            // The lease may already be gone, take a fresh
                            // one and re-register under it
                            match lease.grant(ttl.as_secs() as i64, None).await {
                                Ok(granted) => {
                                    lease_id = granted.id();
                                    if let Err(e) = kv
                                        .put(
                                            key.as_str(),
                                            value.as_str(),
                                            Some(PutOptions::new().with_lease(lease_id)),
                                        )
                                        .await
                                    {
                                        tracing::warn!("re-registering {:?} failed: {}", key, e);
                                    }
                                }
                                Err(e) => tracing::warn!("lease re-grant failed: {}", e),
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }
}
