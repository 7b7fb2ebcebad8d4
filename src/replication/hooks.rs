//! Chunk Store Hooks
//!
//! Connects the chunk store to the replication queues: when the owner
//! creates a chunk, every peer gets a replication entry; when it
//! acknowledges a chunk, every peer gets an acknowledge entry.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Chunk, State};
use crate::error::Result;
use crate::storage::{ChunkAckedHook, ChunkCreatedHook};

pub struct Hooks {
    state: Arc<State>,
    instance_name: String,
}

impl Hooks {
    pub fn new(state: Arc<State>, instance_name: String) -> Self {
        Self {
            state,
            instance_name,
        }
    }

    fn chunk(&self, category: &str, file_name: &str) -> Chunk {
        Chunk {
            owner: self.instance_name.clone(),
            category: category.to_string(),
            file_name: file_name.to_string(),
        }
    }
}

#[async_trait]
impl ChunkCreatedHook for Hooks {
    async fn after_chunk_created(&self, category: &str, file_name: &str) -> Result<()> {
        let ch = self.chunk(category, file_name);

        for peer in self.state.list_peers().await? {
            if peer.instance_name == self.instance_name {
                continue;
            }
            self.state
                .add_chunk_to_replication_queue(&peer.instance_name, &ch)
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl ChunkAckedHook for Hooks {
    async fn after_chunk_acknowledged(&self, category: &str, file_name: &str) -> Result<()> {
        let ch = self.chunk(category, file_name);

        for peer in self.state.list_peers().await? {
            if peer.instance_name == self.instance_name {
                continue;
            }
            self.state
                .add_chunk_to_acknowledge_queue(&peer.instance_name, &ch)
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use std::time::Duration;
    use tokio::sync::watch;

    #[tokio::test]
    async fn test_created_chunk_is_fanned_out_to_peers_only() {
        let state = Arc::new(State::new(Arc::new(MemoryRegistry::new()), "test"));
        let (_tx, shutdown) = watch::channel(false);

        for (name, addr) in [("moscow", "127.0.0.1:1"), ("voronezh", "127.0.0.1:2")] {
            state
                .register_self(name, addr, Duration::from_secs(10), shutdown.clone())
                .await
                .unwrap();
        }

        let hooks = Hooks::new(Arc::clone(&state), "moscow".to_string());
        hooks
            .after_chunk_created("numbers", "moscow-chunk000000000")
            .await
            .unwrap();

        let mut voronezh = state.watch_replication_queue("voronezh", shutdown.clone());
        let ch = voronezh.recv().await.unwrap();
        assert_eq!(ch.owner, "moscow");
        assert_eq!(ch.file_name, "moscow-chunk000000000");

        // The owner must not enqueue work for itself
        let mut moscow = state.watch_replication_queue("moscow", shutdown);
        tokio::select! {
            ch = moscow.recv() => panic!("unexpected replication entry for the owner: {ch:?}"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
}
