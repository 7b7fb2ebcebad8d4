//! Peer Replication Module
//!
//! Every instance owns the chunks its producers create and replicates every
//! other instance's chunks, so that any instance can serve reads for any
//! chunk. The replication queues live in the discovery registry: the owner
//! enqueues a chunk for every peer when it is created, and enqueues an
//! acknowledge entry when it is acknowledged.

pub mod client;
pub mod hooks;
pub mod state;

pub use client::{DirectWriter, ReplicationClient};
pub use hooks::Hooks;
pub use state::{Peer, State};

use std::time::Duration;

use tokio::sync::watch;

/// A chunk as tracked by the replication and acknowledge queues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The instance whose producers created the chunk
    pub owner: String,
    pub category: String,
    pub file_name: String,
}

/// Sleep for the given duration, returning early with `true` when shutdown
/// is signalled.
pub(crate) async fn sleep_or_shutdown(d: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => false,
        _ = shutdown.wait_for(|v| *v) => true,
    }
}
