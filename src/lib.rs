//! Chukcha - Distributed Append-Only Message Log
//!
//! A simple Kafka-like message bus. Producers append newline-delimited byte
//! records to a named category; consumers read, process and acknowledge
//! contiguous byte ranges. Every instance owns a disjoint set of chunks and
//! replicates its peers' chunks, so any instance can serve reads for any
//! chunk.
//!
//! # Architecture
//!
//! Writes land in the owner's current chunk file, which is rotated at a size
//! threshold. Creating a chunk enqueues replication work for every peer in
//! the discovery registry; acknowledging one enqueues its deletion. Peers
//! download chunk bytes over the same HTTP protocol consumers use.
//!
//! # Features
//!
//! - Append-only chunked storage with message-boundary-aware reads
//! - At-least-once delivery with consumer-acknowledged progress
//! - Peer replication driven by registry queues, safe against
//!   acknowledge/download races
//! - A smart client that tracks one read cursor per owner instance

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod replication;
pub mod storage;

pub use config::NodeConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::Simple;
    pub use crate::config::NodeConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::{init_and_serve, InitArgs};
    pub use crate::protocol::Chunk;
}
