//! Node Wiring
//!
//! Builds the storage, replication and HTTP layers of a single chukcha
//! instance and serves them until shutdown.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{self, AppState};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::replication::{Hooks, ReplicationClient, State};
use crate::storage::Manager;

/// Arguments for starting a chukcha instance
pub struct InitArgs {
    pub registry: Arc<dyn Registry>,
    pub cluster_name: String,
    pub instance_name: String,
    pub dirname: PathBuf,
    pub listen_addr: String,
    pub max_chunk_size: u64,
    pub peer_lease_ttl: Duration,
    /// Disable the replica acknowledge loop. Only used by tests that
    /// exercise the replication/acknowledge race.
    pub disable_acknowledge: bool,
}

/// A running chukcha instance
pub struct Node {
    local_addr: SocketAddr,
    shutdown: Arc<watch::Sender<bool>>,
    server: JoinHandle<Result<()>>,
}

impl Node {
    /// The address the instance is actually listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle that can request shutdown from another task
    pub fn shutdown_handle(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.shutdown)
    }

    /// Request a graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the instance to stop serving
    pub async fn wait(self) -> Result<()> {
        match self.server.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("server task failed: {e}"))),
        }
    }
}

/// Validate the data directory, start the replication loops and begin
/// serving the HTTP API.
pub async fn start(args: InitArgs) -> Result<Node> {
    std::fs::create_dir_all(&args.dirname)?;
    probe_writable(&args.dirname)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = Arc::new(State::new(Arc::clone(&args.registry), &args.cluster_name));

    let hooks = Arc::new(Hooks::new(Arc::clone(&state), args.instance_name.clone()));
    let manager = Arc::new(Manager::new(
        args.dirname.clone(),
        args.instance_name.clone(),
        args.max_chunk_size,
        Arc::clone(&hooks) as Arc<dyn crate::storage::ChunkCreatedHook>,
        hooks as Arc<dyn crate::storage::ChunkAckedHook>,
    ));

    let listener = TcpListener::bind(&args.listen_addr).await?;
    let local_addr = listener.local_addr()?;

    state
        .register_self(
            &args.instance_name,
            &local_addr.to_string(),
            args.peer_lease_ttl,
            shutdown_rx.clone(),
        )
        .await?;

    let replication = Arc::new(ReplicationClient::new(
        Arc::clone(&state),
        Arc::clone(&manager) as Arc<dyn crate::replication::DirectWriter>,
        args.instance_name.clone(),
    )?);
    replication.start(shutdown_rx.clone(), args.disable_acknowledge);

    let app = api::router(Arc::new(AppState { manager }));
    let mut shutdown_signal = shutdown_rx;
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_signal.wait_for(|v| *v).await;
            })
            .await
            .map_err(Error::from)
    });

    tracing::info!(
        instance = %args.instance_name,
        addr = %local_addr,
        "chukcha instance is serving"
    );

    Ok(Node {
        local_addr,
        shutdown: Arc::new(shutdown_tx),
        server,
    })
}

/// Start an instance and serve it until shutdown
pub async fn init_and_serve(args: InitArgs) -> Result<()> {
    start(args).await?.wait().await
}

fn probe_writable(dirname: &Path) -> Result<()> {
    let probe = dirname.join("write_test");
    std::fs::write(&probe, b"")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}
