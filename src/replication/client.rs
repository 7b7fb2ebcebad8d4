//! Replication Client
//!
//! Downloads the chunks other instances own into the local chunk store. One
//! downloader per category works through the replication queue; the
//! acknowledge loop removes local replicas once their owner acknowledged
//! them, cancelling an in-flight download of the same chunk first so that an
//! acknowledged chunk is not immediately re-created by its own download.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use super::{sleep_or_shutdown, Chunk, State};
use crate::client::Simple;
use crate::error::{Error, Result};
use crate::protocol;
use crate::storage::ChunkStat;

const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const RETRY_TIMEOUT: Duration = Duration::from_secs(1);

/// How many bytes of a chunk are fetched per read request
const BATCH_SIZE: u64 = 4 * 1024 * 1024;

/// The chunk-store operations the replication client needs. They bypass the
/// create/ack hooks: replicated chunks never generate replication work of
/// their own.
#[async_trait]
pub trait DirectWriter: Send + Sync {
    async fn stat(&self, category: &str, file_name: &str) -> Result<ChunkStat>;
    async fn write_direct(&self, category: &str, file_name: &str, contents: &[u8]) -> Result<()>;
    async fn ack_direct(&self, category: &str, file_name: &str) -> Result<()>;
}

pub struct ReplicationClient {
    state: Arc<State>,
    writer: Arc<dyn DirectWriter>,
    instance_name: String,
    http: reqwest::Client,
    api: Simple,
    per_category: Mutex<HashMap<String, Arc<CategoryDownloader>>>,
}

struct CategoryDownloader {
    events_tx: mpsc::Sender<Chunk>,
    state: Arc<State>,
    writer: Arc<dyn DirectWriter>,
    instance_name: String,
    http: reqwest::Client,
    api: Simple,
    cur: Mutex<Option<CurrentDownload>>,
}

/// The download currently in flight for a category. The acknowledge loop
/// uses it to cancel a download of a chunk that was just acknowledged and to
/// wait until the download has actually stopped.
struct CurrentDownload {
    chunk: Chunk,
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

enum DownloadStep {
    Done,
    /// The owner has more bytes coming, poll again shortly
    Incomplete,
}

impl ReplicationClient {
    pub fn new(
        state: Arc<State>,
        writer: Arc<dyn DirectWriter>,
        instance_name: String,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_CLIENT_TIMEOUT)
            .build()?;

        Ok(Self {
            state,
            writer,
            instance_name,
            http,
            api: Simple::new(Vec::new()),
            per_category: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the replication loop and, unless disabled, the acknowledge
    /// loop. Both run until shutdown.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>, disable_acknowledge: bool) {
        if !disable_acknowledge {
            let client = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { client.acknowledge_loop(shutdown).await });
        }

        tokio::spawn(async move { self.replication_loop(shutdown).await });
    }

    async fn replication_loop(&self, shutdown: watch::Receiver<bool>) {
        let mut events = self
            .state
            .watch_replication_queue(&self.instance_name, shutdown.clone());

        while let Some(ch) = events.recv().await {
            let downloader = self.downloader_for(&ch.category, &shutdown).await;
            if downloader.events_tx.send(ch).await.is_err() {
                return;
            }
        }
    }

    async fn downloader_for(
        &self,
        category: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> Arc<CategoryDownloader> {
        let mut per_category = self.per_category.lock().await;
        if let Some(downloader) = per_category.get(category) {
            return Arc::clone(downloader);
        }

        let (events_tx, events_rx) = mpsc::channel(3);
        let downloader = Arc::new(CategoryDownloader {
            events_tx,
            state: Arc::clone(&self.state),
            writer: Arc::clone(&self.writer),
            instance_name: self.instance_name.clone(),
            http: self.http.clone(),
            api: self.api.clone(),
            cur: Mutex::new(None),
        });
        per_category.insert(category.to_string(), Arc::clone(&downloader));

        let task = Arc::clone(&downloader);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { task.run(events_rx, shutdown).await });

        downloader
    }

    async fn acknowledge_loop(&self, shutdown: watch::Receiver<bool>) {
        let mut events = self
            .state
            .watch_acknowledge_queue(&self.instance_name, shutdown);

        while let Some(ch) = events.recv().await {
            tracing::debug!("acknowledging chunk {:?}", ch);

            self.ensure_chunk_is_not_being_downloaded(&ch).await;

            if let Err(e) = self.writer.ack_direct(&ch.category, &ch.file_name).await {
                tracing::warn!("could not remove the replica of chunk {:?}: {}", ch, e);
            }

            if let Err(e) = self
                .state
                .delete_chunk_from_acknowledge_queue(&self.instance_name, &ch)
                .await
            {
                tracing::warn!("could not delete chunk {:?} from the acknowledge queue: {}", ch, e);
            }
        }
    }

    async fn ensure_chunk_is_not_being_downloaded(&self, ch: &Chunk) {
        let downloader = {
            let per_category = self.per_category.lock().await;
            match per_category.get(&ch.category) {
                Some(downloader) => Arc::clone(downloader),
                None => return,
            }
        };

        let done = {
            let cur = downloader.cur.lock().await;
            match cur.as_ref() {
                Some(current) if current.chunk == *ch => {
                    let _ = current.cancel.send(true);
                    Some(current.done.clone())
                }
                _ => None,
            }
        };

        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}

impl CategoryDownloader {
    async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Chunk>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let ch = tokio::select! {
                _ = shutdown.wait_for(|v| *v) => return,
                event = events.recv() => match event {
                    Some(ch) => ch,
                    None => return,
                },
            };

            self.download_all_chunks_up_to(&ch, &mut shutdown).await;

            if let Err(e) = self
                .state
                .delete_chunk_from_replication_queue(&self.instance_name, &ch)
                .await
            {
                tracing::warn!("could not delete chunk {:?} from the replication queue: {}", ch, e);
            }
        }
    }

    /// Catch up on every chunk of the target's owner up to and including the
    /// target itself, retrying until it succeeds or shutdown.
    async fn download_all_chunks_up_to(&self, target: &Chunk, shutdown: &mut watch::Receiver<bool>) {
        loop {
            match self.download_all_chunks_up_to_iteration(target, shutdown).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!("replicating up to chunk {:?} failed: {}", target, e);
                    if sleep_or_shutdown(RETRY_TIMEOUT, shutdown).await {
                        return;
                    }
                }
            }
        }
    }

    async fn download_all_chunks_up_to_iteration(
        &self,
        target: &Chunk,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let addr = self.listen_addr_for_owner(&target.owner).await?;
        let chunks = self.api.list_chunks(&target.category, &addr, true).await?;

        let mut to_replicate: Vec<protocol::Chunk> = chunks
            .into_iter()
            .filter(|c| {
                let owned = matches!(
                    protocol::parse_chunk_file_name(&c.name),
                    Some((instance, _)) if instance == target.owner
                );
                // Lexicographic comparison works because the chunk index is
                // zero-padded to a fixed width
                owned && c.name <= target.file_name
            })
            .collect();
        to_replicate.sort_by(|a, b| a.name.cmp(&b.name));

        for ch in to_replicate {
            let local = self.writer.stat(&target.category, &ch.name).await?;
            if local.deleted {
                // Already acknowledged here, downloading it again would
                // resurrect it
                continue;
            }

            if !local.exists || ch.size > local.size || !ch.complete {
                let ch = Chunk {
                    owner: target.owner.clone(),
                    category: target.category.clone(),
                    file_name: ch.name,
                };
                self.download_chunk(ch, shutdown).await;
            }
        }

        Ok(())
    }

    async fn download_chunk(&self, ch: Chunk, shutdown: &mut watch::Receiver<bool>) {
        tracing::debug!("downloading chunk {:?}", ch);

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        *self.cur.lock().await = Some(CurrentDownload {
            chunk: ch.clone(),
            cancel: cancel_tx,
            done: done_rx,
        });

        loop {
            match self.download_chunk_iteration(&ch).await {
                Ok(DownloadStep::Done) => break,
                Ok(DownloadStep::Incomplete) => {
                    if wait_cancelled(POLL_INTERVAL, shutdown, &mut cancel_rx).await {
                        break;
                    }
                }
                Err(Error::ChunkNotFound(_)) => {
                    // Gone upstream, most likely acknowledged at the owner;
                    // the acknowledge entry will clean up whatever we wrote
                    tracing::info!("chunk {:?} not found at its owner, skipping", ch);
                    break;
                }
                Err(e) => {
                    tracing::warn!("downloading chunk {:?} failed: {}", ch, e);
                    if wait_cancelled(RETRY_TIMEOUT, shutdown, &mut cancel_rx).await {
                        break;
                    }
                }
            }

            if *cancel_rx.borrow() || *shutdown.borrow() {
                break;
            }
        }

        *self.cur.lock().await = None;
        let _ = done_tx.send(true);

        tracing::debug!("finished downloading chunk {:?}", ch);
    }

    async fn download_chunk_iteration(&self, ch: &Chunk) -> Result<DownloadStep> {
        let local = self.writer.stat(&ch.category, &ch.file_name).await?;
        let addr = self.listen_addr_for_owner(&ch.owner).await?;

        let Some(info) = self.chunk_info(&addr, ch).await? else {
            tracing::info!("chunk {:?} is not listed at {:?} anymore", ch, addr);
            return Ok(DownloadStep::Done);
        };

        if local.size >= info.size {
            if !info.complete {
                return Ok(DownloadStep::Incomplete);
            }
            return Ok(DownloadStep::Done);
        }

        let buf = self.download_part(&addr, ch, local.size).await?;
        self.writer
            .write_direct(&ch.category, &ch.file_name, &buf)
            .await?;

        let local = self.writer.stat(&ch.category, &ch.file_name).await?;
        if local.size < info.size || !info.complete {
            return Ok(DownloadStep::Incomplete);
        }

        Ok(DownloadStep::Done)
    }

    async fn chunk_info(&self, addr: &str, ch: &Chunk) -> Result<Option<protocol::Chunk>> {
        let chunks = self.api.list_chunks(&ch.category, addr, true).await?;
        Ok(chunks.into_iter().find(|c| c.name == ch.file_name))
    }

    async fn download_part(&self, addr: &str, ch: &Chunk, off: u64) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(format!("{addr}/read"))
            .query(&[
                ("off", off.to_string()),
                ("maxSize", BATCH_SIZE.to_string()),
                ("chunk", ch.file_name.clone()),
                ("category", ch.category.clone()),
                ("from_replication", "1".to_string()),
            ])
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::ChunkNotFound(ch.file_name.clone()));
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::UnexpectedStatus { status, body });
        }

        Ok(resp.bytes().await?.to_vec())
    }

    async fn listen_addr_for_owner(&self, owner: &str) -> Result<String> {
        let peers = self.state.list_peers().await?;
        let peer = peers
            .into_iter()
            .find(|p| p.instance_name == owner)
            .ok_or_else(|| Error::UnknownPeer(owner.to_string()))?;

        Ok(format!("http://{}", peer.listen_addr))
    }
}

async fn wait_cancelled(
    d: Duration,
    shutdown: &mut watch::Receiver<bool>,
    cancel: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => false,
        _ = shutdown.wait_for(|v| *v) => true,
        _ = cancel.wait_for(|v| *v) => true,
    }
}
