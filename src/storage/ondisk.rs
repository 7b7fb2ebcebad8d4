//! On-Disk Chunk Store
//!
//! Append-only chunk files for a single category. The instance that created
//! a chunk (the owner) appends to it through `write` until the chunk is
//! rotated; replicas of other instances' chunks are filled through the
//! direct-write path and are never appended to by producers.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::protocol::{self, Chunk};

/// Invoked synchronously when the owner allocates a new chunk. The rotation
/// only takes effect if the hook succeeds.
#[async_trait]
pub trait ChunkCreatedHook: Send + Sync {
    async fn after_chunk_created(&self, category: &str, file_name: &str) -> Result<()>;
}

/// Invoked synchronously when a chunk is acknowledged and removed. The ack
/// only succeeds if the hook succeeds.
#[async_trait]
pub trait ChunkAckedHook: Send + Sync {
    async fn after_chunk_acknowledged(&self, category: &str, file_name: &str) -> Result<()>;
}

/// Result of a local chunk stat, including whether the chunk was already
/// acknowledged and removed on this instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkStat {
    pub size: u64,
    pub exists: bool,
    pub deleted: bool,
}

/// The chunk store of a single category
pub struct OnDisk {
    dirname: PathBuf,
    category: String,
    instance_name: String,
    max_chunk_size: u64,
    create_hook: Arc<dyn ChunkCreatedHook>,
    ack_hook: Arc<dyn ChunkAckedHook>,
    state: Mutex<DiskState>,
}

#[derive(Default)]
struct DiskState {
    /// The owner's current writable chunk ("" when none exists yet)
    last_chunk: String,
    last_chunk_size: u64,
    last_chunk_idx: u64,
    /// Open descriptors, keyed by chunk name. Reads go through `read_at` so
    /// one descriptor serves both the appender and concurrent readers.
    fps: HashMap<String, Arc<File>>,
    /// Chunks acknowledged on this instance. Kept in memory so that `stat`
    /// can report them as deleted after the file is gone, which stops the
    /// replication client from downloading them again.
    deleted: HashSet<String>,
}

impl OnDisk {
    /// Open the chunk store for a category directory, scanning it for chunks
    /// this instance already owns.
    pub fn open(
        dirname: PathBuf,
        category: String,
        instance_name: String,
        max_chunk_size: u64,
        create_hook: Arc<dyn ChunkCreatedHook>,
        ack_hook: Arc<dyn ChunkAckedHook>,
    ) -> Result<Self> {
        let mut last_chunk_idx = 0;
        for entry in std::fs::read_dir(&dirname)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some((instance, idx)) = protocol::parse_chunk_file_name(&name) {
                // The next chunk index must not collide with chunks that
                // were already acknowledged and deleted.
                if instance == instance_name && idx + 1 > last_chunk_idx {
                    last_chunk_idx = idx + 1;
                }
            }
        }

        Ok(Self {
            dirname,
            category,
            instance_name,
            max_chunk_size,
            create_hook,
            ack_hook,
            state: Mutex::new(DiskState {
                last_chunk_idx,
                ..DiskState::default()
            }),
        })
    }

    /// Append the messages to the current writable chunk, rotating first if
    /// the chunk would grow past the configured maximum. A single payload is
    /// never split across chunks, so it may exceed the maximum on its own.
    pub async fn write(&self, msgs: &[u8]) -> Result<()> {
        let mut st = self.state.lock().await;

        let needs_rotation = st.last_chunk.is_empty()
            || (st.last_chunk_size > 0
                && st.last_chunk_size + msgs.len() as u64 > self.max_chunk_size);
        if needs_rotation {
            self.create_next_chunk(&mut st).await?;
        }

        let chunk = st.last_chunk.clone();
        let fp = Self::descriptor(&self.dirname, &mut st, &chunk, true)?;
        (&*fp).write_all(msgs)?;
        st.last_chunk_size += msgs.len() as u64;

        Ok(())
    }

    async fn create_next_chunk(&self, st: &mut DiskState) -> Result<()> {
        let name = protocol::chunk_file_name(&self.instance_name, st.last_chunk_idx);

        // The store keeps pointing at the previous chunk if the hook fails,
        // so a failed rotation appends nothing.
        self.create_hook
            .after_chunk_created(&self.category, &name)
            .await?;

        st.last_chunk = name;
        st.last_chunk_size = 0;
        st.last_chunk_idx += 1;

        Ok(())
    }

    /// Read up to `max_size` bytes starting at `off`, truncated to the last
    /// complete message. Reading at or past the end of the chunk succeeds
    /// with zero bytes.
    pub async fn read(&self, chunk: &str, off: u64, max_size: u64, out: &mut Vec<u8>) -> Result<()> {
        validate_chunk_name(chunk)?;

        let fp = {
            let mut st = self.state.lock().await;
            Self::descriptor(&self.dirname, &mut st, chunk, false)?
        };

        let mut buf = vec![0u8; max_size as usize];
        let mut n = 0;
        while n < buf.len() {
            match fp.read_at(&mut buf[n..], off + n as u64) {
                Ok(0) => break,
                Ok(read) => n += read,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if n == 0 {
            return Ok(());
        }

        let (truncated, _rest) = cut_to_last_message(&buf[..n])?;
        out.extend_from_slice(truncated);

        Ok(())
    }

    /// Acknowledge a fully processed chunk: remove its file and notify the
    /// peers. The owner's current writable chunk cannot be acknowledged.
    pub async fn ack(&self, chunk: &str, size: u64) -> Result<()> {
        validate_chunk_name(chunk)?;

        let mut st = self.state.lock().await;

        if chunk == st.last_chunk {
            return Err(Error::AckOfCurrentChunk);
        }

        let path = self.dirname.join(chunk);
        let meta = std::fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ChunkNotFound(chunk.to_string())
            } else {
                e.into()
            }
        })?;

        if meta.len() > size {
            return Err(Error::AckSizeMismatch {
                acked: size,
                chunk_size: meta.len(),
            });
        }

        st.fps.remove(chunk);
        std::fs::remove_file(&path)?;
        st.deleted.insert(chunk.to_string());

        self.ack_hook
            .after_chunk_acknowledged(&self.category, chunk)
            .await?;

        Ok(())
    }

    /// List every chunk in the category. Only the owner's current writable
    /// chunk is reported as incomplete.
    pub async fn list_chunks(&self) -> Result<Vec<Chunk>> {
        let last_chunk = self.state.lock().await.last_chunk.clone();

        let mut res = Vec::new();
        for entry in std::fs::read_dir(&self.dirname)? {
            let entry = entry?;
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                // Acknowledged concurrently with the listing
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !meta.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            res.push(Chunk {
                complete: name != last_chunk,
                size: meta.len(),
                name,
            });
        }

        Ok(res)
    }

    /// Report the local size of a chunk, whether its file exists, and
    /// whether it was already acknowledged and removed here.
    pub async fn stat(&self, chunk: &str) -> Result<ChunkStat> {
        {
            let st = self.state.lock().await;
            if st.deleted.contains(chunk) {
                return Ok(ChunkStat {
                    size: 0,
                    exists: false,
                    deleted: true,
                });
            }
        }

        match std::fs::metadata(self.dirname.join(chunk)) {
            Ok(meta) => Ok(ChunkStat {
                size: meta.len(),
                exists: true,
                deleted: false,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ChunkStat::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append replicated bytes to a chunk owned by another instance,
    /// creating the file if needed. Never rotates and never fires hooks.
    pub async fn write_direct(&self, chunk: &str, contents: &[u8]) -> Result<()> {
        validate_chunk_name(chunk)?;

        let mut fp = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dirname.join(chunk))?;
        fp.write_all(contents)?;

        Ok(())
    }

    /// Remove a replicated chunk after its owner acknowledged it. Never
    /// fires hooks. Removing an already-removed replica is a no-op.
    pub async fn ack_direct(&self, chunk: &str) -> Result<()> {
        validate_chunk_name(chunk)?;

        let mut st = self.state.lock().await;
        st.fps.remove(chunk);

        match std::fs::remove_file(self.dirname.join(chunk)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        st.deleted.insert(chunk.to_string());

        Ok(())
    }

    fn descriptor(
        dirname: &std::path::Path,
        st: &mut DiskState,
        chunk: &str,
        write: bool,
    ) -> Result<Arc<File>> {
        if let Some(fp) = st.fps.get(chunk) {
            return Ok(Arc::clone(fp));
        }

        let path = dirname.join(chunk);
        let fp = if write {
            // Chunk files are only ever created by the rotation that named
            // them, so an existing file must not be reopened for writing.
            OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
        } else {
            OpenOptions::new().read(true).open(&path)
        };

        let fp = fp.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ChunkNotFound(chunk.to_string())
            } else {
                Error::from(e)
            }
        })?;

        let fp = Arc::new(fp);
        st.fps.insert(chunk.to_string(), Arc::clone(&fp));
        Ok(fp)
    }

    #[cfg(test)]
    async fn last_chunk_idx(&self) -> u64 {
        self.state.lock().await.last_chunk_idx
    }
}

fn validate_chunk_name(chunk: &str) -> Result<()> {
    if chunk.is_empty() || chunk.contains(['/', '\\']) {
        return Err(Error::InvalidChunkName(chunk.to_string()));
    }
    Ok(())
}

/// Cut the buffer down to the last fully written message so that a message
/// is never delivered in two pieces. Returns the delivered prefix and the
/// remainder that belongs to the next read.
pub fn cut_to_last_message(buf: &[u8]) -> Result<(&[u8], &[u8])> {
    if buf.is_empty() {
        return Ok((buf, buf));
    }

    if buf[buf.len() - 1] == b'\n' {
        return Ok((buf, &buf[buf.len()..]));
    }

    match buf.iter().rposition(|&b| b == b'\n') {
        Some(pos) => Ok(buf.split_at(pos + 1)),
        None => Err(Error::BufferTooSmall),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct NoopHooks;

    #[async_trait]
    impl ChunkCreatedHook for NoopHooks {
        async fn after_chunk_created(&self, _category: &str, _file_name: &str) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ChunkAckedHook for NoopHooks {
        async fn after_chunk_acknowledged(&self, _category: &str, _file_name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn test_ondisk(dir: &std::path::Path, max_chunk_size: u64) -> OnDisk {
        let hooks = Arc::new(NoopHooks);
        OnDisk::open(
            dir.to_path_buf(),
            "test".to_string(),
            "hc".to_string(),
            max_chunk_size,
            Arc::clone(&hooks) as Arc<dyn ChunkCreatedHook>,
            hooks as Arc<dyn ChunkAckedHook>,
        )
        .unwrap()
    }

    fn create_file(path: &std::path::Path) {
        std::fs::File::create(path).unwrap();
    }

    #[tokio::test]
    async fn test_init_last_chunk_idx() {
        let dir = tempdir().unwrap();
        create_file(&dir.path().join("hc-chunk1"));
        create_file(&dir.path().join("hc-chunk10"));

        let srv = test_ondisk(dir.path(), 20 * 1024 * 1024);
        assert_eq!(srv.last_chunk_idx().await, 11);
    }

    #[tokio::test]
    async fn test_init_ignores_other_instances() {
        let dir = tempdir().unwrap();
        create_file(&dir.path().join("other-chunk5"));

        let srv = test_ondisk(dir.path(), 20 * 1024 * 1024);
        assert_eq!(srv.last_chunk_idx().await, 0);
    }

    #[tokio::test]
    async fn test_read_write() {
        let dir = tempdir().unwrap();
        let srv = test_ondisk(dir.path(), 20 * 1024 * 1024);

        let want = "one\ntwo\nthree\nfour\n";
        srv.write(want.as_bytes()).await.unwrap();

        let chunks = srv.list_chunks().await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].complete);
        let chunk = chunks[0].name.clone();

        let mut out = Vec::new();
        srv.read(&chunk, 0, want.len() as u64, &mut out).await.unwrap();
        assert_eq!(out, want.as_bytes());

        // The last message must not be chopped when the read buffer can only
        // fit the first three messages.
        let mut out = Vec::new();
        srv.read(&chunk, 0, (want.len() - 1) as u64, &mut out).await.unwrap();
        assert_eq!(out, b"one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn test_read_at_end_returns_no_bytes() {
        let dir = tempdir().unwrap();
        let srv = test_ondisk(dir.path(), 20 * 1024 * 1024);

        srv.write(b"first\n").await.unwrap();
        let chunk = srv.list_chunks().await.unwrap()[0].name.clone();

        let mut out = Vec::new();
        srv.read(&chunk, 6, 1024, &mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_read_missing_chunk() {
        let dir = tempdir().unwrap();
        let srv = test_ondisk(dir.path(), 20 * 1024 * 1024);

        let mut out = Vec::new();
        let err = srv.read("hc-chunk000000007", 0, 1024, &mut out).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rotation_on_small_max_chunk_size() {
        let dir = tempdir().unwrap();
        let srv = test_ondisk(dir.path(), 10);

        srv.write(b"first\n").await.unwrap();
        srv.write(b"secnd\n").await.unwrap();
        srv.write(b"third\n").await.unwrap();

        let mut names: Vec<String> = srv
            .list_chunks()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        names.sort();

        assert_eq!(
            names,
            vec![
                "hc-chunk000000000".to_string(),
                "hc-chunk000000001".to_string(),
                "hc-chunk000000002".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_oversized_write_stays_in_one_chunk() {
        let dir = tempdir().unwrap();
        let srv = test_ondisk(dir.path(), 10);

        srv.write(b"a message larger than the chunk limit\n").await.unwrap();

        let chunks = srv.list_chunks().await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size, 38);
    }

    #[tokio::test]
    async fn test_ack_of_the_last_chunk() {
        let dir = tempdir().unwrap();
        let srv = test_ondisk(dir.path(), 20 * 1024 * 1024);

        srv.write(b"one\ntwo\nthree\nfour\n").await.unwrap();
        let chunks = srv.list_chunks().await.unwrap();
        assert_eq!(chunks.len(), 1);

        let err = srv.ack(&chunks[0].name, chunks[0].size).await.unwrap_err();
        assert!(matches!(err, Error::AckOfCurrentChunk));
    }

    #[tokio::test]
    async fn test_ack_of_the_complete_chunk() {
        let dir = tempdir().unwrap();
        let srv = test_ondisk(dir.path(), 20 * 1024 * 1024);
        create_file(&dir.path().join("hc-chunk1"));

        srv.ack("hc-chunk1", 0).await.unwrap();
        assert!(srv.list_chunks().await.unwrap().is_empty());

        let st = srv.stat("hc-chunk1").await.unwrap();
        assert!(st.deleted);
        assert!(!st.exists);
    }

    #[tokio::test]
    async fn test_ack_with_too_small_size() {
        let dir = tempdir().unwrap();
        let srv = test_ondisk(dir.path(), 20 * 1024 * 1024);
        std::fs::write(dir.path().join("hc-chunk1"), b"unread\n").unwrap();

        let err = srv.ack("hc-chunk1", 3).await.unwrap_err();
        assert!(matches!(err, Error::AckSizeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_ack_of_missing_chunk() {
        let dir = tempdir().unwrap();
        let srv = test_ondisk(dir.path(), 20 * 1024 * 1024);

        let err = srv.ack("hc-chunk1", 0).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_write_direct_and_stat() {
        let dir = tempdir().unwrap();
        let srv = test_ondisk(dir.path(), 20 * 1024 * 1024);

        let replica = "other-chunk000000000";
        srv.write_direct(replica, b"replicated\n").await.unwrap();
        srv.write_direct(replica, b"more\n").await.unwrap();

        let st = srv.stat(replica).await.unwrap();
        assert!(st.exists);
        assert_eq!(st.size, 16);

        srv.ack_direct(replica).await.unwrap();
        let st = srv.stat(replica).await.unwrap();
        assert!(st.deleted);

        // Removing it twice must not fail
        srv.ack_direct(replica).await.unwrap();
    }

    #[test]
    fn test_cut_to_last_message() {
        let (truncated, rest) = cut_to_last_message(b"100\n101\n10").unwrap();
        assert_eq!(truncated, b"100\n101\n");
        assert_eq!(rest, b"10");
    }

    #[test]
    fn test_cut_to_last_message_full_buffer() {
        let (truncated, rest) = cut_to_last_message(b"100\n101\n").unwrap();
        assert_eq!(truncated, b"100\n101\n");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_cut_to_last_message_empty() {
        let (truncated, rest) = cut_to_last_message(b"").unwrap();
        assert!(truncated.is_empty());
        assert!(rest.is_empty());
    }

    #[test]
    fn test_cut_to_last_message_errors() {
        let err = cut_to_last_message(b"100000").unwrap_err();
        assert!(matches!(err, Error::BufferTooSmall));
    }
}
