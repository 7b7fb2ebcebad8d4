//! Smart Client
//!
//! Connects to a set of chukcha instances to produce (`send`) and consume
//! (`process`) messages. The consumer keeps one read cursor per owner
//! instance and only advances it when the processing callback succeeds, so
//! every message is delivered at least once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{self, Chunk};

const DEFAULT_SCRATCH_SIZE: usize = 64 * 1024;

/// The read position within one owner instance's chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOffset {
    #[serde(rename = "CurChunk")]
    pub cur_chunk: Chunk,
    /// Index of the last acknowledged chunk of this owner, or -1 when
    /// nothing was acknowledged yet
    #[serde(rename = "LastAckedChunkIdx")]
    pub last_acked_chunk_idx: i64,
    #[serde(rename = "Off")]
    pub off: u64,
}

impl Default for ReadOffset {
    fn default() -> Self {
        Self {
            cur_chunk: Chunk::default(),
            last_acked_chunk_idx: -1,
            off: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ClientState {
    #[serde(rename = "Offsets")]
    offsets: HashMap<String, ReadOffset>,
}

/// Outcome of a single read against the current chunk of one cursor
enum ReadOutcome {
    Delivered,
    /// The chunk is not on this instance (yet); move on
    Missing,
    /// The cursor moved without delivering anything, read again
    Retry,
    EndOfStream,
}

/// A client connected to a set of chukcha instances.
///
/// The consumer state is not synchronized: use one client (or a restored
/// copy of its state) per consumer.
#[derive(Debug, Clone)]
pub struct Simple {
    addrs: Vec<String>,
    http: reqwest::Client,
    st: ClientState,
}

impl Simple {
    /// Create a client for the given base addresses, e.g.
    /// `http://127.0.0.1:8061`
    pub fn new(addrs: Vec<String>) -> Self {
        Self {
            addrs,
            http: reqwest::Client::new(),
            st: ClientState::default(),
        }
    }

    /// Serialize the consumer cursors so they survive a restart
    pub fn marshal_state(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.st)?)
    }

    /// Restore consumer cursors produced by `marshal_state`
    pub fn restore_saved_state(&mut self, buf: &[u8]) -> Result<()> {
        self.st = serde_json::from_slice(buf)?;
        Ok(())
    }

    /// Write the consumer cursors to a file, atomically via a temporary
    /// file and a rename.
    pub fn save_state_to_file(&self, path: &Path) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, self.marshal_state()?)?;
        std::fs::rename(&tmp, path)?;

        Ok(())
    }

    /// Restore consumer cursors from a state file. Returns `false` when the
    /// file does not exist yet.
    pub fn restore_state_from_file(&mut self, path: &Path) -> Result<bool> {
        match std::fs::read(path) {
            Ok(buf) => {
                self.restore_saved_state(&buf)?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Send messages to one of the configured instances. Each message must
    /// end with a newline.
    pub async fn send(&self, category: &str, msgs: &[u8]) -> Result<()> {
        let addr = self.pick_addr()?;

        let resp = self
            .http
            .post(format!("{addr}/write"))
            .query(&[("category", category)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(msgs.to_vec())
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::UnexpectedStatus { status, body });
        }

        Ok(())
    }

    /// List the chunks stored at `addr` for a category
    pub async fn list_chunks(
        &self,
        category: &str,
        addr: &str,
        from_replication: bool,
    ) -> Result<Vec<Chunk>> {
        let mut query = vec![("category", category.to_string())];
        if from_replication {
            query.push(("from_replication", "1".to_string()));
        }

        let resp = self
            .http
            .get(format!("{addr}/listChunks"))
            .query(&query)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::UnexpectedStatus { status, body });
        }

        Ok(resp.json().await?)
    }

    /// Read the next batch of messages and hand it to `process_fn`. The
    /// cursor only advances when `process_fn` returns `Ok`, so a failed
    /// batch is delivered again.
    ///
    /// At most `scratch_size` bytes are delivered per call (64 KiB when not
    /// given); a batch never ends mid-message. Returns
    /// [`Error::EndOfStream`] when no instance has new messages for this
    /// consumer right now.
    pub async fn process<F>(
        &mut self,
        category: &str,
        scratch_size: Option<usize>,
        mut process_fn: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let max_size = scratch_size.unwrap_or(DEFAULT_SCRATCH_SIZE);
        let addr = self.pick_addr()?.to_string();

        if self.st.offsets.is_empty() {
            self.update_current_chunks(category, &addr).await?;
        }

        let instances: Vec<String> = self.st.offsets.keys().cloned().collect();
        for instance in instances {
            match self
                .process_instance(&addr, &instance, category, max_size, &mut process_fn)
                .await
            {
                Err(Error::EndOfStream) => continue,
                other => return other,
            }
        }

        Err(Error::EndOfStream)
    }

    async fn process_instance<F>(
        &mut self,
        addr: &str,
        instance: &str,
        category: &str,
        max_size: usize,
        process_fn: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        loop {
            self.update_current_chunks(category, addr).await?;

            match self
                .read_once(addr, instance, category, max_size, process_fn)
                .await?
            {
                ReadOutcome::Retry => continue,
                ReadOutcome::Delivered | ReadOutcome::Missing => return Ok(()),
                ReadOutcome::EndOfStream => return Err(Error::EndOfStream),
            }
        }
    }

    async fn read_once<F>(
        &mut self,
        addr: &str,
        instance: &str,
        category: &str,
        max_size: usize,
        process_fn: &mut F,
    ) -> Result<ReadOutcome>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let Some(mut cur) = self.st.offsets.get(instance).cloned() else {
            return Ok(ReadOutcome::EndOfStream);
        };
        if cur.cur_chunk.name.is_empty() {
            // Everything this owner had was already consumed and
            // acknowledged
            return Ok(ReadOutcome::EndOfStream);
        }

        let resp = self
            .http
            .get(format!("{addr}/read"))
            .query(&[
                ("off", cur.off.to_string()),
                ("maxSize", max_size.to_string()),
                ("chunk", cur.cur_chunk.name.clone()),
                ("category", category.to_string()),
            ])
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(
                "chunk {:?} is missing at {:?}, probably not replicated yet, skipping",
                cur.cur_chunk.name,
                addr
            );
            return Ok(ReadOutcome::Missing);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::UnexpectedStatus { status, body });
        }

        let body = resp.bytes().await?;

        // Zero bytes with no error means the end of the chunk by convention
        if body.is_empty() {
            if !cur.cur_chunk.complete {
                self.update_current_chunk_complete_status(&mut cur, instance, category, addr)
                    .await?;

                if !cur.cur_chunk.complete {
                    if cur.off >= cur.cur_chunk.size {
                        // The owner has not written anything new yet
                        self.st.offsets.insert(instance.to_string(), cur);
                        return Ok(ReadOutcome::EndOfStream);
                    }
                } else {
                    self.st.offsets.insert(instance.to_string(), cur);
                    return Ok(ReadOutcome::Retry);
                }
            }

            if cur.off < cur.cur_chunk.size {
                // The owner appended between our read and the listing
                self.st.offsets.insert(instance.to_string(), cur);
                return Ok(ReadOutcome::Retry);
            }

            self.ack_current_chunk(addr, category, &cur).await?;

            if let Some((_, idx)) = protocol::parse_chunk_file_name(&cur.cur_chunk.name) {
                cur.last_acked_chunk_idx = idx as i64;
            }
            cur.cur_chunk = Chunk::default();
            cur.off = 0;
            self.st.offsets.insert(instance.to_string(), cur);

            return Ok(ReadOutcome::Retry);
        }

        process_fn(&body)?;

        cur.off += body.len() as u64;
        self.st.offsets.insert(instance.to_string(), cur);

        Ok(ReadOutcome::Delivered)
    }

    async fn update_current_chunks(&mut self, category: &str, addr: &str) -> Result<()> {
        let chunks = self.list_chunks(category, addr, false).await?;
        if chunks.is_empty() {
            return Err(Error::EndOfStream);
        }

        let mut chunks_by_instance: HashMap<String, Vec<Chunk>> = HashMap::new();
        for c in chunks {
            let Some((instance, chunk_idx)) = protocol::parse_chunk_file_name(&c.name) else {
                continue;
            };
            let instance = instance.to_string();

            if let Some(cur) = self.st.offsets.get(&instance) {
                if (chunk_idx as i64) <= cur.last_acked_chunk_idx {
                    continue;
                }
            }

            chunks_by_instance.entry(instance).or_default().push(c);
        }

        for (instance, chunks) in chunks_by_instance {
            let cur = self.st.offsets.entry(instance).or_default();
            if cur.cur_chunk.name.is_empty() {
                cur.cur_chunk = oldest_chunk(chunks);
                cur.off = 0;
            }
        }

        Ok(())
    }

    async fn update_current_chunk_complete_status(
        &self,
        cur: &mut ReadOffset,
        instance: &str,
        category: &str,
        addr: &str,
    ) -> Result<()> {
        let chunks = self.list_chunks(category, addr, false).await?;

        for c in chunks {
            let Some((chunk_instance, _)) = protocol::parse_chunk_file_name(&c.name) else {
                continue;
            };
            if chunk_instance != instance {
                continue;
            }

            if c.name == cur.cur_chunk.name {
                cur.cur_chunk = c;
                return Ok(());
            }
        }

        Ok(())
    }

    async fn ack_current_chunk(&self, addr: &str, category: &str, cur: &ReadOffset) -> Result<()> {
        let resp = self
            .http
            .get(format!("{addr}/ack"))
            .query(&[
                ("chunk", cur.cur_chunk.name.clone()),
                ("size", cur.off.to_string()),
                ("category", category.to_string()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::UnexpectedStatus { status, body });
        }

        Ok(())
    }

    fn pick_addr(&self) -> Result<&str> {
        self.addrs
            .choose(&mut rand::thread_rng())
            .map(|s| s.as_str())
            .ok_or_else(|| Error::Config("client has no instance addresses configured".into()))
    }
}

/// Pick the chunk to start consuming from: the oldest complete chunk if any
/// chunk is complete (so it can be acknowledged and dropped), the oldest one
/// otherwise.
fn oldest_chunk(mut chunks: Vec<Chunk>) -> Chunk {
    chunks.sort_by(|a, b| a.name.cmp(&b.name));

    match chunks.iter().position(|c| c.complete) {
        Some(pos) => chunks.swap_remove(pos),
        None => chunks.swap_remove(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_restore_round_trip() {
        let mut offsets = HashMap::new();
        offsets.insert(
            "h1".to_string(),
            ReadOffset {
                cur_chunk: Chunk {
                    name: "h1-chunk000000001".to_string(),
                    complete: true,
                    size: 123456,
                },
                last_acked_chunk_idx: 0,
                off: 123,
            },
        );
        offsets.insert(
            "h2".to_string(),
            ReadOffset {
                cur_chunk: Chunk {
                    name: "h2-chunk000000002".to_string(),
                    complete: true,
                    size: 100000,
                },
                last_acked_chunk_idx: -1,
                off: 100,
            },
        );

        let mut cl = Simple::new(vec!["http://localhost".to_string()]);
        cl.st = ClientState { offsets };

        let buf = cl.marshal_state().unwrap();

        let mut restored = Simple::new(vec!["http://localhost".to_string()]);
        restored.restore_saved_state(&buf).unwrap();

        assert_eq!(cl.st, restored.st);
    }

    #[test]
    fn test_state_json_field_names() {
        let mut cl = Simple::new(vec![]);
        cl.st.offsets.insert("h1".to_string(), ReadOffset::default());

        let encoded = String::from_utf8(cl.marshal_state().unwrap()).unwrap();
        assert!(encoded.contains("\"Offsets\""));
        assert!(encoded.contains("\"CurChunk\""));
        assert!(encoded.contains("\"LastAckedChunkIdx\":-1"));
        assert!(encoded.contains("\"Off\":0"));
    }

    #[test]
    fn test_state_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut cl = Simple::new(vec![]);
        cl.st.offsets.insert(
            "h1".to_string(),
            ReadOffset {
                cur_chunk: Chunk {
                    name: "h1-chunk000000000".to_string(),
                    complete: false,
                    size: 42,
                },
                last_acked_chunk_idx: -1,
                off: 10,
            },
        );
        cl.save_state_to_file(&path).unwrap();

        let mut restored = Simple::new(vec![]);
        assert!(restored.restore_state_from_file(&path).unwrap());
        assert_eq!(cl.st, restored.st);

        let missing = dir.path().join("no-such-state.json");
        assert!(!restored.restore_state_from_file(&missing).unwrap());
    }

    #[test]
    fn test_oldest_chunk_prefers_complete() {
        let chunks = vec![
            Chunk {
                name: "h1-chunk000000002".to_string(),
                complete: false,
                size: 10,
            },
            Chunk {
                name: "h1-chunk000000001".to_string(),
                complete: true,
                size: 10,
            },
            Chunk {
                name: "h1-chunk000000000".to_string(),
                complete: true,
                size: 10,
            },
        ];

        assert_eq!(oldest_chunk(chunks).name, "h1-chunk000000000");
    }

    #[test]
    fn test_oldest_chunk_falls_back_to_first() {
        let chunks = vec![
            Chunk {
                name: "h1-chunk000000005".to_string(),
                complete: false,
                size: 10,
            },
            Chunk {
                name: "h1-chunk000000004".to_string(),
                complete: false,
                size: 10,
            },
        ];

        assert_eq!(oldest_chunk(chunks).name, "h1-chunk000000004");
    }
}
