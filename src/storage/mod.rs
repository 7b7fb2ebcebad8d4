//! Chunk Storage Module
//!
//! Per-category append-only chunk stores plus the manager that owns them.

mod ondisk;

pub use ondisk::{cut_to_last_message, ChunkAckedHook, ChunkCreatedHook, ChunkStat, OnDisk};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::replication::DirectWriter;

/// Check that a category name is safe to use as a directory name
pub fn is_valid_category(category: &str) -> bool {
    !category.is_empty() && !category.contains(['/', '\\', '.'])
}

/// Owns the per-category chunk stores of this instance
pub struct Manager {
    dirname: PathBuf,
    instance_name: String,
    max_chunk_size: u64,
    create_hook: Arc<dyn ChunkCreatedHook>,
    ack_hook: Arc<dyn ChunkAckedHook>,
    disks: Mutex<HashMap<String, Arc<OnDisk>>>,
}

impl Manager {
    pub fn new(
        dirname: PathBuf,
        instance_name: String,
        max_chunk_size: u64,
        create_hook: Arc<dyn ChunkCreatedHook>,
        ack_hook: Arc<dyn ChunkAckedHook>,
    ) -> Self {
        Self {
            dirname,
            instance_name,
            max_chunk_size,
            create_hook,
            ack_hook,
            disks: Mutex::new(HashMap::new()),
        }
    }

    /// Get the chunk store for a category, creating its directory on first
    /// use.
    pub async fn get(&self, category: &str) -> Result<Arc<OnDisk>> {
        if !is_valid_category(category) {
            return Err(Error::InvalidCategory(category.to_string()));
        }

        let mut disks = self.disks.lock().await;
        if let Some(disk) = disks.get(category) {
            return Ok(Arc::clone(disk));
        }

        let dir = self.dirname.join(category);
        std::fs::create_dir_all(&dir)?;

        let disk = Arc::new(OnDisk::open(
            dir,
            category.to_string(),
            self.instance_name.clone(),
            self.max_chunk_size,
            Arc::clone(&self.create_hook),
            Arc::clone(&self.ack_hook),
        )?);
        disks.insert(category.to_string(), Arc::clone(&disk));

        Ok(disk)
    }
}

#[async_trait]
impl DirectWriter for Manager {
    async fn stat(&self, category: &str, file_name: &str) -> Result<ChunkStat> {
        self.get(category).await?.stat(file_name).await
    }

    async fn write_direct(&self, category: &str, file_name: &str, contents: &[u8]) -> Result<()> {
        self.get(category).await?.write_direct(file_name, contents).await
    }

    async fn ack_direct(&self, category: &str, file_name: &str) -> Result<()> {
        self.get(category).await?.ack_direct(file_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_category() {
        assert!(is_valid_category("numbers"));
        assert!(is_valid_category("page_views"));

        assert!(!is_valid_category(""));
        assert!(!is_valid_category("../numbers"));
        assert!(!is_valid_category("a/b"));
        assert!(!is_valid_category("a\\b"));
        assert!(!is_valid_category("."));
    }
}
