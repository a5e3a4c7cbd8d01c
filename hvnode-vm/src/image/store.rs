//! Durable storage for the image index
//!
//! The whole index is rewritten after every mutation; there is no log, so
//! the last writer wins. Callers serialize access through the ImageCache.

use super::types::ImageIndex;
use crate::fsutil::{blocking, write_atomically};
use async_trait::async_trait;
use hvnode_core::HvnodeResult;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Persistence backend for the image index.
#[async_trait]
pub trait ImageIndexStore: Send + Sync {
    /// Load the persisted index, or `None` if nothing has been saved yet.
    async fn load(&self) -> HvnodeResult<Option<ImageIndex>>;

    /// Replace the persisted index.
    async fn save(&self, index: &ImageIndex) -> HvnodeResult<()>;
}

/// Index stored as a JSON file in the configuration directory.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ImageIndexStore for JsonFileStore {
    async fn load(&self) -> HvnodeResult<Option<ImageIndex>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                debug!("Loaded image index from {}", self.path.display());
                Ok(Some(serde_json::from_str(&content)?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, index: &ImageIndex) -> HvnodeResult<()> {
        let data = serde_json::to_vec(index)?;
        let path = self.path.clone();
        blocking(move || write_atomically(&path, &data)).await?;
        debug!("Saved image index to {}", self.path.display());
        Ok(())
    }
}

/// Index kept in memory only.
#[derive(Default)]
pub struct MemoryStore {
    index: Mutex<Option<ImageIndex>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(index: ImageIndex) -> Self {
        Self {
            index: Mutex::new(Some(index)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of times the index has been saved.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Option<ImageIndex> {
        self.index.lock().map(|guard| guard.clone()).unwrap_or(None)
    }
}

#[async_trait]
impl ImageIndexStore for MemoryStore {
    async fn load(&self) -> HvnodeResult<Option<ImageIndex>> {
        Ok(self.snapshot())
    }

    async fn save(&self, index: &ImageIndex) -> HvnodeResult<()> {
        if let Ok(mut guard) = self.index.lock() {
            *guard = Some(index.clone());
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl<S: ImageIndexStore + ?Sized> ImageIndexStore for std::sync::Arc<S> {
    async fn load(&self) -> HvnodeResult<Option<ImageIndex>> {
        (**self).load().await
    }

    async fn save(&self, index: &ImageIndex) -> HvnodeResult<()> {
        (**self).save(index).await
    }
}
