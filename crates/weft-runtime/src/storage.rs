//! Storage views handed to channels.
//!
//! The document store itself is an external, content-addressed service
//! ([`DocumentStorage`]). Channels never talk to it directly; each gets an
//! [`ObjectStorage`] scoped to its own subtree:
//!
//! - [`ChannelStorage`] - a subtree of a persisted snapshot, resolved on demand
//! - [`SnapshotStorage`] - an in-memory snapshot (remote attach, no round trip)
//!
//! [`PrefetchedStorage`] wraps a document store with a blob cache that
//! container loads fill with every channel's attributes up front, and
//! [`MemoryBlobStore`] is an in-process store addressed by SHA-256.

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};
use weft_core::tree::{EntryValue, SnapshotTree, StoredTree};

/// Errors from storage reads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("tree not found: {0}")]
    TreeNotFound(String),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Content-addressed blob store backing a document.
#[async_trait]
pub trait DocumentStorage: Send + Sync {
    async fn get_blob(&self, id: &str) -> Result<Vec<u8>, StorageError>;
}

/// A channel's read-only view of its persisted state.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Read the blob at a `/`-separated path relative to the channel root.
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Whether a blob or subtree exists at `path`.
    fn contains(&self, path: &str) -> bool;
}

/// Storage view backed by a subtree of a persisted snapshot.
pub struct ChannelStorage {
    storage: Arc<dyn DocumentStorage>,
    tree: StoredTree,
}

impl ChannelStorage {
    pub fn new(storage: Arc<dyn DocumentStorage>, tree: StoredTree) -> Self {
        Self { storage, tree }
    }

    pub fn tree(&self) -> &StoredTree {
        &self.tree
    }
}

#[async_trait]
impl ObjectStorage for ChannelStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let id = self
            .tree
            .blob_id(path)
            .ok_or_else(|| StorageError::PathNotFound(path.to_string()))?;
        self.storage.get_blob(id).await
    }

    fn contains(&self, path: &str) -> bool {
        self.tree.contains(path)
    }
}

/// Storage view backed purely by an in-memory snapshot.
pub struct SnapshotStorage {
    tree: SnapshotTree,
}

impl SnapshotStorage {
    pub fn new(tree: SnapshotTree) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &SnapshotTree {
        &self.tree
    }
}

#[async_trait]
impl ObjectStorage for SnapshotStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.tree
            .read_blob(path)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| StorageError::PathNotFound(path.to_string()))
    }

    fn contains(&self, path: &str) -> bool {
        self.tree.get(path).is_some()
    }
}

/// Document storage that serves from a prefetched blob map when it can.
pub struct PrefetchedStorage {
    inner: Arc<dyn DocumentStorage>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl PrefetchedStorage {
    pub fn new(inner: Arc<dyn DocumentStorage>) -> Self {
        Self::with_blobs(inner, HashMap::new())
    }

    pub fn with_blobs(inner: Arc<dyn DocumentStorage>, blobs: HashMap<String, Vec<u8>>) -> Self {
        Self {
            inner,
            blobs: RwLock::new(blobs),
        }
    }

    /// Fetch every blob under `tree` into the cache. Returns how many were fetched.
    pub async fn prefetch(&self, tree: &StoredTree) -> Result<usize, StorageError> {
        let mut pending: Vec<&StoredTree> = vec![tree];
        let mut fetched = 0;
        while let Some(current) = pending.pop() {
            for id in current.blobs.values() {
                let cached = self.blobs.read().contains_key(id);
                if cached {
                    continue;
                }
                let bytes = self.inner.get_blob(id).await?;
                self.blobs.write().insert(id.clone(), bytes);
                fetched += 1;
            }
            pending.extend(current.trees.values());
        }
        Ok(fetched)
    }

    /// Fetch the blob at `path` in every child of `tree`, once per distinct
    /// blob. Returns how many were fetched.
    ///
    /// Blobs that cannot be fetched are skipped; reading them later fails
    /// for that child alone.
    pub async fn prefetch_children(&self, tree: &StoredTree, path: &str) -> usize {
        let mut fetched = 0;
        for (child, subtree) in &tree.trees {
            let Some(id) = subtree.blob_id(path) else {
                continue;
            };
            if self.blobs.read().contains_key(id) {
                continue;
            }
            match self.inner.get_blob(id).await {
                Ok(bytes) => {
                    self.blobs.write().insert(id.to_string(), bytes);
                    fetched += 1;
                }
                Err(err) => debug!(child = %child, error = %err, "Prefetch skipped"),
            }
        }
        fetched
    }

    pub fn cached(&self) -> usize {
        self.blobs.read().len()
    }
}

#[async_trait]
impl DocumentStorage for PrefetchedStorage {
    async fn get_blob(&self, id: &str) -> Result<Vec<u8>, StorageError> {
        let cached = self.blobs.read().get(id).cloned();
        if let Some(bytes) = cached {
            trace!(blob = %id, "Serving prefetched blob");
            return Ok(bytes);
        }
        self.inner.get_blob(id).await
    }
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn content_id(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// In-process content-addressed store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    trees: RwLock<HashMap<String, StoredTree>>,
    reads: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob, returning its content id.
    pub fn put_blob(&self, bytes: Vec<u8>) -> String {
        let id = content_id(&bytes);
        self.blobs.write().entry(id.clone()).or_insert(bytes);
        id
    }

    /// Write a snapshot tree, returning its stored form.
    ///
    /// Handle entries must name a tree previously written to this store.
    pub fn upload(&self, tree: &SnapshotTree) -> Result<StoredTree, StorageError> {
        let mut stored = StoredTree::new();
        for entry in &tree.entries {
            match &entry.value {
                EntryValue::Blob(blob) => {
                    let id = self.put_blob(blob.contents.clone());
                    stored.blobs.insert(entry.path.clone(), id);
                }
                EntryValue::Tree(subtree) => {
                    stored.trees.insert(entry.path.clone(), self.upload(subtree)?);
                }
                EntryValue::Handle(id) => {
                    let existing = self
                        .tree(id)
                        .ok_or_else(|| StorageError::TreeNotFound(id.clone()))?;
                    stored.trees.insert(entry.path.clone(), existing);
                }
            }
        }

        let digest_input = serde_json::to_vec(&(&stored.blobs, &stored.trees))
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let id = content_id(&digest_input);
        stored.id = Some(id.clone());
        self.trees.write().entry(id).or_insert_with(|| stored.clone());
        Ok(stored)
    }

    pub fn tree(&self, id: &str) -> Option<StoredTree> {
        self.trees.read().get(id).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }

    /// Number of `get_blob` calls served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DocumentStorage for MemoryBlobStore {
    async fn get_blob(&self, id: &str) -> Result<Vec<u8>, StorageError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.blobs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::BlobNotFound(id.to_string()))
    }
}
