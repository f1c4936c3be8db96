//! Snapshot trees.
//!
//! A [`SnapshotTree`] is the in-memory form a channel or a container produces
//! when asked for a snapshot. A [`StoredTree`] is the same hierarchy after it
//! has been written to blob storage: leaves are blob ids rather than bytes.
//!
//! Paths use `/` as separator, e.g. `"counter-1/.attributes"`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw blob contents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub contents: Vec<u8>,
}

impl Blob {
    pub fn new(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            contents: contents.into(),
        }
    }

    /// Serialize `value` as JSON into a blob.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.contents
    }
}

/// Value of a named tree entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum EntryValue {
    Blob(Blob),
    Tree(SnapshotTree),
    /// Reference to a tree that already exists in storage.
    Handle(String),
}

/// A named entry of a [`SnapshotTree`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub value: EntryValue,
}

/// Hierarchy of named blobs and subtrees plus free-form metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotTree {
    pub entries: Vec<TreeEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl SnapshotTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, path: impl Into<String>, value: EntryValue) {
        let path = path.into();
        self.entries.retain(|entry| entry.path != path);
        self.entries.push(TreeEntry { path, value });
    }

    pub fn add_blob(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.insert(path, EntryValue::Blob(Blob::new(contents)));
    }

    pub fn add_json<T: Serialize>(
        &mut self,
        path: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        self.insert(path, EntryValue::Blob(Blob::from_json(value)?));
        Ok(())
    }

    pub fn add_tree(&mut self, path: impl Into<String>, tree: SnapshotTree) {
        self.insert(path, EntryValue::Tree(tree));
    }

    pub fn add_handle(&mut self, path: impl Into<String>, stored_id: impl Into<String>) {
        self.insert(path, EntryValue::Handle(stored_id.into()));
    }

    /// Remove a top-level entry, returning its value.
    pub fn remove(&mut self, path: &str) -> Option<EntryValue> {
        let index = self.entries.iter().position(|entry| entry.path == path)?;
        Some(self.entries.remove(index).value)
    }

    /// Look up an entry by `/`-separated path.
    pub fn get(&self, path: &str) -> Option<&EntryValue> {
        let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
        let mut current = self;
        while let Some(segment) = segments.next() {
            let entry = current.entries.iter().find(|e| e.path == segment)?;
            if segments.peek().is_none() {
                return Some(&entry.value);
            }
            match &entry.value {
                EntryValue::Tree(tree) => current = tree,
                _ => return None,
            }
        }
        None
    }

    /// Contents of the blob at `path`, if there is one.
    pub fn read_blob(&self, path: &str) -> Option<&[u8]> {
        match self.get(path)? {
            EntryValue::Blob(blob) => Some(blob.as_bytes()),
            _ => None,
        }
    }

    /// Subtree at `path`, if there is one.
    pub fn subtree(&self, path: &str) -> Option<&SnapshotTree> {
        match self.get(path)? {
            EntryValue::Tree(tree) => Some(tree),
            _ => None,
        }
    }

    /// Names of the top-level entries, in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.path.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A snapshot tree as persisted in blob storage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTree {
    /// Storage id of this tree, if it has one.
    pub id: Option<String>,
    /// Blob name to blob id.
    pub blobs: BTreeMap<String, String>,
    pub trees: BTreeMap<String, StoredTree>,
}

impl StoredTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blob id at a `/`-separated path.
    pub fn blob_id(&self, path: &str) -> Option<&str> {
        let (dir, name) = match path.rsplit_once('/') {
            Some((dir, name)) => (Some(dir), name),
            None => (None, path),
        };
        let tree = match dir {
            Some(dir) => self.subtree(dir)?,
            None => self,
        };
        tree.blobs.get(name).map(String::as_str)
    }

    /// Subtree at a `/`-separated path.
    pub fn subtree(&self, path: &str) -> Option<&StoredTree> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |tree, segment| tree.trees.get(segment))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.blob_id(path).is_some() || self.subtree(path).is_some()
    }
}
