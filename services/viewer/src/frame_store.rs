//! Frame store collaborator and its implementations.
//!
//! The viewer core never decodes frames itself. It asks a [`FrameStore`]
//! for frames by identity and tells it when cached frames can be dropped.

use crate::frame::{Frame, FrameDescriptor, ImageId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

/// Errors that can occur while fetching a single frame.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("Frame not found: {0}")]
    NotFound(String),

    #[error("I/O error reading frame: {0}")]
    Io(String),

    #[error("Frame could not be decoded: {0}")]
    Decode(String),

    #[error("Frame store unavailable: {0}")]
    Unavailable(String),

    #[error("Fetch abandoned before completion")]
    Aborted,
}

impl FetchError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Io(_) | FetchError::Unavailable(_))
    }
}

/// Asynchronous keyed frame lookup with a cache.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameStore: Send + Sync {
    /// Fetch (and cache) the frame for an identity.
    async fn fetch(&self, identity: &str) -> Result<Frame, FetchError>;

    /// Drop one cached frame.
    fn evict(&self, identity: &str);

    /// Drop every cached frame.
    fn clear(&self);
}

/// In-memory frame store over a preloaded set of frames.
///
/// The preloaded frames are the backing source; the cache only records
/// which identities have been handed out since the last eviction.
#[derive(Default)]
pub struct MemoryFrameStore {
    frames: RwLock<HashMap<ImageId, Frame>>,
    cached: RwLock<HashSet<ImageId>>,
}

impl MemoryFrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from frames keyed by their own identity.
    pub fn with_frames(frames: impl IntoIterator<Item = Frame>) -> Self {
        let store = Self::new();
        for frame in frames {
            store.insert(frame);
        }
        store
    }

    pub fn insert(&self, frame: Frame) {
        self.frames
            .write()
            .insert(frame.image_identity.clone(), frame);
    }

    /// Remove a frame from the backing source.
    pub fn remove(&self, identity: &str) -> Option<Frame> {
        self.cached.write().remove(identity);
        self.frames.write().remove(identity)
    }

    pub fn len(&self) -> usize {
        self.frames.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.read().is_empty()
    }

    /// Number of identities fetched and not evicted since.
    pub fn cached(&self) -> usize {
        self.cached.read().len()
    }
}

#[async_trait]
impl FrameStore for MemoryFrameStore {
    async fn fetch(&self, identity: &str) -> Result<Frame, FetchError> {
        let frame = self
            .frames
            .read()
            .get(identity)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(identity.to_string()))?;
        self.cached.write().insert(identity.to_string());
        Ok(frame)
    }

    fn evict(&self, identity: &str) {
        self.cached.write().remove(identity);
    }

    fn clear(&self) {
        self.cached.write().clear();
    }
}

/// Frame store backed by a directory of JSON frame descriptors.
///
/// The identity of a frame is its file name relative to the root. Parsed
/// frames are cached, so a second fetch does not touch the disk.
pub struct DirectoryFrameStore {
    root: PathBuf,
    extension: String,
    cache: RwLock<HashMap<ImageId, Frame>>,
}

impl DirectoryFrameStore {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of frames currently cached.
    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }

    /// List descriptor file names under the root, sorted.
    pub async fn list_identities(&self) -> Result<Vec<ImageId>, FetchError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| FetchError::Io(format!("{}: {}", self.root.display(), e)))?;

        let mut identities = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?
        {
            let path = entry.path();
            let matches_extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case(&self.extension))
                .unwrap_or(false);

            if !matches_extension || !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                identities.push(name.to_string());
            }
        }

        identities.sort();
        debug!(
            root = %self.root.display(),
            count = identities.len(),
            "Listed frame descriptors"
        );
        Ok(identities)
    }

    fn resolve(&self, identity: &str) -> Option<PathBuf> {
        let relative = Path::new(identity);
        let plain = relative.components().count() == 1
            && !identity.contains("..")
            && relative.file_name().is_some();
        plain.then(|| self.root.join(relative))
    }
}

#[async_trait]
impl FrameStore for DirectoryFrameStore {
    async fn fetch(&self, identity: &str) -> Result<Frame, FetchError> {
        let cached = self.cache.read().get(identity).cloned();
        if let Some(frame) = cached {
            trace!(identity = %identity, "Frame cache hit");
            return Ok(frame);
        }

        let path = self
            .resolve(identity)
            .ok_or_else(|| FetchError::NotFound(identity.to_string()))?;

        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FetchError::NotFound(identity.to_string()),
            _ => FetchError::Io(format!("{}: {}", path.display(), e)),
        })?;

        let descriptor = FrameDescriptor::from_slice(&bytes)
            .map_err(|e| FetchError::Decode(format!("{}: {}", identity, e)))?;
        let frame = Frame::from_descriptor(identity, descriptor);

        self.cache
            .write()
            .insert(identity.to_string(), frame.clone());

        Ok(frame)
    }

    fn evict(&self, identity: &str) {
        self.cache.write().remove(identity);
    }

    fn clear(&self) {
        self.cache.write().clear();
    }
}
