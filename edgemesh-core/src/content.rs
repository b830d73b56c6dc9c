//! Content store abstraction
//!
//! The node treats the content store as an external collaborator: a keyed
//! lookup that resolves a content id to byte ranges. The on-disk layout and
//! integrity checking live behind this interface. An in-memory implementation
//! is provided for tests and local development.

use crate::error::{EdgeMeshError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Default piece size used by the in-memory store (1 MiB)
pub const DEFAULT_PIECE_SIZE: u64 = 1024 * 1024;

/// Metadata describing a content item the master asks the node to carry
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ContentMetadata {
    /// Opaque content identifier
    pub content_id: String,

    /// Number of pieces the content is split into
    pub piece_count: u32,

    /// Piece size in bytes (last piece may be shorter)
    pub piece_size: u64,

    /// Total content length in bytes
    pub total_length: u64,

    /// Original file name, used for content-type inference
    pub source_name: String,
}

/// Read access to one content item
#[async_trait]
pub trait ContentHandle: Send + Sync {
    /// Opaque content identifier
    fn content_id(&self) -> &str;

    /// Total content length in bytes
    fn total_length(&self) -> u64;

    /// Number of pieces
    fn piece_count(&self) -> u32;

    /// Original file name, used for content-type inference
    fn source_name(&self) -> &str;

    /// Read a byte range within a piece. `length == 0` reads to the end of
    /// the piece.
    async fn read_piece(&self, index: u32, offset: u64, length: u64) -> Result<Bytes>;

    /// Read an absolute byte range `[start, end]` (inclusive) across pieces,
    /// as served by the HTTP listener.
    async fn read_absolute(&self, start: u64, end: u64) -> Result<Bytes>;
}

/// Keyed lookup over the locally held content items
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Resolve a content id to a handle, or `None` on a miss
    async fn get(&self, content_id: &str) -> Option<Arc<dyn ContentHandle>>;

    /// List all content ids currently held
    async fn list(&self) -> Vec<String>;

    /// Register content metadata received from the master
    async fn add(&self, metadata: ContentMetadata) -> Result<()>;

    /// Drop a content item; returns whether it existed
    async fn remove(&self, content_id: &str) -> bool;
}

/// In-memory content store
///
/// Used for testing and development. Not persistent.
#[derive(Default)]
pub struct MemoryContentStore {
    items: RwLock<HashMap<String, Arc<MemoryContent>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully materialized content item
    pub fn insert(&self, content_id: impl Into<String>, source_name: impl Into<String>, data: Bytes) {
        let content_id = content_id.into();
        let item = Arc::new(MemoryContent {
            content_id: content_id.clone(),
            source_name: source_name.into(),
            piece_size: DEFAULT_PIECE_SIZE,
            data,
        });
        self.items.write().insert(content_id, item);
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn get(&self, content_id: &str) -> Option<Arc<dyn ContentHandle>> {
        let items = self.items.read();
        items
            .get(content_id)
            .map(|item| Arc::clone(item) as Arc<dyn ContentHandle>)
    }

    async fn list(&self) -> Vec<String> {
        self.items.read().keys().cloned().collect()
    }

    async fn add(&self, metadata: ContentMetadata) -> Result<()> {
        // Metadata-only registration holds an empty placeholder until the
        // excluded transfer path fills it in.
        let item = Arc::new(MemoryContent {
            content_id: metadata.content_id.clone(),
            source_name: metadata.source_name,
            piece_size: metadata.piece_size.max(1),
            data: Bytes::new(),
        });
        self.items.write().insert(metadata.content_id, item);
        Ok(())
    }

    async fn remove(&self, content_id: &str) -> bool {
        self.items.write().remove(content_id).is_some()
    }
}

struct MemoryContent {
    content_id: String,
    source_name: String,
    piece_size: u64,
    data: Bytes,
}

#[async_trait]
impl ContentHandle for MemoryContent {
    fn content_id(&self) -> &str {
        &self.content_id
    }

    fn total_length(&self) -> u64 {
        self.data.len() as u64
    }

    fn piece_count(&self) -> u32 {
        if self.data.is_empty() {
            0
        } else {
            self.data.len().div_ceil(self.piece_size as usize) as u32
        }
    }

    fn source_name(&self) -> &str {
        &self.source_name
    }

    async fn read_piece(&self, index: u32, offset: u64, length: u64) -> Result<Bytes> {
        let piece_start = index as u64 * self.piece_size;
        if piece_start >= self.total_length() {
            return Err(EdgeMeshError::PieceOutOfBounds {
                index,
                max: self.piece_count().saturating_sub(1),
            });
        }
        let piece_end = (piece_start + self.piece_size).min(self.total_length());
        let piece_len = piece_end - piece_start;
        if offset > piece_len {
            return Err(EdgeMeshError::InvalidRange {
                offset,
                length,
                available: piece_len,
            });
        }
        let read_len = if length == 0 {
            piece_len - offset
        } else {
            length
        };
        if offset + read_len > piece_len {
            return Err(EdgeMeshError::InvalidRange {
                offset,
                length: read_len,
                available: piece_len,
            });
        }
        let start = (piece_start + offset) as usize;
        Ok(self.data.slice(start..start + read_len as usize))
    }

    async fn read_absolute(&self, start: u64, end: u64) -> Result<Bytes> {
        if start > end || end >= self.total_length() {
            return Err(EdgeMeshError::InvalidRange {
                offset: start,
                length: end.saturating_sub(start) + 1,
                available: self.total_length(),
            });
        }
        Ok(self.data.slice(start as usize..=end as usize))
    }
}
