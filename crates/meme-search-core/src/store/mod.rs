//! Collaborator abstractions for meme-search.
//!
//! Every external system the core talks to is reached through one of the
//! traits below, so the orchestrator and the ingestion worker can be driven
//! by the production clients (Weaviate, Elasticsearch, the model server,
//! SQLite) or by the in-memory doubles in [`memory`].
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! | Trait | Backs |
//! |-------|-------|
//! | [`VectorIndex`] | nearest-neighbour and threshold search, count probe, inserts |
//! | [`CaptionIndex`] | fuzzy caption search |
//! | [`LabelLookup`] | reference id → image name |
//! | [`FaceReferenceLookup`] | celebrity name → reference face embeddings |
//! | [`QueryDecomposer`] | free text → [`QueryDecomposition`] |
//! | [`Embedder`] | text / image → vector |
//! | [`TextRemover`] | image → image with the meme text painted out |

pub mod memory;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    CaptionHit, Collection, FaceReference, ItemId, QueryDecomposition, VectorObject,
};

/// Result of a create call against a vector store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new object was stored.
    Created,
    /// An object with the same id already exists; nothing was written.
    Duplicate,
}

/// Vector similarity search service.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Up to `limit` items closest to `vector`, best first.
    async fn nearest_neighbors(
        &self,
        collection: &Collection,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ItemId>>;

    /// Items whose distance to `vector` is at most `max_distance`, best first.
    async fn within_threshold(
        &self,
        collection: &Collection,
        vector: &[f32],
        max_distance: f32,
    ) -> Result<Vec<ItemId>>;

    /// Number of objects stored in `collection`.
    async fn count(&self, collection: &str) -> Result<u64>;

    /// Create one object. An existing id is reported as
    /// [`InsertOutcome::Duplicate`], never as an error.
    async fn insert(&self, collection: &str, object: &VectorObject) -> Result<InsertOutcome>;
}

/// Full-text / fuzzy caption search service.
#[async_trait]
pub trait CaptionIndex: Send + Sync {
    /// Captions matching `text` with a relevance of at least `min_score`, best first.
    async fn fuzzy_search(&self, text: &str, min_score: f32) -> Result<Vec<CaptionHit>>;
}

/// Relational lookup from caption reference ids to items.
#[async_trait]
pub trait LabelLookup: Send + Sync {
    /// The image name labelled with `ref_id`, if any.
    async fn image_for_ref(&self, ref_id: i64) -> Result<Option<ItemId>>;
}

/// Lookup of stored celebrity reference faces.
#[async_trait]
pub trait FaceReferenceLookup: Send + Sync {
    /// All reference embeddings stored under exactly `name`.
    async fn references_by_name(&self, name: &str) -> Result<Vec<FaceReference>>;
}

/// Query understanding service.
#[async_trait]
pub trait QueryDecomposer: Send + Sync {
    async fn decompose(&self, query: &str) -> Result<QueryDecomposition>;
}

/// Embedding generation service.
///
/// Both methods must return a non-empty vector or an error.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_image(&self, image: &Path) -> Result<Vec<f32>>;
}

/// Meme text removal (OCR mask + inpainting) service.
#[async_trait]
pub trait TextRemover: Send + Sync {
    /// Write a text-free copy of `image` and return its path.
    async fn remove_text(&self, image: &Path) -> Result<PathBuf>;
}
