//! In-memory collaborators for tests and offline experiments.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Vector search is brute-force cosine distance over all stored vectors.
//! Caption search scores a caption by how many query terms it contains.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::embedding::cosine_distance;
use crate::models::{
    CaptionHit, Collection, FaceReference, ItemId, QueryDecomposition, VectorObject,
};

use super::{
    CaptionIndex, Embedder, FaceReferenceLookup, InsertOutcome, LabelLookup, QueryDecomposer,
    TextRemover, VectorIndex,
};

struct StoredObject {
    id: Uuid,
    vector: Vec<f32>,
    attributes: HashMap<String, String>,
}

/// In-memory [`VectorIndex`].
#[derive(Default)]
pub struct InMemoryVectorIndex {
    collections: RwLock<HashMap<String, Vec<StoredObject>>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object whose item field is set to `item`, deriving the id
    /// from `item`. Convenience for seeding search fixtures.
    pub fn seed(&self, collection: &Collection, item: &str, vector: Vec<f32>) {
        let mut collections = self.collections.write().unwrap();
        collections
            .entry(collection.name.clone())
            .or_default()
            .push(StoredObject {
                id: crate::models::deterministic_id(&format!("{}/{}", collection.name, item)),
                vector,
                attributes: HashMap::from([(collection.item_field.clone(), item.to_string())]),
            });
    }

    fn ranked(&self, collection: &Collection, vector: &[f32]) -> Vec<(f32, ItemId)> {
        let collections = self.collections.read().unwrap();
        let mut scored: Vec<(f32, ItemId)> = collections
            .get(&collection.name)
            .map(|objects| {
                objects
                    .iter()
                    .filter_map(|o| {
                        o.attributes
                            .get(&collection.item_field)
                            .map(|item| (cosine_distance(vector, &o.vector), item.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn nearest_neighbors(
        &self,
        collection: &Collection,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ItemId>> {
        Ok(self
            .ranked(collection, vector)
            .into_iter()
            .take(limit)
            .map(|(_, item)| item)
            .collect())
    }

    async fn within_threshold(
        &self,
        collection: &Collection,
        vector: &[f32],
        max_distance: f32,
    ) -> Result<Vec<ItemId>> {
        Ok(self
            .ranked(collection, vector)
            .into_iter()
            .take_while(|(distance, _)| *distance <= max_distance)
            .map(|(_, item)| item)
            .collect())
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let collections = self.collections.read().unwrap();
        Ok(collections.get(collection).map_or(0, |c| c.len() as u64))
    }

    async fn insert(&self, collection: &str, object: &VectorObject) -> Result<InsertOutcome> {
        let mut collections = self.collections.write().unwrap();
        let objects = collections.entry(collection.to_string()).or_default();
        if objects.iter().any(|o| o.id == object.id) {
            return Ok(InsertOutcome::Duplicate);
        }
        objects.push(StoredObject {
            id: object.id,
            vector: object.vector.clone(),
            attributes: object.attributes.clone(),
        });
        Ok(InsertOutcome::Created)
    }
}

/// In-memory [`CaptionIndex`].
#[derive(Default)]
pub struct InMemoryCaptions {
    captions: Vec<(i64, String)>,
}

impl InMemoryCaptions {
    pub fn new(captions: Vec<(i64, String)>) -> Self {
        Self { captions }
    }
}

#[async_trait]
impl CaptionIndex for InMemoryCaptions {
    async fn fuzzy_search(&self, text: &str, min_score: f32) -> Result<Vec<CaptionHit>> {
        let query_lower = text.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Vec<CaptionHit> = self
            .captions
            .iter()
            .filter_map(|(ref_id, caption)| {
                let caption_lower = caption.to_lowercase();
                let matches = terms.iter().filter(|t| caption_lower.contains(*t)).count();
                let score = matches as f64;
                (matches > 0 && score >= f64::from(min_score)).then(|| CaptionHit {
                    ref_id: *ref_id,
                    text: caption.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(hits)
    }
}

/// In-memory [`LabelLookup`].
#[derive(Default)]
pub struct InMemoryLabels {
    by_ref: HashMap<i64, ItemId>,
}

impl InMemoryLabels {
    pub fn new(by_ref: HashMap<i64, ItemId>) -> Self {
        Self { by_ref }
    }
}

#[async_trait]
impl LabelLookup for InMemoryLabels {
    async fn image_for_ref(&self, ref_id: i64) -> Result<Option<ItemId>> {
        Ok(self.by_ref.get(&ref_id).cloned())
    }
}

/// In-memory [`FaceReferenceLookup`] with exact name matching.
#[derive(Default)]
pub struct InMemoryFaces {
    references: Vec<FaceReference>,
}

impl InMemoryFaces {
    pub fn new(references: Vec<FaceReference>) -> Self {
        Self { references }
    }
}

#[async_trait]
impl FaceReferenceLookup for InMemoryFaces {
    async fn references_by_name(&self, name: &str) -> Result<Vec<FaceReference>> {
        Ok(self
            .references
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect())
    }
}

/// [`QueryDecomposer`] that returns a fixed decomposition, or fails when
/// built with [`FixedDecomposer::unreachable`].
pub struct FixedDecomposer {
    decomposition: Option<QueryDecomposition>,
}

impl FixedDecomposer {
    pub fn new(decomposition: QueryDecomposition) -> Self {
        Self {
            decomposition: Some(decomposition),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            decomposition: None,
        }
    }
}

#[async_trait]
impl QueryDecomposer for FixedDecomposer {
    async fn decompose(&self, _query: &str) -> Result<QueryDecomposition> {
        self.decomposition
            .clone()
            .ok_or_else(|| anyhow!("query decomposer is unreachable"))
    }
}

/// [`Embedder`] backed by lookup tables; unknown inputs are errors.
#[derive(Default)]
pub struct TableEmbedder {
    texts: HashMap<String, Vec<f32>>,
    images: HashMap<PathBuf, Vec<f32>>,
}

impl TableEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.texts.insert(text.to_string(), vector);
        self
    }

    pub fn with_image(mut self, image: impl Into<PathBuf>, vector: Vec<f32>) -> Self {
        self.images.insert(image.into(), vector);
        self
    }
}

#[async_trait]
impl Embedder for TableEmbedder {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.texts
            .get(text)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| anyhow!("no embedding for text '{}'", text))
    }

    async fn embed_image(&self, image: &Path) -> Result<Vec<f32>> {
        self.images
            .get(image)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| anyhow!("no embedding for image {}", image.display()))
    }
}

/// [`TextRemover`] that pretends to clean an image by renaming it
/// `<stem>_cleaned.<ext>`. Nothing is written to disk.
pub struct RenamingTextRemover;

#[async_trait]
impl TextRemover for RenamingTextRemover {
    async fn remove_text(&self, image: &Path) -> Result<PathBuf> {
        let stem = image
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("image path has no file name: {}", image.display()))?;
        let name = match image.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}_cleaned.{}", stem, ext),
            None => format!("{}_cleaned", stem),
        };
        Ok(image.with_file_name(name))
    }
}
