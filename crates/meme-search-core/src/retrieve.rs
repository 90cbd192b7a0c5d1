//! Query orchestration: decomposition, channel dispatch, suppression, fusion.
//!
//! A [`Retriever`] owns handles to every collaborator and a
//! [`RetrievalPolicy`]. For each query it works out which channels are live,
//! runs them concurrently, degrades failed channels to empty lists and
//! hands everything to [`fuse`](crate::fusion::fuse).
//!
//! # Channels
//!
//! | Channel | Query kind | Driven by | Source |
//! |---------|-----------|-----------|--------|
//! | `face` | text | celebrity names | reference faces → extracted-face index, nested fusion |
//! | `caption` | text | caption phrase | caption index → label lookup |
//! | `descriptive` | text | descriptive phrase | cleaned image index |
//! | `fallback` | text | raw query | raw image index |
//! | `image_original` | image | the image | raw image index |
//! | `image_cleaned` | image | text-removed image | cleaned image index |
//!
//! # Suppression
//!
//! A text channel whose driving phrase is blank or a placeholder (default
//! `"a person"`, compared case-insensitively after trimming) is disabled for
//! the query and never dispatched. Celebrity names are filtered against the
//! placeholders plus the name placeholders (default `"unknown"`); with no
//! names left the face channel is disabled.
//!
//! # Failure
//!
//! Nothing here returns an error for a bad query. A failing collaborator
//! empties its channel and is reported in [`ChannelReport::error`]; when
//! every channel is empty the answer is an empty list.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fusion::{fuse, ChannelConfig, FusedItem};
use crate::models::{ChannelResult, Collection, ItemId, Query, QueryDecomposition};
use crate::store::{
    CaptionIndex, Embedder, FaceReferenceLookup, LabelLookup, QueryDecomposer, TextRemover,
    VectorIndex,
};

pub const FACE: &str = "face";
pub const CAPTION: &str = "caption";
pub const DESCRIPTIVE: &str = "descriptive";
pub const FALLBACK: &str = "fallback";
pub const IMAGE_ORIGINAL: &str = "image_original";
pub const IMAGE_CLEANED: &str = "image_cleaned";

// ============ Policy ============

/// Weight and rank constant of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelPolicy {
    pub weight: f64,
    #[serde(rename = "k")]
    pub rank_constant: f64,
}

impl ChannelPolicy {
    pub const fn new(weight: f64, rank_constant: f64) -> Self {
        Self {
            weight,
            rank_constant,
        }
    }

    fn to_config(self, name: &str) -> Result<ChannelConfig> {
        ChannelConfig::new(name, self.weight, self.rank_constant)
    }
}

/// Per-channel fusion policy.
///
/// `face_reference` applies to both nested levels inside the face channel
/// (references of one celebrity, then celebrities). When deserializing, a
/// channel table may set only `weight` or only `k`; the other keeps that
/// channel's built-in value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PartialPolicies")]
pub struct ChannelPolicies {
    pub face: ChannelPolicy,
    pub caption: ChannelPolicy,
    pub descriptive: ChannelPolicy,
    pub fallback: ChannelPolicy,
    pub image_original: ChannelPolicy,
    pub image_cleaned: ChannelPolicy,
    pub face_reference: ChannelPolicy,
}

impl Default for ChannelPolicies {
    fn default() -> Self {
        Self {
            face: ChannelPolicy::new(0.2, 30.0),
            caption: ChannelPolicy::new(0.3, 30.0),
            descriptive: ChannelPolicy::new(0.1, 30.0),
            fallback: ChannelPolicy::new(0.2, 60.0),
            image_original: ChannelPolicy::new(0.6, 30.0),
            image_cleaned: ChannelPolicy::new(0.4, 30.0),
            face_reference: ChannelPolicy::new(1.0, 30.0),
        }
    }
}

/// A channel table as written in configuration.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialPolicy {
    weight: Option<f64>,
    k: Option<f64>,
}

impl PartialPolicy {
    fn over(self, base: ChannelPolicy) -> ChannelPolicy {
        ChannelPolicy::new(
            self.weight.unwrap_or(base.weight),
            self.k.unwrap_or(base.rank_constant),
        )
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PartialPolicies {
    face: PartialPolicy,
    caption: PartialPolicy,
    descriptive: PartialPolicy,
    fallback: PartialPolicy,
    image_original: PartialPolicy,
    image_cleaned: PartialPolicy,
    face_reference: PartialPolicy,
}

impl From<PartialPolicies> for ChannelPolicies {
    fn from(p: PartialPolicies) -> Self {
        let base = ChannelPolicies::default();
        Self {
            face: p.face.over(base.face),
            caption: p.caption.over(base.caption),
            descriptive: p.descriptive.over(base.descriptive),
            fallback: p.fallback.over(base.fallback),
            image_original: p.image_original.over(base.image_original),
            image_cleaned: p.image_cleaned.over(base.image_cleaned),
            face_reference: p.face_reference.over(base.face_reference),
        }
    }
}

/// Every tunable of a retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalPolicy {
    pub channels: ChannelPolicies,
    /// Result size of every nearest-neighbour channel search.
    pub neighbor_limit: usize,
    /// Maximum cosine distance for a face to count as the same person.
    pub face_max_distance: f32,
    /// Cap on matches kept per reference face.
    pub face_match_cap: usize,
    /// Minimum relevance for a caption hit.
    pub caption_min_score: f32,
    /// Filler phrases that disable a text channel.
    pub placeholders: Vec<String>,
    /// Extra fillers that only apply to celebrity names.
    pub name_placeholders: Vec<String>,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self {
            channels: ChannelPolicies::default(),
            neighbor_limit: 20,
            face_max_distance: 0.16,
            face_match_cap: 100,
            caption_min_score: 5.0,
            placeholders: vec!["a person".to_string()],
            name_placeholders: vec!["unknown".to_string()],
        }
    }
}

impl RetrievalPolicy {
    /// Reject weights or rank constants `<= 0` and nonsensical thresholds.
    pub fn validate(&self) -> Result<()> {
        self.channel_configs()?;
        if self.neighbor_limit == 0 {
            bail!("retrieval.neighbor_limit must be >= 1");
        }
        if !(self.face_max_distance.is_finite() && self.face_max_distance >= 0.0) {
            bail!(
                "retrieval.face_max_distance must be >= 0, got {}",
                self.face_max_distance
            );
        }
        if self.face_match_cap == 0 {
            bail!("retrieval.face_match_cap must be >= 1");
        }
        if !self.caption_min_score.is_finite() {
            bail!("retrieval.caption_min_score must be finite");
        }
        Ok(())
    }

    fn channel_configs(&self) -> Result<HashMap<String, ChannelConfig>> {
        let c = &self.channels;
        [
            (FACE, c.face),
            (CAPTION, c.caption),
            (DESCRIPTIVE, c.descriptive),
            (FALLBACK, c.fallback),
            (IMAGE_ORIGINAL, c.image_original),
            (IMAGE_CLEANED, c.image_cleaned),
        ]
        .into_iter()
        .map(|(name, p)| Ok((name.to_string(), p.to_config(name)?)))
        .collect()
    }

    /// Whether `phrase` carries no usable signal.
    pub fn is_degenerate(&self, phrase: &str) -> bool {
        matches_placeholder(phrase, &self.placeholders)
    }

    /// Whether `name` is not a real celebrity name.
    pub fn is_degenerate_name(&self, name: &str) -> bool {
        matches_placeholder(name, &self.placeholders)
            || matches_placeholder(name, &self.name_placeholders)
    }
}

fn matches_placeholder(phrase: &str, placeholders: &[String]) -> bool {
    let phrase = phrase.trim().to_lowercase();
    phrase.is_empty()
        || placeholders
            .iter()
            .any(|p| p.trim().to_lowercase() == phrase)
}

/// The vector collections the channels search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Collections {
    /// Original meme images.
    pub raw_images: Collection,
    /// Meme images with their text painted out.
    pub cleaned_images: Collection,
    /// Faces cropped out of meme images.
    pub extracted_faces: Collection,
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            raw_images: Collection::new("MemeImage", "name"),
            cleaned_images: Collection::new("MemeImageCleaned", "name"),
            extracted_faces: Collection::new("ExtractedFaceEmbeddings", "imageName"),
        }
    }
}

// ============ Outcome ============

/// How one channel fared for one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReport {
    pub name: String,
    pub enabled: bool,
    pub hits: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A fused answer plus the per-channel story behind it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalOutcome {
    pub items: Vec<FusedItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<QueryDecomposition>,
    pub channels: Vec<ChannelReport>,
}

impl RetrievalOutcome {
    pub fn ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }
}

// ============ Retriever ============

/// Handles to every external system a retrieval touches.
#[derive(Clone)]
pub struct Collaborators {
    pub vectors: Arc<dyn VectorIndex>,
    pub captions: Arc<dyn CaptionIndex>,
    pub labels: Arc<dyn LabelLookup>,
    pub faces: Arc<dyn FaceReferenceLookup>,
    pub decomposer: Arc<dyn QueryDecomposer>,
    pub embedder: Arc<dyn Embedder>,
    pub text_remover: Arc<dyn TextRemover>,
}

pub struct Retriever {
    collaborators: Collaborators,
    policy: RetrievalPolicy,
    collections: Collections,
    configs: HashMap<String, ChannelConfig>,
    face_level: ChannelConfig,
}

/// Per-channel raw output before fusion. `None` means suppressed.
type Dispatched = Option<Result<ChannelResult>>;

async fn dispatch<F>(enabled: bool, channel: F) -> Dispatched
where
    F: Future<Output = Result<ChannelResult>>,
{
    if enabled {
        Some(channel.await)
    } else {
        None
    }
}

impl Retriever {
    /// Build a retriever. Fails if the policy does not validate.
    pub fn new(
        collaborators: Collaborators,
        policy: RetrievalPolicy,
        collections: Collections,
    ) -> Result<Self> {
        policy.validate()?;
        let configs = policy.channel_configs()?;
        let face_level = policy.channels.face_reference.to_config("face_reference")?;
        Ok(Self {
            collaborators,
            policy,
            collections,
            configs,
            face_level,
        })
    }

    pub fn policy(&self) -> &RetrievalPolicy {
        &self.policy
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    /// The best `top_k` items for `query`, best first.
    pub async fn retrieve(&self, query: &Query, top_k: usize) -> Vec<ItemId> {
        self.retrieve_detailed(query, top_k).await.ids()
    }

    /// Like [`retrieve`](Self::retrieve) but keeps scores, the decomposition
    /// and a report per channel.
    pub async fn retrieve_detailed(&self, query: &Query, top_k: usize) -> RetrievalOutcome {
        let mut outcome = match query {
            Query::Text(text) => self.retrieve_text(text).await,
            Query::Image(path) => self.retrieve_image(path).await,
        };
        outcome.items.truncate(top_k);
        outcome
    }

    async fn retrieve_text(&self, text: &str) -> RetrievalOutcome {
        let decomposition = match self.collaborators.decomposer.decompose(text).await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "query decomposition failed; using raw query only");
                QueryDecomposition::default()
            }
        };
        debug!(?decomposition, "decomposed query");

        let mut names: Vec<&str> = Vec::new();
        for name in &decomposition.celebrity_names {
            let name = name.trim();
            if !self.policy.is_degenerate_name(name) && !names.contains(&name) {
                names.push(name);
            }
        }
        let caption = decomposition.caption_phrase.trim();
        let descriptive = decomposition.descriptive_phrase.trim();
        let raw = text.trim();

        let (face, caption_hits, descriptive_hits, fallback_hits) = futures::join!(
            dispatch(!names.is_empty(), self.face_channel(&names)),
            dispatch(!self.policy.is_degenerate(caption), self.caption_channel(caption)),
            dispatch(
                !self.policy.is_degenerate(descriptive),
                self.text_channel(descriptive, &self.collections.cleaned_images),
            ),
            dispatch(
                !raw.is_empty(),
                self.text_channel(raw, &self.collections.raw_images)
            ),
        );

        let mut outcome = self.fuse_channels(vec![
            (FACE, face),
            (CAPTION, caption_hits),
            (DESCRIPTIVE, descriptive_hits),
            (FALLBACK, fallback_hits),
        ]);
        outcome.decomposition = Some(decomposition);
        outcome
    }

    async fn retrieve_image(&self, image: &Path) -> RetrievalOutcome {
        let original = self.image_channel(image, &self.collections.raw_images);
        let cleaned = async {
            let cleaned = self
                .collaborators
                .text_remover
                .remove_text(image)
                .await
                .context("text removal failed")?;
            self.image_channel(&cleaned, &self.collections.cleaned_images)
                .await
        };
        let (original, cleaned) = futures::join!(original, cleaned);

        self.fuse_channels(vec![
            (IMAGE_ORIGINAL, Some(original)),
            (IMAGE_CLEANED, Some(cleaned)),
        ])
    }

    fn fuse_channels(&self, dispatched: Vec<(&str, Dispatched)>) -> RetrievalOutcome {
        let mut results = HashMap::new();
        let mut configs = HashMap::new();
        let mut channels = Vec::with_capacity(dispatched.len());

        for (name, outcome) in dispatched {
            let mut report = ChannelReport {
                name: name.to_string(),
                enabled: outcome.is_some(),
                hits: 0,
                error: None,
            };
            let hits = match outcome {
                None => {
                    debug!(channel = name, "channel suppressed");
                    Vec::new()
                }
                Some(Ok(hits)) => hits,
                Some(Err(e)) => {
                    let message = format!("{:#}", e);
                    warn!(channel = name, error = %message, "channel failed; treating as empty");
                    report.error = Some(message);
                    Vec::new()
                }
            };
            report.hits = hits.len();
            debug!(channel = name, hits = report.hits, "channel finished");

            if let Some(config) = self.configs.get(name) {
                configs.insert(name.to_string(), config.clone().with_enabled(report.enabled));
            }
            results.insert(name.to_string(), hits);
            channels.push(report);
        }

        RetrievalOutcome {
            items: fuse(&results, &configs),
            decomposition: None,
            channels,
        }
    }

    // ============ Channels ============

    /// Nested fusion: references of one celebrity, then celebrities.
    async fn face_channel(&self, names: &[&str]) -> Result<ChannelResult> {
        let per_celebrity = join_all(names.iter().map(|name| self.celebrity_matches(name))).await;

        let mut results = HashMap::new();
        let mut first_error = None;
        for (i, (name, matches)) in names.iter().zip(per_celebrity).enumerate() {
            match matches {
                Ok(matches) => {
                    results.insert(format!("{:04}", i), matches);
                }
                Err(e) => {
                    warn!(celebrity = %name, error = %format!("{:#}", e), "face lookup failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if results.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(self.fuse_level(&results))
    }

    async fn celebrity_matches(&self, name: &str) -> Result<ChannelResult> {
        let references = self
            .collaborators
            .faces
            .references_by_name(name)
            .await
            .with_context(|| format!("reference faces for '{}'", name))?;
        debug!(celebrity = %name, references = references.len(), "reference faces");

        let searches = join_all(references.iter().map(|reference| {
            self.collaborators.vectors.within_threshold(
                &self.collections.extracted_faces,
                &reference.vector,
                self.policy.face_max_distance,
            )
        }))
        .await;

        let mut results = HashMap::new();
        for (i, (reference, search)) in references.iter().zip(searches).enumerate() {
            match search {
                Ok(mut matches) => {
                    matches.truncate(self.policy.face_match_cap);
                    results.insert(format!("{:04}", i), matches);
                }
                Err(e) => warn!(
                    reference = %reference.source_path,
                    error = %format!("{:#}", e),
                    "face similarity search failed"
                ),
            }
        }
        Ok(self.fuse_level(&results))
    }

    fn fuse_level(&self, results: &HashMap<String, ChannelResult>) -> ChannelResult {
        let configs: HashMap<String, ChannelConfig> = results
            .keys()
            .map(|key| (key.clone(), self.face_level.clone()))
            .collect();
        fuse(results, &configs)
            .into_iter()
            .map(|item| item.id)
            .collect()
    }

    async fn caption_channel(&self, phrase: &str) -> Result<ChannelResult> {
        let hits = self
            .collaborators
            .captions
            .fuzzy_search(phrase, self.policy.caption_min_score)
            .await
            .context("caption search failed")?;

        let lookups = join_all(
            hits.iter()
                .map(|hit| self.collaborators.labels.image_for_ref(hit.ref_id)),
        )
        .await;

        let mut items = Vec::with_capacity(hits.len());
        for (hit, lookup) in hits.iter().zip(lookups) {
            match lookup.context("label lookup failed")? {
                Some(item) => items.push(item),
                None => debug!(ref_id = hit.ref_id, "caption hit has no label; dropped"),
            }
        }
        Ok(items)
    }

    async fn text_channel(&self, phrase: &str, collection: &Collection) -> Result<ChannelResult> {
        let vector = self
            .collaborators
            .embedder
            .embed_text(phrase)
            .await
            .context("text embedding failed")?;
        self.collaborators
            .vectors
            .nearest_neighbors(collection, &vector, self.policy.neighbor_limit)
            .await
            .with_context(|| format!("vector search in {}", collection.name))
    }

    async fn image_channel(&self, image: &Path, collection: &Collection) -> Result<ChannelResult> {
        let vector = self
            .collaborators
            .embedder
            .embed_image(image)
            .await
            .context("image embedding failed")?;
        self.collaborators
            .vectors
            .nearest_neighbors(collection, &vector, self.policy.neighbor_limit)
            .await
            .with_context(|| format!("vector search in {}", collection.name))
    }
}
