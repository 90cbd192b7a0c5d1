//! TOML configuration for the `memes` binary.
//!
//! Every section except `[db]` is optional and falls back to defaults that
//! match a local docker-compose deployment (Weaviate on 8080,
//! Elasticsearch on 9200, model server on 8000).
//!
//! ```toml
//! [db]
//! path = "./data/labels.sqlite"
//!
//! [retrieval]
//! final_limit = 10
//! face_max_distance = 0.16
//!
//! # `weight` and `k` each fall back to the channel's built-in value.
//! [retrieval.channels.caption]
//! weight = 0.3
//! k = 30
//!
//! [[ingest]]
//! collection = "MemeImage"
//! format = "npy_dir"
//! path = "./data/embeddings/memes"
//! ```

use anyhow::{bail, Context, Result};
use meme_search_core::models::Collection;
use meme_search_core::retrieve::{Collections, RetrievalPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub weaviate: WeaviateConfig,
    #[serde(default)]
    pub elasticsearch: ElasticConfig,
    #[serde(default)]
    pub model_server: ModelServerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub collections: CollectionsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub labels: LabelsConfig,
    #[serde(default)]
    pub ingest: Vec<IngestJob>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// SQLite label catalog.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WeaviateConfig {
    #[serde(default = "default_weaviate_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WeaviateConfig {
    fn default() -> Self {
        Self {
            url: default_weaviate_url(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_weaviate_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ElasticConfig {
    #[serde(default = "default_elastic_url")]
    pub url: String,
    #[serde(default = "default_caption_index")]
    pub index: String,
    /// Field holding the caption text.
    #[serde(default = "default_text_field")]
    pub text_field: String,
    /// Field holding the label number the hit resolves through.
    #[serde(default = "default_ref_field")]
    pub ref_field: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: default_elastic_url(),
            index: default_caption_index(),
            text_field: default_text_field(),
            ref_field: default_ref_field(),
            username: None,
            password: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_elastic_url() -> String {
    "http://localhost:9200".to_string()
}
fn default_caption_index() -> String {
    "memes".to_string()
}
fn default_text_field() -> String {
    "text_corrected".to_string()
}
fn default_ref_field() -> String {
    "number".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelServerConfig {
    #[serde(default = "default_model_server_url")]
    pub url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Query analysis and inpainting are slow; keep this generous.
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelServerConfig {
    fn default() -> Self {
        Self {
            url: default_model_server_url(),
            max_retries: default_max_retries(),
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

fn default_model_server_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_model_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Default result count when a request does not name one.
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(flatten)]
    pub policy: RetrievalPolicy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_limit: default_final_limit(),
            policy: RetrievalPolicy::default(),
        }
    }
}

fn default_final_limit() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionsConfig {
    #[serde(flatten)]
    pub search: Collections,
    /// Reference faces, looked up by celebrity name.
    #[serde(default = "default_celebrity_faces")]
    pub celebrity_faces: Collection,
}

impl Default for CollectionsConfig {
    fn default() -> Self {
        Self {
            search: Collections::default(),
            celebrity_faces: default_celebrity_faces(),
        }
    }
}

fn default_celebrity_faces() -> Collection {
    Collection::new("CelebFaceEmbeddings", "name")
}

impl CollectionsConfig {
    /// Every configured collection, for `stats`.
    pub fn all(&self) -> Vec<&Collection> {
        vec![
            &self.search.raw_images,
            &self.search.cleaned_images,
            &self.search.extracted_faces,
            &self.celebrity_faces,
        ]
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Where uploaded query images are written before embedding.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            upload_dir: default_upload_dir(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7070".to_string()
}
fn default_upload_dir() -> PathBuf {
    PathBuf::from("./data/uploads")
}

/// How `memes import-labels` derives catalog fields from a labels CSV.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LabelsConfig {
    /// Directory of the original images; `image_path` is `<images_dir>/<file>`.
    #[serde(default)]
    pub images_dir: Option<PathBuf>,
    /// Directory of the text-removed images.
    #[serde(default)]
    pub cleaned_dir: Option<PathBuf>,
    /// Store `image_1` rather than `image_1.jpg` as the image name.
    #[serde(default)]
    pub strip_extension: bool,
}

/// Input layout of an ingestion job.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// Directory tree of `.npy` files, one vector per file.
    NpyDir,
    /// One `{"key", "vector", "attributes"}` object per line.
    Jsonl,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestJob {
    pub collection: String,
    pub format: SourceFormat,
    pub path: PathBuf,
    /// Attribute the file name is stored under (`npy_dir` only).
    #[serde(default = "default_item_field")]
    pub item_field: String,
}

fn default_item_field() -> String {
    "name".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.retrieval.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    config
        .retrieval
        .policy
        .validate()
        .context("Invalid [retrieval] section")?;

    for (name, url) in [
        ("weaviate.url", &config.weaviate.url),
        ("elasticsearch.url", &config.elasticsearch.url),
        ("model_server.url", &config.model_server.url),
    ] {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("{} must be an http(s) URL, got '{}'", name, url);
        }
    }

    for job in &config.ingest {
        if job.collection.trim().is_empty() {
            bail!("ingest.collection must not be empty");
        }
        if job.item_field.trim().is_empty() {
            bail!(
                "ingest.item_field must not be empty (collection '{}')",
                job.collection
            );
        }
    }

    Ok(config)
}
