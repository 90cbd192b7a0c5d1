//! Search wiring for the CLI and the HTTP server.
//!
//! [`SearchService::from_config`] connects the [`Retriever`] to its
//! production collaborators:
//!
//! | Collaborator | Implementation |
//! |--------------|----------------|
//! | vector index, reference faces | [`WeaviateClient`] |
//! | caption index | [`ElasticCaptions`] |
//! | label lookup | [`LabelCatalog`] (SQLite) |
//! | decomposer, embedder, text remover | [`ModelServerClient`] |
//!
//! Fused image names are enriched from the label catalog. A missing label
//! leaves the hit bare rather than dropping it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use meme_search_core::models::{ItemId, Query, QueryDecomposition};
use meme_search_core::retrieve::{ChannelReport, Collaborators, Retriever};
use serde::Serialize;
use tracing::warn;

use crate::config::Config;
use crate::elastic::ElasticCaptions;
use crate::labels::{LabelCatalog, Sentiment};
use crate::model_server::ModelServerClient;
use crate::weaviate::WeaviateClient;

/// One ranked meme as shown to a caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub image_name: ItemId,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<QueryDecomposition>,
    pub channels: Vec<ChannelReport>,
}

pub struct SearchService {
    retriever: Retriever,
    labels: LabelCatalog,
    default_limit: usize,
}

impl SearchService {
    pub fn new(retriever: Retriever, labels: LabelCatalog, default_limit: usize) -> Self {
        Self {
            retriever,
            labels,
            default_limit,
        }
    }

    pub async fn from_config(config: &Config) -> Result<Self> {
        let labels = LabelCatalog::open(&config.db).await?;
        let weaviate = Arc::new(WeaviateClient::from_config(config)?);
        let model_server = Arc::new(ModelServerClient::new(&config.model_server)?);

        let collaborators = Collaborators {
            vectors: weaviate.clone(),
            captions: Arc::new(ElasticCaptions::new(&config.elasticsearch)?),
            labels: Arc::new(labels.clone()),
            faces: weaviate,
            decomposer: model_server.clone(),
            embedder: model_server.clone(),
            text_remover: model_server,
        };
        let retriever = Retriever::new(
            collaborators,
            config.retrieval.policy.clone(),
            config.collections.search.clone(),
        )?;
        Ok(Self::new(retriever, labels, config.retrieval.final_limit))
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    pub fn labels(&self) -> &LabelCatalog {
        &self.labels
    }

    /// Retrieve and enrich. `limit` falls back to `retrieval.final_limit`.
    pub async fn search(&self, query: &Query, limit: Option<usize>) -> SearchResponse {
        let top_k = limit.unwrap_or(self.default_limit);
        let outcome = self.retriever.retrieve_detailed(query, top_k).await;

        let mut results = Vec::with_capacity(outcome.items.len());
        for item in outcome.items {
            let label = match self.labels.record_by_image_name(&item.id).await {
                Ok(label) => label,
                Err(e) => {
                    warn!(image = %item.id, error = %e, "label enrichment failed");
                    None
                }
            };
            results.push(SearchHit {
                image_path: label.as_ref().and_then(|l| l.image_path.clone()),
                sentiment: label.and_then(|l| l.sentiment),
                image_name: item.id,
                score: item.score,
            });
        }

        SearchResponse {
            results,
            decomposition: outcome.decomposition,
            channels: outcome.channels,
        }
    }
}

/// CLI entry point for `memes search <query>`.
pub async fn run_search(
    config: &Config,
    query: &str,
    limit: Option<usize>,
    explain: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    let service = SearchService::from_config(config).await?;
    let response = service
        .search(&Query::Text(query.to_string()), limit)
        .await;
    print_response(&response, explain);
    service.labels().close().await;
    Ok(())
}

/// CLI entry point for `memes search-image <path>`.
pub async fn run_search_image(
    config: &Config,
    path: &Path,
    limit: Option<usize>,
    explain: bool,
) -> Result<()> {
    if !path.is_file() {
        bail!("image not found: {}", path.display());
    }
    let service = SearchService::from_config(config).await?;
    let response = service
        .search(&Query::Image(PathBuf::from(path)), limit)
        .await;
    print_response(&response, explain);
    service.labels().close().await;
    Ok(())
}

fn print_response(response: &SearchResponse, explain: bool) {
    if explain {
        print_explain(response);
    }

    if response.results.is_empty() {
        println!("No results.");
        return;
    }

    for (i, hit) in response.results.iter().enumerate() {
        println!("{}. [{:.4}] {}", i + 1, hit.score, hit.image_name);
        if let Some(ref path) = hit.image_path {
            println!("    path: {}", path);
        }
        if let Some(sentiment) = hit.sentiment {
            println!("    sentiment: {}", sentiment);
        }
    }
}

fn print_explain(response: &SearchResponse) {
    if let Some(ref d) = response.decomposition {
        println!("Decomposition:");
        println!("  descriptive: \"{}\"", d.descriptive_phrase);
        println!("  caption:     \"{}\"", d.caption_phrase);
        println!("  celebrities: [{}]", d.celebrity_names.join(", "));
        println!();
    }

    println!("{:<16} {:<9} {:>5}   ERROR", "CHANNEL", "STATUS", "HITS");
    for channel in &response.channels {
        let status = if channel.enabled { "on" } else { "off" };
        println!(
            "{:<16} {:<9} {:>5}   {}",
            channel.name,
            status,
            channel.hits,
            channel.error.as_deref().unwrap_or("")
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::labels::LabelRecord;
    use crate::migrate;
    use meme_search_core::models::{Collection, FaceReference};
    use meme_search_core::retrieve::{Collections, RetrievalPolicy};
    use meme_search_core::store::memory::{
        FixedDecomposer, InMemoryCaptions, InMemoryFaces, InMemoryLabels, InMemoryVectorIndex,
        RenamingTextRemover, TableEmbedder,
    };
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn service(tmp: &TempDir) -> SearchService {
        let db = DbConfig {
            path: tmp.path().join("labels.sqlite"),
        };
        migrate::run_migrations(&db).await.unwrap();
        let labels = LabelCatalog::open(&db).await.unwrap();
        labels
            .upsert(&LabelRecord {
                number: 1,
                image_name: "meme_1.jpg".into(),
                image_path: Some("images/meme_1.jpg".into()),
                cleaned_image_path: None,
                text_ocr: None,
                text_corrected: Some("one does not simply".into()),
                sentiment: Some(Sentiment::Positive),
            })
            .await
            .unwrap();

        let collections = Collections::default();
        let vectors = InMemoryVectorIndex::new();
        let raw: &Collection = &collections.raw_images;
        vectors.seed(raw, "meme_1.jpg", vec![1.0, 0.0]);
        vectors.seed(raw, "meme_2.jpg", vec![0.9, 0.1]);

        let collaborators = Collaborators {
            vectors: Arc::new(vectors),
            captions: Arc::new(InMemoryCaptions::new(Vec::new())),
            labels: Arc::new(InMemoryLabels::new(HashMap::new())),
            faces: Arc::new(InMemoryFaces::new(Vec::<FaceReference>::new())),
            decomposer: Arc::new(FixedDecomposer::unreachable()),
            embedder: Arc::new(TableEmbedder::new().with_text("boromir", vec![1.0, 0.0])),
            text_remover: Arc::new(RenamingTextRemover),
        };
        let retriever =
            Retriever::new(collaborators, RetrievalPolicy::default(), collections).unwrap();
        SearchService::new(retriever, labels, 5)
    }

    #[tokio::test]
    async fn test_search_enriches_from_labels() {
        let tmp = TempDir::new().unwrap();
        let service = service(&tmp).await;

        let response = service
            .search(&Query::Text("boromir".into()), None)
            .await;

        assert_eq!(response.results.len(), 2);
        let first = &response.results[0];
        assert_eq!(first.image_name, "meme_1.jpg");
        assert_eq!(first.image_path.as_deref(), Some("images/meme_1.jpg"));
        assert_eq!(first.sentiment, Some(Sentiment::Positive));

        let second = &response.results[1];
        assert_eq!(second.image_name, "meme_2.jpg");
        assert!(second.image_path.is_none());
        assert!(first.score > second.score);
    }

    #[tokio::test]
    async fn test_search_limit_and_json_shape() {
        let tmp = TempDir::new().unwrap();
        let service = service(&tmp).await;

        let response = service
            .search(&Query::Text("boromir".into()), Some(1))
            .await;
        assert_eq!(response.results.len(), 1);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["results"][0]["image_name"], "meme_1.jpg");
        assert_eq!(json["results"][0]["sentiment"], "positive");
        assert!(json["channels"].as_array().unwrap().len() >= 1);
    }
}
