//! HTTP client for the model server.
//!
//! The model server is a long-running process that keeps the language model
//! and the CLIP embedder loaded. It exposes:
//!
//! | Endpoint | Request | Response |
//! |----------|---------|----------|
//! | `POST /analyze` | `{"query"}` | decomposition JSON (possibly fenced, or `{"raw_response", "error"}`) |
//! | `POST /embed_text` | `{"text"}` | `{"embedding": [f32]}` |
//! | `POST /embed_image` | `{"image_path"}` | `{"embedding": [f32]}` |
//! | `POST /remove_text` | `{"input_path", "output_path"}` | `{"output_path"}` |
//!
//! [`ModelServerClient`] implements [`QueryDecomposer`], [`Embedder`] and
//! [`TextRemover`].
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use meme_search_core::models::QueryDecomposition;
use meme_search_core::store::{Embedder, QueryDecomposer, TextRemover};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::ModelServerConfig;

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    query: &'a str,
}

#[derive(Serialize)]
struct EmbedTextRequest<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct EmbedImageRequest<'a> {
    image_path: &'a str,
}

#[derive(Serialize)]
struct RemoveTextRequest<'a> {
    input_path: &'a str,
    output_path: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct RemoveTextResponse {
    #[serde(default)]
    output_path: Option<String>,
}

pub struct ModelServerClient {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
    backoff_unit: Duration,
}

impl ModelServerClient {
    pub fn new(config: &ModelServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            backoff_unit: Duration::from_secs(1),
        })
    }

    /// Replace the backoff unit (1s by default).
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    async fn post<B, T>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff_unit * (1u32 << (attempt - 1).min(5));
                debug!(endpoint, attempt, ?delay, "retrying model server call");
                tokio::time::sleep(delay).await;
            }

            match self.client.post(&url).json(body).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .with_context(|| format!("Invalid response from {}", endpoint));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow!("Model server {} error {}: {}", endpoint, status, body_text));
                        continue;
                    }

                    bail!("Model server {} error {}: {}", endpoint, status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::Error::from(e).context(format!("POST {}", url)));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Model server call failed after retries")))
    }

    async fn embedding<B: Serialize>(&self, endpoint: &str, body: &B) -> Result<Vec<f32>> {
        let response: EmbeddingResponse = self.post(endpoint, body).await?;
        if response.embedding.is_empty() {
            bail!("Model server {} returned an empty embedding", endpoint);
        }
        Ok(response.embedding)
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))
}

/// `<dir>/<stem>_cleaned.<ext>` next to the input image.
pub fn cleaned_path(image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let name = match image.extension() {
        Some(ext) => format!("{}_cleaned.{}", stem, ext.to_string_lossy()),
        None => format!("{}_cleaned", stem),
    };
    image.with_file_name(name)
}

/// Pull a JSON object out of free-form model output.
///
/// Accepts a ```` ```json ```` fenced block, a bare ```` ``` ```` fenced
/// block, or the outermost `{ ... }` span.
pub fn extract_json(text: &str) -> Option<Value> {
    let fenced = text
        .split_once("```json")
        .or_else(|| text.split_once("```"))
        .and_then(|(_, rest)| rest.split_once("```"))
        .map(|(inner, _)| inner.trim());
    if let Some(inner) = fenced {
        if let Ok(value) = serde_json::from_str(inner) {
            return Some(value);
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Interpret a `/analyze` response body.
pub fn parse_analysis(body: &Value) -> QueryDecomposition {
    let recovered = match body {
        Value::String(text) => extract_json(text),
        Value::Object(obj) => match obj.get("raw_response").and_then(Value::as_str) {
            Some(raw) => extract_json(raw),
            None => Some(body.clone()),
        },
        _ => None,
    };
    recovered
        .map(|v| QueryDecomposition::from_json(&v))
        .unwrap_or_default()
}

#[async_trait]
impl QueryDecomposer for ModelServerClient {
    async fn decompose(&self, query: &str) -> Result<QueryDecomposition> {
        let body: Value = self.post("/analyze", &AnalyzeRequest { query }).await?;
        Ok(parse_analysis(&body))
    }
}

#[async_trait]
impl Embedder for ModelServerClient {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            bail!("cannot embed empty text");
        }
        self.embedding("/embed_text", &EmbedTextRequest { text })
            .await
    }

    async fn embed_image(&self, image: &Path) -> Result<Vec<f32>> {
        let image_path = path_str(image)?;
        self.embedding("/embed_image", &EmbedImageRequest { image_path })
            .await
    }
}

#[async_trait]
impl TextRemover for ModelServerClient {
    async fn remove_text(&self, image: &Path) -> Result<PathBuf> {
        let output = cleaned_path(image);
        let response: RemoveTextResponse = self
            .post(
                "/remove_text",
                &RemoveTextRequest {
                    input_path: path_str(image)?,
                    output_path: path_str(&output)?,
                },
            )
            .await?;
        Ok(response.output_path.map(PathBuf::from).unwrap_or(output))
    }
}
