//! Elasticsearch caption index client.
//!
//! Runs a fuzzy `match` query against the configured caption field and
//! returns the label numbers of the hits, best first. The label catalog
//! turns those numbers into image names.
//!
//! `memes import-labels` also writes captions through this client, one
//! document per label number.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use meme_search_core::models::CaptionHit;
use meme_search_core::store::CaptionIndex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::ElasticConfig;

/// Maximum number of caption hits requested per query.
const MAX_HITS: usize = 50;

#[derive(Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_score", default)]
    score: Option<f64>,
    #[serde(rename = "_source", default)]
    source: Value,
}

pub struct ElasticCaptions {
    client: reqwest::Client,
    index_url: String,
    text_field: String,
    ref_field: String,
    credentials: Option<(String, Option<String>)>,
}

impl ElasticCaptions {
    pub fn new(config: &ElasticConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            index_url: format!("{}/{}", config.url.trim_end_matches('/'), config.index),
            text_field: config.text_field.clone(),
            ref_field: config.ref_field.clone(),
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
        })
    }

    /// The `_search` body for `text`.
    pub fn query_body(&self, text: &str, min_score: f32) -> Value {
        let mut field = Map::new();
        field.insert(
            self.text_field.clone(),
            json!({ "query": text, "fuzziness": "AUTO" }),
        );
        json!({
            "size": MAX_HITS,
            "min_score": min_score,
            "_source": [self.ref_field, self.text_field],
            "query": { "match": Value::Object(field) }
        })
    }

    /// The document stored for one caption.
    pub fn caption_document(&self, number: i64, text: &str) -> Value {
        let mut doc = Map::new();
        doc.insert(self.ref_field.clone(), json!(number));
        doc.insert(self.text_field.clone(), json!(text));
        Value::Object(doc)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, password.as_ref()),
            None => request,
        }
    }

    /// Number of captions in the index. A missing index counts as empty.
    pub async fn count(&self) -> Result<u64> {
        let response = self
            .authed(self.client.get(format!("{}/_count", self.index_url)))
            .send()
            .await
            .context("Elasticsearch request failed")?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Elasticsearch error {}: {}", status, body);
        }
        let parsed: CountResponse = response
            .json()
            .await
            .context("Invalid Elasticsearch count response")?;
        Ok(parsed.count)
    }

    /// Index (or replace) the caption of label `number`.
    pub async fn index_caption(&self, number: i64, text: &str) -> Result<()> {
        let response = self
            .authed(
                self.client
                    .put(format!("{}/_doc/{}", self.index_url, number))
                    .json(&self.caption_document(number, text)),
            )
            .send()
            .await
            .context("Elasticsearch request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Elasticsearch error {}: {}", status, body);
        }
        Ok(())
    }
}

/// Label numbers may be indexed as numbers or as numeric strings.
fn parse_ref_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl CaptionIndex for ElasticCaptions {
    async fn fuzzy_search(&self, text: &str, min_score: f32) -> Result<Vec<CaptionHit>> {
        let response = self
            .authed(
                self.client
                    .post(format!("{}/_search", self.index_url))
                    .json(&self.query_body(text, min_score)),
            )
            .send()
            .await
            .context("Elasticsearch request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Elasticsearch error {}: {}", status, body);
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .context("Invalid Elasticsearch response")?;

        let mut hits = Vec::with_capacity(parsed.hits.hits.len());
        for hit in parsed.hits.hits {
            let Some(ref_id) = hit.source.get(&self.ref_field).and_then(parse_ref_id) else {
                debug!(field = %self.ref_field, "caption hit without label number; skipped");
                continue;
            };
            hits.push(CaptionHit {
                ref_id,
                text: hit
                    .source
                    .get(&self.text_field)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                score: hit.score.unwrap_or_default(),
            });
        }
        Ok(hits)
    }
}
