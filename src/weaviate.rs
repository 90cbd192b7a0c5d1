//! Weaviate vector store client.
//!
//! Talks to Weaviate over REST (`/v1/objects`) and GraphQL (`/v1/graphql`).
//! GraphQL documents are produced by [`GetQuery`] and [`aggregate_count`],
//! which render every value through a typed [`GqlValue`] so user input
//! (celebrity names, vectors) can never break out of its literal. The
//! document itself is sent as a JSON string field built with `serde_json`.
//!
//! [`WeaviateClient`] implements [`VectorIndex`] and
//! [`FaceReferenceLookup`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use meme_search_core::embedding::is_valid_vector;
use meme_search_core::models::{Collection, FaceReference, ItemId, VectorObject};
use meme_search_core::store::{FaceReferenceLookup, InsertOutcome, VectorIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::config::{Config, WeaviateConfig};

/// Property holding the source image path of a reference face.
const FILE_PATH_FIELD: &str = "filePath";

/// Upper bound on reference faces fetched per celebrity.
const REFERENCE_LIMIT: usize = 200;

// ============ GraphQL builder ============

/// A GraphQL input value.
#[derive(Debug, Clone, PartialEq)]
pub enum GqlValue {
    Str(String),
    Int(i64),
    Float(f64),
    /// Bare identifier such as `Equal`.
    Enum(&'static str),
    List(Vec<GqlValue>),
    Object(Vec<(&'static str, GqlValue)>),
}

impl GqlValue {
    pub fn floats(values: &[f32]) -> Self {
        GqlValue::List(values.iter().map(|v| GqlValue::Float(f64::from(*v))).collect())
    }

    fn render(&self, out: &mut String) {
        match self {
            // GraphQL string escapes are a superset of what JSON emits.
            GqlValue::Str(s) => out.push_str(&serde_json::Value::from(s.as_str()).to_string()),
            GqlValue::Int(i) => {
                let _ = write!(out, "{}", i);
            }
            GqlValue::Float(f) => {
                let _ = write!(out, "{}", f);
            }
            GqlValue::Enum(e) => out.push_str(e),
            GqlValue::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.render(out);
                }
                out.push(']');
            }
            GqlValue::Object(fields) => {
                out.push('{');
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(key);
                    out.push_str(": ");
                    value.render(out);
                }
                out.push('}');
            }
        }
    }
}

/// `{ Get { <Class>(<args>) { <fields> _additional { <additional> } } } }`
#[derive(Debug, Clone)]
pub struct GetQuery {
    class: String,
    args: Vec<(&'static str, GqlValue)>,
    fields: Vec<String>,
    additional: Vec<&'static str>,
}

impl GetQuery {
    pub fn new(class: &str) -> Self {
        Self {
            class: class.to_string(),
            args: Vec::new(),
            fields: Vec::new(),
            additional: Vec::new(),
        }
    }

    pub fn near_vector(mut self, vector: &[f32], max_distance: Option<f32>) -> Self {
        let mut near = vec![("vector", GqlValue::floats(vector))];
        if let Some(d) = max_distance {
            near.push(("distance", GqlValue::Float(f64::from(d))));
        }
        self.args.push(("nearVector", GqlValue::Object(near)));
        self
    }

    pub fn where_text_equal(mut self, property: &str, value: &str) -> Self {
        self.args.push((
            "where",
            GqlValue::Object(vec![
                ("path", GqlValue::List(vec![GqlValue::Str(property.to_string())])),
                ("operator", GqlValue::Enum("Equal")),
                ("valueText", GqlValue::Str(value.to_string())),
            ]),
        ));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.args
            .push(("limit", GqlValue::Int(i64::try_from(limit).unwrap_or(i64::MAX))));
        self
    }

    pub fn field(mut self, name: &str) -> Self {
        self.fields.push(name.to_string());
        self
    }

    pub fn additional(mut self, name: &'static str) -> Self {
        self.additional.push(name);
        self
    }

    pub fn build(&self) -> String {
        let mut out = String::from("{ Get { ");
        out.push_str(&self.class);
        if !self.args.is_empty() {
            out.push('(');
            for (i, (key, value)) in self.args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(key);
                out.push_str(": ");
                value.render(&mut out);
            }
            out.push(')');
        }
        out.push_str(" { ");
        for field in &self.fields {
            out.push_str(field);
            out.push(' ');
        }
        if !self.additional.is_empty() {
            out.push_str("_additional { ");
            out.push_str(&self.additional.join(" "));
            out.push_str(" } ");
        }
        out.push_str("} } }");
        out
    }
}

/// `{ Aggregate { <Class> { meta { count } } } }`
pub fn aggregate_count(class: &str) -> String {
    format!("{{ Aggregate {{ {} {{ meta {{ count }} }} }} }}", class)
}

/// Weaviate class names are GraphQL identifiers; anything else is refused
/// rather than spliced into a document.
fn check_class_name(class: &str) -> Result<()> {
    let mut chars = class.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        bail!("invalid Weaviate class name: '{}'", class);
    }
    Ok(())
}

fn check_property_name(property: &str) -> Result<()> {
    let mut chars = property.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        bail!("invalid Weaviate property name: '{}'", property);
    }
    Ok(())
}

// ============ Wire types ============

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Serialize)]
struct CreateObject<'a> {
    class: &'a str,
    id: Uuid,
    vector: &'a [f32],
    properties: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
struct ReferenceRow {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "filePath")]
    file_path: Option<String>,
    #[serde(default, rename = "_additional")]
    additional: Option<AdditionalVector>,
}

#[derive(Deserialize)]
struct AdditionalVector {
    #[serde(default)]
    vector: Vec<f32>,
}

// ============ Client ============

pub struct WeaviateClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    threshold_limit: usize,
    celebrity_faces: Collection,
}

impl WeaviateClient {
    /// `threshold_limit` bounds the size of a [`VectorIndex::within_threshold`]
    /// answer; Weaviate needs an explicit limit to go past its default of 10.
    pub fn new(
        config: &WeaviateConfig,
        threshold_limit: usize,
        celebrity_faces: Collection,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            threshold_limit,
            celebrity_faces,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.weaviate,
            config.retrieval.policy.face_match_cap,
            config.collections.celebrity_faces.clone(),
        )
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Run a GraphQL document and return its `data` member.
    pub async fn graphql(&self, query: &str) -> Result<Value> {
        debug!(query_len = query.len(), "weaviate graphql");
        let response = self
            .request("/v1/graphql")
            .json(&GraphQlRequest { query })
            .send()
            .await
            .context("Weaviate GraphQL request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Weaviate GraphQL error {}: {}", status, body);
        }

        let parsed: GraphQlResponse = response
            .json()
            .await
            .context("Invalid Weaviate GraphQL response")?;
        if let Some(first) = parsed.errors.first() {
            bail!("Weaviate GraphQL error: {}", first.message);
        }
        parsed
            .data
            .ok_or_else(|| anyhow!("Weaviate GraphQL response has no data"))
    }

    async fn get_rows(&self, class: &str, query: &GetQuery) -> Result<Vec<Value>> {
        let data = self.graphql(&query.build()).await?;
        Ok(data
            .get("Get")
            .and_then(|get| get.get(class))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn search(
        &self,
        collection: &Collection,
        vector: &[f32],
        max_distance: Option<f32>,
        limit: usize,
    ) -> Result<Vec<ItemId>> {
        check_class_name(&collection.name)?;
        check_property_name(&collection.item_field)?;
        if !is_valid_vector(vector) {
            bail!(
                "cannot search {} with an empty or non-finite vector",
                collection.name
            );
        }

        let query = GetQuery::new(&collection.name)
            .near_vector(vector, max_distance)
            .limit(limit)
            .field(&collection.item_field);
        let rows = self.get_rows(&collection.name, &query).await?;

        Ok(rows
            .iter()
            .filter_map(|row| row.get(&collection.item_field).and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl VectorIndex for WeaviateClient {
    async fn nearest_neighbors(
        &self,
        collection: &Collection,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ItemId>> {
        self.search(collection, vector, None, limit).await
    }

    async fn within_threshold(
        &self,
        collection: &Collection,
        vector: &[f32],
        max_distance: f32,
    ) -> Result<Vec<ItemId>> {
        self.search(collection, vector, Some(max_distance), self.threshold_limit)
            .await
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        check_class_name(collection)?;
        let data = self.graphql(&aggregate_count(collection)).await?;
        let count = data
            .get("Aggregate")
            .and_then(|agg| agg.get(collection))
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("meta"))
            .and_then(|meta| meta.get("count"))
            .and_then(Value::as_u64);
        // Weaviate answers an unknown or empty class with an empty list.
        Ok(count.unwrap_or(0))
    }

    async fn insert(&self, collection: &str, object: &VectorObject) -> Result<InsertOutcome> {
        let body = CreateObject {
            class: collection,
            id: object.id,
            vector: &object.vector,
            properties: &object.attributes,
        };
        let response = self
            .request("/v1/objects")
            .json(&body)
            .send()
            .await
            .context("Weaviate insert request failed")?;

        let status = response.status();
        if status.is_success() {
            return Ok(InsertOutcome::Created);
        }
        let text = response.text().await.unwrap_or_default();
        if matches!(status.as_u16(), 422 | 500) && text.contains("already exists") {
            return Ok(InsertOutcome::Duplicate);
        }
        bail!("Weaviate insert error {}: {}", status, text)
    }
}

#[async_trait]
impl FaceReferenceLookup for WeaviateClient {
    async fn references_by_name(&self, name: &str) -> Result<Vec<FaceReference>> {
        let class = &self.celebrity_faces.name;
        let name_field = &self.celebrity_faces.item_field;
        check_class_name(class)?;
        check_property_name(name_field)?;

        let query = GetQuery::new(class)
            .where_text_equal(name_field, name)
            .limit(REFERENCE_LIMIT)
            .field(name_field)
            .field(FILE_PATH_FIELD)
            .additional("vector");

        let rows = self.get_rows(class, &query).await?;
        let mut references = Vec::with_capacity(rows.len());
        for row in rows {
            let name_value = row.get(name_field.as_str()).and_then(Value::as_str).map(str::to_string);
            let parsed: ReferenceRow = serde_json::from_value(row)
                .context("Invalid reference face row from Weaviate")?;
            let vector = parsed.additional.map(|a| a.vector).unwrap_or_default();
            if vector.is_empty() {
                debug!(celebrity = %name, "reference face without vector; skipped");
                continue;
            }
            references.push(FaceReference {
                name: name_value.or(parsed.name).unwrap_or_else(|| name.to_string()),
                source_path: parsed.file_path.unwrap_or_default(),
                vector,
            });
        }
        Ok(references)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_near_vector_query() {
        let query = GetQuery::new("MemeImage")
            .near_vector(&[0.5, -1.0], None)
            .limit(20)
            .field("name")
            .build();
        assert_eq!(
            query,
            "{ Get { MemeImage(nearVector: {vector: [0.5, -1]}, limit: 20) { name } } }"
        );
    }

    #[test]
    fn test_threshold_query_with_additional() {
        let query = GetQuery::new("ExtractedFaceEmbeddings")
            .near_vector(&[1.0], Some(0.25))
            .field("imageName")
            .additional("distance")
            .build();
        assert_eq!(
            query,
            "{ Get { ExtractedFaceEmbeddings(nearVector: {vector: [1], distance: 0.25}) \
             { imageName _additional { distance } } } }"
        );
    }

    #[test]
    fn test_where_value_is_escaped() {
        let query = GetQuery::new("CelebFaceEmbeddings")
            .where_text_equal("name", "Bobby \"Tables\"\n}")
            .field("name")
            .build();
        assert!(query.contains(r#"valueText: "Bobby \"Tables\"\n}""#));
        assert!(query.contains(r#"path: ["name"], operator: Equal"#));
    }

    #[test]
    fn test_aggregate_count() {
        assert_eq!(
            aggregate_count("MemeImage"),
            "{ Aggregate { MemeImage { meta { count } } } }"
        );
    }

    #[test]
    fn test_identifier_checks() {
        assert!(check_class_name("MemeImageCleaned").is_ok());
        assert!(check_class_name("memeImage").is_err());
        assert!(check_class_name("Meme Image").is_err());
        assert!(check_class_name("").is_err());
        assert!(check_property_name("imageName").is_ok());
        assert!(check_property_name("image name").is_err());
    }
}
