//! Core data models shared by retrieval and ingestion.
//!
//! These types represent the items, records, and query pieces that flow
//! through the fusion engine, the query orchestrator and the ingestion
//! worker.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque identifier of a retrievable unit (a meme image name).
pub type ItemId = String;

/// Ordered candidate list produced by one channel, best match first.
pub type ChannelResult = Vec<ItemId>;

/// A vector collection together with the object property that carries the
/// [`ItemId`] of each stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub item_field: String,
}

impl Collection {
    pub fn new(name: impl Into<String>, item_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            item_field: item_field.into(),
        }
    }
}

/// A precomputed vector plus metadata, consumed once by the ingestion worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    /// Stable natural key (file name or file path) the object id derives from.
    #[serde(rename = "key")]
    pub natural_key: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl IngestionRecord {
    /// The store identifier for this record. See [`deterministic_id`].
    pub fn id(&self) -> Uuid {
        deterministic_id(&self.natural_key)
    }
}

/// Derive the store identifier for a natural key.
///
/// UUIDv5 over the key bytes in the DNS namespace. The same key always
/// yields the same id, in any process, so reruns never create a second
/// object for one record.
pub fn deterministic_id(natural_key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, natural_key.as_bytes())
}

/// The object submitted to a vector store on insert.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorObject {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub attributes: HashMap<String, String>,
}

impl From<IngestionRecord> for VectorObject {
    fn from(record: IngestionRecord) -> Self {
        Self {
            id: record.id(),
            vector: record.vector,
            attributes: record.attributes,
        }
    }
}

/// A stored reference embedding of a celebrity's face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceReference {
    pub name: String,
    pub source_path: String,
    pub vector: Vec<f32>,
}

/// One hit from the caption full-text index.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionHit {
    /// External reference id, resolved to an [`ItemId`] via the label catalog.
    pub ref_id: i64,
    pub text: String,
    pub score: f64,
}

/// A retrieval request.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Free-text description of the wanted meme.
    Text(String),
    /// Path of an example image on local disk.
    Image(PathBuf),
}

/// The pieces a free-text query is decomposed into.
///
/// Produced by the [`QueryDecomposer`](crate::store::QueryDecomposer)
/// collaborator. The default value is the "no decomposition" outcome: every
/// phrase empty, no celebrities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryDecomposition {
    /// Generic description of the scene, celebrities replaced by generic nouns.
    pub descriptive_phrase: String,
    /// Text expected to appear written on the meme.
    pub caption_phrase: String,
    /// Recognized person names.
    pub celebrity_names: Vec<String>,
}

impl QueryDecomposition {
    /// Parse a decomposer JSON payload leniently.
    ///
    /// Reads the `text`, `caption` and `celebrities` keys. `celebrities` may
    /// be a list of strings or one comma-separated string. Missing keys and
    /// non-string values are treated as empty. A payload carrying an `error`
    /// key yields the empty decomposition.
    pub fn from_json(value: &Value) -> Self {
        let obj = match value.as_object() {
            Some(obj) if !obj.contains_key("error") => obj,
            _ => return Self::default(),
        };

        let text_field = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        };

        let celebrity_names = match obj.get("celebrities") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect(),
            _ => Vec::new(),
        };

        Self {
            descriptive_phrase: text_field("text"),
            caption_phrase: text_field("caption"),
            celebrity_names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deterministic_id_is_stable() {
        let a = deterministic_id("meme_0042.npy");
        let b = deterministic_id("meme_0042.npy");
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a, deterministic_id("meme_0043.npy"));
    }

    #[test]
    fn test_deterministic_id_matches_uuid5_dns() {
        // uuid5(NAMESPACE_DNS, "python.org")
        assert_eq!(
            deterministic_id("python.org").to_string(),
            "886313e1-3b8a-5372-9b90-0c9aee199e5d"
        );
    }

    #[test]
    fn test_record_into_object_uses_key_id() {
        let record = IngestionRecord {
            natural_key: "cat.npy".into(),
            vector: vec![0.1, 0.2],
            attributes: HashMap::from([("name".to_string(), "cat.npy".to_string())]),
        };
        let expected = deterministic_id("cat.npy");
        let object = VectorObject::from(record);
        assert_eq!(object.id, expected);
        assert_eq!(object.attributes["name"], "cat.npy");
    }

    #[test]
    fn test_decomposition_from_list() {
        let d = QueryDecomposition::from_json(&json!({
            "celebrities": ["Tom Hanks", " Leonardo DiCaprio "],
            "caption": "Actors just want to chill.",
            "text": "two men having coffee"
        }));
        assert_eq!(d.celebrity_names, vec!["Tom Hanks", "Leonardo DiCaprio"]);
        assert_eq!(d.caption_phrase, "Actors just want to chill.");
        assert_eq!(d.descriptive_phrase, "two men having coffee");
    }

    #[test]
    fn test_decomposition_from_comma_string() {
        let d = QueryDecomposition::from_json(&json!({
            "celebrities": "Ned Stark, Catelyn Stark,",
            "text": "a man and a woman smiling"
        }));
        assert_eq!(d.celebrity_names, vec!["Ned Stark", "Catelyn Stark"]);
        assert_eq!(d.caption_phrase, "");
    }

    #[test]
    fn test_decomposition_error_payload_is_empty() {
        let d = QueryDecomposition::from_json(&json!({
            "error": "Failed to parse JSON",
            "text": "ignored"
        }));
        assert_eq!(d, QueryDecomposition::default());
        assert_eq!(
            QueryDecomposition::from_json(&json!("not an object")),
            QueryDecomposition::default()
        );
    }
}
