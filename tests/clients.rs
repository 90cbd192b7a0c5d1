//! HTTP collaborator clients against in-process fake services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use meme_search::config::{
    DbConfig, ElasticConfig, IngestJob, LabelsConfig, ModelServerConfig, SourceFormat,
    WeaviateConfig,
};
use meme_search::elastic::ElasticCaptions;
use meme_search::ingest::run_job;
use meme_search::label_import::{import_labels, parse_labels, CaptionOutcome};
use meme_search::labels::LabelCatalog;
use meme_search::migrate;
use meme_search::model_server::ModelServerClient;
use meme_search::weaviate::WeaviateClient;
use meme_search_core::models::{deterministic_id, Collection, VectorObject};
use meme_search_core::store::{
    CaptionIndex, Embedder, FaceReferenceLookup, InsertOutcome, QueryDecomposer, VectorIndex,
};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ============ Fake Weaviate ============

#[derive(Default)]
struct FakeWeaviate {
    objects: Mutex<Vec<Value>>,
    queries: Mutex<Vec<String>>,
}

/// `{ Get { MemeImage(...` / `{ Aggregate { MemeImage {` → `MemeImage`.
fn class_of(query: &str) -> String {
    let token = query.split_whitespace().nth(3).unwrap_or_default();
    token.split('(').next().unwrap_or_default().to_string()
}

async fn weaviate_graphql(
    State(state): State<Arc<FakeWeaviate>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let query = body["query"].as_str().unwrap_or_default().to_string();
    state.queries.lock().unwrap().push(query.clone());
    let class = class_of(&query);
    let objects = state.objects.lock().unwrap();
    let matching: Vec<&Value> = objects.iter().filter(|o| o["class"] == class).collect();

    if query.starts_with("{ Aggregate") {
        let mut by_class = Map::new();
        by_class.insert(class, json!([{ "meta": { "count": matching.len() } }]));
        return Json(json!({ "data": { "Aggregate": by_class } }));
    }
    if class == "Broken" {
        return Json(json!({ "errors": [{ "message": "class Broken not found" }] }));
    }

    let rows: Vec<Value> = matching
        .iter()
        .map(|o| {
            let mut row = o["properties"].clone();
            row["_additional"] = json!({ "vector": o["vector"] });
            row
        })
        .collect();
    let mut by_class = Map::new();
    by_class.insert(class, Value::Array(rows));
    Json(json!({ "data": { "Get": by_class } }))
}

async fn weaviate_objects(
    State(state): State<Arc<FakeWeaviate>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let mut objects = state.objects.lock().unwrap();
    if objects.iter().any(|o| o["id"] == body["id"]) {
        let message = format!("id '{}' already exists", body["id"].as_str().unwrap_or(""));
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": [{ "message": message }] })),
        );
    }
    objects.push(body.clone());
    (StatusCode::OK, Json(body))
}

async fn fake_weaviate() -> (Arc<FakeWeaviate>, WeaviateClient) {
    let state = Arc::new(FakeWeaviate::default());
    let app = Router::new()
        .route("/v1/graphql", post(weaviate_graphql))
        .route("/v1/objects", post(weaviate_objects))
        .with_state(state.clone());
    let url = serve(app).await;
    let config = WeaviateConfig {
        url,
        ..Default::default()
    };
    let client = WeaviateClient::new(
        &config,
        100,
        Collection::new("CelebFaceEmbeddings", "name"),
    )
    .unwrap();
    (state, client)
}

fn object(key: &str, vector: Vec<f32>, attributes: &[(&str, &str)]) -> VectorObject {
    VectorObject {
        id: deterministic_id(key),
        vector,
        attributes: attributes
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
    }
}

#[tokio::test]
async fn test_weaviate_insert_then_duplicate() {
    let (_state, client) = fake_weaviate().await;
    let obj = object("image_1.jpg.npy", vec![0.1, 0.2], &[("name", "image_1.jpg")]);

    assert_eq!(client.count("MemeImage").await.unwrap(), 0);
    assert_eq!(
        client.insert("MemeImage", &obj).await.unwrap(),
        InsertOutcome::Created
    );
    assert_eq!(
        client.insert("MemeImage", &obj).await.unwrap(),
        InsertOutcome::Duplicate
    );
    assert_eq!(client.count("MemeImage").await.unwrap(), 1);
}

#[tokio::test]
async fn test_weaviate_search_returns_item_field() {
    let (state, client) = fake_weaviate().await;
    for (key, name) in [("a.npy", "image_a.jpg"), ("b.npy", "image_b.jpg")] {
        client
            .insert("MemeImage", &object(key, vec![1.0, 0.0], &[("name", name)]))
            .await
            .unwrap();
    }

    let collection = Collection::new("MemeImage", "name");
    let hits = client
        .nearest_neighbors(&collection, &[1.0, 0.0], 3)
        .await
        .unwrap();
    assert_eq!(hits, vec!["image_a.jpg", "image_b.jpg"]);

    let query = state.queries.lock().unwrap().last().cloned().unwrap();
    assert!(query.contains("nearVector: {vector: [1, 0]}"), "{}", query);
    assert!(query.contains("limit: 3"), "{}", query);

    client
        .within_threshold(&collection, &[1.0, 0.0], 0.16)
        .await
        .unwrap();
    let query = state.queries.lock().unwrap().last().cloned().unwrap();
    assert!(query.contains("distance: 0.1599999964237213") || query.contains("distance: 0.16"));
    assert!(query.contains("limit: 100"), "{}", query);
}

#[tokio::test]
async fn test_weaviate_rejects_bad_identifiers_and_invalid_vectors() {
    let (state, client) = fake_weaviate().await;

    let bad = Collection::new("memeImage", "name");
    assert!(client.nearest_neighbors(&bad, &[1.0], 3).await.is_err());

    let good = Collection::new("MemeImage", "name");
    assert!(client.nearest_neighbors(&good, &[], 3).await.is_err());
    assert!(client
        .nearest_neighbors(&good, &[1.0, f32::NAN], 3)
        .await
        .is_err());
    assert!(client
        .within_threshold(&good, &[f32::INFINITY], 0.16)
        .await
        .is_err());
    assert!(state.queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_weaviate_graphql_errors_surface() {
    let (_state, client) = fake_weaviate().await;
    let err = client
        .nearest_neighbors(&Collection::new("Broken", "name"), &[1.0], 3)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("class Broken not found"));
}

#[tokio::test]
async fn test_weaviate_reference_faces() {
    let (state, client) = fake_weaviate().await;
    client
        .insert(
            "CelebFaceEmbeddings",
            &object(
                "faces/ned/1.jpg",
                vec![0.5, 0.5],
                &[("name", "Ned Stark"), ("filePath", "faces/ned/1.jpg")],
            ),
        )
        .await
        .unwrap();

    let refs = client.references_by_name("Ned Stark").await.unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].name, "Ned Stark");
    assert_eq!(refs[0].source_path, "faces/ned/1.jpg");
    assert_eq!(refs[0].vector, vec![0.5, 0.5]);

    let query = state.queries.lock().unwrap().last().cloned().unwrap();
    assert!(query.contains(r#"valueText: "Ned Stark""#), "{}", query);
    assert!(query.contains("_additional { vector }"), "{}", query);
}

#[tokio::test]
async fn test_ingest_job_against_weaviate_is_idempotent() {
    let (state, client) = fake_weaviate().await;
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("faces.jsonl");
    std::fs::write(
        &path,
        concat!(
            "{\"key\": \"faces/1.jpg\", \"vector\": [1.0, 0.0], \"attributes\": {\"imageName\": \"meme_1.jpg\"}}\n",
            "{\"key\": \"faces/2.jpg\", \"vector\": [0.0, 1.0], \"attributes\": {\"imageName\": \"meme_2.jpg\"}}\n",
        ),
    )
    .unwrap();
    let job = IngestJob {
        collection: "ExtractedFaceEmbeddings".into(),
        format: SourceFormat::Jsonl,
        path,
        item_field: "imageName".into(),
    };

    let first = run_job(&client, &job).await.unwrap();
    assert_eq!((first.imported, first.skipped, first.failed), (2, 0, 0));

    let second = run_job(&client, &job).await.unwrap();
    assert!(second.already_populated);
    assert_eq!(second.imported, 0);
    assert_eq!(state.objects.lock().unwrap().len(), 2);

    let stored = state.objects.lock().unwrap()[0].clone();
    assert_eq!(
        stored["id"],
        json!(deterministic_id("faces/1.jpg").to_string())
    );
}

// ============ Fake model server ============

#[derive(Default)]
struct FakeModelServer {
    calls: AtomicUsize,
    failures_before_success: usize,
}

async fn model_embed_text(
    State(state): State<Arc<FakeModelServer>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let call = state.calls.fetch_add(1, Ordering::SeqCst);
    if call < state.failures_before_success {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": "warming up" })),
        );
    }
    let n = body["text"].as_str().unwrap_or_default().len() as f32;
    (StatusCode::OK, Json(json!({ "embedding": [n, 1.0] })))
}

async fn model_embed_image(Json(_body): Json<Value>) -> impl IntoResponse {
    (StatusCode::BAD_REQUEST, "image not found")
}

async fn model_analyze(Json(_body): Json<Value>) -> Json<Value> {
    Json(json!({
        "raw_response": "```json\n{\"text\": \"a man\", \"caption\": \"winter is coming\", \"celebrities\": \"Ned Stark, unknown\"}\n```",
        "error": "Failed to parse JSON"
    }))
}

async fn fake_model_server(
    failures_before_success: usize,
    max_retries: u32,
) -> (Arc<FakeModelServer>, ModelServerClient) {
    let state = Arc::new(FakeModelServer {
        calls: AtomicUsize::new(0),
        failures_before_success,
    });
    let app = Router::new()
        .route("/embed_text", post(model_embed_text))
        .route("/embed_image", post(model_embed_image))
        .route("/analyze", post(model_analyze))
        .with_state(state.clone());
    let url = serve(app).await;
    let client = ModelServerClient::new(&ModelServerConfig {
        url,
        max_retries,
        timeout_secs: 5,
    })
    .unwrap()
    .with_backoff_unit(Duration::from_millis(1));
    (state, client)
}

#[tokio::test]
async fn test_model_server_retries_unavailable() {
    let (state, client) = fake_model_server(2, 3).await;
    let vector = client.embed_text("abc").await.unwrap();
    assert_eq!(vector, vec![3.0, 1.0]);
    assert_eq!(state.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_model_server_gives_up_after_max_retries() {
    let (state, client) = fake_model_server(5, 1).await;
    let err = client.embed_text("abc").await.unwrap_err();
    assert!(format!("{:#}", err).contains("503"), "{:#}", err);
    assert_eq!(state.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_model_server_client_errors_are_not_retried() {
    let (_state, client) = fake_model_server(0, 3).await;
    let err = client
        .embed_image(std::path::Path::new("/nope.jpg"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("400"), "{}", err);
}

#[tokio::test]
async fn test_model_server_decomposition_unwraps_raw_response() {
    let (_state, client) = fake_model_server(0, 0).await;
    let d = client.decompose("ned stark winter is coming").await.unwrap();
    assert_eq!(d.descriptive_phrase, "a man");
    assert_eq!(d.caption_phrase, "winter is coming");
    assert_eq!(d.celebrity_names, vec!["Ned Stark", "unknown"]);
}

// ============ Fake Elasticsearch ============

#[derive(Default)]
struct FakeElastic {
    requests: Mutex<Vec<(Option<String>, Value)>>,
}

async fn elastic_search(
    State(state): State<Arc<FakeElastic>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.requests.lock().unwrap().push((auth, body));
    Json(json!({
        "hits": { "hits": [
            { "_score": 9.5, "_source": { "number": 12, "text_corrected": "winter is coming" } },
            { "_score": 7.0, "_source": { "number": "40", "text_corrected": "winter came" } },
            { "_score": 6.0, "_source": { "text_corrected": "no number" } }
        ] }
    }))
}

#[tokio::test]
async fn test_elastic_fuzzy_search() {
    let state = Arc::new(FakeElastic::default());
    let app = Router::new()
        .route("/memes/_search", post(elastic_search))
        .with_state(state.clone());
    let url = serve(app).await;

    let captions = ElasticCaptions::new(&ElasticConfig {
        url,
        username: Some("elastic".into()),
        password: Some("changeme".into()),
        ..Default::default()
    })
    .unwrap();

    let hits = captions.fuzzy_search("winter is coming", 5.0).await.unwrap();
    let ids: Vec<i64> = hits.iter().map(|h| h.ref_id).collect();
    assert_eq!(ids, vec![12, 40]);
    assert_eq!(hits[0].text, "winter is coming");

    let requests = state.requests.lock().unwrap();
    let (auth, body) = &requests[0];
    assert!(auth.as_deref().unwrap_or_default().starts_with("Basic "));
    assert_eq!(body["min_score"], 5.0);
}

#[derive(Default)]
struct FakeCaptionStore {
    docs: Mutex<Vec<(String, Value)>>,
}

async fn elastic_count(State(state): State<Arc<FakeCaptionStore>>) -> impl IntoResponse {
    let docs = state.docs.lock().unwrap();
    if docs.is_empty() {
        // Index not created yet.
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "index_not_found_exception" })));
    }
    (StatusCode::OK, Json(json!({ "count": docs.len() })))
}

async fn elastic_put_doc(
    State(state): State<Arc<FakeCaptionStore>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.docs.lock().unwrap().push((id, body));
    (StatusCode::CREATED, Json(json!({ "result": "created" })))
}

#[tokio::test]
async fn test_label_import_indexes_captions_once() {
    let state = Arc::new(FakeCaptionStore::default());
    let app = Router::new()
        .route("/memes/_count", get(elastic_count))
        .route("/memes/_doc/{id}", put(elastic_put_doc))
        .with_state(state.clone());
    let url = serve(app).await;
    let captions = ElasticCaptions::new(&ElasticConfig {
        url,
        ..Default::default()
    })
    .unwrap();

    let tmp = TempDir::new().unwrap();
    let db = DbConfig {
        path: tmp.path().join("labels.sqlite"),
    };
    migrate::run_migrations(&db).await.unwrap();
    let catalog = LabelCatalog::open(&db).await.unwrap();
    let csv = "number,image_name,text_ocr,text_corrected,overall_sentiment\n\
               1,image_1.jpg,A,winter is coming,neutral\n\
               2,image_2.jpg,,,positive\n";

    let rows = parse_labels(csv.as_bytes(), &LabelsConfig::default()).unwrap();
    let summary = import_labels(&catalog, Some(&captions), rows).await.unwrap();
    assert_eq!(summary.imported, 2);
    assert_eq!(
        summary.captions,
        CaptionOutcome::Indexed {
            indexed: 1,
            failed: 0
        }
    );
    {
        let docs = state.docs.lock().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].0, "1");
        assert_eq!(docs[0].1, json!({ "number": 1, "text_corrected": "winter is coming" }));
    }

    // Second run refreshes labels but leaves the populated index alone.
    let rows = parse_labels(csv.as_bytes(), &LabelsConfig::default()).unwrap();
    let summary = import_labels(&catalog, Some(&captions), rows).await.unwrap();
    assert_eq!(summary.captions, CaptionOutcome::AlreadyIndexed);
    assert_eq!(state.docs.lock().unwrap().len(), 1);
    assert_eq!(catalog.count().await.unwrap(), 2);
}
