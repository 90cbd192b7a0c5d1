use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn memes_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("memes");
    path
}

/// Config whose services all point at a closed local port, so nothing in
/// these tests depends on Weaviate, Elasticsearch or the model server.
fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let vectors_dir = root.join("vectors");
    fs::create_dir_all(&vectors_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/labels.sqlite"

[weaviate]
url = "http://127.0.0.1:9"
timeout_secs = 2

[elasticsearch]
url = "http://127.0.0.1:9"

[model_server]
url = "http://127.0.0.1:9"
max_retries = 0

[retrieval]
final_limit = 5

[[ingest]]
collection = "MemeImage"
format = "npy_dir"
path = "{root}/vectors"

[[ingest]]
collection = "CelebFaceEmbeddings"
format = "jsonl"
path = "{root}/celebs.jsonl"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("memes.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_memes(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = memes_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run memes binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_catalog() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_memes(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/labels.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_memes(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_memes(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_memes(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "{}", stderr);
}

#[test]
fn test_invalid_channel_weight_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let mut content = fs::read_to_string(&config_path).unwrap();
    content = content.replace(
        "[retrieval]\nfinal_limit = 5\n",
        "[retrieval]\nfinal_limit = 5\n\n[retrieval.channels.caption]\nweight = -1.0\nk = 30.0\n",
    );
    fs::write(&config_path, content).unwrap();

    let (_, stderr, success) = run_memes(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("retrieval"), "{}", stderr);
}

#[test]
fn test_sources_lists_jobs_with_status() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_memes(&config_path, &["sources"]);
    assert!(success);
    let memes = stdout.lines().find(|l| l.starts_with("MemeImage")).unwrap();
    assert!(memes.contains("npy_dir") && memes.contains("OK"), "{}", memes);
    let celebs = stdout
        .lines()
        .find(|l| l.starts_with("CelebFaceEmbeddings"))
        .unwrap();
    assert!(celebs.contains("MISSING"), "{}", celebs);
}

#[test]
fn test_ingest_unknown_target() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_memes(&config_path, &["ingest", "Nope"]);
    assert!(!success);
    assert!(stderr.contains("No ingest job for 'Nope'"), "{}", stderr);
}

#[test]
fn test_ingest_unreachable_store_is_fatal() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_memes(&config_path, &["ingest", "MemeImage"]);
    assert!(!success, "ingest should fail when the store is down");
    assert!(!stdout.contains("imported:"));
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_memes(&config_path, &["search", "   "]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_search_with_every_service_down_returns_no_results() {
    let (_tmp, config_path) = setup_test_env();

    run_memes(&config_path, &["init"]);
    let (stdout, stderr, success) =
        run_memes(&config_path, &["search", "jon snow", "--explain"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("No results."));
    assert!(stdout.contains("fallback"));
}

#[test]
fn test_search_image_missing_file() {
    let (tmp, config_path) = setup_test_env();

    let missing = tmp.path().join("missing.jpg");
    let (_, stderr, success) =
        run_memes(&config_path, &["search-image", missing.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("image not found"), "{}", stderr);
}

#[test]
fn test_label_missing_image() {
    let (_tmp, config_path) = setup_test_env();

    run_memes(&config_path, &["init"]);
    let (_, stderr, success) = run_memes(&config_path, &["label", "image_1.jpg"]);
    assert!(!success);
    assert!(stderr.contains("no label for image"), "{}", stderr);
}

#[test]
fn test_stats_reports_unreachable_collections() {
    let (_tmp, config_path) = setup_test_env();

    run_memes(&config_path, &["init"]);
    let (stdout, stderr, success) = run_memes(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Labels:      0"));
    assert!(stdout.contains("MemeImage"));
    assert!(stdout.contains("unreachable"));
}

#[test]
fn test_import_labels_fills_catalog() {
    let (tmp, config_path) = setup_test_env();
    let csv = tmp.path().join("labels.csv");
    fs::write(
        &csv,
        "number,image_name,text_ocr,text_corrected,overall_sentiment\n\
         1,image_1.jpg,WINTER IS C0MING,winter is coming,neutral\n\
         oops,image_2.jpg,,,positive\n",
    )
    .unwrap();

    let (stdout, stderr, success) = run_memes(
        &config_path,
        &["import-labels", csv.to_str().unwrap(), "--skip-captions"],
    );
    assert!(success, "import-labels failed: {}", stderr);
    assert!(stdout.contains("imported: 1"), "{}", stdout);
    assert!(stdout.contains("failed: 1"), "{}", stdout);

    let (stdout, _, success) = run_memes(&config_path, &["label", "image_1.jpg"]);
    assert!(success);
    assert!(stdout.contains("winter is coming"));
    assert!(stdout.contains("neutral"));
}

#[test]
fn test_import_labels_unreachable_caption_index_is_fatal() {
    let (tmp, config_path) = setup_test_env();
    let csv = tmp.path().join("labels.csv");
    fs::write(&csv, "number,image_name,text_ocr,text_corrected,overall_sentiment\n").unwrap();

    let (stdout, stderr, success) =
        run_memes(&config_path, &["import-labels", csv.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("caption index"), "{}", stderr);
    assert!(!stdout.contains("imported:"));
}

#[test]
fn test_import_labels_missing_file() {
    let (tmp, config_path) = setup_test_env();
    let missing = tmp.path().join("nope.csv");
    let (_, stderr, success) =
        run_memes(&config_path, &["import-labels", missing.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("Failed to open labels CSV"), "{}", stderr);
}
