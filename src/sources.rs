//! Record sources for ingestion jobs.
//!
//! | Format | Source | Natural key | Attributes |
//! |--------|--------|-------------|------------|
//! | `npy_dir` | [`NpyDirectorySource`] | file name | `{<item_field>: file name without .npy}` |
//! | `jsonl` | [`JsonlSource`] | `key` field | `attributes` field |
//!
//! Both sources check their path when opened (a missing path aborts the
//! job) and then read lazily: one file or one line per stream item. A file
//! or line that cannot be decoded becomes an `Err` item and the stream
//! goes on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use meme_search_core::ingest::RecordSource;
use meme_search_core::models::IngestionRecord;
use tokio::io::{AsyncBufReadExt, BufReader};
use walkdir::WalkDir;

use crate::config::{Config, IngestJob, SourceFormat};
use crate::npy::parse_npy;

/// Every `*.npy` file below `root`, one vector per file.
pub struct NpyDirectorySource {
    root: PathBuf,
    item_field: String,
}

impl NpyDirectorySource {
    pub fn new(root: impl Into<PathBuf>, item_field: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            item_field: item_field.into(),
        }
    }

    fn list_files(&self) -> Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            bail!("npy directory does not exist: {}", self.root.display());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry
                .with_context(|| format!("Failed to walk {}", self.root.display()))?;
            let is_npy = entry
                .path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("npy"));
            if entry.file_type().is_file() && is_npy {
                files.push(entry.into_path());
            }
        }
        // Sort for deterministic ordering
        files.sort();
        Ok(files)
    }
}

async fn read_npy_record(path: PathBuf, item_field: String) -> Result<IngestionRecord> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("no file name: {}", path.display()))?;
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let vector = parse_npy(&bytes).with_context(|| format!("{}", path.display()))?;

    let item = item_name(&file_name).to_string();
    Ok(IngestionRecord {
        natural_key: file_name,
        vector,
        attributes: HashMap::from([(item_field, item)]),
    })
}

/// `image_7.jpg.npy` → `image_7.jpg`.
fn item_name(file_name: &str) -> &str {
    let cut = file_name.len().saturating_sub(4);
    match file_name.get(cut..) {
        Some(ext) if cut > 0 && ext.eq_ignore_ascii_case(".npy") => &file_name[..cut],
        _ => file_name,
    }
}

#[async_trait]
impl RecordSource for NpyDirectorySource {
    fn describe(&self) -> String {
        format!("npy directory {}", self.root.display())
    }

    async fn open(&self) -> Result<BoxStream<'static, Result<IngestionRecord>>> {
        let files = self.list_files()?;
        let item_field = self.item_field.clone();
        Ok(stream::iter(files)
            .then(move |path| read_npy_record(path, item_field.clone()))
            .boxed())
    }
}

/// One JSON object per line:
/// `{"key": "...", "vector": [..], "attributes": {"name": "..."}}`.
pub struct JsonlSource {
    path: PathBuf,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSource for JsonlSource {
    fn describe(&self) -> String {
        format!("jsonl file {}", self.path.display())
    }

    async fn open(&self) -> Result<BoxStream<'static, Result<IngestionRecord>>> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let lines = BufReader::new(file).lines();
        let path = self.path.display().to_string();

        // State is `None` once a read error has been reported.
        let records = stream::unfold(Some((lines, 0usize)), move |state| {
            let path = path.clone();
            async move {
                let (mut lines, mut line_no) = state?;
                loop {
                    line_no += 1;
                    match lines.next_line().await {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => {
                            let record = serde_json::from_str::<IngestionRecord>(&line)
                                .with_context(|| format!("{}:{}: malformed record", path, line_no));
                            return Some((record, Some((lines, line_no))));
                        }
                        Ok(None) => return None,
                        Err(e) => {
                            let err = anyhow::Error::from(e)
                                .context(format!("{}:{}: read failed", path, line_no));
                            return Some((Err(err), None));
                        }
                    }
                }
            }
        });

        Ok(records.boxed())
    }
}

/// Build the record source for one configured job.
pub fn source_for_job(job: &IngestJob) -> Box<dyn RecordSource> {
    match job.format {
        SourceFormat::NpyDir => Box::new(NpyDirectorySource::new(&job.path, &job.item_field)),
        SourceFormat::Jsonl => Box::new(JsonlSource::new(&job.path)),
    }
}

/// CLI entry point for `memes sources`: list configured ingestion jobs.
pub fn list_sources(config: &Config) -> Result<()> {
    if config.ingest.is_empty() {
        println!("No [[ingest]] jobs configured.");
        return Ok(());
    }

    println!("{:<28} {:<8} {:<10} PATH", "COLLECTION", "FORMAT", "STATUS");
    for job in &config.ingest {
        let format = match job.format {
            SourceFormat::NpyDir => "npy_dir",
            SourceFormat::Jsonl => "jsonl",
        };
        println!(
            "{:<28} {:<8} {:<10} {}",
            job.collection,
            format,
            path_status(&job.path, job.format),
            job.path.display()
        );
    }
    Ok(())
}

fn path_status(path: &Path, format: SourceFormat) -> &'static str {
    let ok = match format {
        SourceFormat::NpyDir => path.is_dir(),
        SourceFormat::Jsonl => path.is_file(),
    };
    if ok {
        "OK"
    } else {
        "MISSING"
    }
}
