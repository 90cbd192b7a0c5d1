//! Idempotent ingestion of precomputed vectors into a vector collection.
//!
//! # Policy
//!
//! Ingestion is all-or-nothing per collection:
//!
//! 1. Probe the collection's object count. Anything above zero means the
//!    collection was populated by an earlier run and nothing is written.
//! 2. Otherwise open the [`RecordSource`] and stream its records one by one.
//!    Each record is stored under [`deterministic_id`] of its natural key, so
//!    a partial earlier run that crashed midway can never produce a second
//!    copy of an object: the store answers [`InsertOutcome::Duplicate`].
//!
//! Setup problems (unreachable store on the count probe, a source that
//! cannot be opened) are returned as errors before any record is touched.
//! Per-record problems are counted in [`IngestSummary::failed`] and the
//! stream continues.
//!
//! [`deterministic_id`]: crate::models::deterministic_id

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embedding::is_valid_vector;
use crate::models::{IngestionRecord, VectorObject};
use crate::store::{InsertOutcome, VectorIndex};

/// How often progress is logged, in records.
const PROGRESS_EVERY: usize = 100;

/// A finite, lazily read sequence of ingestion records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Human-readable description for logs ("npy directory ./data/memes").
    fn describe(&self) -> String;

    /// Open the source. Errors here are fatal for the run.
    ///
    /// Individual items of the returned stream may be errors (e.g. one
    /// corrupt file); the worker counts those as failed and keeps reading.
    async fn open(&self) -> Result<BoxStream<'static, Result<IngestionRecord>>>;
}

/// Counters for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub collection: String,
    pub imported: u64,
    pub skipped: u64,
    pub failed: u64,
    /// The count probe found existing data and the run wrote nothing.
    pub already_populated: bool,
}

impl IngestSummary {
    fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            ..Self::default()
        }
    }

    pub fn processed(&self) -> u64 {
        self.imported + self.skipped + self.failed
    }
}

/// Populate `collection` from `source` unless it already holds objects.
pub async fn ingest(
    index: &dyn VectorIndex,
    collection: &str,
    source: &dyn RecordSource,
) -> Result<IngestSummary> {
    let mut summary = IngestSummary::new(collection);

    let existing = index
        .count(collection)
        .await
        .with_context(|| format!("failed to count objects in {}", collection))?;
    if existing > 0 {
        info!(collection, existing, "collection already populated; skipping import");
        summary.already_populated = true;
        return Ok(summary);
    }

    let mut records = source
        .open()
        .await
        .with_context(|| format!("failed to open {}", source.describe()))?;
    info!(collection, source = %source.describe(), "importing");

    while let Some(record) = records.next().await {
        match record {
            Ok(record) => store_record(index, collection, record, &mut summary).await,
            Err(e) => {
                warn!(collection, error = %format!("{:#}", e), "unreadable record");
                summary.failed += 1;
            }
        }

        let processed = summary.processed();
        if processed % PROGRESS_EVERY as u64 == 0 {
            info!(
                collection,
                processed,
                imported = summary.imported,
                skipped = summary.skipped,
                failed = summary.failed,
                "import progress"
            );
        }
    }

    info!(
        collection,
        imported = summary.imported,
        skipped = summary.skipped,
        failed = summary.failed,
        "import finished"
    );
    Ok(summary)
}

async fn store_record(
    index: &dyn VectorIndex,
    collection: &str,
    record: IngestionRecord,
    summary: &mut IngestSummary,
) {
    let key = record.natural_key.clone();
    if !is_valid_vector(&record.vector) {
        warn!(collection, key = %key, "empty or non-finite vector; not submitted");
        summary.failed += 1;
        return;
    }

    let object = VectorObject::from(record);
    match index.insert(collection, &object).await {
        Ok(InsertOutcome::Created) => summary.imported += 1,
        Ok(InsertOutcome::Duplicate) => {
            debug!(collection, key = %key, id = %object.id, "already exists; skipped");
            summary.skipped += 1;
        }
        Err(e) => {
            warn!(collection, key = %key, error = %format!("{:#}", e), "insert failed");
            summary.failed += 1;
        }
    }
}
