//! `memes ingest`: run configured ingestion jobs against Weaviate.
//!
//! Each `[[ingest]]` job names a collection and a record source. The
//! idempotency policy (count probe, deterministic ids, duplicate skipping)
//! lives in [`meme_search_core::ingest`]; this module wires the
//! configured sources to the Weaviate client and reports the outcome.

use anyhow::{bail, Result};
use futures::StreamExt;
use meme_search_core::ingest::{ingest, IngestSummary};
use meme_search_core::store::VectorIndex;

use crate::config::{Config, IngestJob};
use crate::sources::source_for_job;
use crate::weaviate::WeaviateClient;

/// Jobs selected by `target`: a collection name, or `all`.
pub fn select_jobs<'a>(config: &'a Config, target: &str) -> Result<Vec<&'a IngestJob>> {
    let jobs: Vec<&IngestJob> = config
        .ingest
        .iter()
        .filter(|job| target == "all" || job.collection == target)
        .collect();
    if jobs.is_empty() {
        let known: Vec<&str> = config.ingest.iter().map(|j| j.collection.as_str()).collect();
        if known.is_empty() {
            bail!("No [[ingest]] jobs configured");
        }
        bail!(
            "No ingest job for '{}'. Configured: {}, or 'all'",
            target,
            known.join(", ")
        );
    }
    Ok(jobs)
}

/// Run one job against `index`.
pub async fn run_job(index: &dyn VectorIndex, job: &IngestJob) -> Result<IngestSummary> {
    let source = source_for_job(job);
    ingest(index, &job.collection, source.as_ref()).await
}

pub async fn run_ingest(config: &Config, target: &str, dry_run: bool) -> Result<()> {
    let jobs = select_jobs(config, target)?;
    let index = WeaviateClient::from_config(config)?;

    for job in jobs {
        if dry_run {
            dry_run_job(&index, job).await?;
            continue;
        }

        let summary = run_job(&index, job).await?;
        print_summary(&summary);
    }

    println!("ok");
    Ok(())
}

async fn dry_run_job(index: &dyn VectorIndex, job: &IngestJob) -> Result<()> {
    let existing = index.count(&job.collection).await?;
    let source = source_for_job(job);
    let mut records = source.open().await?;

    let (mut readable, mut unreadable) = (0u64, 0u64);
    while let Some(record) = records.next().await {
        match record {
            Ok(_) => readable += 1,
            Err(_) => unreadable += 1,
        }
    }

    println!("ingest {} (dry-run)", job.collection);
    println!("  source: {}", source.describe());
    println!("  existing objects: {}", existing);
    println!("  readable records: {}", readable);
    println!("  unreadable records: {}", unreadable);
    if existing > 0 {
        println!("  would skip: collection already populated");
    }
    Ok(())
}

fn print_summary(summary: &IngestSummary) {
    println!("ingest {}", summary.collection);
    if summary.already_populated {
        println!("  already populated, nothing imported");
        return;
    }
    println!("  imported: {}", summary.imported);
    println!("  skipped (already exists): {}", summary.skipped);
    println!("  failed: {}", summary.failed);
}
