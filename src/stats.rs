//! Index statistics and health overview.
//!
//! Prints the object count of every configured Weaviate collection and the
//! size of the label catalog. Used by `memes stats` to confirm that
//! ingestion ran and that the backing services are reachable. A collection
//! whose count cannot be read is shown as unreachable instead of aborting
//! the report.

use anyhow::Result;
use meme_search_core::store::VectorIndex;

use crate::config::Config;
use crate::labels::LabelCatalog;
use crate::weaviate::WeaviateClient;

/// Count for one collection, or the reason it could not be read.
pub struct CollectionStats {
    pub name: String,
    pub count: Result<u64>,
}

/// Count objects in every collection named in `[collections]`.
pub async fn collect_collection_stats(
    index: &dyn VectorIndex,
    config: &Config,
) -> Vec<CollectionStats> {
    let mut stats = Vec::new();
    for collection in config.collections.all() {
        // Collections may be configured twice (e.g. faces reused); count once.
        if stats.iter().any(|s: &CollectionStats| s.name == collection.name) {
            continue;
        }
        stats.push(CollectionStats {
            name: collection.name.clone(),
            count: index.count(&collection.name).await,
        });
    }
    stats
}

/// Run the stats command: query Weaviate and the catalog and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let index = WeaviateClient::from_config(config)?;
    let catalog = LabelCatalog::open(&config.db).await?;
    let labels = catalog.count().await;
    catalog.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Meme Search — Index Stats");
    println!("=========================");
    println!();
    println!("  Catalog:     {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    match labels {
        Ok(n) => println!("  Labels:      {}", n),
        Err(e) => println!("  Labels:      unavailable ({:#})", e),
    }
    println!();
    println!("  Weaviate:    {}", config.weaviate.url);
    println!("  {:<28} {:>10}", "COLLECTION", "OBJECTS");
    println!("  {}", "-".repeat(40));

    for s in collect_collection_stats(&index, config).await {
        match s.count {
            Ok(n) => println!("  {:<28} {:>10}", s.name, n),
            Err(e) => println!("  {:<28} {:>10}   {:#}", s.name, "unreachable", e),
        }
    }
    println!();

    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
