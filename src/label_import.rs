//! `memes import-labels`: fill the label catalog and the caption index
//! from a labels CSV.
//!
//! The CSV has a header row. Columns are found by header name
//! (`number`, `image_name`, `text_ocr`, `text_corrected`,
//! `overall_sentiment` or `sentiment`), falling back to positions 0 to 4 when a
//! header is missing. A row that does not parse, or that the catalog
//! rejects, is counted as failed and the import goes on.
//!
//! Captions (`text_corrected`) are written to Elasticsearch only when the
//! index is empty, mirroring the count gate of vector ingestion.

use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, warn};

use crate::config::{Config, LabelsConfig};
use crate::elastic::ElasticCaptions;
use crate::labels::{LabelCatalog, LabelRecord, Sentiment};
use crate::migrate;

const PROGRESS_EVERY: u64 = 100;

/// Column positions resolved from the header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns {
    number: usize,
    image_name: usize,
    text_ocr: usize,
    text_corrected: usize,
    sentiment: usize,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Self {
        let find = |names: &[&str]| {
            headers
                .iter()
                .position(|h| names.iter().any(|n| h.eq_ignore_ascii_case(n)))
        };
        Self {
            number: find(&["number"]).unwrap_or(0),
            image_name: find(&["image_name"]).unwrap_or(1),
            text_ocr: find(&["text_ocr"]).unwrap_or(2),
            text_corrected: find(&["text_corrected"]).unwrap_or(3),
            sentiment: find(&["overall_sentiment", "sentiment"]).unwrap_or(4),
        }
    }

    fn record(&self, row: &csv::StringRecord, labels: &LabelsConfig) -> Result<LabelRecord> {
        let field = |i: usize| row.get(i).map(str::trim).filter(|s| !s.is_empty());

        let number = field(self.number).ok_or_else(|| anyhow!("missing label number"))?;
        let number: i64 = number
            .parse()
            .map_err(|_| anyhow!("bad label number '{}'", number))?;
        let file = field(self.image_name).ok_or_else(|| anyhow!("missing image name"))?;
        let sentiment = field(self.sentiment)
            .map(str::parse::<Sentiment>)
            .transpose()?;

        let image_name = if labels.strip_extension {
            Path::new(file)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.to_string())
        } else {
            file.to_string()
        };
        let under = |dir: &Option<std::path::PathBuf>| {
            dir.as_ref().map(|d| d.join(file).display().to_string())
        };

        Ok(LabelRecord {
            number,
            image_name,
            image_path: under(&labels.images_dir),
            cleaned_image_path: under(&labels.cleaned_dir),
            text_ocr: field(self.text_ocr).map(str::to_string),
            text_corrected: field(self.text_corrected).map(str::to_string),
            sentiment,
        })
    }
}

/// Parse every data row of a labels CSV. An unreadable header is an error;
/// a bad row becomes an `Err` entry.
pub fn parse_labels<R: Read>(input: R, labels: &LabelsConfig) -> Result<Vec<Result<LabelRecord>>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(input);
    let headers = reader.headers().context("Failed to read CSV header")?.clone();
    if headers.is_empty() {
        bail!("labels CSV has no header row");
    }
    let columns = Columns::from_headers(&headers);

    Ok(reader
        .records()
        .enumerate()
        .map(|(i, row)| {
            row.map_err(anyhow::Error::from)
                .and_then(|row| columns.record(&row, labels))
                .with_context(|| format!("row {}", i + 1))
        })
        .collect())
}

/// What happened to the caption index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptionOutcome {
    /// Not requested.
    Skipped,
    /// The index already held captions; nothing written.
    AlreadyIndexed,
    Indexed { indexed: u64, failed: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelImportSummary {
    pub imported: u64,
    pub failed: u64,
    pub captions: CaptionOutcome,
}

/// Upsert `rows` into `catalog` and, when `captions` is given and its index
/// is empty, index each imported caption.
///
/// # Errors
///
/// Fails only if the caption index cannot be counted; per-row problems are
/// counted in the summary.
pub async fn import_labels(
    catalog: &LabelCatalog,
    captions: Option<&ElasticCaptions>,
    rows: Vec<Result<LabelRecord>>,
) -> Result<LabelImportSummary> {
    let index_captions = match captions {
        Some(index) => {
            let existing = index
                .count()
                .await
                .context("Failed to count caption index")?;
            if existing > 0 {
                info!(existing, "caption index already populated; not indexing captions");
            }
            existing == 0
        }
        None => false,
    };

    let (mut imported, mut failed) = (0u64, 0u64);
    let (mut indexed, mut index_failed) = (0u64, 0u64);
    for (seen, row) in rows.into_iter().enumerate() {
        let stored = match row {
            Ok(record) => match catalog.upsert(&record).await {
                Ok(()) => Some(record),
                Err(e) => {
                    warn!(number = record.number, error = %format!("{:#}", e), "label insert failed");
                    None
                }
            },
            Err(e) => {
                warn!(error = %format!("{:#}", e), "skipping unreadable label row");
                None
            }
        };

        match stored {
            Some(record) => {
                imported += 1;
                if let (true, Some(index), Some(text)) =
                    (index_captions, captions, record.text_corrected.as_deref())
                {
                    match index.index_caption(record.number, text).await {
                        Ok(()) => indexed += 1,
                        Err(e) => {
                            warn!(number = record.number, error = %format!("{:#}", e), "caption index failed");
                            index_failed += 1;
                        }
                    }
                }
            }
            None => failed += 1,
        }

        let seen = seen as u64 + 1;
        if seen % PROGRESS_EVERY == 0 {
            info!(seen, imported, failed, "importing labels");
        }
    }

    let captions = match (captions, index_captions) {
        (None, _) => CaptionOutcome::Skipped,
        (Some(_), false) => CaptionOutcome::AlreadyIndexed,
        (Some(_), true) => CaptionOutcome::Indexed {
            indexed,
            failed: index_failed,
        },
    };
    Ok(LabelImportSummary {
        imported,
        failed,
        captions,
    })
}

/// CLI entry point for `memes import-labels <csv>`.
pub async fn run_import_labels(config: &Config, csv_path: &Path, skip_captions: bool) -> Result<()> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("Failed to open labels CSV: {}", csv_path.display()))?;
    let rows = parse_labels(file, &config.labels)?;

    migrate::run_migrations(&config.db).await?;
    let catalog = LabelCatalog::open(&config.db).await?;
    let captions = if skip_captions {
        None
    } else {
        Some(ElasticCaptions::new(&config.elasticsearch)?)
    };

    let summary = import_labels(&catalog, captions.as_ref(), rows).await;
    catalog.close().await;
    let summary = summary?;

    println!("import-labels {}", csv_path.display());
    print_summary(&summary);
    println!("ok");
    Ok(())
}

fn print_summary(summary: &LabelImportSummary) {
    println!("  imported: {}", summary.imported);
    println!("  failed: {}", summary.failed);
    match &summary.captions {
        CaptionOutcome::Skipped => println!("  captions: skipped"),
        CaptionOutcome::AlreadyIndexed => {
            println!("  captions: index already populated, nothing indexed")
        }
        CaptionOutcome::Indexed { indexed, failed } => {
            println!("  captions indexed: {}", indexed);
            println!("  captions failed: {}", failed);
        }
    }
}
