//! SQLite label catalog.
//!
//! Each labelled meme has one row keyed by `number`, the id the caption
//! index stores alongside each caption. The catalog resolves caption hits
//! to image names for the caption channel and enriches search results with
//! image paths and sentiment. Used by `memes label` and the HTTP server.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use async_trait::async_trait;
use meme_search_core::models::ItemId;
use meme_search_core::store::LabelLookup;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::config::DbConfig;
use crate::db;

/// Overall sentiment annotated on a meme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    VeryPositive,
    Positive,
    Neutral,
    Negative,
    VeryNegative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::VeryPositive => "very_positive",
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
            Sentiment::VeryNegative => "very_negative",
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sentiment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_lowercase().as_str() {
            "very_positive" => Sentiment::VeryPositive,
            "positive" => Sentiment::Positive,
            "neutral" => Sentiment::Neutral,
            "negative" => Sentiment::Negative,
            "very_negative" => Sentiment::VeryNegative,
            other => bail!("unknown sentiment: '{}'", other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelRecord {
    pub number: i64,
    pub image_name: String,
    pub image_path: Option<String>,
    pub cleaned_image_path: Option<String>,
    pub text_ocr: Option<String>,
    pub text_corrected: Option<String>,
    pub sentiment: Option<Sentiment>,
}

impl LabelRecord {
    fn from_row(row: &SqliteRow) -> Self {
        let image_name: String = row.get("image_name");
        let sentiment: Option<String> = row.get("overall_sentiment");
        let sentiment = sentiment.and_then(|s| match s.parse() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(image = %image_name, error = %e, "ignoring sentiment");
                None
            }
        });
        Self {
            number: row.get("number"),
            image_name,
            image_path: row.get("image_path"),
            cleaned_image_path: row.get("cleaned_image_path"),
            text_ocr: row.get("text_ocr"),
            text_corrected: row.get("text_corrected"),
            sentiment,
        }
    }
}

const SELECT_LABEL: &str = "SELECT number, image_name, image_path, cleaned_image_path, \
     text_ocr, text_corrected, overall_sentiment FROM labels";

/// Handle to the label table. Cheap to clone.
#[derive(Clone)]
pub struct LabelCatalog {
    pool: SqlitePool,
}

impl LabelCatalog {
    pub async fn open(db: &DbConfig) -> Result<Self> {
        Ok(Self {
            pool: db::connect(db).await?,
        })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the row for `record.number`.
    pub async fn upsert(&self, record: &LabelRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO labels (number, image_name, image_path, cleaned_image_path,
                                text_ocr, text_corrected, overall_sentiment)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(number) DO UPDATE SET
                image_name = excluded.image_name,
                image_path = excluded.image_path,
                cleaned_image_path = excluded.cleaned_image_path,
                text_ocr = excluded.text_ocr,
                text_corrected = excluded.text_corrected,
                overall_sentiment = excluded.overall_sentiment
            "#,
        )
        .bind(record.number)
        .bind(&record.image_name)
        .bind(&record.image_path)
        .bind(&record.cleaned_image_path)
        .bind(&record.text_ocr)
        .bind(&record.text_corrected)
        .bind(record.sentiment.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_by_number(&self, number: i64) -> Result<Option<LabelRecord>> {
        let row = sqlx::query(&format!("{} WHERE number = ?", SELECT_LABEL))
            .bind(number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(LabelRecord::from_row))
    }

    pub async fn record_by_image_name(&self, image_name: &str) -> Result<Option<LabelRecord>> {
        let row = sqlx::query(&format!("{} WHERE image_name = ?", SELECT_LABEL))
            .bind(image_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(LabelRecord::from_row))
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM labels")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl LabelLookup for LabelCatalog {
    async fn image_for_ref(&self, ref_id: i64) -> Result<Option<ItemId>> {
        let name: Option<String> =
            sqlx::query_scalar("SELECT image_name FROM labels WHERE number = ?")
                .bind(ref_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(name)
    }
}

/// CLI entry point for `memes label <image_name>`.
pub async fn run_label(db: &DbConfig, image_name: &str) -> Result<()> {
    let catalog = LabelCatalog::open(db).await?;
    let record = catalog.record_by_image_name(image_name).await;
    catalog.close().await;

    let record = match record? {
        Some(r) => r,
        None => bail!("no label for image: {}", image_name),
    };

    println!("--- Label {} ---", record.number);
    println!("image_name:     {}", record.image_name);
    if let Some(ref path) = record.image_path {
        println!("image_path:     {}", path);
    }
    if let Some(ref path) = record.cleaned_image_path {
        println!("cleaned_path:   {}", path);
    }
    println!(
        "sentiment:      {}",
        record
            .sentiment
            .map(|s| s.to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!();
    println!("--- OCR ---");
    println!("{}", record.text_ocr.as_deref().unwrap_or(""));
    println!();
    println!("--- Corrected ---");
    println!("{}", record.text_corrected.as_deref().unwrap_or(""));

    Ok(())
}
