use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::DbConfig;
use crate::db;

/// Create the label catalog schema. Safe to run repeatedly.
pub async fn run_migrations(db: &DbConfig) -> Result<()> {
    let pool = db::connect(db).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // One row per labelled meme; `number` is the id the caption index refers to.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS labels (
            number INTEGER PRIMARY KEY,
            image_name TEXT NOT NULL UNIQUE,
            image_path TEXT,
            cleaned_image_path TEXT,
            text_ocr TEXT,
            text_corrected TEXT,
            overall_sentiment TEXT CHECK (overall_sentiment IN (
                'very_positive', 'positive', 'neutral', 'negative', 'very_negative'
            ))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_labels_sentiment ON labels(overall_sentiment)")
        .execute(pool)
        .await?;

    Ok(())
}
