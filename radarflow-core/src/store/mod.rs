//! Persistent catalogue shared by every worker.
//!
//! A single SQLite database is the only coordination channel between the
//! pipeline stages. Every operation here is one committed transaction;
//! claim operations are guarded UPDATEs whose row count decides which
//! caller won.

mod files;
mod products;
mod volumes;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;

use crate::error::Result;

/// Catalogue timestamps carry second precision.
pub fn now_secs() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_opt(now.timestamp(), 0).single().unwrap_or(now)
}

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if necessary) the catalogue at `path` and apply
    /// pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("state store opened at {}", path.display());
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Status histogram across every entity class, for the statistics view.
    pub async fn counts(&self) -> Result<StoreCounts> {
        let mut counts = StoreCounts::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM files GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "completed" => counts.files_completed = n,
                _ => counts.files_failed = n,
            }
        }

        counts.partial_downloads =
            sqlx::query("SELECT COUNT(*) AS n FROM partial_downloads")
                .fetch_one(&self.pool)
                .await?
                .try_get("n")?;

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM volumes GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.volumes.set(&status, n);
        }

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM products GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.products.set(&status, n);
        }

        Ok(counts)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl StatusCounts {
    fn set(&mut self, status: &str, n: i64) {
        match status {
            "pending" => self.pending = n,
            "processing" => self.processing = n,
            "completed" => self.completed = n,
            "failed" => self.failed = n,
            _ => {}
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StoreCounts {
    pub files_completed: i64,
    pub files_failed: i64,
    pub partial_downloads: i64,
    pub volumes: StatusCounts,
    pub products: StatusCounts,
}
