use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use radarflow_model::{FailureKind, ProductKind, ProductRecord, VolumeId, VolumeRecord, WorkStatus};

use super::volumes::volume_from_row;
use super::{now_secs, Store};
use crate::error::Result;

fn product_from_row(row: &SqliteRow) -> Result<ProductRecord> {
    let status: String = row.try_get("status")?;
    let kind: String = row.try_get("product_type")?;
    let volume_id: String = row.try_get("volume_id")?;

    Ok(ProductRecord {
        volume_id: VolumeId::decode(&volume_id).map_err(crate::CoreError::from)?,
        kind: kind.parse::<ProductKind>().map_err(crate::CoreError::from)?,
        status: status.parse::<WorkStatus>().map_err(crate::CoreError::from)?,
        generated_at: row.try_get("generated_at")?,
        error_type: row
            .try_get::<Option<String>, _>("error_type")?
            .map(|t| t.parse::<FailureKind>())
            .transpose()
            .map_err(crate::CoreError::from)?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Store {
    /// Completed volumes with no product row of this kind yet, or whose
    /// product is pending or failed.
    pub async fn list_volumes_for_rendering(
        &self,
        radar: &str,
        kind: ProductKind,
        limit: i64,
    ) -> Result<Vec<VolumeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT v.* FROM volumes v
            LEFT JOIN products p
                   ON p.volume_id = v.volume_id AND p.product_type = ?2
            WHERE v.radar = ?1
              AND v.status = 'completed'
              AND (p.volume_id IS NULL OR p.status IN ('pending', 'failed'))
            ORDER BY v.observed_at
            LIMIT ?3
            "#,
        )
        .bind(radar)
        .bind(kind.as_str())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(volume_from_row).collect()
    }

    /// Create the product row lazily (only if the volume is completed) and
    /// try to move it to processing. True iff this caller won the claim.
    pub async fn claim_product(&self, volume: &VolumeId, kind: ProductKind) -> Result<bool> {
        let key = volume.encode();
        let now = now_secs();
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO products (
                volume_id, product_type, status, created_at, updated_at
            )
            SELECT ?1, ?2, 'pending', ?3, ?3
            WHERE EXISTS (
                SELECT 1 FROM volumes WHERE volume_id = ?1 AND status = 'completed'
            )
            "#,
        )
        .bind(&key)
        .bind(kind.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE products
            SET status = 'processing', updated_at = ?3
            WHERE volume_id = ?1 AND product_type = ?2
              AND status IN ('pending', 'failed')
            "#,
        )
        .bind(&key)
        .bind(kind.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_product_completed(&self, volume: &VolumeId, kind: ProductKind) -> Result<bool> {
        let now = now_secs();
        let result = sqlx::query(
            r#"
            UPDATE products
            SET status = 'completed', generated_at = ?3,
                error_type = NULL, error_message = NULL, updated_at = ?3
            WHERE volume_id = ?1 AND product_type = ?2 AND status = 'processing'
            "#,
        )
        .bind(volume.encode())
        .bind(kind.as_str())
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_product_failed(
        &self,
        volume: &VolumeId,
        kind: ProductKind,
        error: FailureKind,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE products
            SET status = 'failed', error_type = ?3, error_message = ?4, updated_at = ?5
            WHERE volume_id = ?1 AND product_type = ?2 AND status = 'processing'
            "#,
        )
        .bind(volume.encode())
        .bind(kind.as_str())
        .bind(error.as_str())
        .bind(message)
        .bind(now_secs())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_product(
        &self,
        volume: &VolumeId,
        kind: ProductKind,
    ) -> Result<Option<ProductRecord>> {
        let row = sqlx::query(
            "SELECT * FROM products WHERE volume_id = ?1 AND product_type = ?2",
        )
        .bind(volume.encode())
        .bind(kind.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    /// Render work still open for this product kind: unrendered candidates
    /// plus claimed rows.
    pub async fn render_work_remaining(&self, radar: &str, kind: ProductKind) -> Result<i64> {
        let candidates: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM volumes v
            LEFT JOIN products p
                   ON p.volume_id = v.volume_id AND p.product_type = ?2
            WHERE v.radar = ?1
              AND v.status = 'completed'
              AND (p.volume_id IS NULL OR p.status IN ('pending', 'processing'))
            "#,
        )
        .bind(radar)
        .bind(kind.as_str())
        .fetch_one(self.pool())
        .await?
        .try_get("n")?;
        Ok(candidates)
    }

    pub async fn reset_stuck_products(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE products
            SET status = 'pending', updated_at = ?2
            WHERE status = 'processing' AND updated_at < ?1
            "#,
        )
        .bind(cutoff)
        .bind(now_secs())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn retry_failed_products(&self, radar: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE products
            SET status = 'pending', error_type = NULL, error_message = NULL, updated_at = ?2
            WHERE status = 'failed'
              AND volume_id IN (SELECT volume_id FROM volumes WHERE radar = ?1)
            "#,
        )
        .bind(radar)
        .bind(now_secs())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
