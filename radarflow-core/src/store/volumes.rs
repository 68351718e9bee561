use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use radarflow_model::{FailureKind, VolumeId, VolumeRecord, WorkStatus};

use super::{now_secs, Store};
use crate::error::Result;

pub(crate) fn volume_from_row(row: &SqliteRow) -> Result<VolumeRecord> {
    let status: String = row.try_get("status")?;
    let expected: String = row.try_get("expected_fields")?;
    let downloaded: String = row.try_get("downloaded_fields")?;

    Ok(VolumeRecord {
        volume_id: VolumeId {
            radar: row.try_get("radar")?,
            volume_code: row.try_get("vol_code")?,
            volume_number: row.try_get("vol_num")?,
            observed_at: row.try_get("observed_at")?,
        },
        expected_fields: serde_json::from_str(&expected)?,
        downloaded_fields: serde_json::from_str(&downloaded)?,
        is_complete: row.try_get("is_complete")?,
        status: status.parse::<WorkStatus>().map_err(crate::CoreError::from)?,
        output_path: row
            .try_get::<Option<String>, _>("output_path")?
            .map(PathBuf::from),
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Ensure a volume row exists for `volume` on the given connection,
/// carrying the expected moment list. Existing membership and status are
/// left untouched. Shared with the file-commit transaction so a completed
/// file and its volume row land atomically.
pub(crate) async fn upsert_volume_in(
    conn: &mut sqlx::SqliteConnection,
    volume: &VolumeId,
    expected_fields: &[String],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO volumes (
            volume_id, radar, vol_code, vol_num, observed_at,
            expected_fields, downloaded_fields, is_complete, status,
            created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, '[]', 0, 'pending', ?7, ?7)
        ON CONFLICT (volume_id) DO UPDATE SET
            expected_fields = excluded.expected_fields,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(volume.encode())
    .bind(&volume.radar)
    .bind(&volume.volume_code)
    .bind(&volume.volume_number)
    .bind(volume.observed_at)
    .bind(serde_json::to_string(expected_fields)?)
    .bind(now_secs())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Add `field` to the volume's downloaded set on the given connection and
/// recompute completeness. Returns the new `is_complete` flag.
pub(crate) async fn add_field_in(
    conn: &mut sqlx::SqliteConnection,
    volume: &VolumeId,
    field: &str,
) -> Result<bool> {
    let key = volume.encode();

    let row = sqlx::query(
        "SELECT expected_fields, downloaded_fields FROM volumes WHERE volume_id = ?1",
    )
    .bind(&key)
    .fetch_one(&mut *conn)
    .await?;

    let expected: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("expected_fields")?)?;
    let mut downloaded: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("downloaded_fields")?)?;

    if !downloaded.iter().any(|f| f == field) {
        downloaded.push(field.to_string());
    }
    let is_complete = expected.iter().all(|f| downloaded.contains(f));

    sqlx::query(
        r#"
        UPDATE volumes
        SET downloaded_fields = ?2, is_complete = ?3, updated_at = ?4
        WHERE volume_id = ?1
        "#,
    )
    .bind(&key)
    .bind(serde_json::to_string(&downloaded)?)
    .bind(is_complete)
    .bind(now_secs())
    .execute(&mut *conn)
    .await?;

    if is_complete {
        debug!(volume = %key, "volume membership complete");
    }
    Ok(is_complete)
}

impl Store {
    /// Ensure a volume row exists for `volume`, carrying the given expected
    /// moment list. Existing membership and status are left untouched.
    pub async fn upsert_volume(&self, volume: &VolumeId, expected_fields: &[String]) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        upsert_volume_in(&mut conn, volume, expected_fields).await
    }

    /// Add `field` to the volume's downloaded set and recompute
    /// completeness. Returns the new `is_complete` flag.
    pub async fn add_field_to_volume(&self, volume: &VolumeId, field: &str) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let is_complete = add_field_in(&mut tx, volume, field).await?;
        tx.commit().await?;
        Ok(is_complete)
    }

    /// Complete volumes waiting to be processed, oldest observation first.
    pub async fn claimable_volumes(&self, radar: &str, limit: i64) -> Result<Vec<VolumeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM volumes
            WHERE radar = ?1 AND status = 'pending' AND is_complete = 1
            ORDER BY observed_at
            LIMIT ?2
            "#,
        )
        .bind(radar)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(volume_from_row).collect()
    }

    /// Attempt to move the volume `pending -> processing`. True iff this
    /// caller won; a concurrent claimant sees zero affected rows.
    pub async fn claim_volume_for_processing(&self, volume: &VolumeId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE volumes
            SET status = 'processing', updated_at = ?2
            WHERE volume_id = ?1 AND status = 'pending' AND is_complete = 1
            "#,
        )
        .bind(volume.encode())
        .bind(now_secs())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Terminal success: must only commit after the output container has
    /// been flushed to disk.
    pub async fn mark_volume_processed(&self, volume: &VolumeId, output_path: &Path) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE volumes
            SET status = 'completed', output_path = ?2, error_message = NULL, updated_at = ?3
            WHERE volume_id = ?1 AND status = 'processing'
            "#,
        )
        .bind(volume.encode())
        .bind(output_path.to_string_lossy().into_owned())
        .bind(now_secs())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_volume_failed(
        &self,
        volume: &VolumeId,
        kind: FailureKind,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE volumes
            SET status = 'failed', error_message = ?2, updated_at = ?3
            WHERE volume_id = ?1 AND status = 'processing'
            "#,
        )
        .bind(volume.encode())
        .bind(format!("{kind}: {message}"))
        .bind(now_secs())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_volume(&self, volume: &VolumeId) -> Result<Option<VolumeRecord>> {
        let row = sqlx::query("SELECT * FROM volumes WHERE volume_id = ?1")
            .bind(volume.encode())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(volume_from_row).transpose()
    }

    /// Volumes the converter still has to look at: claimable or claimed.
    pub async fn convert_work_remaining(&self, radar: &str) -> Result<i64> {
        let n: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM volumes
            WHERE radar = ?1
              AND ((status = 'pending' AND is_complete = 1) OR status = 'processing')
            "#,
        )
        .bind(radar)
        .fetch_one(self.pool())
        .await?
        .try_get("n")?;
        Ok(n)
    }

    /// Recovery sweep: volumes claimed before `cutoff` go back to pending.
    pub async fn reset_stuck_volumes(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE volumes
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

    /// Operator recovery: every failed volume becomes claimable again.
    pub async fn retry_failed_volumes(&self, radar: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE volumes
            SET status = 'pending', error_message = NULL, updated_at = ?2
            WHERE radar = ?1 AND status = 'failed'
            "#,
        )
        .bind(radar)
        .bind(now_secs())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
