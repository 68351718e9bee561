use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use radarflow_model::{FileRecord, FileStatus, PartialDownload, VolumeId};

use super::Store;
use crate::error::Result;

fn file_from_row(row: &SqliteRow) -> Result<FileRecord> {
    let status: String = row.try_get("status")?;
    Ok(FileRecord {
        filename: row.try_get("filename")?,
        remote_path: row.try_get("remote_path")?,
        local_path: PathBuf::from(row.try_get::<String, _>("local_path")?),
        size: row.try_get::<i64, _>("size")? as u64,
        digest: row.try_get("digest")?,
        radar: row.try_get("radar")?,
        field: row.try_get("field")?,
        volume_code: row.try_get("vol_code")?,
        volume_number: row.try_get("vol_num")?,
        observed_at: row.try_get("observed_at")?,
        status: status.parse::<FileStatus>().map_err(crate::CoreError::from)?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Commit a fully downloaded and verified file. Replaces any previous
    /// row for the same filename (a re-downloaded copy re-links), drops the
    /// transient partial row, and applies the volume-membership update, all
    /// in one transaction: a crash can never leave a completed file whose
    /// volume row does not account for it. Returns the volume's new
    /// completeness flag.
    pub async fn record_completed_file(
        &self,
        record: &FileRecord,
        expected_fields: &[String],
    ) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO files (
                filename, remote_path, local_path, size, digest,
                radar, field, vol_code, vol_num, observed_at, status, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT (filename) DO UPDATE SET
                remote_path = excluded.remote_path,
                local_path = excluded.local_path,
                size = excluded.size,
                digest = excluded.digest,
                status = excluded.status,
                created_at = excluded.created_at
            "#,
        )
        .bind(&record.filename)
        .bind(&record.remote_path)
        .bind(record.local_path.to_string_lossy().into_owned())
        .bind(record.size as i64)
        .bind(&record.digest)
        .bind(&record.radar)
        .bind(&record.field)
        .bind(&record.volume_code)
        .bind(&record.volume_number)
        .bind(record.observed_at)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM partial_downloads WHERE filename = ?1")
            .bind(&record.filename)
            .execute(&mut *tx)
            .await?;

        let volume = VolumeId {
            radar: record.radar.clone(),
            volume_code: record.volume_code.clone(),
            volume_number: record.volume_number.clone(),
            observed_at: record.observed_at,
        };
        super::volumes::upsert_volume_in(&mut tx, &volume, expected_fields).await?;
        let is_complete = super::volumes::add_field_in(&mut tx, &volume, &record.field).await?;

        tx.commit().await?;
        Ok(is_complete)
    }

    /// Upsert retry state for an in-flight fetch. A completed file row for
    /// the same key wins: the partial is silently dropped instead.
    pub async fn record_partial(&self, partial: &PartialDownload) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let completed: bool = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM files WHERE filename = ?1 AND status = 'completed') AS e",
        )
        .bind(&partial.filename)
        .fetch_one(&mut *tx)
        .await?
        .try_get("e")?;

        if completed {
            debug!(
                filename = %partial.filename,
                "skipping partial record: file already completed"
            );
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO partial_downloads (
                filename, remote_path, local_path, bytes_downloaded,
                total_bytes, attempt_count, last_attempt
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (filename) DO UPDATE SET
                remote_path = excluded.remote_path,
                local_path = excluded.local_path,
                bytes_downloaded = excluded.bytes_downloaded,
                total_bytes = excluded.total_bytes,
                attempt_count = excluded.attempt_count,
                last_attempt = excluded.last_attempt
            "#,
        )
        .bind(&partial.filename)
        .bind(&partial.remote_path)
        .bind(partial.local_path.to_string_lossy().into_owned())
        .bind(partial.bytes_downloaded as i64)
        .bind(partial.total_bytes.map(|b| b as i64))
        .bind(partial.attempt_count as i64)
        .bind(partial.last_attempt)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_partial(&self, filename: &str) -> Result<Option<PartialDownload>> {
        let row = sqlx::query("SELECT * FROM partial_downloads WHERE filename = ?1")
            .bind(filename)
            .fetch_optional(self.pool())
            .await?;

        row.map(|row| {
            Ok(PartialDownload {
                filename: row.try_get("filename")?,
                remote_path: row.try_get("remote_path")?,
                local_path: PathBuf::from(row.try_get::<String, _>("local_path")?),
                bytes_downloaded: row.try_get::<i64, _>("bytes_downloaded")? as u64,
                total_bytes: row.try_get::<Option<i64>, _>("total_bytes")?.map(|b| b as u64),
                attempt_count: row.try_get::<i64, _>("attempt_count")? as u32,
                last_attempt: row.try_get("last_attempt")?,
            })
        })
        .transpose()
    }

    pub async fn is_file_completed(&self, filename: &str) -> Result<bool> {
        let exists: bool = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM files WHERE filename = ?1 AND status = 'completed') AS e",
        )
        .bind(filename)
        .fetch_one(self.pool())
        .await?
        .try_get("e")?;
        Ok(exists)
    }

    /// Most recent observation instant among completed files for `radar`;
    /// the walker resumes from here.
    pub async fn latest_observation_instant(&self, radar: &str) -> Result<Option<DateTime<Utc>>> {
        let instant: Option<DateTime<Utc>> = sqlx::query(
            "SELECT MAX(observed_at) AS latest FROM files WHERE radar = ?1 AND status = 'completed'",
        )
        .bind(radar)
        .fetch_one(self.pool())
        .await?
        .try_get("latest")?;
        Ok(instant)
    }

    /// Completed file rows constituting one volume, ordered by field name.
    pub async fn files_for_volume(&self, volume: &VolumeId) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM files
            WHERE radar = ?1 AND vol_code = ?2 AND vol_num = ?3
              AND observed_at = ?4 AND status = 'completed'
            ORDER BY field
            "#,
        )
        .bind(&volume.radar)
        .bind(&volume.volume_code)
        .bind(&volume.volume_number)
        .bind(volume.observed_at)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(file_from_row).collect()
    }

    pub async fn partial_count(&self) -> Result<i64> {
        let n: i64 = sqlx::query("SELECT COUNT(*) AS n FROM partial_downloads")
            .fetch_one(self.pool())
            .await?
            .try_get("n")?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use radarflow_model::{FileStatus, ParsedFilename};

    use super::*;
    use crate::store::now_secs;

    async fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("catalogue.db")).await.unwrap();
        (dir, store)
    }

    fn record(filename: &str) -> FileRecord {
        let parsed = ParsedFilename::parse(filename).unwrap();
        FileRecord {
            filename: filename.to_string(),
            remote_path: format!("/incoming/{filename}"),
            local_path: PathBuf::from(format!("/tmp/{filename}")),
            size: 1024,
            digest: "ab".repeat(32),
            radar: parsed.radar.clone(),
            field: parsed.field.clone(),
            volume_code: parsed.volume_code.clone(),
            volume_number: parsed.volume_number.clone(),
            observed_at: parsed.observed_at,
            status: FileStatus::Completed,
            created_at: now_secs(),
        }
    }

    fn expected(record: &FileRecord) -> Vec<String> {
        vec![record.field.clone()]
    }

    fn partial(filename: &str, attempts: u32) -> PartialDownload {
        PartialDownload {
            filename: filename.to_string(),
            remote_path: format!("/incoming/{filename}"),
            local_path: PathBuf::from(format!("/tmp/{filename}.part")),
            bytes_downloaded: 100,
            total_bytes: Some(1024),
            attempt_count: attempts,
            last_attempt: now_secs(),
        }
    }

    #[tokio::test]
    async fn completed_file_round_trips() {
        let (_dir, store) = temp_store().await;
        let rec = record("RMA1_0315_01_DBZH_20250101T120000Z.BUFR");

        assert!(!store.is_file_completed(&rec.filename).await.unwrap());
        store
            .record_completed_file(&rec, &expected(&rec))
            .await
            .unwrap();
        assert!(store.is_file_completed(&rec.filename).await.unwrap());

        let files = store
            .files_for_volume(&ParsedFilename::parse(&rec.filename).unwrap().volume_id())
            .await
            .unwrap();
        assert_eq!(files, vec![rec]);
    }

    #[tokio::test]
    async fn file_commit_updates_volume_membership_atomically() {
        let (_dir, store) = temp_store().await;
        let rec = record("RMA1_0315_01_DBZH_20250101T120000Z.BUFR");
        let expected = vec!["DBZH".to_string(), "VRAD".to_string()];

        let complete = store.record_completed_file(&rec, &expected).await.unwrap();
        assert!(!complete);

        // The volume row exists with the field already accounted for, with
        // no window for a crash between the two writes.
        let id = ParsedFilename::parse(&rec.filename).unwrap().volume_id();
        let volume = store.get_volume(&id).await.unwrap().unwrap();
        assert_eq!(volume.downloaded_fields, vec!["DBZH"]);
        assert!(!volume.is_complete);

        let vrad = record("RMA1_0315_01_VRAD_20250101T120000Z.BUFR");
        let complete = store.record_completed_file(&vrad, &expected).await.unwrap();
        assert!(complete);
        assert!(store.get_volume(&id).await.unwrap().unwrap().is_complete);
    }

    #[tokio::test]
    async fn completed_file_deletes_partial_row() {
        let (_dir, store) = temp_store().await;
        let name = "RMA1_0315_01_DBZH_20250101T120000Z.BUFR";

        store.record_partial(&partial(name, 1)).await.unwrap();
        assert_eq!(store.partial_count().await.unwrap(), 1);

        let rec = record(name);
        store
            .record_completed_file(&rec, &expected(&rec))
            .await
            .unwrap();
        assert_eq!(store.partial_count().await.unwrap(), 0);
        assert!(store.get_partial(name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_never_coexists_with_completed() {
        let (_dir, store) = temp_store().await;
        let name = "RMA1_0315_01_DBZH_20250101T120000Z.BUFR";

        let rec = record(name);
        store
            .record_completed_file(&rec, &expected(&rec))
            .await
            .unwrap();
        store.record_partial(&partial(name, 1)).await.unwrap();

        assert_eq!(store.partial_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn partial_attempts_accumulate() {
        let (_dir, store) = temp_store().await;
        let name = "RMA1_0315_01_DBZH_20250101T120000Z.BUFR";

        store.record_partial(&partial(name, 1)).await.unwrap();
        store.record_partial(&partial(name, 2)).await.unwrap();

        let row = store.get_partial(name).await.unwrap().unwrap();
        assert_eq!(row.attempt_count, 2);
        assert!(!store.is_file_completed(name).await.unwrap());
    }

    #[tokio::test]
    async fn latest_observation_tracks_maximum() {
        let (_dir, store) = temp_store().await;

        assert!(store
            .latest_observation_instant("RMA1")
            .await
            .unwrap()
            .is_none());

        for name in [
            "RMA1_0315_01_DBZH_20250101T120000Z.BUFR",
            "RMA1_0315_01_DBZH_20250101T130000Z.BUFR",
            "RMA1_0315_01_DBZH_20250101T123000Z.BUFR",
        ] {
            let rec = record(name);
            store
                .record_completed_file(&rec, &expected(&rec))
                .await
                .unwrap();
        }

        let latest = store.latest_observation_instant("RMA1").await.unwrap();
        assert_eq!(
            latest,
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 13, 0, 0).unwrap())
        );
        assert!(store
            .latest_observation_instant("RMA9")
            .await
            .unwrap()
            .is_none());
    }
}
