//! Translates the flat stream of completed files into volume membership:
//! looks up the expected moment set and drives the store's fused
//! file-plus-membership commit.

use std::sync::Arc;

use tracing::info;

use radarflow_config::Config;
use radarflow_model::{FileRecord, VolumeId};

use crate::error::{CoreError, Result};
use crate::store::Store;

#[derive(Clone)]
pub struct VolumeAssembler {
    store: Store,
    config: Arc<Config>,
}

impl VolumeAssembler {
    pub fn new(store: Store, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    /// Commit a fully verified file. The file row, the volume row it
    /// belongs to, and the membership update land in one store transaction,
    /// so a crash can never leave a completed file its volume does not
    /// account for.
    pub async fn record_file(&self, record: &FileRecord) -> Result<()> {
        let volume_id = VolumeId {
            radar: record.radar.clone(),
            volume_code: record.volume_code.clone(),
            volume_number: record.volume_number.clone(),
            observed_at: record.observed_at,
        };

        let expected = self
            .config
            .expected_fields(&record.volume_code, &record.volume_number)
            .ok_or_else(|| {
                CoreError::Config(format!(
                    "no expectation entry for volume code {} number {}",
                    record.volume_code, record.volume_number
                ))
            })?;

        let complete = self.store.record_completed_file(record, expected).await?;
        if complete {
            info!(volume = %volume_id, "volume complete, ready for processing");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use radarflow_model::{FileStatus, ParsedFilename, WorkStatus};

    use super::*;
    use crate::store::now_secs;

    fn test_config() -> Arc<Config> {
        let mut numbers = BTreeMap::new();
        numbers.insert(
            "01".to_string(),
            vec!["DBZH".to_string(), "VRAD".to_string()],
        );
        let mut volumes = BTreeMap::new();
        volumes.insert("0315".to_string(), numbers);

        Arc::new(Config {
            connection: radarflow_config::ConnectionConfig {
                host: "localhost:21".into(),
                username: "radar".into(),
                password: "radar".into(),
                base_path: "/incoming".into(),
            },
            radar: radarflow_config::RadarConfig {
                code: "RMA1".into(),
                start_instant: now_secs(),
                end_instant: None,
                extension: "BUFR".into(),
            },
            paths: radarflow_config::PathsConfig {
                download_root: "/tmp/raw".into(),
                container_root: "/tmp/out".into(),
                product_root: "/tmp/img".into(),
                decoder_resources: "/tmp/res".into(),
                decoder_library: "/tmp/librvd.so".into(),
                state_store: "/tmp/catalogue.db".into(),
            },
            volumes,
            tuning: Default::default(),
            renderer: Default::default(),
            http: Default::default(),
        })
    }

    fn record(filename: &str) -> FileRecord {
        let parsed = ParsedFilename::parse(filename).unwrap();
        FileRecord {
            filename: filename.to_string(),
            remote_path: format!("/incoming/{filename}"),
            local_path: format!("/tmp/raw/{filename}").into(),
            size: 10,
            digest: "00".repeat(32),
            radar: parsed.radar.clone(),
            field: parsed.field.clone(),
            volume_code: parsed.volume_code.clone(),
            volume_number: parsed.volume_number.clone(),
            observed_at: parsed.observed_at,
            status: FileStatus::Completed,
            created_at: now_secs(),
        }
    }

    #[tokio::test]
    async fn files_accumulate_into_a_volume() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("catalogue.db")).await.unwrap();
        let assembler = VolumeAssembler::new(store.clone(), test_config());

        let first = record("RMA1_0315_01_DBZH_20250101T120000Z.BUFR");
        assembler.record_file(&first).await.unwrap();
        assert!(store.is_file_completed(&first.filename).await.unwrap());

        let id = ParsedFilename::parse(&first.filename).unwrap().volume_id();
        let volume = store.get_volume(&id).await.unwrap().unwrap();
        assert!(!volume.is_complete);
        assert_eq!(volume.status, WorkStatus::Pending);
        assert_eq!(volume.expected_fields, vec!["DBZH", "VRAD"]);

        let second = record("RMA1_0315_01_VRAD_20250101T120000Z.BUFR");
        assembler.record_file(&second).await.unwrap();

        let volume = store.get_volume(&id).await.unwrap().unwrap();
        assert!(volume.is_complete);
    }

    #[tokio::test]
    async fn unknown_volume_code_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("catalogue.db")).await.unwrap();
        let assembler = VolumeAssembler::new(store.clone(), test_config());

        let stray = record("RMA1_9999_01_DBZH_20250101T120000Z.BUFR");
        let err = assembler.record_file(&stray).await.unwrap_err();
        assert!(err.is_fatal());

        // Nothing was committed: the file row is part of the same refused
        // transaction.
        assert!(!store.is_file_completed(&stray.filename).await.unwrap());
    }
}
