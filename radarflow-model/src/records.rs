use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::volume::{FailureKind, FileStatus, ProductKind, VolumeId, WorkStatus};

/// One remote artifact and its verified local materialization.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub size: u64,
    /// SHA-256 of the file contents, lowercase hex.
    pub digest: String,
    pub radar: String,
    pub field: String,
    pub volume_code: String,
    pub volume_number: String,
    pub observed_at: DateTime<Utc>,
    pub status: FileStatus,
    pub created_at: DateTime<Utc>,
}

/// Transient retry state for an in-flight fetch. Deleted the moment the
/// corresponding [`FileRecord`] is committed.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PartialDownload {
    pub filename: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub attempt_count: u32,
    pub last_attempt: DateTime<Utc>,
}

/// Catalogue row for one logical scan volume.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VolumeRecord {
    pub volume_id: VolumeId,
    /// Configuration-declared moment list, in configured order.
    pub expected_fields: Vec<String>,
    /// Moments whose file rows have been committed so far.
    pub downloaded_fields: Vec<String>,
    pub is_complete: bool,
    pub status: WorkStatus,
    pub output_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VolumeRecord {
    /// Expected moments not yet downloaded, in expected order.
    pub fn missing_fields(&self) -> Vec<&str> {
        self.expected_fields
            .iter()
            .filter(|field| !self.downloaded_fields.contains(field))
            .map(String::as_str)
            .collect()
    }

    pub fn covers_expected(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

/// One generated visualization artifact for one volume.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProductRecord {
    pub volume_id: VolumeId,
    pub kind: ProductKind,
    pub status: WorkStatus,
    pub generated_at: Option<DateTime<Utc>>,
    pub error_type: Option<FailureKind>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn volume(expected: &[&str], downloaded: &[&str]) -> VolumeRecord {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        VolumeRecord {
            volume_id: VolumeId {
                radar: "RMA1".into(),
                volume_code: "0315".into(),
                volume_number: "01".into(),
                observed_at: now,
            },
            expected_fields: expected.iter().map(|s| s.to_string()).collect(),
            downloaded_fields: downloaded.iter().map(|s| s.to_string()).collect(),
            is_complete: false,
            status: WorkStatus::Pending,
            output_path: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn missing_fields_preserve_expected_order() {
        let record = volume(&["DBZH", "VRAD", "ZDR"], &["ZDR"]);
        assert_eq!(record.missing_fields(), vec!["DBZH", "VRAD"]);
        assert!(!record.covers_expected());
    }

    #[test]
    fn extra_downloaded_fields_do_not_affect_coverage() {
        // A moment the expectation map never listed is recorded but changes
        // nothing: the expected set is authoritative.
        let record = volume(&["DBZH"], &["DBZH", "WRAD"]);
        assert!(record.covers_expected());
    }

    #[test]
    fn single_field_volume_completes_after_one_download() {
        let record = volume(&["DBZH"], &["DBZH"]);
        assert!(record.covers_expected());
    }
}
