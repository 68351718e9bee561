use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::ModelError;
use crate::filename::{format_compact_instant, parse_compact_instant};

/// Identity of one logical scan volume: every file sharing this quadruple
/// belongs to the same volume regardless of its moment name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct VolumeId {
    pub radar: String,
    pub volume_code: String,
    pub volume_number: String,
    pub observed_at: DateTime<Utc>,
}

impl VolumeId {
    /// Deterministic string encoding used as the catalogue primary key,
    /// e.g. `RMA1_0315_01_20250101T120000Z`.
    pub fn encode(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.radar,
            self.volume_code,
            self.volume_number,
            format_compact_instant(self.observed_at)
        )
    }

    pub fn decode(value: &str) -> Result<Self, ModelError> {
        let mut parts = value.split('_');
        let (radar, code, num, instant) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(radar), Some(code), Some(num), Some(instant), None) => {
                (radar, code, num, instant)
            }
            _ => return Err(ModelError::VolumeId(value.to_string())),
        };

        Ok(Self {
            radar: radar.to_string(),
            volume_code: code.to_string(),
            volume_number: num.to_string(),
            observed_at: parse_compact_instant(instant)
                .map_err(|_| ModelError::VolumeId(value.to_string()))?,
        })
    }
}

impl Display for VolumeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Terminal-only state of a fetched file row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FileStatus {
    Completed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }
}

impl FromStr for FileStatus {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "completed" => Ok(FileStatus::Completed),
            "failed" => Ok(FileStatus::Failed),
            other => Err(ModelError::Status(other.to_string())),
        }
    }
}

impl Display for FileStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state shared by volume and product rows.
///
/// Advances monotonically except for the recovery transitions
/// `processing -> pending` (stuck sweep) and `failed -> pending` (operator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum WorkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Processing => "processing",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Failed)
    }
}

impl FromStr for WorkStatus {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(WorkStatus::Pending),
            "processing" => Ok(WorkStatus::Processing),
            "completed" => Ok(WorkStatus::Completed),
            "failed" => Ok(WorkStatus::Failed),
            other => Err(ModelError::Status(other.to_string())),
        }
    }
}

impl Display for WorkStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of generated visualization artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ProductKind {
    Image,
    Geotiff,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Image => "image",
            ProductKind::Geotiff => "geotiff",
        }
    }
}

impl FromStr for ProductKind {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "image" => Ok(ProductKind::Image),
            "geotiff" => Ok(ProductKind::Geotiff),
            other => Err(ModelError::ProductKind(other.to_string())),
        }
    }
}

impl Display for ProductKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short machine-readable classification recorded next to a failed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    FileNotFound,
    DecodeError,
    GeometryMismatch,
    IoError,
    ReadError,
    Standardize,
    Plot,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::FileNotFound => "FILE_NOT_FOUND",
            FailureKind::DecodeError => "DECODE_ERROR",
            FailureKind::GeometryMismatch => "GEOMETRY_MISMATCH",
            FailureKind::IoError => "IO_ERROR",
            FailureKind::ReadError => "READ_ERROR",
            FailureKind::Standardize => "STANDARDIZE",
            FailureKind::Plot => "PLOT",
        }
    }
}

impl FromStr for FailureKind {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "FILE_NOT_FOUND" => Ok(FailureKind::FileNotFound),
            "DECODE_ERROR" => Ok(FailureKind::DecodeError),
            "GEOMETRY_MISMATCH" => Ok(FailureKind::GeometryMismatch),
            "IO_ERROR" => Ok(FailureKind::IoError),
            "READ_ERROR" => Ok(FailureKind::ReadError),
            "STANDARDIZE" => Ok(FailureKind::Standardize),
            "PLOT" => Ok(FailureKind::Plot),
            other => Err(ModelError::Status(other.to_string())),
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_id() -> VolumeId {
        VolumeId {
            radar: "RMA1".into(),
            volume_code: "0315".into(),
            volume_number: "01".into(),
            observed_at: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn volume_id_encoding_round_trips() {
        let id = sample_id();
        let encoded = id.encode();
        assert_eq!(encoded, "RMA1_0315_01_20250101T120000Z");
        assert_eq!(VolumeId::decode(&encoded).unwrap(), id);
    }

    #[test]
    fn volume_id_rejects_extra_segments() {
        assert!(VolumeId::decode("RMA1_0315_01_DBZH_20250101T120000Z").is_err());
        assert!(VolumeId::decode("RMA1_0315_01").is_err());
    }

    #[test]
    fn statuses_round_trip_through_text() {
        for status in [
            WorkStatus::Pending,
            WorkStatus::Processing,
            WorkStatus::Completed,
            WorkStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<WorkStatus>().unwrap(), status);
        }
        assert!(WorkStatus::Completed.is_terminal());
        assert!(!WorkStatus::Processing.is_terminal());
        assert!("done".parse::<WorkStatus>().is_err());
    }

    #[test]
    fn failure_kind_round_trips() {
        for kind in [
            FailureKind::FileNotFound,
            FailureKind::DecodeError,
            FailureKind::GeometryMismatch,
            FailureKind::IoError,
            FailureKind::ReadError,
            FailureKind::Standardize,
            FailureKind::Plot,
        ] {
            assert_eq!(kind.as_str().parse::<FailureKind>().unwrap(), kind);
        }
    }
}
