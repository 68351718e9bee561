//! Core data model definitions shared across Radarflow crates.

pub mod error;
pub mod filename;
pub mod records;
pub mod volume;

pub use error::{ModelError, Result as ModelResult};
pub use filename::{format_compact_instant, parse_compact_instant, ParsedFilename};
pub use records::{FileRecord, PartialDownload, ProductRecord, VolumeRecord};
pub use volume::{FailureKind, FileStatus, ProductKind, VolumeId, WorkStatus};
