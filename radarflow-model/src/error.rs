use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("unrecognized filename: {0}")]
    Filename(String),

    #[error("invalid observation instant: {0}")]
    Instant(String),

    #[error("invalid volume id: {0}")]
    VolumeId(String),

    #[error("unknown status value: {0}")]
    Status(String),

    #[error("unknown product kind: {0}")]
    ProductKind(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
