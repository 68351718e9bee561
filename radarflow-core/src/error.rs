use thiserror::Error;

use crate::cfradial::ContainerError;
use crate::decode::DecodeError;
use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("state store migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Model(#[from] radarflow_model::ModelError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("inconsistent sweep geometry: {0}")]
    Geometry(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Fatal errors abort the owning worker and bring the supervisor down;
    /// everything else is captured into the affected row.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::Store(_) | CoreError::Migrate(_) | CoreError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
