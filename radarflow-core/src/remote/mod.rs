//! Access to the remote file server.
//!
//! The walker and fetcher only ever see [`RemoteStore`]; the FTP
//! implementation and the local-directory implementation used by tests obey
//! the same contract, including the distinction between "not found" and
//! transport failure.

mod ftp;
mod local;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use ftp::FtpRemote;
pub use local::DirRemote;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("remote path not found: {0}")]
    NotFound(String),

    #[error("remote transport error: {0}")]
    Transport(String),

    #[error("remote authentication failed: {0}")]
    Auth(String),

    #[error("transfer stalled: no data within {0:?}")]
    Stalled(Duration),
}

impl RemoteError {
    /// Listing a directory that does not exist yet (future hours) is
    /// expected and handled by skipping, unlike a transport failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
}

/// Chunked byte stream of one remote file. The consumer drives the
/// inactivity timeout; the producer side simply stops sending on error.
#[derive(Debug)]
pub struct RemoteReader {
    rx: mpsc::Receiver<Result<Vec<u8>, RemoteError>>,
}

impl RemoteReader {
    pub(crate) fn new(rx: mpsc::Receiver<Result<Vec<u8>, RemoteError>>) -> Self {
        Self { rx }
    }

    /// Next chunk, `Ok(None)` at clean end of stream. An elapsed
    /// `inactivity` window aborts the transfer.
    pub async fn next_chunk(
        &mut self,
        inactivity: Duration,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        match tokio::time::timeout(inactivity, self.rx.recv()).await {
            Err(_) => Err(RemoteError::Stalled(inactivity)),
            Ok(None) => Ok(None),
            Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
            Ok(Some(Err(err))) => Err(err),
        }
    }
}

pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List the entries of a directory. Must report a missing directory as
    /// [`RemoteError::NotFound`], not as a transport failure.
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Open a file for sequential read starting at `offset` bytes.
    async fn open(&self, path: &str, offset: u64) -> Result<RemoteReader, RemoteError>;
}
