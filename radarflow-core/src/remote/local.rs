use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use super::{RemoteEntry, RemoteError, RemoteReader, RemoteStore, CHUNK_SIZE};

/// A local directory tree obeying the remote path contract. Used by the
/// test suites and by offline reprocessing of an already-mirrored archive.
#[derive(Debug, Clone)]
pub struct DirRemote {
    root: PathBuf,
}

impl DirRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

fn classify(err: std::io::Error, path: &str) -> RemoteError {
    if err.kind() == std::io::ErrorKind::NotFound {
        RemoteError::NotFound(path.to_string())
    } else {
        RemoteError::Transport(err.to_string())
    }
}

#[async_trait]
impl RemoteStore for DirRemote {
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let dir = self.resolve(path);
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|err| classify(err, path))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|err| classify(err, path))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|err| classify(err, path))?;
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: metadata.is_file().then(|| metadata.len()),
            });
        }
        Ok(entries)
    }

    async fn open(&self, path: &str, offset: u64) -> Result<RemoteReader, RemoteError> {
        let file_path = self.resolve(path);
        let mut file = tokio::fs::File::open(&file_path)
            .await
            .map_err(|err| classify(err, path))?;

        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|err| classify(err, path))?;
        }

        let (tx, rx) = mpsc::channel::<Result<Vec<u8>, RemoteError>>(8);
        tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send(Err(RemoteError::Transport(err.to_string())))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(RemoteReader::new(rx))
    }
}
