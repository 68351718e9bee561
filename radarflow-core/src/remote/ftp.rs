use std::io::Read;

use async_trait::async_trait;
use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{RemoteEntry, RemoteError, RemoteReader, RemoteStore, CHUNK_SIZE};

/// FTP-backed remote store. suppaftp is a blocking client, so every
/// operation runs on the blocking pool, mirroring how the decoder is driven.
/// Sessions are per-operation: radar servers drop idle control connections
/// faster than the poll interval.
#[derive(Debug, Clone)]
pub struct FtpRemote {
    addr: String,
    username: String,
    password: String,
}

impl FtpRemote {
    pub fn new(addr: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    fn session(&self) -> Result<FtpStream, RemoteError> {
        let mut ftp = FtpStream::connect(&self.addr)
            .map_err(|err| classify(err, &self.addr))?;
        ftp.login(&self.username, &self.password)
            .map_err(|err| RemoteError::Auth(err.to_string()))?;
        ftp.transfer_type(FileType::Binary)
            .map_err(|err| classify(err, &self.addr))?;
        Ok(ftp)
    }
}

fn classify(err: FtpError, path: &str) -> RemoteError {
    match &err {
        FtpError::UnexpectedResponse(response) if response.status == Status::FileUnavailable => {
            RemoteError::NotFound(path.to_string())
        }
        _ => RemoteError::Transport(err.to_string()),
    }
}

#[async_trait]
impl RemoteStore for FtpRemote {
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let remote = self.clone();
        let path = path.to_string();

        tokio::task::spawn_blocking(move || {
            let mut ftp = remote.session()?;
            let lines = ftp.list(Some(&path)).map_err(|err| classify(err, &path))?;
            let _ = ftp.quit();

            let mut entries = Vec::with_capacity(lines.len());
            for line in lines {
                match line.parse::<ListEntry>() {
                    Ok(parsed) => entries.push(RemoteEntry {
                        name: parsed.name().to_string(),
                        is_dir: parsed.is_directory(),
                        size: (!parsed.is_directory()).then(|| parsed.size() as u64),
                    }),
                    Err(err) => {
                        debug!(%path, line, "skipping unparseable listing line: {err}");
                    }
                }
            }
            Ok(entries)
        })
        .await
        .map_err(|err| RemoteError::Transport(format!("listing task failed: {err}")))?
    }

    async fn open(&self, path: &str, offset: u64) -> Result<RemoteReader, RemoteError> {
        let remote = self.clone();
        let path = path.to_string();
        let (tx, rx) = mpsc::channel::<Result<Vec<u8>, RemoteError>>(8);

        tokio::task::spawn_blocking(move || {
            let mut ftp = match remote.session() {
                Ok(ftp) => ftp,
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                    return;
                }
            };

            let mut stream = match ftp.retr_as_stream(&path) {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = tx.blocking_send(Err(classify(err, &path)));
                    return;
                }
            };

            // REST support varies across servers; already-fetched bytes are
            // skipped client side instead.
            let mut to_skip = offset;
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = if to_skip >= n as u64 {
                            to_skip -= n as u64;
                            continue;
                        } else if to_skip > 0 {
                            let skip = to_skip as usize;
                            to_skip = 0;
                            buf[skip..n].to_vec()
                        } else {
                            buf[..n].to_vec()
                        };
                        if tx.blocking_send(Ok(chunk)).is_err() {
                            // Receiver gone: the fetch was cancelled.
                            drop(stream);
                            let _ = ftp.quit();
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = tx.blocking_send(Err(RemoteError::Transport(err.to_string())));
                        return;
                    }
                }
            }

            if let Err(err) = ftp.finalize_retr_stream(stream) {
                warn!(%path, "failed to finalize transfer: {err}");
                let _ = tx.blocking_send(Err(classify(err, &path)));
                return;
            }
            let _ = ftp.quit();
        });

        Ok(RemoteReader::new(rx))
    }
}
