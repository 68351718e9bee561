//! Fetch stage: walk the remote calendar tree, download and verify files,
//! record outcomes in the catalogue.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use radarflow_config::Config;
use radarflow_model::{FileRecord, FileStatus, ParsedFilename, PartialDownload};

use crate::assemble::VolumeAssembler;
use crate::error::{CoreError, Result};
use crate::layout::download_path;
use crate::remote::{RemoteError, RemoteStore};
use crate::store::{now_secs, Store};
use crate::supervisor::{PipelineWorker, StageFlags, WorkerCtx};
use crate::walker::{CalendarWalker, Candidate};

pub struct Fetcher {
    store: Store,
    remote: Arc<dyn RemoteStore>,
    assembler: VolumeAssembler,
    config: Arc<Config>,
    flags: Arc<StageFlags>,
}

impl Fetcher {
    pub fn new(
        store: Store,
        remote: Arc<dyn RemoteStore>,
        config: Arc<Config>,
        flags: Arc<StageFlags>,
    ) -> Self {
        let assembler = VolumeAssembler::new(store.clone(), config.clone());
        Self {
            store,
            remote,
            assembler,
            config,
            flags,
        }
    }

    /// One pass over the remote tree, from the resume point up to
    /// `min(end, now)`. Item failures are recorded and retried next sweep;
    /// only fatal errors escape. True means the walk ran to exhaustion
    /// rather than breaking early on a listing failure or shutdown.
    async fn sweep(&self, ctx: &WorkerCtx) -> Result<bool> {
        let radar = &self.config.radar.code;
        let start = match self.store.latest_observation_instant(radar).await? {
            Some(latest) => latest.max(self.config.radar.start_instant),
            None => self.config.radar.start_instant,
        };

        let mut walker = CalendarWalker::new(
            self.remote.clone(),
            self.config.connection.base_path.clone(),
            radar.clone(),
            self.config.radar.extension.clone(),
            start,
            self.config.radar.end_instant,
            self.config.tuning.listing_timeout,
        );

        let semaphore = Arc::new(Semaphore::new(self.config.tuning.max_concurrent_downloads));
        let mut downloads: JoinSet<Result<()>> = JoinSet::new();
        let mut exhausted = false;

        loop {
            if ctx.is_shutdown() {
                break;
            }
            ctx.beat();

            let candidate = match walker.next().await {
                Ok(Some(candidate)) => candidate,
                Ok(None) => {
                    exhausted = true;
                    break;
                }
                Err(err) => {
                    warn!("remote listing failed, ending sweep early: {err}");
                    break;
                }
            };

            if self.store.is_file_completed(&candidate.filename).await? {
                debug!(filename = %candidate.filename, "already fetched, skipping");
                continue;
            }

            while let Some(done) = downloads.try_join_next() {
                absorb(done)?;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| CoreError::Internal("download semaphore closed".into()))?;

            let task = DownloadTask {
                store: self.store.clone(),
                remote: self.remote.clone(),
                assembler: self.assembler.clone(),
                config: self.config.clone(),
                cancel: ctx.cancellation(),
                candidate,
            };
            downloads.spawn(async move {
                let _permit = permit;
                task.run().await
            });
        }

        while let Some(done) = downloads.join_next().await {
            absorb(done)?;
        }
        Ok(exhausted)
    }
}

/// Collapse a finished download task: fatal errors propagate, anything else
/// was already captured into the catalogue.
fn absorb(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) if err.is_fatal() => Err(err),
        Ok(Err(err)) => {
            error!("download ended with unrecorded error: {err}");
            Ok(())
        }
        Err(join_err) => {
            error!("download task panicked: {join_err}");
            Ok(())
        }
    }
}

#[async_trait]
impl PipelineWorker for Fetcher {
    fn name(&self) -> &'static str {
        "fetcher"
    }

    async fn run(self: Box<Self>, ctx: WorkerCtx) -> Result<()> {
        loop {
            ctx.beat();
            if ctx.is_shutdown() {
                return Ok(());
            }

            let exhausted = self.sweep(&ctx).await?;

            if let Some(end) = self.config.radar.end_instant {
                if exhausted && end <= Utc::now() && self.store.partial_count().await? == 0 {
                    info!("calendar window exhausted with no outstanding partials");
                    self.flags.mark_fetch_done();
                    return Ok(());
                }
            }

            if !ctx.sleep(self.config.tuning.poll_interval).await {
                return Ok(());
            }
        }
    }
}

enum FetchFailure {
    /// Listed by the walker but absent when fetched. Logged, not retried
    /// until the next traversal cycle.
    NotFound,
    Cancelled,
    /// Transport error, truncation, or size mismatch. Retried next sweep.
    Item {
        temp_path: PathBuf,
        bytes_downloaded: u64,
        message: String,
    },
}

struct DownloadTask {
    store: Store,
    remote: Arc<dyn RemoteStore>,
    assembler: VolumeAssembler,
    config: Arc<Config>,
    cancel: CancellationToken,
    candidate: Candidate,
}

impl DownloadTask {
    async fn run(self) -> Result<()> {
        let parsed = match ParsedFilename::parse(&self.candidate.filename) {
            Ok(parsed) => parsed,
            Err(err) => {
                // The walker only yields parseable names; a race with a
                // rename on the server can still land here.
                warn!(filename = %self.candidate.filename, "unparseable candidate: {err}");
                return Ok(());
            }
        };

        match self.download(&parsed).await {
            Ok(record) => {
                self.assembler.record_file(&record).await?;
                info!(
                    filename = %record.filename,
                    size = record.size,
                    "file fetched and recorded"
                );
                Ok(())
            }
            Err(FetchFailure::NotFound) => {
                warn!(
                    filename = %self.candidate.filename,
                    "listed file absent on fetch; will reappear next cycle if real"
                );
                Ok(())
            }
            Err(FetchFailure::Cancelled) => Ok(()),
            Err(FetchFailure::Item {
                temp_path,
                bytes_downloaded,
                message,
            }) => {
                let attempts = self
                    .store
                    .get_partial(&self.candidate.filename)
                    .await?
                    .map(|partial| partial.attempt_count)
                    .unwrap_or(0)
                    + 1;

                self.store
                    .record_partial(&PartialDownload {
                        filename: self.candidate.filename.clone(),
                        remote_path: self.candidate.remote_path.clone(),
                        local_path: temp_path.clone(),
                        bytes_downloaded,
                        total_bytes: self.candidate.size,
                        attempt_count: attempts,
                        last_attempt: now_secs(),
                    })
                    .await?;

                if !self.config.tuning.resume_partial {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                }

                warn!(
                    filename = %self.candidate.filename,
                    attempt = attempts,
                    "download failed: {message}"
                );
                Ok(())
            }
        }
    }

    async fn download(
        &self,
        parsed: &ParsedFilename,
    ) -> std::result::Result<FileRecord, FetchFailure> {
        let final_path = download_path(
            &self.config.paths.download_root,
            &parsed.radar,
            parsed.observed_at,
            &self.candidate.filename,
        );
        let temp_path = PathBuf::from(format!("{}.part", final_path.display()));

        let item = |temp: &PathBuf, bytes: u64, message: String| FetchFailure::Item {
            temp_path: temp.clone(),
            bytes_downloaded: bytes,
            message,
        };

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| item(&temp_path, 0, format!("create dir: {err}")))?;
        }

        let mut hasher = Sha256::new();
        let mut bytes_downloaded: u64 = 0;

        // With resume enabled a previous attempt's temp file is continued;
        // its contents enter the running digest first.
        let mut file = if self.config.tuning.resume_partial && temp_path.exists() {
            let existing = tokio::fs::read(&temp_path)
                .await
                .map_err(|err| item(&temp_path, 0, format!("read partial: {err}")))?;
            hasher.update(&existing);
            bytes_downloaded = existing.len() as u64;
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&temp_path)
                .await
                .map_err(|err| item(&temp_path, 0, format!("open partial: {err}")))?
        } else {
            tokio::fs::File::create(&temp_path)
                .await
                .map_err(|err| item(&temp_path, 0, format!("create temp: {err}")))?
        };

        let mut reader = match self
            .remote
            .open(&self.candidate.remote_path, bytes_downloaded)
            .await
        {
            Ok(reader) => reader,
            Err(RemoteError::NotFound(_)) => return Err(FetchFailure::NotFound),
            Err(err) => return Err(item(&temp_path, bytes_downloaded, err.to_string())),
        };

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(FetchFailure::Cancelled),
                chunk = reader.next_chunk(self.config.tuning.inactivity_timeout) => chunk,
            };
            match chunk {
                Ok(None) => break,
                Ok(Some(chunk)) => {
                    file.write_all(&chunk)
                        .await
                        .map_err(|err| item(&temp_path, bytes_downloaded, format!("write: {err}")))?;
                    hasher.update(&chunk);
                    bytes_downloaded += chunk.len() as u64;
                }
                Err(RemoteError::NotFound(_)) => return Err(FetchFailure::NotFound),
                Err(err) => return Err(item(&temp_path, bytes_downloaded, err.to_string())),
            }
        }

        file.flush()
            .await
            .map_err(|err| item(&temp_path, bytes_downloaded, format!("flush: {err}")))?;
        file.sync_all()
            .await
            .map_err(|err| item(&temp_path, bytes_downloaded, format!("sync: {err}")))?;
        drop(file);

        if self.config.tuning.verify_checksums {
            if let Some(expected) = self.candidate.size {
                if bytes_downloaded != expected {
                    return Err(item(
                        &temp_path,
                        bytes_downloaded,
                        format!("size mismatch: got {bytes_downloaded}, server reported {expected}"),
                    ));
                }
            }
        }

        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|err| item(&temp_path, bytes_downloaded, format!("rename: {err}")))?;

        Ok(FileRecord {
            filename: self.candidate.filename.clone(),
            remote_path: self.candidate.remote_path.clone(),
            local_path: final_path,
            size: bytes_downloaded,
            digest: hex::encode(hasher.finalize()),
            radar: parsed.radar.clone(),
            field: parsed.field.clone(),
            volume_code: parsed.volume_code.clone(),
            volume_number: parsed.volume_number.clone(),
            observed_at: parsed.observed_at,
            status: FileStatus::Completed,
            created_at: now_secs(),
        })
    }
}
