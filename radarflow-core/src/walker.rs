//! Lazy traversal of the remote calendar hierarchy
//! `<base>/<radar>/<YYYY>/<MM>/<DD>/<HH>/<mmss>/<filename>`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeDelta, TimeZone, Timelike, Utc};
use tracing::{debug, warn};

use radarflow_model::ParsedFilename;

use crate::remote::{RemoteError, RemoteStore};

/// One remote file the fetcher should consider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub remote_path: String,
    pub filename: String,
    /// Server-reported size from the listing, when available.
    pub size: Option<u64>,
    pub observed_at: DateTime<Utc>,
}

fn truncate_to_hour(instant: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(
        instant.year(),
        instant.month(),
        instant.day(),
        instant.hour(),
        0,
        0,
    )
    .single()
    .unwrap_or(instant)
}

/// Pull-driven producer of candidate paths in non-decreasing observation
/// order. Hour directories that do not exist yet are skipped silently;
/// every other listing failure propagates to the caller.
pub struct CalendarWalker {
    remote: Arc<dyn RemoteStore>,
    base: String,
    radar: String,
    extension: String,
    listing_timeout: Duration,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    cursor: DateTime<Utc>,
    buckets: VecDeque<String>,
    files: VecDeque<Candidate>,
}

impl CalendarWalker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        base: impl Into<String>,
        radar: impl Into<String>,
        extension: impl Into<String>,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        listing_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            base: base.into(),
            radar: radar.into(),
            extension: extension.into(),
            listing_timeout,
            start,
            end,
            cursor: truncate_to_hour(start),
            buckets: VecDeque::new(),
            files: VecDeque::new(),
        }
    }

    /// Next candidate, or `None` once the walk has caught up with
    /// `min(end, now)`. In continuous mode the caller re-polls later.
    pub async fn next(&mut self) -> Result<Option<Candidate>, RemoteError> {
        loop {
            if let Some(candidate) = self.files.pop_front() {
                return Ok(Some(candidate));
            }
            if let Some(bucket) = self.buckets.pop_front() {
                self.load_bucket(&bucket).await?;
                continue;
            }

            let now = Utc::now();
            if self.cursor > now {
                return Ok(None);
            }
            if let Some(end) = self.end {
                if self.cursor >= end {
                    return Ok(None);
                }
            }

            let hour = self.cursor;
            self.cursor += TimeDelta::hours(1);
            self.load_hour(hour).await?;
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<crate::remote::RemoteEntry>, RemoteError> {
        match tokio::time::timeout(self.listing_timeout, self.remote.list_dir(path)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transport(format!(
                "listing of {path} timed out after {:?}",
                self.listing_timeout
            ))),
        }
    }

    async fn load_hour(&mut self, hour: DateTime<Utc>) -> Result<(), RemoteError> {
        let path = format!(
            "{}/{}/{}",
            self.base,
            self.radar,
            hour.format("%Y/%m/%d/%H")
        );

        let entries = match self.list(&path).await {
            Ok(entries) => entries,
            Err(err) if err.is_not_found() => {
                debug!(%path, "hour directory absent, skipping");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        // The mmss bucket encoding makes lexicographic order temporal order.
        let mut buckets: Vec<String> = entries
            .into_iter()
            .filter(|entry| entry.is_dir)
            .map(|entry| entry.name)
            .collect();
        buckets.sort();

        self.buckets
            .extend(buckets.into_iter().map(|name| format!("{path}/{name}")));
        Ok(())
    }

    async fn load_bucket(&mut self, bucket: &str) -> Result<(), RemoteError> {
        let entries = match self.list(bucket).await {
            Ok(entries) => entries,
            Err(err) if err.is_not_found() => {
                debug!(%bucket, "bucket vanished between listings, skipping");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let mut files: Vec<_> = entries
            .into_iter()
            .filter(|entry| !entry.is_dir)
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        for entry in files {
            let parsed = match ParsedFilename::parse(&entry.name) {
                Ok(parsed) => parsed,
                Err(_) => {
                    debug!(name = %entry.name, "ignoring file with foreign name");
                    continue;
                }
            };
            if !parsed.has_extension(&self.extension) {
                continue;
            }
            if parsed.radar != self.radar {
                warn!(name = %entry.name, "file for another radar in this tree, ignoring");
                continue;
            }
            if parsed.observed_at < self.start {
                continue;
            }
            if let Some(end) = self.end {
                if parsed.observed_at >= end {
                    continue;
                }
            }

            self.files.push_back(Candidate {
                remote_path: format!("{bucket}/{}", entry.name),
                filename: entry.name,
                size: entry.size,
                observed_at: parsed.observed_at,
            });
        }
        Ok(())
    }
}
