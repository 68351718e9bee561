//! Periodic recovery of work items whose owning worker died after claiming
//! them: `processing` rows older than the stuck timeout return to `pending`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeDelta;
use tracing::{info, warn};

use radarflow_config::Config;

use crate::error::Result;
use crate::store::{now_secs, Store};
use crate::supervisor::{PipelineWorker, WorkerCtx};

pub struct StuckSweeper {
    store: Store,
    config: Arc<Config>,
}

impl StuckSweeper {
    pub fn new(store: Store, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    async fn sweep(&self) -> Result<()> {
        let timeout = TimeDelta::from_std(self.config.tuning.stuck_timeout)
            .unwrap_or_else(|_| TimeDelta::hours(1));
        let cutoff = now_secs() - timeout;

        let volumes = self.store.reset_stuck_volumes(cutoff).await?;
        let products = self.store.reset_stuck_products(cutoff).await?;
        if volumes > 0 || products > 0 {
            warn!(volumes, products, "reset stuck rows back to pending");
        }

        let counts = self.store.counts().await?;
        info!(
            files = counts.files_completed,
            partials = counts.partial_downloads,
            volumes_pending = counts.volumes.pending,
            volumes_completed = counts.volumes.completed,
            volumes_failed = counts.volumes.failed,
            products_completed = counts.products.completed,
            products_failed = counts.products.failed,
            "pipeline statistics"
        );
        Ok(())
    }
}

#[async_trait]
impl PipelineWorker for StuckSweeper {
    fn name(&self) -> &'static str {
        "stuck-sweeper"
    }

    async fn run(self: Box<Self>, ctx: WorkerCtx) -> Result<()> {
        loop {
            ctx.beat();
            if ctx.is_shutdown() {
                return Ok(());
            }
            self.sweep().await?;
            if !ctx.sleep(self.config.tuning.stuck_sweep_interval).await {
                return Ok(());
            }
        }
    }
}
