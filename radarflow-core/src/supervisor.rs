//! Lifecycle of the pipeline workers.
//!
//! Every worker is a loop that observes a shared cancellation token at each
//! suspension point. The supervisor joins them, propagates the first fatal
//! error, and cancels the auxiliary tasks once every primary stage has
//! drained in bounded-window mode.

use std::collections::HashMap;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;

/// Completion flags the stages use to coordinate draining when an end
/// instant is configured. Monotonic: once set they stay set.
#[derive(Debug, Default)]
pub struct StageFlags {
    fetch_done: AtomicBool,
    convert_done: AtomicBool,
}

impl StageFlags {
    pub fn mark_fetch_done(&self) {
        self.fetch_done.store(true, Ordering::SeqCst);
    }

    pub fn fetch_done(&self) -> bool {
        self.fetch_done.load(Ordering::SeqCst)
    }

    pub fn mark_convert_done(&self) {
        self.convert_done.store(true, Ordering::SeqCst);
    }

    pub fn convert_done(&self) -> bool {
        self.convert_done.load(Ordering::SeqCst)
    }
}

/// Last heartbeat instant per worker, for the statistics view.
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    beats: Arc<Mutex<HashMap<&'static str, DateTime<Utc>>>>,
}

impl Liveness {
    fn beat(&self, name: &'static str) {
        if let Ok(mut beats) = self.beats.lock() {
            beats.insert(name, Utc::now());
        }
    }

    pub fn snapshot(&self) -> HashMap<&'static str, DateTime<Utc>> {
        self.beats.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

/// Handle passed into a worker's run loop.
#[derive(Debug)]
pub struct WorkerCtx {
    name: &'static str,
    shutdown: CancellationToken,
    liveness: Liveness,
}

impl WorkerCtx {
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn wait_shutdown(&self) {
        self.shutdown.cancelled().await
    }

    /// Token for sub-tasks the worker spawns itself.
    pub fn cancellation(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Refresh this worker's liveness indicator. Called once per loop
    /// iteration.
    pub fn beat(&self) {
        self.liveness.beat(self.name);
    }

    /// Cancellable sleep. False means shutdown fired before the interval
    /// elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Drains and finishes on its own in bounded-window mode.
    Primary,
    /// Runs until cancelled.
    Auxiliary,
}

#[async_trait]
pub trait PipelineWorker: Send + 'static {
    fn name(&self) -> &'static str;
    async fn run(self: Box<Self>, ctx: WorkerCtx) -> Result<()>;
}

pub struct Supervisor {
    shutdown: CancellationToken,
    liveness: Liveness,
    tasks: JoinSet<(&'static str, Role, Result<()>)>,
    primaries: usize,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            liveness: Liveness::default(),
            tasks: JoinSet::new(),
            primaries: 0,
        }
    }

    /// Token to wire into signal handling: cancelling it drains the whole
    /// pipeline.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    pub fn spawn<W: PipelineWorker>(&mut self, role: Role, worker: W) {
        let name = worker.name();
        let ctx = WorkerCtx {
            name,
            shutdown: self.shutdown.child_token(),
            liveness: self.liveness.clone(),
        };
        if role == Role::Primary {
            self.primaries += 1;
        }
        info!(worker = name, ?role, "spawning worker");
        self.tasks
            .spawn(async move { (name, role, Box::new(worker).run(ctx).await) });
    }

    /// Join workers until all complete. The first worker error cancels the
    /// rest and is returned once they have drained.
    pub async fn supervise(&mut self) -> Result<()> {
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, role, Ok(()))) => {
                    info!(worker = name, "worker finished");
                    if role == Role::Primary {
                        self.primaries -= 1;
                        if self.primaries == 0 {
                            info!("all primary stages drained, cancelling auxiliaries");
                            self.shutdown.cancel();
                        }
                    }
                }
                Ok((name, _, Err(err))) => {
                    error!(worker = name, "worker failed: {err}");
                    self.shutdown.cancel();
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    if join_err.is_panic() {
                        panic::resume_unwind(join_err.into_panic());
                    }
                    warn!("worker task aborted");
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Cancel everything and wait up to `grace` for workers to finish their
    /// current item, then abort what remains.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        self.shutdown.cancel();

        tokio::select! {
            result = self.supervise() => result,
            _ = tokio::time::sleep(grace) => {
                warn!("workers did not drain within {grace:?}, aborting");
                self.tasks.abort_all();
                self.supervise().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Finishes;

    #[async_trait]
    impl PipelineWorker for Finishes {
        fn name(&self) -> &'static str {
            "finishes"
        }

        async fn run(self: Box<Self>, ctx: WorkerCtx) -> Result<()> {
            ctx.beat();
            Ok(())
        }
    }

    struct RunsUntilCancelled;

    #[async_trait]
    impl PipelineWorker for RunsUntilCancelled {
        fn name(&self) -> &'static str {
            "aux"
        }

        async fn run(self: Box<Self>, ctx: WorkerCtx) -> Result<()> {
            ctx.wait_shutdown().await;
            Ok(())
        }
    }

    struct Fails;

    #[async_trait]
    impl PipelineWorker for Fails {
        fn name(&self) -> &'static str {
            "fails"
        }

        async fn run(self: Box<Self>, _ctx: WorkerCtx) -> Result<()> {
            Err(crate::CoreError::Internal("boom".into()))
        }
    }

    #[tokio::test]
    async fn auxiliaries_are_cancelled_once_primaries_drain() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn(Role::Primary, Finishes);
        supervisor.spawn(Role::Auxiliary, RunsUntilCancelled);

        supervisor.supervise().await.unwrap();
    }

    #[tokio::test]
    async fn worker_error_cancels_the_rest_and_propagates() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn(Role::Primary, Fails);
        supervisor.spawn(Role::Auxiliary, RunsUntilCancelled);

        let err = supervisor.supervise().await.unwrap_err();
        assert!(matches!(err, crate::CoreError::Internal(_)));
    }

    #[tokio::test]
    async fn external_cancellation_drains_cleanly() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn(Role::Auxiliary, RunsUntilCancelled);

        let token = supervisor.cancellation_token();
        token.cancel();
        supervisor.supervise().await.unwrap();
    }

    #[tokio::test]
    async fn liveness_records_heartbeats() {
        let mut supervisor = Supervisor::new();
        let liveness = supervisor.liveness();
        supervisor.spawn(Role::Primary, Finishes);
        supervisor.supervise().await.unwrap();

        assert!(liveness.snapshot().contains_key("finishes"));
    }
}
