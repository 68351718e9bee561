//! Statistics endpoint: a polling view of catalogue counts and worker
//! liveness.

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tracing::info;

use radarflow_core::supervisor::{Liveness, PipelineWorker, WorkerCtx};
use radarflow_core::{CoreError, Store, StoreCounts};

#[derive(Clone)]
struct StatsState {
    store: Store,
    liveness: Liveness,
}

#[derive(serde::Serialize)]
struct StatsResponse {
    counts: StoreCounts,
    workers: BTreeMap<String, DateTime<Utc>>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn stats(
    State(state): State<StatsState>,
) -> Result<Json<StatsResponse>, StatusCode> {
    let counts = state
        .store
        .counts()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let workers = state
        .liveness
        .snapshot()
        .into_iter()
        .map(|(name, beat)| (name.to_string(), beat))
        .collect();
    Ok(Json(StatsResponse { counts, workers }))
}

fn router(state: StatsState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Auxiliary worker serving the statistics view until shutdown.
pub struct StatsServer {
    listener: TcpListener,
    store: Store,
    liveness: Liveness,
}

impl StatsServer {
    pub fn new(listener: TcpListener, store: Store, liveness: Liveness) -> Self {
        Self {
            listener,
            store,
            liveness,
        }
    }
}

#[async_trait]
impl PipelineWorker for StatsServer {
    fn name(&self) -> &'static str {
        "stats-server"
    }

    async fn run(self: Box<Self>, ctx: WorkerCtx) -> radarflow_core::Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("statistics endpoint listening on {addr}");
        }
        let app = router(StatsState {
            store: self.store,
            liveness: self.liveness,
        });
        let shutdown = ctx.cancellation();

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|err| CoreError::Internal(format!("stats server failed: {err}")))
    }
}
