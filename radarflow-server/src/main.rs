mod http;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use tokio::net::TcpListener;
use tokio::select;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use radarflow_config::Config;
use radarflow_core::decode::{NativeDecoder, VolumeDecoder};
use radarflow_core::remote::{FtpRemote, RemoteStore};
use radarflow_core::{
    Converter, Fetcher, Renderer, Role, StageFlags, Store, StuckSweeper, Supervisor,
};

use http::StatsServer;

/// Continuous radar ingestion pipeline: fetch, convert, render.
#[derive(Parser, Debug)]
#[command(name = "radarflow-server", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "radarflow.toml")]
    config: PathBuf,
}

/// Grace period for workers to finish their current item on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    select! {
        result = tokio::signal::ctrl_c() => result,
        _ = term.recv() => Ok(()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "radarflow_server=info,radarflow_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(
        Config::load(&cli.config)
            .with_context(|| format!("loading configuration from {}", cli.config.display()))?,
    );
    info!(
        radar = %config.radar.code,
        start = %config.radar.start_instant,
        end = ?config.radar.end_instant,
        "configuration loaded"
    );

    for dir in [
        &config.paths.download_root,
        &config.paths.container_root,
        &config.paths.product_root,
    ] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating directory {}", dir.display()))?;
    }
    if let Some(parent) = config.paths.state_store.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    let store = Store::open(&config.paths.state_store)
        .await
        .context("opening state store")?;

    let decoder: Arc<dyn VolumeDecoder> = Arc::new(
        NativeDecoder::load(&config.paths.decoder_library, &config.paths.decoder_resources)
            .context("loading decoder library")?,
    );
    let remote: Arc<dyn RemoteStore> = Arc::new(FtpRemote::new(
        config.connection.host.clone(),
        config.connection.username.clone(),
        config.connection.password.clone(),
    ));

    let flags = Arc::new(StageFlags::default());
    let mut supervisor = Supervisor::new();

    supervisor.spawn(
        Role::Primary,
        Fetcher::new(store.clone(), remote, config.clone(), flags.clone()),
    );
    supervisor.spawn(
        Role::Primary,
        Converter::new(store.clone(), decoder, config.clone(), flags.clone()),
    );
    supervisor.spawn(
        Role::Primary,
        Renderer::new(store.clone(), config.clone(), flags).context("configuring renderer")?,
    );
    supervisor.spawn(
        Role::Auxiliary,
        StuckSweeper::new(store.clone(), config.clone()),
    );

    if let Some(listen) = config.http.listen {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("binding statistics endpoint on {listen}"))?;
        supervisor.spawn(
            Role::Auxiliary,
            StatsServer::new(listener, store.clone(), supervisor.liveness()),
        );
    }

    let result = select! {
        result = supervisor.supervise().fuse() => result,
        signal = shutdown_signal().fuse() => {
            signal.context("listening for shutdown signals")?;
            info!("shutdown signal received, draining workers");
            supervisor.shutdown(SHUTDOWN_GRACE).await
        }
    };

    // The store is always closed last, after every worker has stopped.
    store.close().await;
    result.context("pipeline failed")?;

    info!("radarflow exited cleanly");
    Ok(())
}
