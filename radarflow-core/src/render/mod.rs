//! Render stage: per completed volume, produce visualization rasters and
//! track each product row independently.

pub mod plot;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use radarflow_config::Config;
use radarflow_model::{FailureKind, ProductKind, VolumeRecord};

use crate::cfradial;
use crate::error::{CoreError, Result};
use crate::layout::product_path;
use crate::radar::RadarVolume;
use crate::store::Store;
use crate::supervisor::{PipelineWorker, StageFlags, WorkerCtx};

/// Aliases some upstream encoders use for the canonical moment names.
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("TH", "DBZH"),
    ("TV", "DBZV"),
    ("DBZ", "DBZH"),
    ("V", "VRAD"),
    ("VEL", "VRAD"),
    ("W", "WRAD"),
    ("RHO", "RHOHV"),
    ("PHI", "PHIDP"),
];

const ERROR_MESSAGE_LIMIT: usize = 500;

#[derive(Clone)]
pub struct Renderer {
    store: Store,
    config: Arc<Config>,
    flags: Arc<StageFlags>,
    kind: ProductKind,
}

impl Renderer {
    pub fn new(store: Store, config: Arc<Config>, flags: Arc<StageFlags>) -> Result<Self> {
        let kind = config
            .renderer
            .product_type
            .parse::<ProductKind>()
            .map_err(|err| CoreError::Config(err.to_string()))?;
        Ok(Self {
            store,
            config,
            flags,
            kind,
        })
    }

    async fn render_volume(&self, record: VolumeRecord) -> Result<()> {
        let volume_id = record.volume_id.clone();
        let config = self.config.clone();
        let kind = self.kind;

        let outcome =
            tokio::task::spawn_blocking(move || render_blocking(&config, kind, &record)).await;

        match outcome {
            Ok(Ok(rasters)) => {
                self.store.mark_product_completed(&volume_id, kind).await?;
                info!(volume = %volume_id, rasters, "products rendered");
            }
            Ok(Err((error, message))) => {
                self.store
                    .mark_product_failed(&volume_id, kind, error, &truncate(&message))
                    .await?;
                warn!(volume = %volume_id, %error, "rendering failed: {message}");
            }
            Err(join_err) => {
                self.store
                    .mark_product_failed(
                        &volume_id,
                        kind,
                        FailureKind::Plot,
                        &truncate(&format!("render task failed: {join_err}")),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineWorker for Renderer {
    fn name(&self) -> &'static str {
        "renderer"
    }

    async fn run(self: Box<Self>, ctx: WorkerCtx) -> Result<()> {
        let this = *self;
        let semaphore = Arc::new(Semaphore::new(this.config.tuning.max_concurrent_renders));
        let batch = (this.config.tuning.max_concurrent_renders * 4) as i64;

        loop {
            ctx.beat();
            if ctx.is_shutdown() {
                return Ok(());
            }

            let candidates = this
                .store
                .list_volumes_for_rendering(&this.config.radar.code, this.kind, batch)
                .await?;

            let mut inflight: JoinSet<Result<()>> = JoinSet::new();
            for record in candidates {
                if ctx.is_shutdown() {
                    break;
                }
                if !this
                    .store
                    .claim_product(&record.volume_id, this.kind)
                    .await?
                {
                    continue;
                }

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| CoreError::Internal("render semaphore closed".into()))?;
                let job = this.clone();
                inflight.spawn(async move {
                    let _permit = permit;
                    job.render_volume(record).await
                });
            }

            while let Some(done) = inflight.join_next().await {
                match done {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => error!("render task panicked: {join_err}"),
                }
            }

            // Failed products stay in the candidate list for the operator's
            // sake, so this stage makes one attempt per sweep: check the
            // drain condition, then sleep out the interval.
            if this.flags.convert_done()
                && this
                    .store
                    .render_work_remaining(&this.config.radar.code, this.kind)
                    .await?
                    == 0
            {
                info!("conversion drained and no render candidates remain");
                return Ok(());
            }
            if !ctx.sleep(this.config.tuning.poll_interval).await {
                return Ok(());
            }
        }
    }
}

fn truncate(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_LIMIT {
        return message.to_string();
    }
    let mut end = ERROR_MESSAGE_LIMIT;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// Rename alias moments to the canonical set, dropping an alias whose
/// canonical name is already present.
fn standardize_fields(volume: &mut RadarVolume) {
    let mut fields = std::mem::take(&mut volume.fields);
    let mut seen: Vec<String> = fields.iter().map(|(name, _)| name.clone()).collect();

    for (name, _) in &mut fields {
        if let Some((_, canonical)) = FIELD_ALIASES
            .iter()
            .find(|(alias, _)| *alias == name.as_str())
        {
            if !seen.iter().any(|existing| existing == canonical) {
                seen.push(canonical.to_string());
                *name = canonical.to_string();
            }
        }
    }

    // A duplicate canonical name can only come from an alias losing the
    // race above; keep the first occurrence.
    let mut kept: Vec<(String, crate::radar::FloatGrid)> = Vec::with_capacity(fields.len());
    for (name, grid) in fields {
        if kept.iter().any(|(existing, _)| *existing == name) {
            warn!(field = %name, "dropping duplicate moment after standardization");
            continue;
        }
        kept.push((name, grid));
    }
    volume.fields = kept;
}

type RenderFailure = (FailureKind, String);

/// The synchronous rendering path: read the container, standardize, plot
/// every configured moment per elevation plus the filtered variants.
/// Returns the number of rasters written.
fn render_blocking(
    config: &Config,
    kind: ProductKind,
    record: &VolumeRecord,
) -> std::result::Result<usize, RenderFailure> {
    if kind != ProductKind::Image {
        return Err((
            FailureKind::Plot,
            format!("product kind {kind} is not supported by this renderer"),
        ));
    }

    let container = record
        .output_path
        .as_ref()
        .ok_or_else(|| {
            (
                FailureKind::ReadError,
                "volume row carries no output path".to_string(),
            )
        })?;
    if !container.exists() {
        return Err((
            FailureKind::FileNotFound,
            format!("container missing: {}", container.display()),
        ));
    }

    let mut volume = cfradial::read_volume(container)
        .map_err(|err| (FailureKind::ReadError, err.to_string()))?;

    standardize_fields(&mut volume);

    if config.renderer.add_colmax {
        if let Some(colmax) = plot::colmax_grid(&volume) {
            // Pseudo-volume sharing the lowest sweep's geometry.
            let rays = colmax.rays();
            let mut flat = volume.clone();
            flat.azimuth_deg = volume.azimuth_deg[volume.sweep_rays(0)].to_vec();
            flat.elevation_deg = vec![0.0; rays];
            flat.time_secs = volume.time_secs[volume.sweep_rays(0)].to_vec();
            flat.sweep_start_ray = vec![0];
            flat.sweep_end_ray = vec![rays - 1];
            flat.fixed_angle_deg = vec![0.0];
            flat.fields = vec![("COLMAX".to_string(), colmax)];

            let path = product_path(
                &config.paths.product_root,
                &volume.radar,
                record.volume_id.observed_at,
                "COLMAX",
                "max",
                false,
            );
            let grid = &flat.fields[0].1;
            let image = plot::plot_sweep(&flat, grid, 0, "COLMAX", config.renderer.image_size);
            write_image(&image, &path)?;
        }
    }

    let configured: Vec<String> = match &config.renderer.fields {
        Some(fields) => fields.clone(),
        None => volume
            .field_names()
            .iter()
            .map(|name| name.to_string())
            .collect(),
    };

    let mut rasters = 0usize;
    for field in &configured {
        // Effectively-complete volumes may miss optional moments; skip them.
        let Some(grid) = volume.field(field) else {
            continue;
        };
        let masked = plot::apply_quality_mask(&volume, grid);

        for sweep in 0..volume.nsweeps() {
            let label = plot::elevation_label(volume.fixed_angle_deg[sweep]);
            let plain = product_path(
                &config.paths.product_root,
                &volume.radar,
                record.volume_id.observed_at,
                field,
                &label,
                false,
            );
            let image =
                plot::plot_sweep(&volume, grid, sweep, field, config.renderer.image_size);
            write_image(&image, &plain)?;

            let filtered = product_path(
                &config.paths.product_root,
                &volume.radar,
                record.volume_id.observed_at,
                field,
                &label,
                true,
            );
            let image =
                plot::plot_sweep(&volume, &masked, sweep, field, config.renderer.image_size);
            write_image(&image, &filtered)?;

            rasters += 2;
        }
    }

    if config.renderer.add_colmax && volume.field("DBZH").is_some() {
        rasters += 1;
    }
    Ok(rasters)
}

fn write_image(
    image: &image::RgbaImage,
    path: &Path,
) -> std::result::Result<(), RenderFailure> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| (FailureKind::IoError, err.to_string()))?;
    }
    image
        .save(path)
        .map_err(|err| (FailureKind::Plot, err.to_string()))
}
