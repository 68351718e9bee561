//! Convert stage: decode every constituent of a complete volume, align the
//! sub-products onto a common range grid, and persist one canonical
//! container per volume.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use radarflow_config::Config;
use radarflow_model::{FailureKind, VolumeId, VolumeRecord};

use crate::cfradial;
use crate::decode::{DecodeError, DecodedVolume, VolumeDecoder};
use crate::error::{CoreError, Result};
use crate::layout::container_path;
use crate::radar::{FloatGrid, RadarVolume, MISSING};
use crate::store::Store;
use crate::supervisor::{PipelineWorker, StageFlags, WorkerCtx};

/// Relative tolerance for gate size agreement across sub-products.
const GATE_SIZE_TOLERANCE: f32 = 1e-3;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Converter {
    store: Store,
    decoder: Arc<dyn VolumeDecoder>,
    config: Arc<Config>,
    flags: Arc<StageFlags>,
}

enum BuildError {
    /// Recorded into the volume row; the worker keeps running.
    Item(FailureKind, String),
    /// Shutdown observed mid-volume: leave the claim for the stuck sweep.
    Cancelled,
    Fatal(CoreError),
}

impl From<CoreError> for BuildError {
    fn from(err: CoreError) -> Self {
        if err.is_fatal() {
            BuildError::Fatal(err)
        } else {
            BuildError::Item(FailureKind::IoError, err.to_string())
        }
    }
}

impl Converter {
    pub fn new(
        store: Store,
        decoder: Arc<dyn VolumeDecoder>,
        config: Arc<Config>,
        flags: Arc<StageFlags>,
    ) -> Self {
        Self {
            store,
            decoder,
            config,
            flags,
        }
    }

    async fn process_volume(
        &self,
        record: VolumeRecord,
        cancel: CancellationToken,
    ) -> Result<()> {
        let volume_id = record.volume_id.clone();
        match self.build(&record, &cancel).await {
            Ok(output) => {
                self.store.mark_volume_processed(&volume_id, &output).await?;
                info!(volume = %volume_id, output = %output.display(), "volume converted");
            }
            Err(BuildError::Item(kind, message)) => {
                self.store
                    .mark_volume_failed(&volume_id, kind, &message)
                    .await?;
                warn!(volume = %volume_id, %kind, "conversion failed: {message}");
            }
            Err(BuildError::Cancelled) => {
                info!(volume = %volume_id, "conversion interrupted by shutdown");
            }
            Err(BuildError::Fatal(err)) => return Err(err),
        }
        Ok(())
    }

    async fn build(
        &self,
        record: &VolumeRecord,
        cancel: &CancellationToken,
    ) -> std::result::Result<PathBuf, BuildError> {
        let volume_id = &record.volume_id;
        let files = self
            .store
            .files_for_volume(volume_id)
            .await
            .map_err(BuildError::from)?;

        // Decode constituents in the expected order; the row said complete,
        // but the files can still have vanished from disk since.
        let mut parts = Vec::with_capacity(record.expected_fields.len());
        for field in &record.expected_fields {
            let file = files
                .iter()
                .find(|file| &file.field == field)
                .ok_or_else(|| {
                    BuildError::Item(
                        FailureKind::FileNotFound,
                        format!("no completed file row for field {field}"),
                    )
                })?;

            if !file.local_path.exists() {
                return Err(BuildError::Item(
                    FailureKind::FileNotFound,
                    format!("local file missing: {}", file.local_path.display()),
                ));
            }

            let decoded = self
                .decode_with_retry(file.local_path.clone(), cancel)
                .await?;
            parts.push((field.clone(), decoded));
        }

        let radar_volume = align_volume(volume_id, parts)
            .map_err(|message| BuildError::Item(FailureKind::GeometryMismatch, message))?;

        let output = container_path(&self.config.paths.container_root, volume_id);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| BuildError::Item(FailureKind::IoError, err.to_string()))?;
        }

        let write_path = output.clone();
        let write_result = tokio::task::spawn_blocking(move || {
            cfradial::write_volume(&write_path, &radar_volume)
        })
        .await;

        match write_result {
            Ok(Ok(())) => Ok(output),
            Ok(Err(err)) => {
                let _ = tokio::fs::remove_file(&output).await;
                Err(BuildError::Item(FailureKind::IoError, err.to_string()))
            }
            Err(join_err) => {
                let _ = tokio::fs::remove_file(&output).await;
                Err(BuildError::Item(
                    FailureKind::IoError,
                    format!("container write task failed: {join_err}"),
                ))
            }
        }
    }

    /// The native decoder fails sporadically on valid inputs; retry with
    /// exponential backoff, capped, a bounded number of times.
    async fn decode_with_retry(
        &self,
        path: PathBuf,
        cancel: &CancellationToken,
    ) -> std::result::Result<DecodedVolume, BuildError> {
        let attempts = self.config.tuning.decode_attempts;
        let mut delay = BACKOFF_BASE;

        for attempt in 1..=attempts {
            let decoder = self.decoder.clone();
            let decode_path = path.clone();
            let outcome =
                tokio::task::spawn_blocking(move || decoder.decode(&decode_path)).await;

            let err = match outcome {
                Ok(Ok(decoded)) => return Ok(decoded),
                Ok(Err(err)) => err,
                Err(join_err) => DecodeError::Library(format!("decoder task panicked: {join_err}")),
            };

            if attempt == attempts {
                return Err(BuildError::Item(FailureKind::DecodeError, err.to_string()));
            }
            warn!(
                path = %path.display(),
                attempt,
                "decode attempt failed, retrying in {delay:?}: {err}"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(BuildError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(BACKOFF_CAP);
        }
        unreachable!("retry loop always returns")
    }
}

#[async_trait]
impl PipelineWorker for Converter {
    fn name(&self) -> &'static str {
        "converter"
    }

    async fn run(self: Box<Self>, ctx: WorkerCtx) -> Result<()> {
        let this = *self;
        let semaphore = Arc::new(Semaphore::new(this.config.tuning.max_concurrent_decodes));
        let batch = (this.config.tuning.max_concurrent_decodes * 4) as i64;

        loop {
            ctx.beat();
            if ctx.is_shutdown() {
                return Ok(());
            }

            let candidates = this
                .store
                .claimable_volumes(&this.config.radar.code, batch)
                .await?;

            let mut claimed_any = false;
            let mut inflight: JoinSet<Result<()>> = JoinSet::new();
            for record in candidates {
                if ctx.is_shutdown() {
                    break;
                }
                if !this
                    .store
                    .claim_volume_for_processing(&record.volume_id)
                    .await?
                {
                    continue;
                }
                claimed_any = true;

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| CoreError::Internal("decode semaphore closed".into()))?;
                let job = this.clone();
                let cancel = ctx.cancellation();
                inflight.spawn(async move {
                    let _permit = permit;
                    job.process_volume(record, cancel).await
                });
            }

            while let Some(done) = inflight.join_next().await {
                match done {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => error!("conversion task panicked: {join_err}"),
                }
            }

            if !claimed_any {
                if this.flags.fetch_done()
                    && this
                        .store
                        .convert_work_remaining(&this.config.radar.code)
                        .await?
                        == 0
                {
                    info!("no fetchable input remains and every volume is terminal");
                    this.flags.mark_convert_done();
                    return Ok(());
                }
                if !ctx.sleep(this.config.tuning.poll_interval).await {
                    return Ok(());
                }
            }
        }
    }
}

/// Align decoded sub-products onto the reference range grid (the field
/// whose outermost gate covers the greatest range) and assemble the
/// canonical radar object.
fn align_volume(
    volume_id: &VolumeId,
    parts: Vec<(String, DecodedVolume)>,
) -> std::result::Result<RadarVolume, String> {
    if parts.is_empty() {
        return Err("volume has no decoded sub-products".into());
    }

    let reference_index = parts
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.1.max_range_m()
                .partial_cmp(&b.1.max_range_m())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(index, _)| index)
        .unwrap_or(0);

    let reference = &parts[reference_index].1;
    let ref_gates = reference.data.gates();
    let ref_sweep = &reference.sweeps[0];

    // Gate geometry must be uniform across the reference's sweeps for a
    // single shared range axis to make sense.
    for sweep in &reference.sweeps {
        if relative_diff(sweep.gate_size_m, ref_sweep.gate_size_m) > GATE_SIZE_TOLERANCE {
            return Err(format!(
                "gate size varies across sweeps of the reference field ({} vs {})",
                sweep.gate_size_m, ref_sweep.gate_size_m
            ));
        }
    }

    for (name, part) in &parts {
        if part.sweeps.len() != reference.sweeps.len() {
            return Err(format!(
                "field {name} has {} sweeps, reference has {}",
                part.sweeps.len(),
                reference.sweeps.len()
            ));
        }
        for (index, (sweep, ref_sweep)) in
            part.sweeps.iter().zip(&reference.sweeps).enumerate()
        {
            if sweep.nrays != ref_sweep.nrays {
                return Err(format!(
                    "field {name} sweep {index} has {} rays, reference has {}",
                    sweep.nrays, ref_sweep.nrays
                ));
            }
            if relative_diff(sweep.gate_size_m, ref_sweep.gate_size_m) > GATE_SIZE_TOLERANCE {
                return Err(format!(
                    "field {name} sweep {index} gate size {} incompatible with reference {}",
                    sweep.gate_size_m, ref_sweep.gate_size_m
                ));
            }
            if (sweep.gate_offset_m - ref_sweep.gate_offset_m).abs()
                > ref_sweep.gate_size_m * 0.5
            {
                return Err(format!(
                    "field {name} sweep {index} gate offset {} incompatible with reference {}",
                    sweep.gate_offset_m, ref_sweep.gate_offset_m
                ));
            }
        }
        if part.data.gates() > ref_gates {
            // The reference maximizes coverage; under compatible geometry a
            // wider constituent means the sweep tables are lying.
            return Err(format!(
                "field {name} has {} gates, more than the reference's {ref_gates}",
                part.data.gates()
            ));
        }
    }

    let range_m: Vec<f32> = (0..ref_gates)
        .map(|gate| ref_sweep.gate_offset_m + ref_sweep.gate_size_m * (gate as f32 + 0.5))
        .collect();

    let mut sweep_start_ray = Vec::with_capacity(reference.sweeps.len());
    let mut sweep_end_ray = Vec::with_capacity(reference.sweeps.len());
    let mut time_secs = Vec::with_capacity(reference.data.rays());
    let mut ray = 0usize;
    for sweep in &reference.sweeps {
        sweep_start_ray.push(ray);
        sweep_end_ray.push(ray + sweep.nrays - 1);

        // Per-ray times interpolate each sweep's start..end window.
        let start = sweep.start_time.timestamp_millis() as f64 / 1000.0;
        let end = sweep.end_time.timestamp_millis() as f64 / 1000.0;
        let span = (end - start).max(0.0);
        let denom = (sweep.nrays.max(2) - 1) as f64;
        for index in 0..sweep.nrays {
            time_secs.push(start + span * index as f64 / denom);
        }
        ray += sweep.nrays;
    }

    let mut volume = RadarVolume {
        radar: volume_id.radar.clone(),
        volume_code: volume_id.volume_code.clone(),
        volume_number: volume_id.volume_number.clone(),
        latitude_deg: reference.meta.latitude_deg,
        longitude_deg: reference.meta.longitude_deg,
        altitude_m: reference.meta.altitude_m,
        volume_start: volume_id.observed_at,
        range_m,
        azimuth_deg: reference.azimuth_deg.clone(),
        elevation_deg: reference.elevation_deg.clone(),
        time_secs,
        sweep_start_ray,
        sweep_end_ray,
        fixed_angle_deg: reference.sweeps.iter().map(|s| s.fixed_angle_deg).collect(),
        nyquist_ms: reference.sweeps.iter().map(|s| s.nyquist_ms).collect(),
        prt_s: reference.sweeps.iter().map(|s| s.prt_s).collect(),
        pulse_width_s: reference.sweeps.iter().map(|s| s.pulse_width_s).collect(),
        missing_value: MISSING,
        fields: Vec::new(),
    };

    for (name, part) in parts {
        let missing = part.meta.missing_value;
        let mut grid: FloatGrid = part.data.padded_to_gates(ref_gates, MISSING);
        grid.remap_missing(missing, MISSING);
        volume.add_field(name, grid)?;
    }

    volume.validate()?;
    Ok(volume)
}

fn relative_diff(a: f32, b: f32) -> f32 {
    let scale = a.abs().max(b.abs()).max(f32::EPSILON);
    (a - b).abs() / scale
}
