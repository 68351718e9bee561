//! End-to-end pipeline scenarios over a local directory tree standing in
//! for the remote server and a deterministic decoder standing in for the
//! vendor library.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use radarflow_config::{
    Config, ConnectionConfig, HttpConfig, PathsConfig, RadarConfig, RendererConfig, TuningConfig,
};
use radarflow_core::decode::{DecodeError, DecodedVolume, SweepMeta, VolumeDecoder, VolumeMeta};
use radarflow_core::radar::FloatGrid;
use radarflow_core::remote::{DirRemote, RemoteStore};
use radarflow_core::{
    cfradial, Converter, Fetcher, Renderer, Role, StageFlags, Store, StuckSweeper, Supervisor,
};
use radarflow_model::{ParsedFilename, ProductKind, VolumeId, WorkStatus};

const DBZH_GATES: usize = 10;
const VRAD_GATES: usize = 8;
const RAYS_PER_SWEEP: usize = 4;
const SWEEPS: usize = 2;

/// Deterministic stand-in for the native decoder: geometry depends only on
/// the moment name parsed from the file path, so repeated decodes agree.
struct FakeDecoder {
    calls: AtomicU32,
    /// Number of leading invocations that fail with a sporadic error.
    fail_first: u32,
}

impl FakeDecoder {
    fn reliable() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first: 0,
        }
    }

    fn flaky(fail_first: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first,
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VolumeDecoder for FakeDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedVolume, DecodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            return Err(DecodeError::Native {
                path: path.display().to_string(),
                code: 7,
                message: "sporadic decoder hiccup".into(),
            });
        }

        let filename = path.file_name().unwrap().to_str().unwrap();
        let parsed = ParsedFilename::parse(filename).expect("pipeline only decodes parsed names");
        let (ngates, fill) = match parsed.field.as_str() {
            "VRAD" => (VRAD_GATES, -3.5f32),
            _ => (DBZH_GATES, 35.0f32),
        };

        let nrays = RAYS_PER_SWEEP * SWEEPS;
        let start = parsed.observed_at;
        let sweeps = (0..SWEEPS)
            .map(|sweep| SweepMeta {
                nrays: RAYS_PER_SWEEP,
                ngates,
                gate_size_m: 500.0,
                gate_offset_m: 0.0,
                start_time: start + chrono::TimeDelta::seconds(sweep as i64 * 15),
                end_time: start + chrono::TimeDelta::seconds(sweep as i64 * 15 + 12),
                fixed_angle_deg: 0.5 + sweep as f32,
                prt_s: 0.001,
                pulse_width_s: 1e-6,
                nyquist_ms: 8.0,
                scan_rate_deg_s: 18.0,
            })
            .collect();

        Ok(DecodedVolume {
            data: FloatGrid::filled(nrays, ngates, fill),
            azimuth_deg: (0..nrays)
                .map(|ray| (ray % RAYS_PER_SWEEP) as f32 * 90.0)
                .collect(),
            elevation_deg: (0..nrays)
                .map(|ray| 0.5 + (ray / RAYS_PER_SWEEP) as f32)
                .collect(),
            meta: VolumeMeta {
                latitude_deg: -31.44,
                longitude_deg: -64.19,
                altitude_m: 440.0,
                volume_start: start,
                missing_value: -999.0,
            },
            sweeps,
        })
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: Arc<Config>,
    remote: Arc<dyn RemoteStore>,
    store: Store,
}

async fn fixture(remote_files: &[&str]) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let server_root = dir.path().join("server");

    for filename in remote_files {
        let parsed = ParsedFilename::parse(filename).unwrap();
        let bucket = parsed.observed_at.format("%Y/%m/%d/%H/%M%S");
        let path = server_root
            .join("incoming/RMA1")
            .join(bucket.to_string())
            .join(filename);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // Payload contents only matter to the real decoder.
        std::fs::write(&path, filename.as_bytes()).unwrap();
    }

    let mut numbers = BTreeMap::new();
    numbers.insert(
        "01".to_string(),
        vec!["DBZH".to_string(), "VRAD".to_string()],
    );
    let mut volumes = BTreeMap::new();
    volumes.insert("0315".to_string(), numbers);

    let config = Arc::new(Config {
        connection: ConnectionConfig {
            host: "unused:21".into(),
            username: "radar".into(),
            password: "radar".into(),
            base_path: "/incoming".into(),
        },
        radar: RadarConfig {
            code: "RMA1".into(),
            start_instant: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
            end_instant: Some(Utc.with_ymd_and_hms(2025, 1, 1, 13, 0, 0).unwrap()),
            extension: "BUFR".into(),
        },
        paths: PathsConfig {
            download_root: dir.path().join("raw"),
            container_root: dir.path().join("cfradial"),
            product_root: dir.path().join("products"),
            decoder_resources: dir.path().join("resources"),
            decoder_library: dir.path().join("librvd.so"),
            state_store: dir.path().join("catalogue.db"),
        },
        volumes,
        tuning: TuningConfig {
            poll_interval: Duration::from_millis(50),
            decode_attempts: 3,
            ..Default::default()
        },
        renderer: RendererConfig::default(),
        http: HttpConfig::default(),
    });

    let store = Store::open(&config.paths.state_store).await.unwrap();
    let remote: Arc<dyn RemoteStore> = Arc::new(DirRemote::new(server_root));

    Fixture {
        _dir: dir,
        config,
        remote,
        store,
    }
}

async fn run_pipeline(fixture: &Fixture, decoder: Arc<dyn VolumeDecoder>) {
    let flags = Arc::new(StageFlags::default());
    let mut supervisor = Supervisor::new();

    supervisor.spawn(
        Role::Primary,
        Fetcher::new(
            fixture.store.clone(),
            fixture.remote.clone(),
            fixture.config.clone(),
            flags.clone(),
        ),
    );
    supervisor.spawn(
        Role::Primary,
        Converter::new(
            fixture.store.clone(),
            decoder,
            fixture.config.clone(),
            flags.clone(),
        ),
    );
    supervisor.spawn(
        Role::Primary,
        Renderer::new(fixture.store.clone(), fixture.config.clone(), flags).unwrap(),
    );
    supervisor.spawn(
        Role::Auxiliary,
        StuckSweeper::new(fixture.store.clone(), fixture.config.clone()),
    );

    tokio::time::timeout(Duration::from_secs(60), supervisor.supervise())
        .await
        .expect("pipeline should drain within the timeout")
        .expect("pipeline should finish cleanly");
}

fn volume_id() -> VolumeId {
    VolumeId {
        radar: "RMA1".into(),
        volume_code: "0315".into(),
        volume_number: "01".into(),
        observed_at: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn happy_path_produces_container_and_products() {
    let fixture = fixture(&[
        "RMA1_0315_01_DBZH_20250101T120000Z.BUFR",
        "RMA1_0315_01_VRAD_20250101T120000Z.BUFR",
    ])
    .await;
    let decoder = Arc::new(FakeDecoder::reliable());

    run_pipeline(&fixture, decoder.clone()).await;

    // Two file rows, verified and linked to real local files.
    for filename in [
        "RMA1_0315_01_DBZH_20250101T120000Z.BUFR",
        "RMA1_0315_01_VRAD_20250101T120000Z.BUFR",
    ] {
        assert!(fixture.store.is_file_completed(filename).await.unwrap());
    }
    let files = fixture.store.files_for_volume(&volume_id()).await.unwrap();
    assert_eq!(files.len(), 2);
    for file in &files {
        assert!(file.local_path.exists());
        let bytes = std::fs::read(&file.local_path).unwrap();
        assert_eq!(file.size, bytes.len() as u64);
        assert_eq!(file.digest, {
            use sha2::Digest;
            hex::encode(sha2::Sha256::digest(&bytes))
        });
    }

    // One completed volume with a readable container at the expected path.
    let volume = fixture
        .store
        .get_volume(&volume_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(volume.status, WorkStatus::Completed);
    let output = volume.output_path.unwrap();
    assert_eq!(
        output,
        fixture
            .config
            .paths
            .container_root
            .join("RMA1/2025/01/01/RMA1_0315_01_20250101T120000Z.nc")
    );
    let container = cfradial::read_volume(&output).unwrap();
    assert_eq!(container.field_names(), vec!["DBZH", "VRAD"]);
    assert_eq!(container.ngates(), DBZH_GATES);
    // VRAD was right-padded onto the reference grid.
    let vrad = container.field("VRAD").unwrap();
    assert_eq!(vrad.get(0, VRAD_GATES - 1), -3.5);
    assert_eq!(vrad.get(0, VRAD_GATES), container.missing_value);

    // Decoder ran exactly once per constituent.
    assert_eq!(decoder.calls(), 2);

    // Product row completed, rasters on disk: 2 fields x 2 sweeps x 2 variants.
    let product = fixture
        .store
        .get_product(&volume_id(), ProductKind::Image)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(product.status, WorkStatus::Completed);
    assert!(product.generated_at.is_some());

    let product_dir = fixture.config.paths.product_root.join("RMA1/2025/01/01");
    let mut pngs: Vec<String> = std::fs::read_dir(&product_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    pngs.sort();
    assert_eq!(pngs.len(), 8);
    assert!(pngs.contains(&"RMA1_20250101T120000Z_DBZH_0.5.png".to_string()));
    assert!(pngs.contains(&"RMA1_20250101T120000Z_DBZH_1.5_filtered.png".to_string()));
    assert!(pngs.contains(&"RMA1_20250101T120000Z_VRAD_0.5.png".to_string()));
}

#[tokio::test]
async fn rerun_is_idempotent() {
    let fixture = fixture(&[
        "RMA1_0315_01_DBZH_20250101T120000Z.BUFR",
        "RMA1_0315_01_VRAD_20250101T120000Z.BUFR",
    ])
    .await;

    let decoder = Arc::new(FakeDecoder::reliable());
    run_pipeline(&fixture, decoder.clone()).await;

    let files_before = fixture.store.files_for_volume(&volume_id()).await.unwrap();
    let volume_before = fixture
        .store
        .get_volume(&volume_id())
        .await
        .unwrap()
        .unwrap();

    // Same configuration, populated store: a no-op.
    run_pipeline(&fixture, decoder.clone()).await;

    let files_after = fixture.store.files_for_volume(&volume_id()).await.unwrap();
    assert_eq!(files_before, files_after);
    let volume_after = fixture
        .store
        .get_volume(&volume_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(volume_before, volume_after);
    // No re-decode of the already-processed volume.
    assert_eq!(decoder.calls(), 2);
}

#[tokio::test]
async fn missing_field_leaves_volume_pending() {
    let fixture = fixture(&["RMA1_0315_01_DBZH_20250101T120000Z.BUFR"]).await;
    let decoder = Arc::new(FakeDecoder::reliable());

    run_pipeline(&fixture, decoder.clone()).await;

    let volume = fixture
        .store
        .get_volume(&volume_id())
        .await
        .unwrap()
        .unwrap();
    assert!(!volume.is_complete);
    assert_eq!(volume.status, WorkStatus::Pending);
    assert_eq!(volume.missing_fields(), vec!["VRAD"]);
    assert!(volume.output_path.is_none());

    // Nothing was decoded or rendered.
    assert_eq!(decoder.calls(), 0);
    assert!(fixture
        .store
        .get_product(&volume_id(), ProductKind::Image)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn flaky_decoder_retries_and_succeeds() {
    let fixture = fixture(&[
        "RMA1_0315_01_DBZH_20250101T120000Z.BUFR",
        "RMA1_0315_01_VRAD_20250101T120000Z.BUFR",
    ])
    .await;

    // First invocation fails, the in-volume retry succeeds.
    let decoder = Arc::new(FakeDecoder::flaky(1));
    run_pipeline(&fixture, decoder.clone()).await;

    let volume = fixture
        .store
        .get_volume(&volume_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(volume.status, WorkStatus::Completed);
    assert!(volume.output_path.unwrap().exists());
    assert_eq!(decoder.calls(), 3);
}

#[tokio::test]
async fn exhausted_decoder_fails_the_volume() {
    let fixture = fixture(&[
        "RMA1_0315_01_DBZH_20250101T120000Z.BUFR",
        "RMA1_0315_01_VRAD_20250101T120000Z.BUFR",
    ])
    .await;

    // More failures than tuning.decode_attempts allows.
    let decoder = Arc::new(FakeDecoder::flaky(100));
    run_pipeline(&fixture, decoder.clone()).await;

    let volume = fixture
        .store
        .get_volume(&volume_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(volume.status, WorkStatus::Failed);
    let message = volume.error_message.unwrap();
    assert!(message.starts_with("DECODE_ERROR"), "{message}");
    assert!(volume.output_path.is_none());

    // Failed volumes are terminal: no product row was ever created.
    assert!(fixture
        .store
        .get_product(&volume_id(), ProductKind::Image)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn empty_window_exits_immediately() {
    let fixture = fixture(&[]).await;
    let mut config = (*fixture.config).clone();
    config.radar.end_instant = Some(config.radar.start_instant);
    let fixture = Fixture {
        config: Arc::new(config),
        ..fixture
    };

    let decoder = Arc::new(FakeDecoder::reliable());
    run_pipeline(&fixture, decoder.clone()).await;

    let counts = fixture.store.counts().await.unwrap();
    assert_eq!(counts.files_completed, 0);
    assert_eq!(counts.volumes.pending, 0);
    assert_eq!(decoder.calls(), 0);
}
