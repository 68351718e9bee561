//! On-disk layout of the worker-owned directory subtrees. Raw downloads,
//! containers, and products each mirror the remote calendar hierarchy.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use radarflow_model::{format_compact_instant, VolumeId};

/// `<root>/<radar>/YYYY/MM/DD`
pub fn calendar_dir(root: &Path, radar: &str, instant: DateTime<Utc>) -> PathBuf {
    root.join(radar).join(instant.format("%Y/%m/%d").to_string())
}

/// Final resting place of a raw downloaded file.
pub fn download_path(
    root: &Path,
    radar: &str,
    instant: DateTime<Utc>,
    filename: &str,
) -> PathBuf {
    calendar_dir(root, radar, instant).join(filename)
}

/// Canonical container path for a volume, e.g.
/// `<root>/RMA1/2025/01/01/RMA1_0315_01_20250101T120000Z.nc`.
pub fn container_path(root: &Path, volume: &VolumeId) -> PathBuf {
    calendar_dir(root, &volume.radar, volume.observed_at).join(format!("{}.nc", volume.encode()))
}

/// Raster path for one rendered elevation of one moment.
pub fn product_path(
    root: &Path,
    radar: &str,
    instant: DateTime<Utc>,
    field: &str,
    elevation_label: &str,
    filtered: bool,
) -> PathBuf {
    let suffix = if filtered { "_filtered" } else { "" };
    calendar_dir(root, radar, instant).join(format!(
        "{radar}_{}_{field}_{elevation_label}{suffix}.png",
        format_compact_instant(instant)
    ))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn paths_mirror_the_calendar_hierarchy() {
        let instant = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let volume = VolumeId {
            radar: "RMA1".into(),
            volume_code: "0315".into(),
            volume_number: "01".into(),
            observed_at: instant,
        };

        assert_eq!(
            download_path(
                Path::new("/raw"),
                "RMA1",
                instant,
                "RMA1_0315_01_DBZH_20250101T120000Z.BUFR"
            ),
            PathBuf::from("/raw/RMA1/2025/01/01/RMA1_0315_01_DBZH_20250101T120000Z.BUFR")
        );
        assert_eq!(
            container_path(Path::new("/out"), &volume),
            PathBuf::from("/out/RMA1/2025/01/01/RMA1_0315_01_20250101T120000Z.nc")
        );
        assert_eq!(
            product_path(Path::new("/img"), "RMA1", instant, "DBZH", "0.5", true),
            PathBuf::from("/img/RMA1/2025/01/01/RMA1_20250101T120000Z_DBZH_0.5_filtered.png")
        );
    }
}
