//! Polar-to-cartesian PPI rasterization and per-moment colour scales.

use image::{Rgba, RgbaImage};

use crate::radar::{FloatGrid, RadarVolume};

/// Correlation floor below which samples are treated as non-meteorological.
pub const RHOHV_MIN: f32 = 0.7;

/// Reflectivity floor below which co-located samples are treated as noise.
pub const DBZH_MIN: f32 = 5.0;

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Colour scale stops per moment family, linearly interpolated.
type Scale = &'static [(f32, [u8; 3])];

const REFLECTIVITY: &[(f32, [u8; 3])] = &[
    (-10.0, [120, 120, 120]),
    (0.0, [4, 233, 231]),
    (10.0, [1, 159, 244]),
    (20.0, [3, 0, 244]),
    (30.0, [2, 253, 2]),
    (40.0, [253, 248, 2]),
    (50.0, [253, 139, 0]),
    (60.0, [212, 0, 0]),
    (70.0, [248, 0, 253]),
];

const VELOCITY: &[(f32, [u8; 3])] = &[
    (-30.0, [0, 100, 0]),
    (-5.0, [150, 255, 150]),
    (0.0, [255, 255, 255]),
    (5.0, [255, 190, 190]),
    (30.0, [150, 0, 0]),
];

const CORRELATION: &[(f32, [u8; 3])] = &[
    (0.5, [40, 40, 90]),
    (0.9, [70, 160, 200]),
    (1.0, [250, 250, 110]),
];

const DIFFERENTIAL: &[(f32, [u8; 3])] = &[
    (-2.0, [60, 60, 60]),
    (0.0, [120, 170, 220]),
    (2.0, [60, 200, 60]),
    (6.0, [230, 60, 60]),
];

const GENERIC: &[(f32, [u8; 3])] = &[(0.0, [30, 30, 30]), (60.0, [230, 230, 230])];

fn scale_for(field: &str) -> Scale {
    match field {
        "DBZH" | "DBZV" | "COLMAX" => REFLECTIVITY,
        "VRAD" | "WRAD" => VELOCITY,
        "RHOHV" => CORRELATION,
        "ZDR" | "KDP" | "PHIDP" => DIFFERENTIAL,
        _ => GENERIC,
    }
}

fn colorize(stops: Scale, value: f32) -> Rgba<u8> {
    let (first, last) = (stops[0], stops[stops.len() - 1]);
    if value <= first.0 {
        return Rgba([first.1[0], first.1[1], first.1[2], 255]);
    }
    if value >= last.0 {
        return Rgba([last.1[0], last.1[1], last.1[2], 255]);
    }
    for pair in stops.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if value <= hi.0 {
            let t = (value - lo.0) / (hi.0 - lo.0);
            let mix = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * t).round() as u8;
            return Rgba([
                mix(lo.1[0], hi.1[0]),
                mix(lo.1[1], hi.1[1]),
                mix(lo.1[2], hi.1[2]),
                255,
            ]);
        }
    }
    TRANSPARENT
}

/// Sorted (azimuth, ray) pairs for nearest-ray lookup over one sweep.
struct AzimuthIndex {
    entries: Vec<(f32, usize)>,
}

impl AzimuthIndex {
    fn build(volume: &RadarVolume, sweep: usize) -> Self {
        let mut entries: Vec<(f32, usize)> = volume
            .sweep_rays(sweep)
            .map(|ray| (volume.azimuth_deg[ray].rem_euclid(360.0), ray))
            .collect();
        entries.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Self { entries }
    }

    fn nearest(&self, azimuth: f32) -> usize {
        let target = azimuth.rem_euclid(360.0);
        let position = self
            .entries
            .partition_point(|(az, _)| *az < target);

        let mut best = (f32::MAX, 0usize);
        for index in [
            position.checked_sub(1).unwrap_or(self.entries.len() - 1),
            position % self.entries.len(),
        ] {
            let (az, ray) = self.entries[index];
            let raw = (az - target).abs();
            let dist = raw.min(360.0 - raw);
            if dist < best.0 {
                best = (dist, ray);
            }
        }
        best.1
    }
}

/// Render one elevation of one moment as a north-up PPI raster. Missing
/// samples and pixels beyond the outermost gate stay transparent.
pub fn plot_sweep(
    volume: &RadarVolume,
    grid: &FloatGrid,
    sweep: usize,
    field: &str,
    size: u32,
) -> RgbaImage {
    let scale = scale_for(field);
    let index = AzimuthIndex::build(volume, sweep);

    let ngates = volume.ngates();
    let first_range = volume.range_m.first().copied().unwrap_or(0.0);
    let gate_step = if ngates > 1 {
        volume.range_m[1] - volume.range_m[0]
    } else {
        first_range.max(1.0) * 2.0
    };
    let max_range = volume.range_m.last().copied().unwrap_or(0.0) + gate_step * 0.5;

    let mut image = RgbaImage::from_pixel(size, size, TRANSPARENT);
    let center = size as f32 / 2.0;
    let meters_per_pixel = max_range / center;

    for y in 0..size {
        for x in 0..size {
            let dx = (x as f32 + 0.5 - center) * meters_per_pixel;
            let dy = (y as f32 + 0.5 - center) * meters_per_pixel;
            let radius = (dx * dx + dy * dy).sqrt();
            if radius > max_range {
                continue;
            }

            // North-up, clockwise azimuth.
            let azimuth = dx.atan2(-dy).to_degrees().rem_euclid(360.0);
            let ray = index.nearest(azimuth);

            let gate = ((radius - first_range) / gate_step).round();
            if gate < 0.0 || gate as usize >= ngates {
                continue;
            }

            let value = grid.get(ray, gate as usize);
            if value == volume.missing_value {
                continue;
            }
            image.put_pixel(x, y, colorize(scale, value));
        }
    }
    image
}

/// Column-maximum reflectivity: per azimuth of the lowest sweep, the
/// maximum DBZH over every sweep at the same gate.
pub fn colmax_grid(volume: &RadarVolume) -> Option<FloatGrid> {
    let dbzh = volume.field("DBZH")?;
    let base_rays: Vec<usize> = volume.sweep_rays(0).collect();
    let ngates = volume.ngates();

    let indexes: Vec<AzimuthIndex> = (0..volume.nsweeps())
        .map(|sweep| AzimuthIndex::build(volume, sweep))
        .collect();

    let mut grid = FloatGrid::filled(base_rays.len(), ngates, volume.missing_value);
    for (row, &base_ray) in base_rays.iter().enumerate() {
        let azimuth = volume.azimuth_deg[base_ray];
        for gate in 0..ngates {
            let mut best = volume.missing_value;
            let mut seen = false;
            for index in &indexes {
                let ray = index.nearest(azimuth);
                let value = dbzh.get(ray, gate);
                if value != volume.missing_value && (!seen || value > best) {
                    best = value;
                    seen = true;
                }
            }
            if seen {
                grid.set(row, gate, best);
            }
        }
    }
    Some(grid)
}

/// Quality-controlled copy of a moment layer: a sample becomes missing when
/// its co-located RHOHV falls below [`RHOHV_MIN`] or its co-located
/// reflectivity falls below [`DBZH_MIN`]. Layers the container lacks simply
/// contribute no mask.
pub fn apply_quality_mask(volume: &RadarVolume, grid: &FloatGrid) -> FloatGrid {
    let mut out = grid.clone();
    let rhohv = volume.field("RHOHV");
    let dbzh = volume.field("DBZH");
    if rhohv.is_none() && dbzh.is_none() {
        return out;
    }

    for ray in 0..out.rays() {
        for gate in 0..out.gates() {
            let low_quality = rhohv.is_some_and(|rhohv| {
                let quality = rhohv.get(ray, gate);
                quality == volume.missing_value || quality < RHOHV_MIN
            });
            let weak_echo = dbzh.is_some_and(|dbzh| {
                let reflectivity = dbzh.get(ray, gate);
                reflectivity == volume.missing_value || reflectivity < DBZH_MIN
            });
            if low_quality || weak_echo {
                out.set(ray, gate, volume.missing_value);
            }
        }
    }
    out
}

pub fn elevation_label(angle_deg: f32) -> String {
    format!("{angle_deg:.1}")
}
