//! Canonical in-memory radar volume: the converter builds it from decoded
//! sub-products, the container codec persists it, the renderer consumes it.

use chrono::{DateTime, Utc};

/// Canonical missing-value sentinel used across every field layer.
pub const MISSING: f32 = -9999.0;

/// Owned row-major `(rays, gates)` f32 buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatGrid {
    rays: usize,
    gates: usize,
    data: Vec<f32>,
}

impl FloatGrid {
    pub fn filled(rays: usize, gates: usize, value: f32) -> Self {
        Self {
            rays,
            gates,
            data: vec![value; rays * gates],
        }
    }

    pub fn from_vec(rays: usize, gates: usize, data: Vec<f32>) -> Result<Self, String> {
        if data.len() != rays * gates {
            return Err(format!(
                "grid data length {} does not match shape ({rays}, {gates})",
                data.len()
            ));
        }
        Ok(Self { rays, gates, data })
    }

    pub fn rays(&self) -> usize {
        self.rays
    }

    pub fn gates(&self) -> usize {
        self.gates
    }

    pub fn get(&self, ray: usize, gate: usize) -> f32 {
        self.data[ray * self.gates + gate]
    }

    pub fn set(&mut self, ray: usize, gate: usize, value: f32) {
        self.data[ray * self.gates + gate] = value;
    }

    pub fn row(&self, ray: usize) -> &[f32] {
        &self.data[ray * self.gates..(ray + 1) * self.gates]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Copy onto a wider gate axis, right-padding new gates with `fill`.
    /// The caller guarantees `gates >= self.gates`.
    pub fn padded_to_gates(&self, gates: usize, fill: f32) -> FloatGrid {
        let mut out = FloatGrid::filled(self.rays, gates, fill);
        let copy = self.gates.min(gates);
        for ray in 0..self.rays {
            let src = ray * self.gates;
            let dst = ray * gates;
            out.data[dst..dst + copy].copy_from_slice(&self.data[src..src + copy]);
        }
        out
    }

    /// Rewrite one sentinel as another, tolerating NaN sentinels.
    pub fn remap_missing(&mut self, from: f32, to: f32) {
        if from.to_bits() == to.to_bits() {
            return;
        }
        for value in &mut self.data {
            let hit = if from.is_nan() {
                value.is_nan()
            } else {
                *value == from
            };
            if hit {
                *value = to;
            }
        }
    }
}

/// One decoded, aligned scan volume with any number of moment layers.
///
/// Invariants (checked by [`RadarVolume::validate`]): every layer shares the
/// `(rays, gates)` shape, sweep boundary arrays are monotonic, and per-ray
/// times never decrease within a sweep.
#[derive(Debug, Clone)]
pub struct RadarVolume {
    pub radar: String,
    pub volume_code: String,
    pub volume_number: String,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
    pub volume_start: DateTime<Utc>,
    /// Gate center distances in meters.
    pub range_m: Vec<f32>,
    pub azimuth_deg: Vec<f32>,
    pub elevation_deg: Vec<f32>,
    /// Per-ray time as seconds since epoch.
    pub time_secs: Vec<f64>,
    pub sweep_start_ray: Vec<usize>,
    /// Inclusive end indices, parallel to `sweep_start_ray`.
    pub sweep_end_ray: Vec<usize>,
    pub fixed_angle_deg: Vec<f32>,
    pub nyquist_ms: Vec<f32>,
    pub prt_s: Vec<f32>,
    pub pulse_width_s: Vec<f32>,
    pub missing_value: f32,
    /// Moment layers in configured order.
    pub fields: Vec<(String, FloatGrid)>,
}

impl RadarVolume {
    pub fn nrays(&self) -> usize {
        self.azimuth_deg.len()
    }

    pub fn ngates(&self) -> usize {
        self.range_m.len()
    }

    pub fn nsweeps(&self) -> usize {
        self.sweep_start_ray.len()
    }

    pub fn field(&self, name: &str) -> Option<&FloatGrid> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, grid)| grid)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn add_field(&mut self, name: impl Into<String>, grid: FloatGrid) -> Result<(), String> {
        if grid.rays() != self.nrays() || grid.gates() != self.ngates() {
            return Err(format!(
                "field shape ({}, {}) does not match volume shape ({}, {})",
                grid.rays(),
                grid.gates(),
                self.nrays(),
                self.ngates()
            ));
        }
        self.fields.push((name.into(), grid));
        Ok(())
    }

    /// Ray index range of sweep `sweep`, end-exclusive.
    pub fn sweep_rays(&self, sweep: usize) -> std::ops::Range<usize> {
        self.sweep_start_ray[sweep]..self.sweep_end_ray[sweep] + 1
    }

    pub fn validate(&self) -> Result<(), String> {
        let nrays = self.nrays();
        if self.elevation_deg.len() != nrays || self.time_secs.len() != nrays {
            return Err("per-ray axes disagree on ray count".into());
        }
        if self.sweep_start_ray.len() != self.sweep_end_ray.len()
            || self.sweep_start_ray.len() != self.fixed_angle_deg.len()
        {
            return Err("per-sweep tables disagree on sweep count".into());
        }
        if self.sweep_start_ray.is_empty() {
            return Err("volume has no sweeps".into());
        }

        let mut prev_end: Option<usize> = None;
        for sweep in 0..self.nsweeps() {
            let start = self.sweep_start_ray[sweep];
            let end = self.sweep_end_ray[sweep];
            if end < start || end >= nrays {
                return Err(format!("sweep {sweep} has bounds {start}..={end}"));
            }
            if let Some(prev) = prev_end {
                if start != prev + 1 {
                    return Err(format!(
                        "sweep {sweep} starts at ray {start}, expected {}",
                        prev + 1
                    ));
                }
            } else if start != 0 {
                return Err("first sweep does not start at ray 0".into());
            }
            prev_end = Some(end);

            for ray in start..end {
                if self.time_secs[ray + 1] < self.time_secs[ray] {
                    return Err(format!("ray times decrease within sweep {sweep}"));
                }
            }
        }
        if prev_end != Some(nrays - 1) {
            return Err("sweeps do not cover every ray".into());
        }

        for (name, grid) in &self.fields {
            if grid.rays() != nrays || grid.gates() != self.ngates() {
                return Err(format!("field {name} has a mismatched shape"));
            }
        }
        Ok(())
    }
}
