//! Contract between the legacy binary-format decoder and the converter.
//!
//! The decoder itself is a vendor routine loaded at runtime; everything
//! above this module depends only on [`VolumeDecoder`] and its typed return
//! value.

mod native;

use std::path::Path;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use native::NativeDecoder;

use crate::radar::FloatGrid;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("decoder library unavailable: {0}")]
    Library(String),

    #[error("decoder failed on {path} with code {code}: {message}")]
    Native {
        path: String,
        code: i32,
        message: String,
    },

    #[error("decoder returned an inconsistent volume: {0}")]
    Malformed(String),
}

/// Per-sweep row of the decoder's metadata table.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepMeta {
    pub nrays: usize,
    pub ngates: usize,
    pub gate_size_m: f32,
    pub gate_offset_m: f32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub fixed_angle_deg: f32,
    pub prt_s: f32,
    pub pulse_width_s: f32,
    pub nyquist_ms: f32,
    pub scan_rate_deg_s: f32,
}

/// Volume-level metadata from the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMeta {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
    pub volume_start: DateTime<Utc>,
    /// Sentinel the decoder uses for missing samples in `data`.
    pub missing_value: f32,
}

/// Everything the decoder yields for one file: a `(total_rays, gates)` data
/// grid plus per-ray pointing and the sweep table.
#[derive(Debug, Clone)]
pub struct DecodedVolume {
    pub data: FloatGrid,
    pub azimuth_deg: Vec<f32>,
    pub elevation_deg: Vec<f32>,
    pub meta: VolumeMeta,
    pub sweeps: Vec<SweepMeta>,
}

impl DecodedVolume {
    /// Distance covered by the outermost gate; the alignment step picks the
    /// sub-product maximizing this as its reference.
    pub fn max_range_m(&self) -> f32 {
        self.sweeps
            .iter()
            .map(|sweep| sweep.gate_offset_m + sweep.gate_size_m * self.data.gates() as f32)
            .fold(0.0f32, f32::max)
    }

    /// Internal consistency: sweep table rays sum to the grid's ray count.
    pub fn validate(&self) -> Result<(), DecodeError> {
        let total: usize = self.sweeps.iter().map(|sweep| sweep.nrays).sum();
        if total != self.data.rays() {
            return Err(DecodeError::Malformed(format!(
                "sweep table covers {total} rays but grid has {}",
                self.data.rays()
            )));
        }
        if self.azimuth_deg.len() != self.data.rays()
            || self.elevation_deg.len() != self.data.rays()
        {
            return Err(DecodeError::Malformed(
                "per-ray pointing arrays disagree with grid ray count".into(),
            ));
        }
        if self.sweeps.is_empty() {
            return Err(DecodeError::Malformed("volume has no sweeps".into()));
        }
        Ok(())
    }
}

/// Synchronous by design: invocations run on the blocking pool so the
/// scheduler is never held up by the native routine.
pub trait VolumeDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<DecodedVolume, DecodeError>;
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sweep(nrays: usize, ngates: usize, gate_size: f32, offset: f32) -> SweepMeta {
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        SweepMeta {
            nrays,
            ngates,
            gate_size_m: gate_size,
            gate_offset_m: offset,
            start_time: t,
            end_time: t + chrono::TimeDelta::seconds(10),
            fixed_angle_deg: 0.5,
            prt_s: 0.001,
            pulse_width_s: 1e-6,
            nyquist_ms: 8.0,
            scan_rate_deg_s: 18.0,
        }
    }

    fn decoded(nrays: usize, ngates: usize) -> DecodedVolume {
        DecodedVolume {
            data: FloatGrid::filled(nrays, ngates, 0.0),
            azimuth_deg: vec![0.0; nrays],
            elevation_deg: vec![0.5; nrays],
            meta: VolumeMeta {
                latitude_deg: -31.44,
                longitude_deg: -64.19,
                altitude_m: 440.0,
                volume_start: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
                missing_value: -999.0,
            },
            sweeps: vec![sweep(nrays, ngates, 500.0, 0.0)],
        }
    }

    #[test]
    fn max_range_uses_the_widest_sweep() {
        let mut volume = decoded(4, 100);
        volume.sweeps = vec![
            sweep(2, 100, 500.0, 0.0),
            sweep(2, 100, 300.0, 50_000.0),
        ];
        // 50_000 + 300 * 100 = 80_000 beats 500 * 100 = 50_000.
        assert_eq!(volume.max_range_m(), 80_000.0);
    }

    #[test]
    fn ray_count_mismatch_is_malformed() {
        let mut volume = decoded(4, 10);
        volume.sweeps = vec![sweep(3, 10, 500.0, 0.0)];
        assert!(matches!(
            volume.validate(),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn consistent_volume_validates() {
        decoded(8, 16).validate().unwrap();
    }
}
