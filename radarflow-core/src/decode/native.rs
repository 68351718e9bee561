use std::ffi::{c_char, c_int, CStr, CString};
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use libloading::Library;

use super::{DecodeError, DecodedVolume, SweepMeta, VolumeDecoder, VolumeMeta};
use crate::radar::FloatGrid;

/// Sweep row as laid out by the vendor decoder.
#[repr(C)]
struct RawSweep {
    nrays: u32,
    ngates: u32,
    gate_size_m: f32,
    gate_offset_m: f32,
    start_time: i64,
    end_time: i64,
    fixed_angle_deg: f32,
    prt_s: f32,
    pulse_width_s: f32,
    nyquist_ms: f32,
    scan_rate_deg_s: f32,
}

/// Volume header as laid out by the vendor decoder. `data`, `azimuth`,
/// `elevation` and `sweeps` stay owned by the library until `rvd_free`.
#[repr(C)]
struct RawVolume {
    total_rays: u32,
    ngates: u32,
    nsweeps: u32,
    data: *const f32,
    azimuth: *const f32,
    elevation: *const f32,
    latitude_deg: f64,
    longitude_deg: f64,
    altitude_m: f64,
    volume_time: i64,
    missing_value: f32,
    sweeps: *const RawSweep,
}

type DecodeFn = unsafe extern "C" fn(*const c_char, *const c_char, *mut *mut RawVolume) -> c_int;
type FreeFn = unsafe extern "C" fn(*mut RawVolume);
type StrerrorFn = unsafe extern "C" fn(c_int) -> *const c_char;

/// Adapter over the legacy volume decoder, loaded at runtime from the
/// configured shared library. All buffers are copied into owned Rust values
/// before the native allocation is released, so nothing above this type
/// ever sees a raw pointer.
pub struct NativeDecoder {
    // Not used directly but keeps the library mapped while the function
    // pointers below remain callable.
    _lib: Library,
    decode: DecodeFn,
    free: FreeFn,
    strerror: StrerrorFn,
    resources: PathBuf,
}

impl std::fmt::Debug for NativeDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeDecoder")
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

impl NativeDecoder {
    /// Load the decoder library and resolve its symbols. Failure here is an
    /// unrecoverable initialization error for the converter stage.
    pub fn load(library: &Path, resources: &Path) -> Result<Self, DecodeError> {
        // SAFETY:
        // - The decoder library has no initialization routines.
        // - The resolved symbols must match the declared signatures; this is
        //   part of the vendor ABI contract.
        unsafe {
            let lib = Library::new(library)
                .map_err(|err| DecodeError::Library(err.to_string()))?;
            let decode = *lib
                .get(b"rvd_decode\0")
                .map_err(|err| DecodeError::Library(err.to_string()))?;
            let free = *lib
                .get(b"rvd_free\0")
                .map_err(|err| DecodeError::Library(err.to_string()))?;
            let strerror = *lib
                .get(b"rvd_strerror\0")
                .map_err(|err| DecodeError::Library(err.to_string()))?;
            Ok(Self {
                _lib: lib,
                decode,
                free,
                strerror,
                resources: resources.to_path_buf(),
            })
        }
    }

    fn error_message(&self, code: c_int) -> String {
        // SAFETY: rvd_strerror returns a pointer to a static NUL-terminated
        // table entry, or NULL for unknown codes.
        unsafe {
            let ptr = (self.strerror)(code);
            if ptr.is_null() {
                format!("unknown decoder error {code}")
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        }
    }
}

fn c_path(path: &Path) -> Result<CString, DecodeError> {
    CString::new(path.to_string_lossy().into_owned())
        .map_err(|_| DecodeError::Malformed(format!("path contains NUL: {}", path.display())))
}

fn instant(epoch_secs: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(epoch_secs, 0)
        .single()
        .unwrap_or(chrono::DateTime::<Utc>::UNIX_EPOCH)
}

impl VolumeDecoder for NativeDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedVolume, DecodeError> {
        let file = c_path(path)?;
        let resources = c_path(&self.resources)?;

        let mut raw: *mut RawVolume = std::ptr::null_mut();
        // SAFETY: both strings are valid NUL-terminated paths and `raw` is a
        // valid out-pointer. On non-zero return the library has not
        // allocated anything.
        let code = unsafe { (self.decode)(file.as_ptr(), resources.as_ptr(), &mut raw) };
        if code != 0 {
            return Err(DecodeError::Native {
                path: path.display().to_string(),
                code,
                message: self.error_message(code),
            });
        }
        if raw.is_null() {
            return Err(DecodeError::Malformed(
                "decoder returned success but no volume".into(),
            ));
        }

        // SAFETY: on zero return the library guarantees `raw` points to a
        // RawVolume whose buffers have the advertised lengths; they are
        // copied out before rvd_free invalidates them.
        let decoded = unsafe {
            let volume = &*raw;
            let total_rays = volume.total_rays as usize;
            let ngates = volume.ngates as usize;
            let nsweeps = volume.nsweeps as usize;

            let data =
                std::slice::from_raw_parts(volume.data, total_rays * ngates).to_vec();
            let azimuth = std::slice::from_raw_parts(volume.azimuth, total_rays).to_vec();
            let elevation =
                std::slice::from_raw_parts(volume.elevation, total_rays).to_vec();
            let sweeps = std::slice::from_raw_parts(volume.sweeps, nsweeps)
                .iter()
                .map(|sweep| SweepMeta {
                    nrays: sweep.nrays as usize,
                    ngates: sweep.ngates as usize,
                    gate_size_m: sweep.gate_size_m,
                    gate_offset_m: sweep.gate_offset_m,
                    start_time: instant(sweep.start_time),
                    end_time: instant(sweep.end_time),
                    fixed_angle_deg: sweep.fixed_angle_deg,
                    prt_s: sweep.prt_s,
                    pulse_width_s: sweep.pulse_width_s,
                    nyquist_ms: sweep.nyquist_ms,
                    scan_rate_deg_s: sweep.scan_rate_deg_s,
                })
                .collect();

            let meta = VolumeMeta {
                latitude_deg: volume.latitude_deg,
                longitude_deg: volume.longitude_deg,
                altitude_m: volume.altitude_m,
                volume_start: instant(volume.volume_time),
                missing_value: volume.missing_value,
            };

            (self.free)(raw);

            DecodedVolume {
                data: FloatGrid::from_vec(total_rays, ngates, data)
                    .map_err(DecodeError::Malformed)?,
                azimuth_deg: azimuth,
                elevation_deg: elevation,
                meta,
                sweeps,
            }
        };

        decoded.validate()?;
        Ok(decoded)
    }
}
