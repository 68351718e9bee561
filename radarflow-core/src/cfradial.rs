//! CF/Radial-style canonical container, encoded as NetCDF-3 classic.
//!
//! The classic format is small and fully specified, so it is written and
//! read directly rather than through the C libnetcdf binding: a big-endian
//! header describing dimensions, attributes and variables, followed by each
//! variable's data at a recorded offset.

use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::radar::{FloatGrid, RadarVolume, MISSING};

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed container: {0}")]
    Format(String),
}

const MAGIC: [u8; 4] = [b'C', b'D', b'F', 0x01];
const NC_DIMENSION: u32 = 0x0A;
const NC_VARIABLE: u32 = 0x0B;
const NC_ATTRIBUTE: u32 = 0x0C;

const NC_CHAR: u32 = 2;
const NC_INT: u32 = 4;
const NC_FLOAT: u32 = 5;
const NC_DOUBLE: u32 = 6;

/// Attribute or variable payload. Only the types the radar container needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Char(String),
    Int(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl Value {
    fn nc_type(&self) -> u32 {
        match self {
            Value::Char(_) => NC_CHAR,
            Value::Int(_) => NC_INT,
            Value::Float(_) => NC_FLOAT,
            Value::Double(_) => NC_DOUBLE,
        }
    }

    fn nelems(&self) -> usize {
        match self {
            Value::Char(text) => text.len(),
            Value::Int(values) => values.len(),
            Value::Float(values) => values.len(),
            Value::Double(values) => values.len(),
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            Value::Char(text) => text.len(),
            Value::Int(values) => values.len() * 4,
            Value::Float(values) => values.len() * 4,
            Value::Double(values) => values.len() * 8,
        }
    }

    fn write_padded(&self, out: &mut Vec<u8>) -> Result<(), ContainerError> {
        match self {
            Value::Char(text) => out.extend_from_slice(text.as_bytes()),
            Value::Int(values) => {
                for value in values {
                    out.write_i32::<BigEndian>(*value)?;
                }
            }
            Value::Float(values) => {
                for value in values {
                    out.write_f32::<BigEndian>(*value)?;
                }
            }
            Value::Double(values) => {
                for value in values {
                    out.write_f64::<BigEndian>(*value)?;
                }
            }
        }
        pad(out);
        Ok(())
    }

    fn read(
        cursor: &mut Cursor<&[u8]>,
        nc_type: u32,
        nelems: usize,
    ) -> Result<Value, ContainerError> {
        let value = match nc_type {
            NC_CHAR => {
                let mut bytes = vec![0u8; nelems];
                cursor.read_exact(&mut bytes)?;
                Value::Char(String::from_utf8_lossy(&bytes).into_owned())
            }
            NC_INT => {
                let mut values = Vec::with_capacity(nelems);
                for _ in 0..nelems {
                    values.push(cursor.read_i32::<BigEndian>()?);
                }
                Value::Int(values)
            }
            NC_FLOAT => {
                let mut values = Vec::with_capacity(nelems);
                for _ in 0..nelems {
                    values.push(cursor.read_f32::<BigEndian>()?);
                }
                Value::Float(values)
            }
            NC_DOUBLE => {
                let mut values = Vec::with_capacity(nelems);
                for _ in 0..nelems {
                    values.push(cursor.read_f64::<BigEndian>()?);
                }
                Value::Double(values)
            }
            other => {
                return Err(ContainerError::Format(format!(
                    "unsupported nc_type {other}"
                )))
            }
        };
        skip_padding(cursor, value.byte_len());
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dim {
    pub name: String,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Var {
    pub name: String,
    /// Indices into the dataset's dimension list; empty means scalar.
    pub dims: Vec<usize>,
    pub atts: Vec<(String, Value)>,
    pub data: Value,
}

impl Var {
    pub fn att(&self, name: &str) -> Option<&Value> {
        self.atts
            .iter()
            .find(|(att, _)| att == name)
            .map(|(_, value)| value)
    }
}

/// A fully materialized classic dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub dims: Vec<Dim>,
    pub gatts: Vec<(String, Value)>,
    pub vars: Vec<Var>,
}

fn pad(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn skip_padding(cursor: &mut Cursor<&[u8]>, byte_len: usize) {
    let rem = byte_len % 4;
    if rem != 0 {
        cursor.set_position(cursor.position() + (4 - rem) as u64);
    }
}

fn write_name(out: &mut Vec<u8>, name: &str) -> Result<(), ContainerError> {
    out.write_u32::<BigEndian>(name.len() as u32)?;
    out.extend_from_slice(name.as_bytes());
    pad(out);
    Ok(())
}

fn read_name(cursor: &mut Cursor<&[u8]>) -> Result<String, ContainerError> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    skip_padding(cursor, len);
    String::from_utf8(bytes).map_err(|_| ContainerError::Format("non-utf8 name".into()))
}

fn write_att_list(
    out: &mut Vec<u8>,
    atts: &[(String, Value)],
) -> Result<(), ContainerError> {
    if atts.is_empty() {
        out.write_u32::<BigEndian>(0)?;
        out.write_u32::<BigEndian>(0)?;
        return Ok(());
    }
    out.write_u32::<BigEndian>(NC_ATTRIBUTE)?;
    out.write_u32::<BigEndian>(atts.len() as u32)?;
    for (name, value) in atts {
        write_name(out, name)?;
        out.write_u32::<BigEndian>(value.nc_type())?;
        out.write_u32::<BigEndian>(value.nelems() as u32)?;
        value.write_padded(out)?;
    }
    Ok(())
}

fn read_att_list(cursor: &mut Cursor<&[u8]>) -> Result<Vec<(String, Value)>, ContainerError> {
    let tag = cursor.read_u32::<BigEndian>()?;
    let count = cursor.read_u32::<BigEndian>()? as usize;
    if tag == 0 {
        return Ok(Vec::new());
    }
    if tag != NC_ATTRIBUTE {
        return Err(ContainerError::Format(format!(
            "expected attribute list tag, found {tag:#x}"
        )));
    }
    let mut atts = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_name(cursor)?;
        let nc_type = cursor.read_u32::<BigEndian>()?;
        let nelems = cursor.read_u32::<BigEndian>()? as usize;
        atts.push((name, Value::read(cursor, nc_type, nelems)?));
    }
    Ok(atts)
}

impl Dataset {
    pub fn var(&self, name: &str) -> Option<&Var> {
        self.vars.iter().find(|var| var.name == name)
    }

    pub fn gatt(&self, name: &str) -> Option<&Value> {
        self.gatts
            .iter()
            .find(|(att, _)| att == name)
            .map(|(_, value)| value)
    }

    fn var_len(&self, var: &Var) -> usize {
        var.dims
            .iter()
            .map(|&dim| self.dims[dim].len)
            .product::<usize>()
    }

    fn padded_size(&self, var: &Var) -> usize {
        let size = match &var.data {
            Value::Char(_) => self.var_len(var),
            Value::Int(_) | Value::Float(_) => self.var_len(var) * 4,
            Value::Double(_) => self.var_len(var) * 8,
        };
        size.div_ceil(4) * 4
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ContainerError> {
        for var in &self.vars {
            if var.data.nelems() != self.var_len(var) {
                return Err(ContainerError::Format(format!(
                    "variable {} holds {} elements for a shape of {}",
                    var.name,
                    var.data.nelems(),
                    self.var_len(var)
                )));
            }
        }

        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.write_u32::<BigEndian>(0)?; // numrecs: no record dimension

        if self.dims.is_empty() {
            out.write_u32::<BigEndian>(0)?;
            out.write_u32::<BigEndian>(0)?;
        } else {
            out.write_u32::<BigEndian>(NC_DIMENSION)?;
            out.write_u32::<BigEndian>(self.dims.len() as u32)?;
            for dim in &self.dims {
                write_name(&mut out, &dim.name)?;
                out.write_u32::<BigEndian>(dim.len as u32)?;
            }
        }

        write_att_list(&mut out, &self.gatts)?;

        let mut begin_positions = Vec::with_capacity(self.vars.len());
        if self.vars.is_empty() {
            out.write_u32::<BigEndian>(0)?;
            out.write_u32::<BigEndian>(0)?;
        } else {
            out.write_u32::<BigEndian>(NC_VARIABLE)?;
            out.write_u32::<BigEndian>(self.vars.len() as u32)?;
            for var in &self.vars {
                write_name(&mut out, &var.name)?;
                out.write_u32::<BigEndian>(var.dims.len() as u32)?;
                for &dim in &var.dims {
                    out.write_u32::<BigEndian>(dim as u32)?;
                }
                write_att_list(&mut out, &var.atts)?;
                out.write_u32::<BigEndian>(var.data.nc_type())?;
                out.write_u32::<BigEndian>(self.padded_size(var) as u32)?;
                begin_positions.push(out.len());
                out.write_u32::<BigEndian>(0)?; // patched below
            }
        }

        // Header finished: assign offsets and patch the begin fields.
        let mut offset = out.len();
        for (var, patch_at) in self.vars.iter().zip(begin_positions) {
            out[patch_at..patch_at + 4].copy_from_slice(&(offset as u32).to_be_bytes());
            offset += self.padded_size(var);
        }

        for var in &self.vars {
            var.data.write_padded(&mut out)?;
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContainerError> {
        let mut cursor = Cursor::new(bytes);

        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(ContainerError::Format("bad magic".into()));
        }
        let _numrecs = cursor.read_u32::<BigEndian>()?;

        let tag = cursor.read_u32::<BigEndian>()?;
        let count = cursor.read_u32::<BigEndian>()? as usize;
        let mut dims = Vec::new();
        if tag == NC_DIMENSION {
            for _ in 0..count {
                let name = read_name(&mut cursor)?;
                let len = cursor.read_u32::<BigEndian>()? as usize;
                dims.push(Dim { name, len });
            }
        } else if tag != 0 {
            return Err(ContainerError::Format(format!(
                "expected dimension list tag, found {tag:#x}"
            )));
        }

        let gatts = read_att_list(&mut cursor)?;

        let tag = cursor.read_u32::<BigEndian>()?;
        let count = cursor.read_u32::<BigEndian>()? as usize;
        let mut headers = Vec::new();
        if tag == NC_VARIABLE {
            for _ in 0..count {
                let name = read_name(&mut cursor)?;
                let ndims = cursor.read_u32::<BigEndian>()? as usize;
                let mut var_dims = Vec::with_capacity(ndims);
                for _ in 0..ndims {
                    let dim = cursor.read_u32::<BigEndian>()? as usize;
                    if dim >= dims.len() {
                        return Err(ContainerError::Format(format!(
                            "variable {name} references unknown dimension {dim}"
                        )));
                    }
                    var_dims.push(dim);
                }
                let atts = read_att_list(&mut cursor)?;
                let nc_type = cursor.read_u32::<BigEndian>()?;
                let _vsize = cursor.read_u32::<BigEndian>()?;
                let begin = cursor.read_u32::<BigEndian>()? as u64;
                headers.push((name, var_dims, atts, nc_type, begin));
            }
        } else if tag != 0 {
            return Err(ContainerError::Format(format!(
                "expected variable list tag, found {tag:#x}"
            )));
        }

        let mut vars = Vec::with_capacity(headers.len());
        for (name, var_dims, atts, nc_type, begin) in headers {
            let nelems = var_dims
                .iter()
                .map(|&dim| dims[dim].len)
                .product::<usize>();
            let mut data_cursor = Cursor::new(bytes);
            data_cursor.set_position(begin);
            let data = Value::read(&mut data_cursor, nc_type, nelems)?;
            vars.push(Var {
                name,
                dims: var_dims,
                atts,
                data,
            });
        }

        Ok(Dataset { dims, gatts, vars })
    }
}

/// Coordinate and geometry variables that are not moment layers.
const COORDINATE_VARS: &[&str] = &[
    "time",
    "range",
    "azimuth",
    "elevation",
    "sweep_start_ray_index",
    "sweep_end_ray_index",
    "fixed_angle",
    "nyquist_velocity",
    "prt",
    "pulse_width",
    "latitude",
    "longitude",
    "altitude",
];

fn field_units(name: &str) -> &'static str {
    match name {
        "DBZH" | "DBZV" | "COLMAX" => "dBZ",
        "VRAD" | "WRAD" => "meters_per_second",
        "ZDR" => "dB",
        "PHIDP" => "degrees",
        "KDP" => "degrees_per_kilometer",
        "RHOHV" => "1",
        _ => "unknown",
    }
}

fn float_att(var: &Var, name: &str) -> Option<f32> {
    match var.att(name) {
        Some(Value::Float(values)) => values.first().copied(),
        _ => None,
    }
}

fn char_gatt(dataset: &Dataset, name: &str) -> Result<String, ContainerError> {
    match dataset.gatt(name) {
        Some(Value::Char(text)) => Ok(text.clone()),
        _ => Err(ContainerError::Format(format!(
            "missing global attribute {name}"
        ))),
    }
}

fn dataset_from_volume(volume: &RadarVolume) -> Dataset {
    let time_dim = 0usize;
    let range_dim = 1usize;
    let sweep_dim = 2usize;

    let mut dataset = Dataset {
        dims: vec![
            Dim {
                name: "time".into(),
                len: volume.nrays(),
            },
            Dim {
                name: "range".into(),
                len: volume.ngates(),
            },
            Dim {
                name: "sweep".into(),
                len: volume.nsweeps(),
            },
        ],
        gatts: vec![
            ("Conventions".into(), Value::Char("CF/Radial".into())),
            (
                "instrument_name".into(),
                Value::Char(volume.radar.clone()),
            ),
            (
                "volume_code".into(),
                Value::Char(volume.volume_code.clone()),
            ),
            (
                "volume_number".into(),
                Value::Char(volume.volume_number.clone()),
            ),
            (
                "time_coverage_start".into(),
                Value::Char(volume.volume_start.to_rfc3339()),
            ),
        ],
        vars: Vec::new(),
    };

    let coord = |name: &str, dims: Vec<usize>, atts: Vec<(String, Value)>, data: Value| Var {
        name: name.into(),
        dims,
        atts,
        data,
    };
    let units = |text: &str| ("units".to_string(), Value::Char(text.into()));

    dataset.vars.push(coord(
        "time",
        vec![time_dim],
        vec![units("seconds since 1970-01-01T00:00:00Z")],
        Value::Double(volume.time_secs.clone()),
    ));
    dataset.vars.push(coord(
        "range",
        vec![range_dim],
        vec![units("meters")],
        Value::Float(volume.range_m.clone()),
    ));
    dataset.vars.push(coord(
        "azimuth",
        vec![time_dim],
        vec![units("degrees")],
        Value::Float(volume.azimuth_deg.clone()),
    ));
    dataset.vars.push(coord(
        "elevation",
        vec![time_dim],
        vec![units("degrees")],
        Value::Float(volume.elevation_deg.clone()),
    ));
    dataset.vars.push(coord(
        "sweep_start_ray_index",
        vec![sweep_dim],
        Vec::new(),
        Value::Int(volume.sweep_start_ray.iter().map(|&i| i as i32).collect()),
    ));
    dataset.vars.push(coord(
        "sweep_end_ray_index",
        vec![sweep_dim],
        Vec::new(),
        Value::Int(volume.sweep_end_ray.iter().map(|&i| i as i32).collect()),
    ));
    dataset.vars.push(coord(
        "fixed_angle",
        vec![sweep_dim],
        vec![units("degrees")],
        Value::Float(volume.fixed_angle_deg.clone()),
    ));
    dataset.vars.push(coord(
        "nyquist_velocity",
        vec![sweep_dim],
        vec![units("meters_per_second")],
        Value::Float(volume.nyquist_ms.clone()),
    ));
    dataset.vars.push(coord(
        "prt",
        vec![sweep_dim],
        vec![units("seconds")],
        Value::Float(volume.prt_s.clone()),
    ));
    dataset.vars.push(coord(
        "pulse_width",
        vec![sweep_dim],
        vec![units("seconds")],
        Value::Float(volume.pulse_width_s.clone()),
    ));
    dataset.vars.push(coord(
        "latitude",
        Vec::new(),
        vec![units("degrees_north")],
        Value::Double(vec![volume.latitude_deg]),
    ));
    dataset.vars.push(coord(
        "longitude",
        Vec::new(),
        vec![units("degrees_east")],
        Value::Double(vec![volume.longitude_deg]),
    ));
    dataset.vars.push(coord(
        "altitude",
        Vec::new(),
        vec![units("meters")],
        Value::Double(vec![volume.altitude_m]),
    ));

    for (name, grid) in &volume.fields {
        dataset.vars.push(Var {
            name: name.clone(),
            dims: vec![time_dim, range_dim],
            atts: vec![
                ("_FillValue".into(), Value::Float(vec![volume.missing_value])),
                units(field_units(name)),
            ],
            data: Value::Float(grid.data().to_vec()),
        });
    }

    dataset
}

fn floats(dataset: &Dataset, name: &str) -> Result<Vec<f32>, ContainerError> {
    match dataset.var(name).map(|var| &var.data) {
        Some(Value::Float(values)) => Ok(values.clone()),
        _ => Err(ContainerError::Format(format!("missing variable {name}"))),
    }
}

fn doubles(dataset: &Dataset, name: &str) -> Result<Vec<f64>, ContainerError> {
    match dataset.var(name).map(|var| &var.data) {
        Some(Value::Double(values)) => Ok(values.clone()),
        _ => Err(ContainerError::Format(format!("missing variable {name}"))),
    }
}

fn indices(dataset: &Dataset, name: &str) -> Result<Vec<usize>, ContainerError> {
    match dataset.var(name).map(|var| &var.data) {
        Some(Value::Int(values)) => Ok(values.iter().map(|&i| i as usize).collect()),
        _ => Err(ContainerError::Format(format!("missing variable {name}"))),
    }
}

fn volume_from_dataset(dataset: &Dataset) -> Result<RadarVolume, ContainerError> {
    let time_coverage_start = char_gatt(dataset, "time_coverage_start")?;
    let volume_start = DateTime::parse_from_rfc3339(&time_coverage_start)
        .map_err(|err| ContainerError::Format(format!("bad time_coverage_start: {err}")))?
        .with_timezone(&Utc);

    let range_m = floats(dataset, "range")?;
    let azimuth_deg = floats(dataset, "azimuth")?;
    let nrays = azimuth_deg.len();
    let ngates = range_m.len();

    let mut fields = Vec::new();
    let mut missing_value = MISSING;
    for var in &dataset.vars {
        if COORDINATE_VARS.contains(&var.name.as_str()) {
            continue;
        }
        if let Value::Float(values) = &var.data {
            if values.len() != nrays * ngates {
                continue;
            }
            if let Some(fill) = float_att(var, "_FillValue") {
                missing_value = fill;
            }
            fields.push((
                var.name.clone(),
                FloatGrid::from_vec(nrays, ngates, values.clone())
                    .map_err(ContainerError::Format)?,
            ));
        }
    }

    let volume = RadarVolume {
        radar: char_gatt(dataset, "instrument_name")?,
        volume_code: char_gatt(dataset, "volume_code")?,
        volume_number: char_gatt(dataset, "volume_number")?,
        latitude_deg: doubles(dataset, "latitude")?[0],
        longitude_deg: doubles(dataset, "longitude")?[0],
        altitude_m: doubles(dataset, "altitude")?[0],
        volume_start,
        range_m,
        azimuth_deg,
        elevation_deg: floats(dataset, "elevation")?,
        time_secs: doubles(dataset, "time")?,
        sweep_start_ray: indices(dataset, "sweep_start_ray_index")?,
        sweep_end_ray: indices(dataset, "sweep_end_ray_index")?,
        fixed_angle_deg: floats(dataset, "fixed_angle")?,
        nyquist_ms: floats(dataset, "nyquist_velocity")?,
        prt_s: floats(dataset, "prt")?,
        pulse_width_s: floats(dataset, "pulse_width")?,
        missing_value,
        fields,
    };

    volume.validate().map_err(ContainerError::Format)?;
    Ok(volume)
}

/// Serialize `volume` to `path`, fsyncing before return so the caller can
/// safely commit the catalogue transition afterwards.
pub fn write_volume(path: &Path, volume: &RadarVolume) -> Result<(), ContainerError> {
    let bytes = dataset_from_volume(volume).to_bytes()?;
    let mut file = std::fs::File::create(path)?;
    std::io::Write::write_all(&mut file, &bytes)?;
    file.sync_all()?;
    Ok(())
}

pub fn read_volume(path: &Path) -> Result<RadarVolume, ContainerError> {
    let bytes = std::fs::read(path)?;
    volume_from_dataset(&Dataset::from_bytes(&bytes)?)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sample_volume() -> RadarVolume {
        RadarVolume {
            radar: "RMA1".into(),
            volume_code: "0315".into(),
            volume_number: "01".into(),
            latitude_deg: -31.44,
            longitude_deg: -64.19,
            altitude_m: 440.0,
            volume_start: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
            range_m: vec![250.0, 750.0, 1250.0],
            azimuth_deg: vec![0.0, 120.0, 240.0, 0.0],
            elevation_deg: vec![0.5, 0.5, 0.5, 1.5],
            time_secs: vec![1.735732800e9, 1.735732801e9, 1.735732802e9, 1.735732803e9],
            sweep_start_ray: vec![0, 3],
            sweep_end_ray: vec![2, 3],
            fixed_angle_deg: vec![0.5, 1.5],
            nyquist_ms: vec![8.0, 8.0],
            prt_s: vec![0.001, 0.001],
            pulse_width_s: vec![1e-6, 1e-6],
            missing_value: MISSING,
            fields: vec![
                (
                    "DBZH".to_string(),
                    FloatGrid::from_vec(
                        4,
                        3,
                        vec![
                            10.0, 20.0, 30.0, 11.0, 21.0, 31.0, 12.0, 22.0, 32.0, MISSING,
                            23.0, 33.0,
                        ],
                    )
                    .unwrap(),
                ),
                ("VRAD".to_string(), FloatGrid::filled(4, 3, -3.5)),
            ],
        }
    }

    #[test]
    fn container_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.nc");
        let volume = sample_volume();

        write_volume(&path, &volume).unwrap();
        let loaded = read_volume(&path).unwrap();

        assert_eq!(loaded.radar, "RMA1");
        assert_eq!(loaded.volume_code, "0315");
        assert_eq!(loaded.volume_start, volume.volume_start);
        assert_eq!(loaded.range_m, volume.range_m);
        assert_eq!(loaded.azimuth_deg, volume.azimuth_deg);
        assert_eq!(loaded.sweep_start_ray, volume.sweep_start_ray);
        assert_eq!(loaded.sweep_end_ray, volume.sweep_end_ray);
        assert_eq!(loaded.field_names(), vec!["DBZH", "VRAD"]);
        assert_eq!(
            loaded.field("DBZH").unwrap().data(),
            volume.field("DBZH").unwrap().data()
        );
        assert_eq!(loaded.missing_value, MISSING);
    }

    #[test]
    fn writes_are_byte_stable() {
        // Two writes of the same volume are byte-identical, which is what
        // makes redo-after-crash idempotent.
        let volume = sample_volume();
        let a = dataset_from_volume(&volume).to_bytes().unwrap();
        let b = dataset_from_volume(&volume).to_bytes().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn header_starts_with_classic_magic() {
        let bytes = dataset_from_volume(&sample_volume()).to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"CDF\x01");
    }

    #[test]
    fn unknown_bytes_are_rejected() {
        assert!(Dataset::from_bytes(b"not a container").is_err());
        assert!(read_volume(Path::new("/nonexistent/volume.nc")).is_err());
    }

    #[test]
    fn shape_mismatch_is_rejected_at_write() {
        let mut dataset = dataset_from_volume(&sample_volume());
        // Corrupt one variable's payload length.
        if let Some(var) = dataset.vars.iter_mut().find(|v| v.name == "DBZH") {
            var.data = Value::Float(vec![1.0]);
        }
        assert!(dataset.to_bytes().is_err());
    }

    #[test]
    fn empty_dataset_round_trips() {
        let dataset = Dataset::default();
        let bytes = dataset.to_bytes().unwrap();
        assert_eq!(Dataset::from_bytes(&bytes).unwrap(), dataset);
    }
}
