//! Configuration for the Radarflow pipeline.
//!
//! Loaded once from a TOML file, validated, and passed into each worker as an
//! immutable value. Workers never consult the environment themselves.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

/// Remote file server connection parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    /// Root of the calendar hierarchy on the server, e.g. `/radar`.
    pub base_path: String,
}

/// Which radar is monitored over which calendar window.
#[derive(Debug, Clone, Deserialize)]
pub struct RadarConfig {
    pub code: String,
    pub start_instant: DateTime<Utc>,
    /// Absent means continuous mode: keep polling forever.
    #[serde(default)]
    pub end_instant: Option<DateTime<Utc>>,
    #[serde(default = "RadarConfig::default_extension")]
    pub extension: String,
}

impl RadarConfig {
    fn default_extension() -> String {
        "BUFR".to_string()
    }
}

/// Directory layout. Each worker owns a disjoint subtree.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    pub download_root: PathBuf,
    pub container_root: PathBuf,
    pub product_root: PathBuf,
    pub decoder_resources: PathBuf,
    pub decoder_library: PathBuf,
    pub state_store: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TuningConfig {
    #[serde(default = "TuningConfig::default_poll_interval", deserialize_with = "de_duration")]
    pub poll_interval: Duration,
    #[serde(default = "TuningConfig::default_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "TuningConfig::default_decodes")]
    pub max_concurrent_decodes: usize,
    #[serde(default = "TuningConfig::default_renders")]
    pub max_concurrent_renders: usize,
    #[serde(default = "TuningConfig::default_true")]
    pub verify_checksums: bool,
    #[serde(default)]
    pub resume_partial: bool,
    #[serde(default = "TuningConfig::default_stuck_timeout", deserialize_with = "de_duration")]
    pub stuck_timeout: Duration,
    #[serde(default = "TuningConfig::default_stuck_sweep", deserialize_with = "de_duration")]
    pub stuck_sweep_interval: Duration,
    #[serde(default = "TuningConfig::default_listing_timeout", deserialize_with = "de_duration")]
    pub listing_timeout: Duration,
    #[serde(default = "TuningConfig::default_inactivity_timeout", deserialize_with = "de_duration")]
    pub inactivity_timeout: Duration,
    #[serde(default = "TuningConfig::default_decode_attempts")]
    pub decode_attempts: u32,
    #[serde(default)]
    pub allow_incomplete: bool,
}

impl TuningConfig {
    fn default_poll_interval() -> Duration {
        Duration::from_secs(30)
    }
    fn default_downloads() -> usize {
        5
    }
    fn default_decodes() -> usize {
        2
    }
    fn default_renders() -> usize {
        2
    }
    fn default_true() -> bool {
        true
    }
    fn default_stuck_timeout() -> Duration {
        Duration::from_secs(60 * 60)
    }
    fn default_stuck_sweep() -> Duration {
        Duration::from_secs(5 * 60)
    }
    fn default_listing_timeout() -> Duration {
        Duration::from_secs(30)
    }
    fn default_inactivity_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_decode_attempts() -> u32 {
        3
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            poll_interval: Self::default_poll_interval(),
            max_concurrent_downloads: Self::default_downloads(),
            max_concurrent_decodes: Self::default_decodes(),
            max_concurrent_renders: Self::default_renders(),
            verify_checksums: true,
            resume_partial: false,
            stuck_timeout: Self::default_stuck_timeout(),
            stuck_sweep_interval: Self::default_stuck_sweep(),
            listing_timeout: Self::default_listing_timeout(),
            inactivity_timeout: Self::default_inactivity_timeout(),
            decode_attempts: Self::default_decode_attempts(),
            allow_incomplete: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RendererConfig {
    #[serde(default = "RendererConfig::default_product_type")]
    pub product_type: String,
    #[serde(default)]
    pub add_colmax: bool,
    /// Moments to plot. Absent means every moment present in the container.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default = "RendererConfig::default_image_size")]
    pub image_size: u32,
}

impl RendererConfig {
    fn default_product_type() -> String {
        "image".to_string()
    }
    fn default_image_size() -> u32 {
        600
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            product_type: Self::default_product_type(),
            add_colmax: false,
            fields: None,
            image_size: Self::default_image_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpConfig {
    /// Bind address for the statistics endpoint; absent disables it.
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

/// Declares which moments constitute a complete volume, keyed by
/// `(volume_code, volume_number)`.
pub type ExpectationMap = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub radar: RadarConfig,
    pub paths: PathsConfig,
    pub volumes: ExpectationMap,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.radar.code.is_empty() {
            return Err(ConfigError::Invalid("radar.code must not be empty".into()));
        }
        if self.radar.extension.is_empty() {
            return Err(ConfigError::Invalid(
                "radar.extension must not be empty".into(),
            ));
        }
        if let Some(end) = self.radar.end_instant {
            if end < self.radar.start_instant {
                return Err(ConfigError::Invalid(
                    "radar.end_instant precedes radar.start_instant".into(),
                ));
            }
        }
        if self.volumes.is_empty() {
            return Err(ConfigError::Invalid(
                "volumes expectation map must declare at least one volume code".into(),
            ));
        }
        for (code, numbers) in &self.volumes {
            for (number, fields) in numbers {
                if fields.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "volumes.{code}.{number} declares no fields"
                    )));
                }
            }
        }
        if self.tuning.max_concurrent_downloads == 0
            || self.tuning.max_concurrent_decodes == 0
            || self.tuning.max_concurrent_renders == 0
        {
            return Err(ConfigError::Invalid(
                "concurrency limits must be at least 1".into(),
            ));
        }
        if self.tuning.decode_attempts == 0 {
            return Err(ConfigError::Invalid(
                "tuning.decode_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Expected moment list for a specific volume, if the map declares it.
    pub fn expected_fields(&self, volume_code: &str, volume_number: &str) -> Option<&[String]> {
        self.volumes
            .get(volume_code)
            .and_then(|numbers| numbers.get(volume_number))
            .map(Vec::as_slice)
    }

    /// Union of every declared moment, in first-seen order. Fallback plot
    /// list when `renderer.fields` is absent.
    pub fn all_expected_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        for numbers in self.volumes.values() {
            for declared in numbers.values() {
                for field in declared {
                    if !fields.contains(field) {
                        fields.push(field.clone());
                    }
                }
            }
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[connection]
host = "ftp.example.org:21"
username = "radar"
password = "secret"
base_path = "/incoming"

[radar]
code = "RMA1"
start_instant = "2025-01-01T00:00:00Z"
end_instant = "2025-01-01T13:00:00Z"

[paths]
download_root = "/var/lib/radarflow/raw"
container_root = "/var/lib/radarflow/cfradial"
product_root = "/var/lib/radarflow/products"
decoder_resources = "/usr/share/rvd"
decoder_library = "/usr/lib/librvd.so"
state_store = "/var/lib/radarflow/catalogue.db"

[volumes.0315]
"01" = ["DBZH", "VRAD"]
"02" = ["DBZH"]

[tuning]
poll_interval = "10s"
stuck_timeout = "30m"

[renderer]
add_colmax = true
"#;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_sample_config() {
        let file = write_config(SAMPLE);
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.radar.code, "RMA1");
        assert_eq!(config.radar.extension, "BUFR");
        assert_eq!(config.tuning.poll_interval, Duration::from_secs(10));
        assert_eq!(config.tuning.stuck_timeout, Duration::from_secs(30 * 60));
        assert_eq!(config.tuning.max_concurrent_downloads, 5);
        assert!(config.renderer.add_colmax);
        assert_eq!(
            config.expected_fields("0315", "01").unwrap(),
            &["DBZH".to_string(), "VRAD".to_string()]
        );
        assert!(config.expected_fields("0315", "03").is_none());
        assert!(config.expected_fields("9999", "01").is_none());
    }

    #[test]
    fn union_of_expected_fields_is_deduplicated() {
        let file = write_config(SAMPLE);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.all_expected_fields(), vec!["DBZH", "VRAD"]);
    }

    #[test]
    fn rejects_inverted_window() {
        let text = SAMPLE.replace(
            "end_instant = \"2025-01-01T13:00:00Z\"",
            "end_instant = \"2024-12-31T00:00:00Z\"",
        );
        let file = write_config(&text);
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_empty_field_list() {
        let text = SAMPLE.replace("\"02\" = [\"DBZH\"]", "\"02\" = []");
        let file = write_config(&text);
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/radarflow.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
