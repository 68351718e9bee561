use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ModelError, Result};
use crate::volume::VolumeId;

/// `RMA1_0315_01_DBZH_20250101T120000Z.BUFR`
static FILENAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<radar>[A-Z0-9]+)_(?P<code>\d{4})_(?P<num>\d{2})_(?P<field>[A-Za-z0-9]+)_(?P<instant>\d{8}T\d{6}Z)\.(?P<ext>[A-Za-z0-9]+)$",
    )
    .expect("filename pattern")
});

const COMPACT_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Format a UTC instant in the compact form used in filenames and volume ids.
pub fn format_compact_instant(instant: DateTime<Utc>) -> String {
    instant.format(COMPACT_FORMAT).to_string()
}

/// Parse the compact `YYYYMMDDTHHMMSSZ` instant form.
pub fn parse_compact_instant(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, COMPACT_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| ModelError::Instant(value.to_string()))
}

/// Structured view of a remote artifact filename.
///
/// Every component that needs to know which radar, moment, or scan a file
/// belongs to goes through this parser; the grammar is defined nowhere else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    pub radar: String,
    pub volume_code: String,
    pub volume_number: String,
    pub field: String,
    pub observed_at: DateTime<Utc>,
    pub extension: String,
}

impl ParsedFilename {
    pub fn parse(filename: &str) -> Result<Self> {
        let caps = FILENAME_RE
            .captures(filename)
            .ok_or_else(|| ModelError::Filename(filename.to_string()))?;

        let observed_at = parse_compact_instant(&caps["instant"])?;

        Ok(Self {
            radar: caps["radar"].to_string(),
            volume_code: caps["code"].to_string(),
            volume_number: caps["num"].to_string(),
            field: caps["field"].to_string(),
            observed_at,
            extension: caps["ext"].to_string(),
        })
    }

    /// The identity quadruple this file contributes to. The field name is
    /// deliberately not part of the identity.
    pub fn volume_id(&self) -> VolumeId {
        VolumeId {
            radar: self.radar.clone(),
            volume_code: self.volume_code.clone(),
            volume_number: self.volume_number.clone(),
            observed_at: self.observed_at,
        }
    }

    /// Whether the extension matches the configured one, case-insensitively.
    pub fn has_extension(&self, extension: &str) -> bool {
        self.extension.eq_ignore_ascii_case(extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_canonical_filename() {
        let parsed = ParsedFilename::parse("RMA1_0315_01_DBZH_20250101T120000Z.BUFR").unwrap();

        assert_eq!(parsed.radar, "RMA1");
        assert_eq!(parsed.volume_code, "0315");
        assert_eq!(parsed.volume_number, "01");
        assert_eq!(parsed.field, "DBZH");
        assert_eq!(parsed.extension, "BUFR");
        assert_eq!(
            parsed.observed_at,
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn field_is_not_part_of_identity() {
        let a = ParsedFilename::parse("RMA1_0315_01_DBZH_20250101T120000Z.BUFR").unwrap();
        let b = ParsedFilename::parse("RMA1_0315_01_VRAD_20250101T120000Z.BUFR").unwrap();
        assert_eq!(a.volume_id(), b.volume_id());
    }

    #[test]
    fn rejects_malformed_filenames() {
        for bad in [
            "RMA1_0315_01_DBZH_20250101T120000Z",
            "RMA1_315_01_DBZH_20250101T120000Z.BUFR",
            "RMA1_0315_1_DBZH_20250101T120000Z.BUFR",
            "RMA1_0315_01_DBZH_2025-01-01T120000Z.BUFR",
            "notes.txt",
            "",
        ] {
            assert!(ParsedFilename::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn rejects_invalid_instants() {
        let err = ParsedFilename::parse("RMA1_0315_01_DBZH_20251301T120000Z.BUFR").unwrap_err();
        assert!(matches!(err, ModelError::Instant(_)));
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let parsed = ParsedFilename::parse("RMA1_0315_01_DBZH_20250101T120000Z.bufr").unwrap();
        assert!(parsed.has_extension("BUFR"));
        assert!(!parsed.has_extension("nc"));
    }

    #[test]
    fn compact_instant_round_trips() {
        let instant = Utc.with_ymd_and_hms(2025, 6, 30, 23, 59, 59).unwrap();
        let text = format_compact_instant(instant);
        assert_eq!(text, "20250630T235959Z");
        assert_eq!(parse_compact_instant(&text).unwrap(), instant);
    }
}
