//! Spectrum records and the reader seam used to ingest them.
//!
//! The engine does not own the instrument's file format. It consumes
//! [`SpectrumRecord`]s produced by a [`SpectrumReader`]. The default reader,
//! [`PiccoloJsonReader`], understands the piccolo spectra-list layout:
//!
//! ```text
//! {"Spectra": [
//!    {"Metadata": {"SerialNumber": "QEP00114",
//!                  "Direction": "Upwelling",
//!                  "SaturationLevel": 200000,
//!                  "WavelengthCalibrationCoefficients": [c3, c2, c1, c0],
//!                  ...},
//!     "Pixels": [ ... ]},
//!    ...]}
//! ```
//!
//! Metadata keys other than the four above are ignored.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// One spectrum as delivered by the instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumRecord {
    /// Spectrometer serial number.
    pub serial_number: String,
    /// Measurement direction tag (e.g. upwelling / downwelling).
    pub direction: String,
    /// Largest representable intensity for this spectrometer.
    pub saturation_level: f64,
    /// Factory pixel → wavelength coefficients, highest degree first.
    pub wavelength_coefficients: Vec<f64>,
    /// Raw intensity per pixel.
    pub pixels: Vec<f64>,
}

impl SpectrumRecord {
    pub fn num_pixels(&self) -> usize {
        self.pixels.len()
    }

    /// Whether any pixel reached the saturation level.
    pub fn is_saturated(&self) -> bool {
        self.pixels.iter().any(|&v| v >= self.saturation_level)
    }

    /// Whether this record belongs to the given spectrometer and direction.
    pub fn is_from(&self, serial_number: &str, direction: &str) -> bool {
        self.serial_number == serial_number && self.direction == direction
    }
}

/// Source of spectrum records.
///
/// Implementations must read the whole file before returning: either every
/// record is produced or an error is.
pub trait SpectrumReader {
    fn read_spectra(&self, path: &Path) -> Result<Vec<SpectrumRecord>>;
}

/// Reader for piccolo JSON spectra lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct PiccoloJsonReader;

impl SpectrumReader for PiccoloJsonReader {
    fn read_spectra(&self, path: &Path) -> Result<Vec<SpectrumRecord>> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read spectra file: {}", path.display()))?;
        parse_piccolo_spectra(&data)
    }
}

#[derive(Deserialize)]
struct RawSpectraList {
    #[serde(rename = "Spectra")]
    spectra: Vec<RawSpectrum>,
}

#[derive(Deserialize)]
struct RawSpectrum {
    #[serde(rename = "Metadata")]
    metadata: RawMetadata,
    #[serde(rename = "Pixels")]
    pixels: Vec<f64>,
}

#[derive(Deserialize)]
struct RawMetadata {
    #[serde(rename = "SerialNumber")]
    serial_number: String,
    #[serde(rename = "Direction")]
    direction: String,
    #[serde(rename = "SaturationLevel")]
    saturation_level: f64,
    #[serde(rename = "WavelengthCalibrationCoefficients")]
    wavelength_coefficients: Vec<f64>,
}

/// Parse a piccolo spectra list from an in-memory JSON string.
pub fn parse_piccolo_spectra(data: &str) -> Result<Vec<SpectrumRecord>> {
    let raw: RawSpectraList = serde_json::from_str(data).context("malformed spectra list")?;
    raw.spectra
        .into_iter()
        .enumerate()
        .map(|(idx, s)| {
            anyhow::ensure!(
                !s.metadata.wavelength_coefficients.is_empty(),
                "spectrum {idx}: no wavelength calibration coefficients"
            );
            anyhow::ensure!(
                s.metadata.saturation_level > 0.0,
                "spectrum {idx}: saturation level must be positive"
            );
            Ok(SpectrumRecord {
                serial_number: s.metadata.serial_number,
                direction: s.metadata.direction,
                saturation_level: s.metadata.saturation_level,
                wavelength_coefficients: s.metadata.wavelength_coefficients,
                pixels: s.pixels,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "Spectra": [
            {"Metadata": {"SerialNumber": "QEP00114", "Direction": "Upwelling",
                          "SaturationLevel": 65535, "Dark": false,
                          "WavelengthCalibrationCoefficients": [0.0, 0.5, 340.0]},
             "Pixels": [1000, 1200, 30000, 1100]},
            {"Metadata": {"SerialNumber": "QEP00114", "Direction": "Downwelling",
                          "SaturationLevel": 65535,
                          "WavelengthCalibrationCoefficients": [0.0, 0.5, 341.0]},
             "Pixels": [1000, 65535, 1000]}
        ]
    }"#;

    #[test]
    fn parses_spectra_list() {
        let records = parse_piccolo_spectra(SAMPLE).unwrap();
        assert_eq!(records.len(), 2);
        let r = &records[0];
        assert!(r.is_from("QEP00114", "Upwelling"));
        assert!(!r.is_from("QEP00114", "Downwelling"));
        assert_eq!(r.num_pixels(), 4);
        assert_eq!(r.wavelength_coefficients, vec![0.0, 0.5, 340.0]);
        assert!(!r.is_saturated());
        assert!(records[1].is_saturated());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_piccolo_spectra("{\"Spectra\": [ {\"Metadata\": {}} ]}").is_err());
        assert!(parse_piccolo_spectra("not json").is_err());
    }

    #[test]
    fn rejects_missing_coefficients() {
        let data = r#"{"Spectra": [{"Metadata": {"SerialNumber": "A", "Direction": "B",
            "SaturationLevel": 10, "WavelengthCalibrationCoefficients": []},
            "Pixels": [1, 2, 3]}]}"#;
        let err = parse_piccolo_spectra(data).unwrap_err();
        assert!(err.to_string().contains("coefficients"));
    }

    #[test]
    fn missing_file() {
        assert!(PiccoloJsonReader
            .read_spectra(Path::new("no/such/file.pico"))
            .is_err());
    }
}
