//! # piccolo-wavecal
//!
//! **Wavelength re-calibration** for piccolo spectrometers, written in Rust.
//!
//! Every spectrometer ships with factory coefficients mapping pixel index to
//! wavelength. These drift. Given spectra of calibration lamps with known
//! emission lines, `piccolo-wavecal` detects the lamp lines, matches them
//! against the reference catalogue and fits a corrected polynomial.
//!
//! ## Features
//!
//! - **Per-instrument datasets**: one dataset per spectrometer serial number
//!   and measurement direction; other records in a file are skipped
//! - **Saturation-aware peak detection**: peaks are accepted inside an
//!   intensity band whose upper edge defaults to a fraction of saturation
//! - **Deterministic greedy matching**: reproduces existing calibrations
//!   exactly
//! - **Manual review loop**: the peak table is a plain keyed store that can be
//!   edited between matching and fitting
//! - **Region weighting**: optionally bias the fit towards part of the detector
//!
//! ## Example
//!
//! ```no_run
//! use piccolo_wavecal::{CalibrationDataset, FitConfig};
//!
//! let mut ds = CalibrationDataset::new("QEP00114", "Upwelling");
//! ds.add_light_source("HgAr", "data/HgArLines.csv").unwrap();
//! ds.add_spectrum("HgAr", "data/hgar_0001.pico").unwrap();
//!
//! let n = ds.match_wavelength().unwrap();
//! println!("matched {n} peaks");
//!
//! let result = ds.fit_wavelength(&FitConfig::default()).unwrap();
//! println!(
//!     "RMSE {:.3} nm -> {:.3} nm, coefficients {:?}",
//!     result.rmse_before_nm,
//!     result.rmse_after_nm,
//!     result.polynomial.to_descending()
//! );
//! ```
//!
//! ## Workflow
//!
//! 1. **Register light sources**: each lamp with its reference-line file
//! 2. **Ingest spectra**: peaks inside the intensity band enter the peak table
//! 3. **Match**: peaks are paired with reference lines using the factory
//!    calibration
//! 4. **Review** (optional): edit, unassign or drop peak assignments
//! 5. **Fit**: least-squares polynomial through all assigned peaks
//!

/// Raw reference-line readers
pub(crate) mod catalogs;
pub mod calibration;
mod error;
pub mod fit;
pub mod peak_detection;
pub mod polynomial;
pub mod spectral_lines;
pub mod spectrum;

pub use calibration::{
    BatchReport, CalibrationConfig, CalibrationDataset, CalibrationPlan, DatasetState,
    IngestedSpectrum, LightSourcePlan, PeakAssignment, PeakResidual, SkippedFile, SpectrumRow,
};
pub use error::*;
pub use fit::{FitConfig, WavelengthFitResult};
pub use peak_detection::{find_peaks, IntensityBand};
pub use polynomial::WavelengthPolynomial;
pub use spectral_lines::SpectralLineCatalogue;
pub use spectrum::{PiccoloJsonReader, SpectrumReader, SpectrumRecord};
