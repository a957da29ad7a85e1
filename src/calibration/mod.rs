//! Wavelength calibration of one spectrometer/direction pair.
//!
//! A [`CalibrationDataset`] accumulates lamp spectra and re-derives the
//! pixel → wavelength polynomial:
//!
//! 1. **Light sources**: register each calibration lamp with its
//!    reference-line catalogue.
//! 2. **Ingestion**: add spectra files per lamp. Every in-scope spectrum is
//!    appended to the spectra table and its peaks are entered in the peak
//!    table, unassigned.
//! 3. **Matching**: assign reference wavelengths to peaks using the greedy
//!    catalogue match, evaluated on the factory (original) calibration.
//! 4. **Fitting**: fit a new polynomial through all assigned peaks. The peak
//!    table may be edited by hand between matching and fitting, and fitting may
//!    be repeated as often as wanted.

mod dataset;
pub mod plan;

use std::path::PathBuf;
use std::sync::OnceLock;

pub use dataset::CalibrationDataset;
pub use plan::{BatchReport, CalibrationPlan, LightSourcePlan, SkippedFile};

use crate::polynomial::WavelengthPolynomial;
use crate::spectral_lines::DEFAULT_MATCH_TOLERANCE_NM;

// ── Configuration ───────────────────────────────────────────────────────────

/// Dataset-wide settings.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Maximum distance between a peak's original wavelength and a reference
    /// line for them to be matched (strict). Default 2.0 nm.
    pub match_tolerance_nm: f64,
    /// Largest element-wise difference tolerated between the original
    /// coefficients of two ingested spectra. Default 1e-5.
    pub coefficient_tolerance: f64,
    /// Lower edge of the peak acceptance band while no minimum intensity has
    /// been set explicitly. Default 5000.
    pub default_min_intensity: f64,
    /// Upper edge of the peak acceptance band, as a percentage of the
    /// saturation level, applied on first ingestion if no maximum intensity
    /// has been set. Default 80.
    pub saturation_percentage: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            match_tolerance_nm: DEFAULT_MATCH_TOLERANCE_NM,
            coefficient_tolerance: 1e-5,
            default_min_intensity: 5000.0,
            saturation_percentage: 80.0,
        }
    }
}

// ── Tables ──────────────────────────────────────────────────────────────────

/// One pixel of one ingested spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumRow {
    pub pixel: usize,
    pub intensity: f64,
    /// Wavelength from the factory calibration.
    pub orig_wavelength: f64,
    /// 0-based ingestion order of the spectrum this row belongs to.
    pub spectrum_id: usize,
    pub light_source: String,
    /// Wavelength from the current new calibration; `None` until the first fit.
    pub new_wavelength: Option<f64>,
}

/// A detected peak and the reference wavelength assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakAssignment {
    pub light_source: String,
    /// Assigned reference wavelength; `None` while unassigned.
    pub wavelength: Option<f64>,
}

impl PeakAssignment {
    pub fn unassigned(light_source: impl Into<String>) -> Self {
        Self {
            light_source: light_source.into(),
            wavelength: None,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.wavelength.is_some()
    }
}

/// Bookkeeping entry for one ingested spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedSpectrum {
    /// File (or other source label) the spectrum came from.
    pub source: PathBuf,
    /// Position of the record within its source.
    pub record_index: usize,
    pub light_source: String,
}

/// Mismatch between an assigned reference wavelength and the calibrations.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakResidual {
    pub pixel: usize,
    pub light_source: String,
    pub reference_nm: f64,
    /// reference − original-calibration wavelength
    pub orig_residual_nm: f64,
    /// reference − new-calibration wavelength, once fitted
    pub new_residual_nm: Option<f64>,
}

/// Where a dataset is in the calibration workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DatasetState {
    Empty,
    LightSourcesRegistered,
    SpectraIngested,
    Matched,
    Fitted,
}

// ── Coefficient storage ─────────────────────────────────────────────────────

/// Coefficients plus a lazily built evaluator.
///
/// Every replacement bumps `version` and drops the evaluator, so a stale
/// polynomial can never be observed.
#[derive(Debug, Clone, Default)]
struct CoefficientCache {
    coeffs: Option<Vec<f64>>,
    version: u64,
    evaluator: OnceLock<WavelengthPolynomial>,
}

impl CoefficientCache {
    fn set(&mut self, coeffs: Vec<f64>) {
        self.coeffs = Some(coeffs);
        self.version += 1;
        self.evaluator = OnceLock::new();
    }

    fn coefficients(&self) -> Option<&[f64]> {
        self.coeffs.as_deref()
    }

    fn polynomial(&self) -> Option<&WavelengthPolynomial> {
        let coeffs = self.coeffs.as_ref()?;
        Some(
            self.evaluator
                .get_or_init(|| WavelengthPolynomial::new(coeffs.clone())),
        )
    }
}
