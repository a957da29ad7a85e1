//! Catalogue of known emission lines for one calibration light source.
//!
//! `SpectralLineCatalogue` stores the reference wavelengths of a lamp as a
//! sorted, de-duplicated list and offers the greedy matching primitive used to
//! assign reference lines to detected peaks.
//!
//! Matching flow:
//! 1. Candidates arrive as `(pixel, observed_wavelength)` pairs, in the order
//!    the caller fixes (ascending pixel index when driven by the dataset).
//! 2. For each candidate, the remaining reference lines are scanned in
//!    ascending wavelength order and the first one closer than the tolerance
//!    is taken.
//! 3. A taken line is removed from the pool, so two candidates can never share
//!    a line. The earlier candidate wins any contest.
//!
//! The result depends on candidate order. Existing calibrations were produced
//! with exactly this rule, so it must not be replaced by a globally optimal
//! assignment.

use std::path::Path;

use tracing::info;

use crate::catalogs::lines::read_spectral_lines;
use crate::error::{CalibrationError, Result};

/// Default matching tolerance in nanometres.
pub const DEFAULT_MATCH_TOLERANCE_NM: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SpectralLineCatalogue {
    name: String,
    lines: Vec<f64>,
}

impl SpectralLineCatalogue {
    /// Build a catalogue from reference wavelengths in any order.
    ///
    /// Wavelengths are sorted ascending and exact duplicates are dropped.
    pub fn from_wavelengths(
        name: impl Into<String>,
        wavelengths: impl IntoIterator<Item = f64>,
    ) -> Self {
        let mut lines: Vec<f64> = wavelengths.into_iter().collect();
        lines.sort_by(|a, b| a.total_cmp(b));
        lines.dedup();
        Self {
            name: name.into(),
            lines,
        }
    }

    /// Load a catalogue from a reference-line file.
    ///
    /// Fails with [`CalibrationError::Parse`] if the file is missing, holds
    /// non-numeric data, or lists no wavelengths.
    pub fn load(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let wavelengths =
            read_spectral_lines(path).map_err(|e| CalibrationError::parse(path, e))?;
        let catalogue = Self::from_wavelengths(name, wavelengths);
        info!(
            "Loaded {} spectral lines for {} from {}",
            catalogue.len(),
            catalogue.name,
            path.display()
        );
        Ok(catalogue)
    }

    /// Light-source name this catalogue belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reference wavelengths in ascending order.
    pub fn lines(&self) -> &[f64] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Greedily assign reference lines to candidate peaks.
    ///
    /// `candidates` are `(pixel, observed_wavelength)` pairs. Returns the
    /// matched `(pixel, reference_wavelength)` pairs in candidate order.
    /// Candidates with no remaining line strictly closer than `tolerance_nm`
    /// are left out.
    pub fn match_peaks(&self, candidates: &[(usize, f64)], tolerance_nm: f64) -> Vec<(usize, f64)> {
        let mut remaining = self.lines.clone();
        let mut matched = Vec::new();

        for &(pixel, observed) in candidates {
            if let Some(j) = remaining
                .iter()
                .position(|&line| (observed - line).abs() < tolerance_nm)
            {
                matched.push((pixel, remaining.remove(j)));
            }
        }

        matched
    }
}
