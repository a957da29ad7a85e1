use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info};

use super::{
    CalibrationConfig, CoefficientCache, DatasetState, IngestedSpectrum, PeakAssignment,
    PeakResidual, SpectrumRow,
};
use crate::error::{CalibrationError, Result};
use crate::fit::{fit_polynomial, gaussian_weights, rms, FitConfig, WavelengthFitResult};
use crate::peak_detection::{find_peaks, IntensityBand};
use crate::polynomial::WavelengthPolynomial;
use crate::spectral_lines::SpectralLineCatalogue;
use crate::spectrum::{PiccoloJsonReader, SpectrumReader, SpectrumRecord};

/// Calibration state for one spectrometer and one measurement direction.
///
/// Only records whose serial number and direction match the dataset are
/// ingested; everything else in a file is skipped.
#[derive(Debug, Clone)]
pub struct CalibrationDataset {
    serial_number: String,
    direction: String,
    config: CalibrationConfig,
    spectral_lines: BTreeMap<String, SpectralLineCatalogue>,
    ingested: Vec<IngestedSpectrum>,
    spectra: Vec<SpectrumRow>,
    peaks: BTreeMap<usize, PeakAssignment>,
    orig: CoefficientCache,
    new: CoefficientCache,
    saturation_level: Option<f64>,
    min_intensity: Option<f64>,
    max_intensity: Option<f64>,
    matched: bool,
}

/// Everything produced by one file, committed only once the whole file passed.
struct StagedIngestion {
    orig: Option<WavelengthPolynomial>,
    saturation_level: Option<f64>,
    max_intensity: Option<f64>,
    rows: Vec<SpectrumRow>,
    peaks: Vec<usize>,
    ingested: Vec<IngestedSpectrum>,
}

impl CalibrationDataset {
    pub fn new(serial_number: impl Into<String>, direction: impl Into<String>) -> Self {
        Self::with_config(serial_number, direction, CalibrationConfig::default())
    }

    pub fn with_config(
        serial_number: impl Into<String>,
        direction: impl Into<String>,
        config: CalibrationConfig,
    ) -> Self {
        Self {
            serial_number: serial_number.into(),
            direction: direction.into(),
            config,
            spectral_lines: BTreeMap::new(),
            ingested: Vec::new(),
            spectra: Vec::new(),
            peaks: BTreeMap::new(),
            orig: CoefficientCache::default(),
            new: CoefficientCache::default(),
            saturation_level: None,
            min_intensity: None,
            max_intensity: None,
            matched: false,
        }
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn direction(&self) -> &str {
        &self.direction
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    // ── Light sources ───────────────────────────────────────────────────

    /// Register a light source from its reference-line file.
    pub fn add_light_source(&mut self, name: impl Into<String>, path: impl AsRef<Path>) -> Result<()> {
        let name = name.into();
        if self.spectral_lines.contains_key(&name) {
            return Err(CalibrationError::DuplicateLightSource(name));
        }
        let catalogue = SpectralLineCatalogue::load(name, path)?;
        self.add_light_source_lines(catalogue)
    }

    /// Register an already built catalogue under its own name.
    pub fn add_light_source_lines(&mut self, catalogue: SpectralLineCatalogue) -> Result<()> {
        if self.spectral_lines.contains_key(catalogue.name()) {
            return Err(CalibrationError::DuplicateLightSource(
                catalogue.name().to_string(),
            ));
        }
        debug!(
            "Registered light source {} with {} lines",
            catalogue.name(),
            catalogue.len()
        );
        self.spectral_lines
            .insert(catalogue.name().to_string(), catalogue);
        Ok(())
    }

    /// Registered light-source names, sorted.
    pub fn light_sources(&self) -> impl Iterator<Item = &str> {
        self.spectral_lines.keys().map(String::as_str)
    }

    pub fn spectral_lines(&self, light_source: &str) -> Option<&SpectralLineCatalogue> {
        self.spectral_lines.get(light_source)
    }

    // ── Ingestion ───────────────────────────────────────────────────────

    /// Ingest a piccolo JSON spectra file recorded with `light_source`.
    ///
    /// Returns the number of spectra taken from the file.
    pub fn add_spectrum(&mut self, light_source: &str, path: impl AsRef<Path>) -> Result<usize> {
        self.add_spectrum_with_reader(light_source, path, &PiccoloJsonReader)
    }

    /// Ingest a spectra file through any [`SpectrumReader`].
    pub fn add_spectrum_with_reader<R: SpectrumReader + ?Sized>(
        &mut self,
        light_source: &str,
        path: impl AsRef<Path>,
        reader: &R,
    ) -> Result<usize> {
        let path = path.as_ref();
        self.ensure_light_source(light_source)?;
        let records = reader
            .read_spectra(path)
            .map_err(|e| CalibrationError::parse(path, e))?;
        let n = self.add_records(light_source, path, &records)?;
        info!(
            "Ingested {} of {} spectra from {} ({})",
            n,
            records.len(),
            path.display(),
            light_source
        );
        Ok(n)
    }

    /// Ingest in-memory records. `source` labels them in [`Self::ingested`].
    ///
    /// Either every in-scope record is ingested or, on error, none is.
    pub fn add_records(
        &mut self,
        light_source: &str,
        source: impl AsRef<Path>,
        records: &[SpectrumRecord],
    ) -> Result<usize> {
        self.ensure_light_source(light_source)?;
        let staged = self.stage(light_source, source.as_ref(), records)?;
        Ok(self.commit(staged))
    }

    fn ensure_light_source(&self, light_source: &str) -> Result<()> {
        if self.spectral_lines.contains_key(light_source) {
            Ok(())
        } else {
            Err(CalibrationError::UnknownLightSource(light_source.to_string()))
        }
    }

    fn stage(
        &self,
        light_source: &str,
        source: &Path,
        records: &[SpectrumRecord],
    ) -> Result<StagedIngestion> {
        let mut staged = StagedIngestion {
            orig: self.orig.polynomial().cloned(),
            saturation_level: self.saturation_level,
            max_intensity: self.max_intensity,
            rows: Vec::new(),
            peaks: Vec::new(),
            ingested: Vec::new(),
        };
        let min_intensity = self.min_intensity();

        for (record_index, record) in records.iter().enumerate() {
            if !record.is_from(&self.serial_number, &self.direction) {
                debug!(
                    "Skipping record {} of {}: {} {}",
                    record_index,
                    source.display(),
                    record.serial_number,
                    record.direction
                );
                continue;
            }

            check_record_values(record)?;
            let coeffs = WavelengthPolynomial::from_descending(&record.wavelength_coefficients);
            let orig = match staged.orig.take() {
                Some(existing) => {
                    let differs = existing
                        .max_abs_difference(&coeffs)
                        .map_or(true, |d| !(d <= self.config.coefficient_tolerance));
                    if differs {
                        return Err(CalibrationError::CoefficientMismatch {
                            existing: existing.coefficients().to_vec(),
                            offending: coeffs.coefficients().to_vec(),
                        });
                    }
                    existing
                }
                None => coeffs,
            };

            let saturation = *staged
                .saturation_level
                .get_or_insert(record.saturation_level);
            // A maximum set before the saturation level was known is checked here
            let max = *staged
                .max_intensity
                .get_or_insert(0.01 * self.config.saturation_percentage * saturation);
            check_band(min_intensity, Some(max), Some(saturation))?;

            let spectrum_id = self.ingested.len() + staged.ingested.len();
            staged
                .rows
                .extend(record.pixels.iter().enumerate().map(|(pixel, &intensity)| {
                    SpectrumRow {
                        pixel,
                        intensity,
                        orig_wavelength: orig.eval(pixel as f64),
                        spectrum_id,
                        light_source: light_source.to_string(),
                        new_wavelength: None,
                    }
                }));

            let band = IntensityBand::new(Some(min_intensity), staged.max_intensity);
            let peaks = find_peaks(&record.pixels, &band);
            debug!(
                "Spectrum {} ({}): {} peaks in [{}, {:?}]",
                spectrum_id,
                light_source,
                peaks.len(),
                min_intensity,
                staged.max_intensity
            );
            staged.peaks.extend(peaks);

            staged.ingested.push(IngestedSpectrum {
                source: source.to_path_buf(),
                record_index,
                light_source: light_source.to_string(),
            });
            staged.orig = Some(orig);
        }

        Ok(staged)
    }

    fn commit(&mut self, staged: StagedIngestion) -> usize {
        let n = staged.ingested.len();
        if n == 0 {
            return 0;
        }
        let light_source = &staged.ingested[0].light_source;

        if self.orig.coefficients().is_none() {
            if let Some(orig) = staged.orig {
                self.orig.set(orig.coefficients().to_vec());
            }
        }
        self.saturation_level = staged.saturation_level;
        self.max_intensity = staged.max_intensity;

        let first_row = self.spectra.len();
        self.spectra.extend(staged.rows);
        if let Some(new) = self.new.polynomial() {
            for row in &mut self.spectra[first_row..] {
                row.new_wavelength = Some(new.eval(row.pixel as f64));
            }
        }

        for pixel in staged.peaks {
            self.peaks
                .insert(pixel, PeakAssignment::unassigned(light_source.as_str()));
        }
        self.ingested.extend(staged.ingested);
        n
    }

    /// Ingestion log, one entry per spectrum.
    pub fn ingested(&self) -> &[IngestedSpectrum] {
        &self.ingested
    }

    pub fn num_spectra(&self) -> usize {
        self.ingested.len()
    }

    /// Spectra table: one row per pixel of every ingested spectrum.
    pub fn spectra(&self) -> &[SpectrumRow] {
        &self.spectra
    }

    pub fn spectrum_rows(&self, spectrum_id: usize) -> impl Iterator<Item = &SpectrumRow> {
        self.spectra
            .iter()
            .filter(move |row| row.spectrum_id == spectrum_id)
    }

    // ── Intensity band ──────────────────────────────────────────────────

    /// Lower edge of the peak band (the configured default until set).
    pub fn min_intensity(&self) -> f64 {
        self.min_intensity
            .unwrap_or(self.config.default_min_intensity)
    }

    /// Set the lower edge of the peak band.
    ///
    /// A value that is not positive and finite is rejected with
    /// [`CalibrationError::InvalidParameter`] (a configuration error). A value
    /// that breaks `min < max < saturation` is rejected with
    /// [`CalibrationError::IntensityBand`] (a consistency error). Either way the
    /// band is left unchanged. The same split applies to
    /// [`Self::set_max_intensity`] and [`Self::set_saturation_percentage`].
    pub fn set_min_intensity(&mut self, value: f64) -> Result<()> {
        check_band(value, self.max_intensity, self.saturation_level)?;
        self.min_intensity = Some(value);
        Ok(())
    }

    pub fn max_intensity(&self) -> Option<f64> {
        self.max_intensity
    }

    pub fn set_max_intensity(&mut self, value: f64) -> Result<()> {
        check_band(self.min_intensity(), Some(value), self.saturation_level)?;
        self.max_intensity = Some(value);
        Ok(())
    }

    pub fn saturation_level(&self) -> Option<f64> {
        self.saturation_level
    }

    /// Maximum intensity as a percentage of the saturation level.
    pub fn saturation_percentage(&self) -> Option<f64> {
        Some(100.0 * self.max_intensity? / self.saturation_level?)
    }

    /// Set the maximum intensity to `percentage` % of the saturation level.
    pub fn set_saturation_percentage(&mut self, percentage: f64) -> Result<()> {
        let saturation = self
            .saturation_level
            .ok_or(CalibrationError::SaturationUnknown)?;
        self.set_max_intensity(0.01 * percentage * saturation)
    }

    /// Band applied to newly ingested spectra.
    ///
    /// Unbounded until a maximum intensity is known.
    pub fn peak_band(&self) -> IntensityBand {
        match self.max_intensity {
            Some(max) => IntensityBand::new(Some(self.min_intensity()), Some(max)),
            None => IntensityBand::unbounded(),
        }
    }

    // ── Coefficients ────────────────────────────────────────────────────

    /// Factory coefficients, lowest degree first.
    pub fn orig_coeff(&self) -> Option<&[f64]> {
        self.orig.coefficients()
    }

    /// Fitted coefficients, lowest degree first.
    pub fn new_coeff(&self) -> Option<&[f64]> {
        self.new.coefficients()
    }

    /// Incremented every time the new coefficients are replaced.
    pub fn new_coeff_version(&self) -> u64 {
        self.new.version
    }

    /// Replace the new coefficients (lowest degree first), e.g. to restore a
    /// previously saved calibration. Recomputes every new wavelength.
    pub fn set_new_coeff(&mut self, coeffs: Vec<f64>) -> Result<()> {
        if coeffs.is_empty() {
            return Err(CalibrationError::InvalidParameter(
                "new coefficients must not be empty".to_string(),
            ));
        }
        if !coeffs.iter().all(|c| c.is_finite()) {
            return Err(CalibrationError::NonFinite);
        }
        self.new.set(coeffs);
        if let Some(new) = self.new.polynomial() {
            for row in &mut self.spectra {
                row.new_wavelength = Some(new.eval(row.pixel as f64));
            }
        }
        Ok(())
    }

    pub fn orig_polynomial(&self) -> Result<&WavelengthPolynomial> {
        self.orig.polynomial().ok_or(CalibrationError::NoSpectra)
    }

    pub fn new_polynomial(&self) -> Result<&WavelengthPolynomial> {
        self.new.polynomial().ok_or(CalibrationError::NotFitted)
    }

    pub fn orig_wavelength(&self, pixel: f64) -> Result<f64> {
        Ok(self.orig_polynomial()?.eval(pixel))
    }

    pub fn orig_wavelengths(&self, pixels: &[usize]) -> Result<Vec<f64>> {
        Ok(self.orig_polynomial()?.eval_pixels(pixels))
    }

    pub fn new_wavelength(&self, pixel: f64) -> Result<f64> {
        Ok(self.new_polynomial()?.eval(pixel))
    }

    pub fn new_wavelengths(&self, pixels: &[usize]) -> Result<Vec<f64>> {
        Ok(self.new_polynomial()?.eval_pixels(pixels))
    }

    // ── Peaks ───────────────────────────────────────────────────────────

    /// Peak table keyed by pixel index.
    pub fn peaks(&self) -> &BTreeMap<usize, PeakAssignment> {
        &self.peaks
    }

    /// Mutable peak table for manual review. Edits are picked up by the next
    /// [`Self::fit_wavelength`].
    pub fn peaks_mut(&mut self) -> &mut BTreeMap<usize, PeakAssignment> {
        &mut self.peaks
    }

    pub fn assign_peak(&mut self, pixel: usize, wavelength: f64) -> Result<()> {
        if !(wavelength.is_finite() && wavelength > 0.0) {
            return Err(CalibrationError::InvalidParameter(format!(
                "wavelength must be positive, got {wavelength}"
            )));
        }
        self.peak_mut(pixel)?.wavelength = Some(wavelength);
        Ok(())
    }

    pub fn unassign_peak(&mut self, pixel: usize) -> Result<()> {
        self.peak_mut(pixel)?.wavelength = None;
        Ok(())
    }

    pub fn remove_peak(&mut self, pixel: usize) -> Option<PeakAssignment> {
        self.peaks.remove(&pixel)
    }

    fn peak_mut(&mut self, pixel: usize) -> Result<&mut PeakAssignment> {
        self.peaks
            .get_mut(&pixel)
            .ok_or_else(|| CalibrationError::InvalidParameter(format!("no peak at pixel {pixel}")))
    }

    // ── Matching and fitting ────────────────────────────────────────────

    /// Assign reference wavelengths to peaks, per light source.
    ///
    /// All previous assignments are reset first, so repeated calls give the
    /// same table. Returns the number of matched peaks.
    pub fn match_wavelength(&mut self) -> Result<usize> {
        for assignment in self.peaks.values_mut() {
            assignment.wavelength = None;
        }
        if self.peaks.is_empty() {
            self.matched = true;
            return Ok(0);
        }
        let orig = self.orig.polynomial().ok_or(CalibrationError::NoSpectra)?;

        let mut n_matched = 0;
        for (name, catalogue) in &self.spectral_lines {
            let candidates: Vec<(usize, f64)> = self
                .peaks
                .iter()
                .filter(|(_, a)| a.light_source == *name)
                .map(|(&pixel, _)| (pixel, orig.eval(pixel as f64)))
                .collect();
            let matched = catalogue.match_peaks(&candidates, self.config.match_tolerance_nm);
            debug!(
                "{}: matched {} of {} peaks",
                name,
                matched.len(),
                candidates.len()
            );
            for (pixel, wavelength) in matched {
                if let Some(assignment) = self.peaks.get_mut(&pixel) {
                    assignment.wavelength = Some(wavelength);
                    n_matched += 1;
                }
            }
        }

        self.matched = true;
        info!("Matched {} of {} peaks", n_matched, self.peaks.len());
        Ok(n_matched)
    }

    /// Fit new coefficients through every assigned peak.
    ///
    /// On error the previous new coefficients are kept.
    pub fn fit_wavelength(&mut self, config: &FitConfig) -> Result<WavelengthFitResult> {
        config.validate()?;

        let (pixels, wavelengths): (Vec<f64>, Vec<f64>) = self
            .peaks
            .iter()
            .filter_map(|(&pixel, a)| a.wavelength.map(|w| (pixel as f64, w)))
            .unzip();
        let needed = config.order + 1;
        if pixels.len() < needed {
            return Err(CalibrationError::InsufficientData {
                needed,
                found: pixels.len(),
            });
        }

        let weights = gaussian_weights(&pixels, config);
        let polynomial = fit_polynomial(&pixels, &wavelengths, weights.as_deref(), config.order)?;

        let residuals = |p: &WavelengthPolynomial| {
            rms(pixels
                .iter()
                .zip(&wavelengths)
                .map(|(&x, &w)| w - p.eval(x)))
        };
        let rmse_before_nm = self.orig.polynomial().map_or(f64::NAN, residuals);
        let rmse_after_nm = residuals(&polynomial);

        self.set_new_coeff(polynomial.coefficients().to_vec())?;
        info!(
            "Fitted order {} wavelength polynomial to {} peaks{}: RMSE {:.4} nm -> {:.4} nm",
            config.order,
            pixels.len(),
            if weights.is_some() { " (weighted)" } else { "" },
            rmse_before_nm,
            rmse_after_nm
        );

        Ok(WavelengthFitResult {
            polynomial,
            n_points: pixels.len(),
            weighted: weights.is_some(),
            rmse_before_nm,
            rmse_after_nm,
        })
    }

    /// Reference minus calibrated wavelength at every assigned peak.
    pub fn peak_residuals(&self) -> Result<Vec<PeakResidual>> {
        let orig = self.orig_polynomial()?;
        let new = self.new.polynomial();
        Ok(self
            .peaks
            .iter()
            .filter_map(|(&pixel, a)| {
                let reference = a.wavelength?;
                let x = pixel as f64;
                Some(PeakResidual {
                    pixel,
                    light_source: a.light_source.clone(),
                    reference_nm: reference,
                    orig_residual_nm: reference - orig.eval(x),
                    new_residual_nm: new.map(|p| reference - p.eval(x)),
                })
            })
            .collect())
    }

    pub fn state(&self) -> DatasetState {
        if self.new.coefficients().is_some() {
            DatasetState::Fitted
        } else if self.matched {
            DatasetState::Matched
        } else if !self.ingested.is_empty() {
            DatasetState::SpectraIngested
        } else if !self.spectral_lines.is_empty() {
            DatasetState::LightSourcesRegistered
        } else {
            DatasetState::Empty
        }
    }
}

/// Reject records whose calibration metadata cannot be compared or evaluated.
fn check_record_values(record: &SpectrumRecord) -> Result<()> {
    if !record.saturation_level.is_finite()
        || !record.wavelength_coefficients.iter().all(|c| c.is_finite())
    {
        return Err(CalibrationError::NonFinite);
    }
    if record.saturation_level <= 0.0 {
        return Err(CalibrationError::InvalidParameter(format!(
            "saturation level must be positive, got {}",
            record.saturation_level
        )));
    }
    if record.wavelength_coefficients.is_empty() {
        return Err(CalibrationError::InvalidParameter(
            "no wavelength calibration coefficients".to_string(),
        ));
    }
    Ok(())
}

/// Validate `0 < min < max < saturation` for whichever bounds are known.
fn check_band(min: f64, max: Option<f64>, saturation: Option<f64>) -> Result<()> {
    if !(min.is_finite() && min > 0.0) {
        return Err(CalibrationError::InvalidParameter(format!(
            "minimum intensity must be positive, got {min}"
        )));
    }
    if let Some(max) = max {
        if !max.is_finite() {
            return Err(CalibrationError::InvalidParameter(format!(
                "maximum intensity must be finite, got {max}"
            )));
        }
        if max <= min {
            return Err(CalibrationError::IntensityBand(format!(
                "maximum intensity {max} must be larger than minimum intensity {min}"
            )));
        }
    }
    if let Some(saturation) = saturation {
        let upper = max.unwrap_or(min);
        if upper >= saturation {
            return Err(CalibrationError::IntensityBand(format!(
                "intensity {upper} must be below the saturation level {saturation}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use approx::assert_relative_eq;

    const SERIAL: &str = "QEP00114";
    const DIRECTION: &str = "Upwelling";
    const SATURATION: f64 = 65535.0;
    // λ = 400 + 0.5·p, highest degree first as in the instrument metadata
    const FACTORY: [f64; 2] = [0.5, 400.0];
    const LINE_PIXELS: [usize; 4] = [40, 80, 120, 160];

    fn lamp_pixels(lines: &[(usize, f64)]) -> Vec<f64> {
        (0..200)
            .map(|p| {
                lines.iter().fold(1000.0, |acc, &(centre, amplitude)| {
                    let d = p as f64 - centre as f64;
                    acc + amplitude * (-d * d / 4.5).exp()
                })
            })
            .collect()
    }

    fn record(coeffs: &[f64], lines: &[(usize, f64)]) -> SpectrumRecord {
        SpectrumRecord {
            serial_number: SERIAL.to_string(),
            direction: DIRECTION.to_string(),
            saturation_level: SATURATION,
            wavelength_coefficients: coeffs.to_vec(),
            pixels: lamp_pixels(lines),
        }
    }

    fn lamp_record() -> SpectrumRecord {
        let lines: Vec<(usize, f64)> = LINE_PIXELS.iter().map(|&p| (p, 30000.0)).collect();
        record(&FACTORY, &lines)
    }

    /// Reference lines sit 0.5 nm above the factory calibration.
    fn dataset() -> CalibrationDataset {
        let mut ds = CalibrationDataset::new(SERIAL, DIRECTION);
        let lines = LINE_PIXELS.iter().map(|&p| 400.5 + 0.5 * p as f64);
        ds.add_light_source_lines(SpectralLineCatalogue::from_wavelengths("Lamp", lines))
            .unwrap();
        ds
    }

    fn ingested() -> CalibrationDataset {
        let mut ds = dataset();
        assert_eq!(ds.add_records("Lamp", "lamp.pico", &[lamp_record()]).unwrap(), 1);
        ds
    }

    #[test]
    fn duplicate_and_unknown_light_sources() {
        let mut ds = dataset();
        let err = ds
            .add_light_source_lines(SpectralLineCatalogue::from_wavelengths("Lamp", [500.0]))
            .unwrap_err();
        assert!(matches!(err, CalibrationError::DuplicateLightSource(_)));
        let err = ds.add_records("Other", "x", &[lamp_record()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(ds.light_sources().collect::<Vec<_>>(), vec!["Lamp"]);
    }

    #[test]
    fn ingestion_fills_tables() {
        let ds = ingested();
        assert_eq!(ds.num_spectra(), 1);
        assert_eq!(ds.spectra().len(), 200);
        assert_eq!(ds.peaks().keys().copied().collect::<Vec<_>>(), LINE_PIXELS);
        assert!(ds.peaks().values().all(|a| !a.is_assigned()));
        assert_eq!(ds.orig_coeff(), Some(&[400.0, 0.5][..]));
        assert_relative_eq!(ds.orig_wavelength(40.0).unwrap(), 420.0, epsilon = 1e-12);
        let row = ds.spectrum_rows(0).nth(10).unwrap();
        assert_relative_eq!(row.orig_wavelength, 405.0, epsilon = 1e-12);
        assert!(row.new_wavelength.is_none());
        assert_eq!(ds.state(), DatasetState::SpectraIngested);
    }

    #[test]
    fn orig_coeff_is_write_once() {
        let mut ds = ingested();
        // Within tolerance is accepted and does not move the stored value
        let close = record(&[0.5 + 1e-7, 400.0], &[(40, 30000.0)]);
        assert_eq!(ds.add_records("Lamp", "close.pico", &[close]).unwrap(), 1);
        assert_eq!(ds.orig_coeff(), Some(&[400.0, 0.5][..]));

        let far = record(&[0.5, 401.0], &[(40, 30000.0)]);
        let err = ds.add_records("Lamp", "far.pico", &[far]).unwrap_err();
        assert!(matches!(err, CalibrationError::CoefficientMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_eq!(ds.num_spectra(), 2);
    }

    #[test]
    fn mismatch_within_a_file_commits_nothing() {
        let mut ds = dataset();
        let good = lamp_record();
        let bad = record(&[0.6, 400.0], &[(100, 30000.0)]);
        let err = ds.add_records("Lamp", "mixed.pico", &[good, bad]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_eq!(ds.num_spectra(), 0);
        assert!(ds.spectra().is_empty());
        assert!(ds.peaks().is_empty());
        assert!(ds.orig_coeff().is_none());
        assert!(ds.saturation_level().is_none());
        assert!(ds.max_intensity().is_none());
    }

    #[test]
    fn foreign_records_are_skipped() {
        let mut ds = dataset();
        let mut other_serial = lamp_record();
        other_serial.serial_number = "QEP00999".to_string();
        let mut other_direction = lamp_record();
        other_direction.direction = "Downwelling".to_string();
        // Foreign records never take part in the coefficient check
        other_direction.wavelength_coefficients = vec![1.0, 2.0, 3.0];
        let n = ds
            .add_records("Lamp", "f.pico", &[other_serial, lamp_record(), other_direction])
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(ds.ingested()[0].record_index, 1);
        assert_eq!(ds.add_records("Lamp", "g.pico", &[]).unwrap(), 0);
    }

    #[test]
    fn saturation_defaults_band_and_excludes_clipped_lines() {
        let mut ds = dataset();
        assert!(ds.peak_band().is_unbounded());
        let err = ds.set_saturation_percentage(90.0).unwrap_err();
        assert!(matches!(err, CalibrationError::SaturationUnknown));

        let rec = record(&FACTORY, &[(40, 30000.0), (100, 60000.0), (150, 2000.0)]);
        ds.add_records("Lamp", "sat.pico", &[rec]).unwrap();
        assert_eq!(ds.saturation_level(), Some(SATURATION));
        assert_relative_eq!(ds.max_intensity().unwrap(), 0.8 * SATURATION, epsilon = 1e-9);
        assert_relative_eq!(ds.saturation_percentage().unwrap(), 80.0, epsilon = 1e-9);
        // 61000 is above the band and 3000 below it
        assert_eq!(ds.peaks().keys().copied().collect::<Vec<_>>(), vec![40]);

        ds.set_saturation_percentage(95.0).unwrap();
        assert_relative_eq!(ds.max_intensity().unwrap(), 0.95 * SATURATION, epsilon = 1e-9);
        let band = ds.peak_band();
        assert_eq!(band.min, Some(5000.0));
    }

    #[test]
    fn preset_maximum_is_checked_against_saturation() {
        let mut ds = dataset();
        // Accepted while the saturation level is unknown
        ds.set_max_intensity(70000.0).unwrap();
        let rec = record(&FACTORY, &[(40, 30000.0), (100, 64535.0)]);
        let err = ds.add_records("Lamp", "clipped.pico", &[rec]).unwrap_err();
        assert!(matches!(err, CalibrationError::IntensityBand(_)));
        assert_eq!(ds.num_spectra(), 0);
        assert!(ds.peaks().is_empty());
        assert!(ds.saturation_level().is_none());
        assert!(ds.orig_coeff().is_none());

        // A preset maximum below saturation is kept instead of the default
        ds.set_max_intensity(60000.0).unwrap();
        let rec = record(&FACTORY, &[(40, 30000.0), (100, 64535.0)]);
        ds.add_records("Lamp", "ok.pico", &[rec]).unwrap();
        assert_relative_eq!(ds.max_intensity().unwrap(), 60000.0);
        assert_eq!(ds.peaks().keys().copied().collect::<Vec<_>>(), vec![40]);
    }

    #[test]
    fn non_finite_metadata_is_rejected() {
        let mut ds = ingested();
        let n_spectra = ds.num_spectra();

        let nan_coeff = record(&[f64::NAN, 400.0], &[(40, 30000.0)]);
        let err = ds.add_records("Lamp", "nan.pico", &[nan_coeff]).unwrap_err();
        assert!(matches!(err, CalibrationError::NonFinite));

        let mut nan_saturation = lamp_record();
        nan_saturation.saturation_level = f64::NAN;
        let err = ds
            .add_records("Lamp", "nan_sat.pico", &[nan_saturation])
            .unwrap_err();
        assert!(matches!(err, CalibrationError::NonFinite));

        let mut no_coeffs = lamp_record();
        no_coeffs.wavelength_coefficients.clear();
        let err = ds.add_records("Lamp", "empty.pico", &[no_coeffs]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        assert_eq!(ds.num_spectra(), n_spectra);
        assert_eq!(ds.orig_coeff(), Some(&[400.0, 0.5][..]));
    }

    #[test]
    fn nan_coefficients_never_match() {
        let mut ds = dataset();
        let mut first = lamp_record();
        first.wavelength_coefficients = vec![f64::NAN, 400.0];
        assert!(ds.add_records("Lamp", "first.pico", &[first]).is_err());
        assert!(ds.orig_coeff().is_none());
    }

    #[test]
    fn invalid_band_leaves_values_unchanged() {
        let mut ds = ingested();
        let max = ds.max_intensity().unwrap();
        let err = ds.set_min_intensity(max).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_relative_eq!(ds.min_intensity(), 5000.0);

        let err = ds.set_max_intensity(4000.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        let err = ds.set_max_intensity(SATURATION).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_relative_eq!(ds.max_intensity().unwrap(), max);

        assert_eq!(ds.set_min_intensity(-1.0).unwrap_err().kind(), ErrorKind::Configuration);
        ds.set_min_intensity(2000.0).unwrap();
        assert_relative_eq!(ds.min_intensity(), 2000.0);
    }

    #[test]
    fn match_is_idempotent() {
        let mut ds = ingested();
        assert_eq!(ds.match_wavelength().unwrap(), 4);
        let first = ds.peaks().clone();
        assert_relative_eq!(first[&40].wavelength.unwrap(), 420.5);
        assert_eq!(ds.match_wavelength().unwrap(), 4);
        assert_eq!(ds.peaks(), &first);
        assert_eq!(ds.state(), DatasetState::Matched);
    }

    #[test]
    fn match_resets_manual_edits() {
        let mut ds = ingested();
        ds.match_wavelength().unwrap();
        ds.unassign_peak(80).unwrap();
        ds.assign_peak(120, 999.0).unwrap();
        ds.match_wavelength().unwrap();
        assert_relative_eq!(ds.peaks()[&80].wavelength.unwrap(), 440.5);
        assert_relative_eq!(ds.peaks()[&120].wavelength.unwrap(), 460.5);
        assert!(ds.assign_peak(3, 500.0).is_err());
    }

    #[test]
    fn two_point_line_fit() {
        let mut ds = ingested();
        ds.peaks_mut().clear();
        ds.peaks_mut().insert(
            10,
            PeakAssignment {
                light_source: "Lamp".to_string(),
                wavelength: Some(500.0),
            },
        );
        ds.peaks_mut().insert(
            20,
            PeakAssignment {
                light_source: "Lamp".to_string(),
                wavelength: Some(510.0),
            },
        );
        let result = ds.fit_wavelength(&FitConfig::with_order(1)).unwrap();
        assert_eq!(result.n_points, 2);
        assert!(!result.weighted);
        let coeffs = ds.new_coeff().unwrap();
        assert_relative_eq!(coeffs[0], 490.0, epsilon = 1e-9);
        assert_relative_eq!(coeffs[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(ds.new_wavelength(15.0).unwrap(), 505.0, epsilon = 1e-9);
    }

    #[test]
    fn fit_reproduces_assigned_wavelengths() {
        let mut ds = ingested();
        ds.match_wavelength().unwrap();
        let result = ds.fit_wavelength(&FitConfig::default()).unwrap();
        assert_eq!(result.n_points, 4);
        assert_relative_eq!(result.rmse_before_nm, 0.5, epsilon = 1e-9);
        assert!(result.rmse_after_nm < 1e-8);

        let new = ds.new_wavelengths(&LINE_PIXELS).unwrap();
        for (p, w) in LINE_PIXELS.iter().zip(new) {
            assert_relative_eq!(w, 400.5 + 0.5 * *p as f64, epsilon = 1e-8);
        }
        // Spectra table follows the new calibration
        let row = ds.spectrum_rows(0).nth(10).unwrap();
        assert_relative_eq!(row.new_wavelength.unwrap(), 405.5, epsilon = 1e-8);
        assert_eq!(ds.state(), DatasetState::Fitted);

        let residuals = ds.peak_residuals().unwrap();
        assert_eq!(residuals.len(), 4);
        for r in residuals {
            assert_relative_eq!(r.orig_residual_nm, 0.5, epsilon = 1e-9);
            assert!(r.new_residual_nm.unwrap().abs() < 1e-8);
        }
    }

    #[test]
    fn failed_fit_keeps_previous_coefficients() {
        let mut ds = ingested();
        ds.match_wavelength().unwrap();
        ds.fit_wavelength(&FitConfig::with_order(1)).unwrap();
        let before = ds.new_coeff().unwrap().to_vec();
        let version = ds.new_coeff_version();

        let err = ds.fit_wavelength(&FitConfig::with_order(4)).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientData { needed: 5, found: 4 }
        ));
        assert_eq!(ds.new_coeff().unwrap(), &before[..]);
        assert_eq!(ds.new_coeff_version(), version);
    }

    #[test]
    fn manual_edits_feed_the_next_fit() {
        let mut ds = ingested();
        ds.match_wavelength().unwrap();
        ds.unassign_peak(160).unwrap();
        assert!(ds.remove_peak(120).is_some());
        let result = ds.fit_wavelength(&FitConfig::with_order(1)).unwrap();
        assert_eq!(result.n_points, 2);

        ds.peaks_mut().get_mut(&80).unwrap().wavelength = Some(441.5);
        let result = ds.fit_wavelength(&FitConfig::with_order(1)).unwrap();
        assert_relative_eq!(result.polynomial.coefficients()[1], 0.5 + 1.0 / 40.0, epsilon = 1e-9);
    }

    #[test]
    fn weighted_fit_is_reported() {
        let mut ds = ingested();
        ds.match_wavelength().unwrap();
        let config = FitConfig {
            order: 1,
            optimize_wavelength: Some(100.0),
            ..Default::default()
        };
        let result = ds.fit_wavelength(&config).unwrap();
        assert!(result.weighted);
        // Exact data: weighting does not move the solution
        assert_relative_eq!(ds.new_wavelength(100.0).unwrap(), 450.5, epsilon = 1e-8);
    }

    #[test]
    fn coefficient_access_before_data() {
        let ds = dataset();
        assert!(matches!(ds.orig_polynomial(), Err(CalibrationError::NoSpectra)));
        assert!(matches!(ds.new_wavelength(1.0), Err(CalibrationError::NotFitted)));
        assert!(ds.peak_residuals().is_err());
        assert_eq!(ds.state(), DatasetState::LightSourcesRegistered);
        assert_eq!(
            CalibrationDataset::new(SERIAL, DIRECTION).state(),
            DatasetState::Empty
        );
    }

    #[test]
    fn restoring_coefficients_updates_rows() {
        let mut ds = ingested();
        ds.set_new_coeff(vec![401.0, 0.5]).unwrap();
        assert_eq!(ds.new_coeff_version(), 1);
        assert!(ds
            .spectra()
            .iter()
            .all(|r| (r.new_wavelength.unwrap() - r.orig_wavelength - 1.0).abs() < 1e-9));
        assert!(ds.set_new_coeff(Vec::new()).is_err());

        // Later ingestion picks up the current new calibration
        ds.add_records("Lamp", "more.pico", &[lamp_record()]).unwrap();
        let row = ds.spectrum_rows(1).next().unwrap();
        assert_relative_eq!(row.new_wavelength.unwrap(), 401.0);
    }
}
