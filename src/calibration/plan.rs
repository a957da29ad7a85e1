//! Batch ingestion from a calibration plan.
//!
//! A plan names each light source, its reference-line file and the spectra
//! files recorded with it. [`CalibrationDataset::ingest_plan`] registers the
//! light sources and ingests every file, skipping spectra files that cannot be
//! parsed. Plans derive serde so front-ends can keep them in whatever config
//! format they already use.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::CalibrationDataset;
use crate::error::Result;

/// Light sources and files to ingest into one dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPlan {
    pub light_sources: Vec<LightSourcePlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSourcePlan {
    pub name: String,
    /// Reference-line file of the light source.
    pub spectral_lines: PathBuf,
    /// Spectra files recorded with the light source.
    #[serde(default)]
    pub spectra: Vec<PathBuf>,
}

impl CalibrationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a light source to the plan.
    pub fn with_light_source(
        mut self,
        name: impl Into<String>,
        spectral_lines: impl Into<PathBuf>,
        spectra: impl IntoIterator<Item = impl Into<PathBuf>>,
    ) -> Self {
        self.light_sources.push(LightSourcePlan {
            name: name.into(),
            spectral_lines: spectral_lines.into(),
            spectra: spectra.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn num_files(&self) -> usize {
        self.light_sources.iter().map(|ls| ls.spectra.len()).sum()
    }
}

/// Spectra file left out of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of [`CalibrationDataset::ingest_plan`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Spectra files read successfully (including files with no in-scope record).
    pub files_ingested: usize,
    /// Spectra ingested over all files.
    pub spectra_ingested: usize,
    pub skipped: Vec<SkippedFile>,
}

impl CalibrationDataset {
    /// Register every light source of `plan` and ingest its spectra files.
    ///
    /// Recoverable errors on a spectra file (see
    /// [`ErrorKind::is_recoverable`](crate::ErrorKind::is_recoverable)) are
    /// logged and the file is skipped. Any other error aborts the batch.
    pub fn ingest_plan(&mut self, plan: &CalibrationPlan) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        for source in &plan.light_sources {
            self.add_light_source(source.name.as_str(), &source.spectral_lines)?;
            for path in &source.spectra {
                match self.add_spectrum(&source.name, path) {
                    Ok(n) => {
                        report.files_ingested += 1;
                        report.spectra_ingested += n;
                    }
                    Err(e) if e.kind().is_recoverable() => {
                        warn!("Skipping {}: {}", path.display(), e);
                        report.skipped.push(SkippedFile {
                            path: path.clone(),
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        info!(
            "Batch complete: {} spectra from {} of {} files ({} skipped)",
            report.spectra_ingested,
            report.files_ingested,
            plan.num_files(),
            report.skipped.len()
        );
        Ok(report)
    }
}
