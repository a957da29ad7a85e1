//! Error taxonomy for the calibration engine.
//!
//! Every fallible operation on a [`CalibrationDataset`](crate::CalibrationDataset)
//! returns a [`CalibrationError`]. Errors fall into five kinds (see [`ErrorKind`]):
//!
//! - **Configuration**: usage errors such as registering a light source twice.
//! - **Consistency**: the request contradicts state already committed to the dataset.
//! - **Parse**: a catalogue or spectrum file could not be read. Recoverable: skip
//!   the file and keep going with the rest of the batch.
//! - **InsufficientData**: too few matched peaks for the requested polynomial.
//! - **Numeric**: the least-squares problem is degenerate.

use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of a [`CalibrationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Consistency,
    Parse,
    InsufficientData,
    Numeric,
}

impl ErrorKind {
    /// Whether a batch driver may skip the offending input and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::Parse)
    }
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("light source {0} is already loaded")]
    DuplicateLightSource(String),

    #[error("light source {0} not registered")]
    UnknownLightSource(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(
        "trying to change original wavelength coefficients: {existing:?} -> {offending:?}"
    )]
    CoefficientMismatch {
        existing: Vec<f64>,
        offending: Vec<f64>,
    },

    #[error("invalid intensity band: {0}")]
    IntensityBand(String),

    #[error("saturation level is not known until a spectrum has been ingested")]
    SaturationUnknown,

    #[error("original wavelength coefficients not set yet")]
    NoSpectra,

    #[error("new wavelength coefficients not set yet")]
    NotFitted,

    #[error("failed to parse {}: {source:#}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("need at least {needed} matched peaks, found {found}")]
    InsufficientData { needed: usize, found: usize },

    #[error("rank deficient fit: rank {rank}, need {needed}")]
    RankDeficient { rank: usize, needed: usize },

    #[error("non-finite value in fit input")]
    NonFinite,
}

impl CalibrationError {
    pub fn kind(&self) -> ErrorKind {
        use CalibrationError::*;
        match self {
            DuplicateLightSource(_) | UnknownLightSource(_) | InvalidParameter(_) => {
                ErrorKind::Configuration
            }
            CoefficientMismatch { .. }
            | IntensityBand(_)
            | SaturationUnknown
            | NoSpectra
            | NotFitted => ErrorKind::Consistency,
            Parse { .. } => ErrorKind::Parse,
            InsufficientData { .. } => ErrorKind::InsufficientData,
            RankDeficient { .. } | NonFinite => ErrorKind::Numeric,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, source: anyhow::Error) -> Self {
        CalibrationError::Parse {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CalibrationError>;
