//! Weighted least-squares fitting of the pixel → wavelength polynomial.
//!
//! The fit is the standard Vandermonde formulation:
//!
//! ```text
//! minimise Σ wᵢ² · (λᵢ − Σₖ cₖ·pᵢᵏ)²
//! ```
//!
//! Rows of the design matrix and the right-hand side are multiplied by the
//! weights, each column is scaled to unit norm to keep high powers of the
//! pixel index well conditioned, and the system is solved by SVD. A design
//! matrix whose numerical rank is below `order + 1` (e.g. too few distinct
//! pixels) is rejected rather than solved.
//!
//! # Region weighting
//!
//! When an optimisation target is given, each point is weighted with
//!
//! ```text
//! w(p) = 0.5 + a · exp(−(p − b)² / (2c²))
//! ```
//!
//! where `b` is the target and `c` the gaussian width. Note that `p` here is
//! the **pixel index** of the matched peak even though `b` is documented as a
//! wavelength. Existing calibrations were produced this way, so the
//! behaviour is kept as is.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{CalibrationError, Result};
use crate::polynomial::WavelengthPolynomial;

/// Configuration for [`CalibrationDataset::fit_wavelength`](crate::CalibrationDataset::fit_wavelength).
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Degree of the fitted polynomial. Default 3.
    pub order: usize,
    /// Centre of the gaussian weighting. `None` fits unweighted.
    /// Default: None
    pub optimize_wavelength: Option<f64>,
    /// Width (standard deviation) of the gaussian weighting. Must be positive.
    /// Default 100.
    pub gaussian_width: f64,
    /// Amplitude of the gaussian weighting. With the default of 1.0 the
    /// weights lie in `(0.5, 1.5]`.
    pub gaussian_amplitude: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            order: 3,
            optimize_wavelength: None,
            gaussian_width: 100.0,
            gaussian_amplitude: 1.0,
        }
    }
}

impl FitConfig {
    /// Plain fit of the given degree.
    pub fn with_order(order: usize) -> Self {
        Self {
            order,
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.gaussian_width.is_finite() && self.gaussian_width > 0.0) {
            return Err(CalibrationError::InvalidParameter(format!(
                "gaussian width must be positive, got {}",
                self.gaussian_width
            )));
        }
        if !self.gaussian_amplitude.is_finite() || self.gaussian_amplitude < 0.0 {
            return Err(CalibrationError::InvalidParameter(format!(
                "gaussian amplitude must be non-negative, got {}",
                self.gaussian_amplitude
            )));
        }
        if let Some(centre) = self.optimize_wavelength {
            if !centre.is_finite() {
                return Err(CalibrationError::InvalidParameter(
                    "optimisation target must be finite".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Result of a wavelength fit.
#[derive(Debug, Clone)]
pub struct WavelengthFitResult {
    /// The fitted polynomial (also stored as the dataset's new coefficients).
    pub polynomial: WavelengthPolynomial,
    /// Number of matched peaks used in the fit.
    pub n_points: usize,
    /// Whether gaussian region weighting was applied.
    pub weighted: bool,
    /// RMS of (reference − original-calibration wavelength) at the fitted peaks, nm.
    pub rmse_before_nm: f64,
    /// RMS of (reference − new-calibration wavelength) at the fitted peaks, nm.
    pub rmse_after_nm: f64,
}

/// `a · exp(−(x − b)² / (2c²))`
pub fn gaussian(a: f64, b: f64, c: f64, x: f64) -> f64 {
    a * (-(x - b).powi(2) / (2.0 * c * c)).exp()
}

/// Per-point weights for the given pixels, or `None` for an unweighted fit.
pub fn gaussian_weights(pixels: &[f64], config: &FitConfig) -> Option<Vec<f64>> {
    let centre = config.optimize_wavelength?;
    Some(
        pixels
            .iter()
            .map(|&p| 0.5 + gaussian(config.gaussian_amplitude, centre, config.gaussian_width, p))
            .collect(),
    )
}

/// Weighted least-squares polynomial fit of `y` against `x`.
///
/// Returns the polynomial of degree `order`. Fails with
/// [`CalibrationError::InvalidParameter`] when the slice lengths differ,
/// [`CalibrationError::InsufficientData`] when there are fewer than
/// `order + 1` points and [`CalibrationError::RankDeficient`] when the
/// points do not determine a unique polynomial.
pub fn fit_polynomial(
    x: &[f64],
    y: &[f64],
    weights: Option<&[f64]>,
    order: usize,
) -> Result<WavelengthPolynomial> {
    if x.len() != y.len() {
        return Err(CalibrationError::InvalidParameter(format!(
            "x and y must have the same length, got {} and {}",
            x.len(),
            y.len()
        )));
    }
    if let Some(w) = weights {
        if w.len() != x.len() {
            return Err(CalibrationError::InvalidParameter(format!(
                "expected {} weights, got {}",
                x.len(),
                w.len()
            )));
        }
    }

    let n = x.len();
    let n_coeffs = order + 1;
    if n < n_coeffs {
        return Err(CalibrationError::InsufficientData {
            needed: n_coeffs,
            found: n,
        });
    }

    let finite = |v: &[f64]| v.iter().all(|a| a.is_finite());
    if !finite(x) || !finite(y) || !weights.map_or(true, finite) {
        return Err(CalibrationError::NonFinite);
    }

    let weight = |i: usize| weights.map_or(1.0, |w| w[i]);

    let mut a_mat = DMatrix::<f64>::from_fn(n, n_coeffs, |i, k| weight(i) * x[i].powi(k as i32));
    let b_vec = DVector::<f64>::from_fn(n, |i, _| weight(i) * y[i]);

    // Column scaling
    let scale: Vec<f64> = (0..n_coeffs)
        .map(|k| {
            let norm = a_mat.column(k).norm();
            if norm > 0.0 {
                norm
            } else {
                1.0
            }
        })
        .collect();
    for (k, &s) in scale.iter().enumerate() {
        a_mat.column_mut(k).unscale_mut(s);
    }

    let svd = a_mat.svd(true, true);
    let sigma_max = svd.singular_values.max();
    let tol = n as f64 * f64::EPSILON * sigma_max;
    let rank = svd.rank(tol);
    if rank < n_coeffs {
        debug!("Polynomial fit of order {} is rank deficient ({} < {})", order, rank, n_coeffs);
        return Err(CalibrationError::RankDeficient {
            rank,
            needed: n_coeffs,
        });
    }

    let solution = svd
        .solve(&b_vec, tol)
        .map_err(|_| CalibrationError::RankDeficient {
            rank,
            needed: n_coeffs,
        })?;

    let coeffs: Vec<f64> = solution
        .iter()
        .zip(&scale)
        .map(|(c, s)| c / s)
        .collect();
    if !finite(&coeffs) {
        return Err(CalibrationError::NonFinite);
    }

    Ok(WavelengthPolynomial::new(coeffs))
}

/// Root-mean-square of a set of residuals (0 for an empty set).
pub(crate) fn rms(residuals: impl IntoIterator<Item = f64>) -> f64 {
    let (sum_sq, count) = residuals
        .into_iter()
        .fold((0.0, 0usize), |(s, n), r| (s + r * r, n + 1));
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt()
}
