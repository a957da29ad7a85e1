//! Pixel → wavelength polynomial.
//!
//! ```text
//! λ(p) = c0 + c1·p + c2·p² + … + cn·pⁿ
//! ```
//!
//! Coefficients are stored lowest-degree-first (`c0` first, highest degree
//! last). Instrument metadata and numpy-style exports list them the other way
//! round; use [`WavelengthPolynomial::from_descending`] and
//! [`WavelengthPolynomial::to_descending`] at those boundaries.

#[derive(Debug, Clone, PartialEq)]
pub struct WavelengthPolynomial {
    coeffs: Vec<f64>,
}

impl WavelengthPolynomial {
    /// Create a polynomial from lowest-degree-first coefficients.
    ///
    /// An empty coefficient list is the zero polynomial.
    pub fn new(coeffs: Vec<f64>) -> Self {
        Self { coeffs }
    }

    /// Create a polynomial from highest-degree-first coefficients.
    pub fn from_descending(coeffs: &[f64]) -> Self {
        Self {
            coeffs: coeffs.iter().rev().copied().collect(),
        }
    }

    /// Coefficients, lowest degree first.
    pub fn coefficients(&self) -> &[f64] {
        &self.coeffs
    }

    /// Coefficients, highest degree first.
    pub fn to_descending(&self) -> Vec<f64> {
        self.coeffs.iter().rev().copied().collect()
    }

    /// Polynomial degree (number of coefficients minus one).
    pub fn degree(&self) -> usize {
        self.coeffs.len().saturating_sub(1)
    }

    /// Evaluate at a single (possibly fractional) pixel position.
    pub fn eval(&self, pixel: f64) -> f64 {
        // Horner's scheme
        self.coeffs.iter().rev().fold(0.0, |acc, &c| acc * pixel + c)
    }

    /// Evaluate at integer pixel indices.
    pub fn eval_pixels(&self, pixels: &[usize]) -> Vec<f64> {
        pixels.iter().map(|&p| self.eval(p as f64)).collect()
    }

    /// Evaluate at arbitrary positions.
    pub fn eval_many(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.eval(x)).collect()
    }

    /// Largest element-wise coefficient difference, or `None` if the two
    /// polynomials have a different number of coefficients. NaN if any
    /// difference is NaN.
    pub fn max_abs_difference(&self, other: &WavelengthPolynomial) -> Option<f64> {
        if self.coeffs.len() != other.coeffs.len() {
            return None;
        }
        Some(
            self.coeffs
                .iter()
                .zip(&other.coeffs)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, |acc, d| if d.is_nan() || d > acc { d } else { acc }),
        )
    }
}
