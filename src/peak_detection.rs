//! Detect candidate emission-line peaks in a raw spectrum.
//!
//! A peak is a local maximum of the per-pixel intensity array whose height
//! lies inside an inclusive intensity band:
//!
//! 1. An interior sample is a candidate if it is strictly greater than its
//!    left neighbour and strictly greater than the first differing sample to
//!    its right. A flat-topped plateau reports its middle pixel (rounded
//!    down). The first and last samples are never peaks.
//! 2. Candidates outside `[min, max]` are discarded. The lower bound keeps
//!    noise bumps out; the upper bound keeps saturated (clipped) lines out,
//!    since their apparent centre is unreliable.
//!
//! # Example
//!
//! ```
//! use piccolo_wavecal::{find_peaks, IntensityBand};
//!
//! let intensity = [0.0, 5.0, 1.0, 9.0, 9.0, 2.0, 70.0, 3.0];
//! assert_eq!(find_peaks(&intensity, &IntensityBand::unbounded()), vec![1, 3, 6]);
//! assert_eq!(find_peaks(&intensity, &IntensityBand::new(Some(4.0), Some(50.0))), vec![1, 3]);
//! ```

/// Inclusive intensity band used to gate peak heights.
///
/// Either bound may be absent, meaning unbounded on that side.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IntensityBand {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl IntensityBand {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    /// Band accepting every local maximum.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |lo| value >= lo) && self.max.map_or(true, |hi| value <= hi)
    }
}

/// Return the sorted pixel indices of local maxima inside `band`.
pub fn find_peaks(intensity: &[f64], band: &IntensityBand) -> Vec<usize> {
    let mut peaks = local_maxima(intensity);
    if !band.is_unbounded() {
        peaks.retain(|&idx| band.contains(intensity[idx]));
    }
    peaks
}

/// Local maxima with plateau handling, in ascending order.
fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }

    let i_max = x.len() - 1;
    let mut i = 1;
    while i < i_max {
        if x[i - 1] < x[i] {
            // Walk across a possible plateau
            let mut i_ahead = i + 1;
            while i_ahead < i_max && x[i_ahead] == x[i] {
                i_ahead += 1;
            }
            if x[i_ahead] < x[i] {
                let left_edge = i;
                let right_edge = i_ahead - 1;
                peaks.push((left_edge + right_edge) / 2);
                // Skip samples that cannot be maxima
                i = i_ahead;
            }
        }
        i += 1;
    }

    peaks
}
