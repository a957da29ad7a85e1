//! Reader for reference-line files.
//!
//! A reference-line file lists the emission wavelengths (nm) of one
//! calibration lamp, one per line. The files are traditionally named `*.csv`
//! (e.g. `HgArLines.csv`) so a trailing comma-separated column, such as an
//! element label, is tolerated and ignored. Blank lines and `#` comments are
//! skipped.

use std::path::Path;

use anyhow::{Context, Result};

/// Parse reference wavelengths from an in-memory string.
///
/// Wavelengths are returned in file order; sorting and de-duplication are
/// left to [`SpectralLineCatalogue`](crate::SpectralLineCatalogue).
pub fn parse_spectral_lines(data: &str) -> Result<Vec<f64>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(data.as_bytes());

    let mut wavelengths = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let line = record.position().map_or(0, |p| p.line());
        // numpy.loadtxt-style whitespace separation within the first column
        let field = match record.get(0).and_then(|f| f.split_whitespace().next()) {
            Some(f) => f,
            None => continue,
        };
        let wavelength: f64 = field
            .parse()
            .with_context(|| format!("line {line}: {field:?} is not a wavelength"))?;
        anyhow::ensure!(
            wavelength.is_finite() && wavelength > 0.0,
            "line {line}: wavelength {wavelength} must be positive and finite"
        );
        wavelengths.push(wavelength);
    }

    anyhow::ensure!(!wavelengths.is_empty(), "no reference wavelengths found");
    Ok(wavelengths)
}

/// Load reference wavelengths from a file.
pub fn read_spectral_lines<P: AsRef<Path>>(file: P) -> Result<Vec<f64>> {
    let path = file.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read spectral lines file: {}", path.display()))?;
    parse_spectral_lines(&data)
}
