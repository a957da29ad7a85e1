//! Raw readers for reference-line catalogues.

pub mod lines;
