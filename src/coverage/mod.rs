//! Coverage module
//!
//! Provides:
//! - Cobertura XML token scanning
//! - Streaming package extraction
//! - Threshold validation

mod error;
mod extractor;
mod scanner;
mod threshold;

pub use error::ExtractError;
pub use extractor::*;
pub use scanner::{Attributes, Scanner, Token};
pub use threshold::*;

use serde::Serialize;

/// One `package` element and the files it contains
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Package {
    pub path: String,
    pub files: Vec<Coverage>,
}

impl Package {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            files: Vec::new(),
        }
    }

    pub fn uncovered_count(&self) -> usize {
        self.files.iter().map(|f| f.uncovered_lines.len()).sum()
    }
}

/// Coverage for a single `class` element (one source file)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Coverage {
    pub file: String,
    /// Truncated `line-rate * 100`, taken from the report as-is
    pub percent: u8,
    /// Zero-hit line numbers in document order
    pub uncovered_lines: Vec<u32>,
    pub lines_total: u32,
    pub lines_covered: u32,
}

/// Convert a Cobertura line-rate into a whole percentage, truncating.
pub fn percent_from_rate(rate: f64) -> Option<u8> {
    if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
        return None;
    }
    Some((rate * 100.0) as u8)
}
