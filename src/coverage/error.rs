//! Extraction error taxonomy

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type for extraction operations.
pub type Result<T> = std::result::Result<T, ExtractError>;

/// Terminal error of an extraction run.
///
/// Packages already delivered before the error stay valid; the error only
/// says why no further packages were produced.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// The byte stream is not well-formed XML
    #[error("malformed XML at byte {offset}: {message}")]
    Xml { offset: usize, message: String },

    /// Well-formed XML that does not follow the package/class/line shape
    #[error("invalid coverage report at byte {offset}: {message}")]
    Structure { offset: usize, message: String },

    /// The byte source itself failed
    #[error("I/O error while reading coverage report: {0}")]
    Io(#[from] io::Error),

    /// Extraction was asked to stop before end of stream
    #[error("coverage extraction cancelled")]
    Cancelled,
}

impl ExtractError {
    pub(crate) fn structure(offset: usize, message: impl Into<String>) -> Self {
        ExtractError::Structure {
            offset,
            message: message.into(),
        }
    }

    pub(crate) fn from_xml(offset: usize, err: quick_xml::Error) -> Self {
        match err {
            quick_xml::Error::Io(io) => {
                let io = Arc::try_unwrap(io)
                    .unwrap_or_else(|shared| io::Error::new(shared.kind(), shared.to_string()));
                ExtractError::Io(io)
            }
            other => ExtractError::Xml {
                offset,
                message: other.to_string(),
            },
        }
    }

    /// True when the run stopped because of cancellation rather than bad data.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExtractError::Cancelled)
    }

    /// True for both XML syntax errors and schema-shape violations.
    pub fn is_malformed(&self) -> bool {
        matches!(self, ExtractError::Xml { .. } | ExtractError::Structure { .. })
    }

    /// Byte offset of the offending input, when known.
    pub fn offset(&self) -> Option<usize> {
        match self {
            ExtractError::Xml { offset, .. } | ExtractError::Structure { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}
