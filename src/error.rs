//! Error types for gbptree

use std::borrow::Cow;
use std::fmt;
use std::io;
use thiserror::Error;

use crate::gspp::{GsppResult, PointerField};

/// The main error type for gbptree operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(String),

    /// The tree structure on disk does not make sense
    #[error("Tree inconsistency: {details}")]
    Corruption {
        /// Description of the inconsistency
        details: String,
        /// Page where the inconsistency was detected
        page_id: Option<PageId>,
    },

    /// A generation-safe pointer could not be read or written
    #[error("Tree inconsistency: {field} of page {page_id} is unusable ({result})")]
    PointerCorruption {
        /// Page holding the pointer
        page_id: PageId,
        /// Which pointer of the node
        field: PointerField,
        /// Decoded outcome of the pointer read or write
        result: GsppResult,
    },

    /// A cursor read or wrote outside its page
    #[error("Out of bounds access on page {page_id}")]
    OutOfBounds {
        /// Page the cursor was pinned to
        page_id: PageId,
    },

    /// The stored file does not match the layout or page size it was opened with
    #[error("Metadata mismatch: {0}")]
    MetadataMismatch(Cow<'static, str>),

    /// On-disk format version is not supported
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected version
        expected: u32,
        /// Found version
        found: u32,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Invalid page ID
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

impl Error {
    /// Build a corruption error for a page
    pub fn corruption(details: impl Into<String>, page_id: PageId) -> Self {
        Error::Corruption { details: details.into(), page_id: Some(page_id) }
    }

    /// Whether this error reports on-disk inconsistency rather than misuse or I/O
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corruption { .. } | Error::PointerCorruption { .. } | Error::OutOfBounds { .. }
        )
    }
}

/// Page identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PageId(pub u64);

impl PageId {
    /// Convert to byte offset in file
    pub fn to_offset(self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result type alias for gbptree operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_offset() {
        assert_eq!(PageId(0).to_offset(4096), 0);
        assert_eq!(PageId(3).to_offset(8192), 3 * 8192);
    }

    #[test]
    fn test_corruption_classification() {
        assert!(Error::corruption("bad", PageId(7)).is_corruption());
        assert!(Error::OutOfBounds { page_id: PageId(1) }.is_corruption());
        assert!(!Error::InvalidOperation("nope").is_corruption());
        assert!(!Error::from(io::Error::new(io::ErrorKind::Other, "disk")).is_corruption());
    }

    #[test]
    fn test_display() {
        let err = Error::corruption("keys out of order", PageId(12));
        assert_eq!(err.to_string(), "Tree inconsistency: keys out of order");
        let err = Error::VersionMismatch { expected: 1, found: 9 };
        assert_eq!(err.to_string(), "Version mismatch: expected 1, found 9");
    }
}
