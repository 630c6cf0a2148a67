//! Error types shared across the node.

use std::path::PathBuf;

use thiserror::Error;

/// How a persisted document failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptKind {
    /// Bytes are not valid UTF-8 (wrong file, binary garbage, old format).
    Encoding,
    /// Not JSON at all, or truncated mid-document.
    Syntax,
    /// Valid JSON with the wrong structure.
    Shape,
}

impl CorruptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorruptKind::Encoding => "encoding",
            CorruptKind::Syntax => "syntax",
            CorruptKind::Shape => "shape",
        }
    }
}

/// Local persistence faults.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document missing: {}", path.display())]
    Missing { path: PathBuf },

    #[error("document corrupt ({}) at {}: {detail}; content starts with {excerpt:?}", kind.as_str(), path.display())]
    Corrupt {
        path: PathBuf,
        kind: CorruptKind,
        excerpt: String,
        detail: String,
    },

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize document for {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn path(&self) -> &PathBuf {
        match self {
            StoreError::Missing { path }
            | StoreError::Corrupt { path, .. }
            | StoreError::Io { path, .. }
            | StoreError::Serialize { path, .. } => path,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, StoreError::Missing { .. })
    }
}

/// Malformed input that retrying cannot fix.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} must be finite, got {value}")]
    NotFinite { field: &'static str, value: f64 },

    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Errors surfaced by the membership-filtered caches.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

pub(crate) fn ensure_finite(field: &'static str, value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ValidationError::NotFinite { field, value })
    }
}
