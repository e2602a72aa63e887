//! Error types shared by the core modules.

pub use cairn_error::{kind_of, CairnError, ErrorKind, KindContext};

/// Result type alias for cairn operations
pub type Result<T> = anyhow::Result<T>;

/// Shorthand for an `anyhow::Error` carrying a kind and a detail.
pub fn err(kind: ErrorKind, detail: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(CairnError::with_detail(kind, detail))
}
