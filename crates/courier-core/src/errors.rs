//! Error types for the Courier core.
//!
//! Routine broker outcomes (absent destinations, late replies, failed
//! sends) are not errors and never appear here. These variants only cover
//! input that could not be understood at all.

use thiserror::Error;

/// Errors raised while decoding or encoding wire data.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Inbound text was not a valid envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),

    /// An outbound value could not be serialized.
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl CoreError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidEnvelope(_) => "INVALID_ENVELOPE",
            Self::Serialize(_) => "SERIALIZE_ERROR",
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
