//! Domain error taxonomy.
//!
//! Errors are classified by how callers should react, not by where they
//! originated. Store backends, the queue, and the engine all surface their
//! failures through these kinds; the REST layer maps them onto HTTP statuses
//! with a stable `error_code`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-version or uniqueness clash. The caller re-reads and retries.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Store unavailable or timed out. Retried internally up to 3 times.
    #[error("transient error: {0}")]
    Transient(String),

    /// Action invalid for the entity's current phase. Never retried.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Invariant violated on read. Logged and surfaced; no auto-recovery.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Stable machine-readable code, identical across API versions.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "unavailable",
            Self::Precondition(_) => "invalid_phase",
            Self::Fatal(_) => "internal",
        }
    }

    /// HTTP status the REST surface maps this error onto.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::Precondition(_) => 409,
            Self::Transient(_) => 503,
            Self::Fatal(_) => 500,
        }
    }

    /// Whether an internal retry is appropriate.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(format!("invalid JSON: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
