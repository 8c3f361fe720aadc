//! Error types for the capsule boundary

use thiserror::Error;

/// Capsule boundary error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Namespace creation or library load failed
    #[error("Failed to load {target}: {message}")]
    Load {
        /// Library path or name that was being loaded
        target: String,
        /// Loader diagnostic
        message: String,
    },

    /// A required export is absent from the shadow library
    #[error("Missing symbol {symbol} in {target}: {reason}")]
    MissingSymbol {
        /// Symbol name
        symbol: String,
        /// Library the symbol was expected in
        target: String,
        /// Why the lookup was rejected
        reason: String,
    },

    /// More allocator instances are linked than provenance can tell apart
    #[error("Allocator mismatch: {instances} allocator instances loaded, at most 2 supported")]
    AllocatorMismatch {
        /// Number of allocator instances observed
        instances: usize,
    },

    /// GOT rewriting failed
    #[error("Relocation error in {object}: {message}")]
    Relocation {
        /// Loaded object being patched
        object: String,
        /// Error message
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System error from nix
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    /// Malformed JSON configuration
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a [`Error::Load`]
    pub fn load(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Load {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Whether this error aborts capsule construction
    #[must_use]
    pub const fn is_construction_failure(&self) -> bool {
        matches!(
            self,
            Self::Load { .. } | Self::MissingSymbol { .. } | Self::InvalidConfig { .. }
        )
    }
}

/// Result type alias for capsule operations
pub type Result<T> = std::result::Result<T, Error>;
