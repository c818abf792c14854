//! Error types for the packet-filter layer.

use thiserror::Error;

/// Result type alias for packet-filter operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors that can occur while rendering or applying rulesets.
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Ruleset template rendering failed.
    #[error("ruleset render error: {0}")]
    Render(String),

    /// The packet-filter tool rejected the ruleset.
    #[error("ruleset apply error: {0}")]
    Apply(String),
}
