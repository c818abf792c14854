//! Error types for image provisioning.

use thiserror::Error;

/// Result type alias for image operations.
pub type Result<T> = std::result::Result<T, ImageError>;

/// Errors that can occur while preparing disk images.
#[derive(Debug, Error)]
pub enum ImageError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Download failed.
    #[error("download error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL could not be interpreted.
    #[error("bad URL: {0}")]
    Url(String),

    /// Checksum file did not contain the expected entry.
    #[error("checksum error: {0}")]
    Checksum(String),

    /// Disk-image tool invocation failed.
    #[error("disk-image tool error: {0}")]
    Convert(String),

    /// User-data image construction failed.
    #[error("user-data error: {0}")]
    UserData(String),
}
