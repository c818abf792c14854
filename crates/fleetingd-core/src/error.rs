//! Error types for the pool core.

use thiserror::Error;

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while managing the pool.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration or host preflight problem. Fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// The `/24` has no free `/30`, or the pool is shutting down and no
    /// longer accepts instances.
    #[error("available VM address space exhausted")]
    AddressSpaceExhausted,

    /// Base image preparation failed.
    #[error("image preparation error: {0}")]
    ImagePrep(#[from] fleetingd_image::ImageError),

    /// The hypervisor child could not be started, or its disk material could
    /// not be created.
    #[error("boot error: {0}")]
    Boot(String),

    /// The child did not exit within the destroy budget. The instance stays
    /// registered.
    #[error("timed out waiting for instance {0} to be removed")]
    DestroyTimeout(String),

    /// The packet-filter tool rejected the ruleset.
    #[error("packet-filter error: {0}")]
    FilterApply(#[from] fleetingd_net::NetError),

    /// No such instance.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// The instance exists but has no SSH identity (the prebuild VM).
    #[error("instance has no SSH identity: {0}")]
    NoIdentity(String),

    /// SSH probe failure. Reported as `Creating` by status updates, never
    /// surfaced as a hard error.
    #[error("heartbeat failed for {0}: {1}")]
    Heartbeat(String, String),

    /// SSH key generation or encoding failure.
    #[error("SSH key error: {0}")]
    SshKey(#[from] ssh_key::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
