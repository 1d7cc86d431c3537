use hvunpack_core::VmiError;

/// An error that can occur while unpacking.
#[derive(thiserror::Error, Debug)]
pub enum UnpackError {
    /// An introspection error occurred.
    #[error(transparent)]
    Vmi(#[from] VmiError),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The target process could not be found.
    #[error("target process not found: {0}")]
    TargetNotFound(String),

    /// The dump writer is gone and no further jobs can be queued.
    #[error("dump queue closed")]
    QueueClosed,
}
