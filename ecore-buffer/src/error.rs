//! Error types for the buffer queue and display output

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("backend not available: {0}")]
    BackendUnavailable(String),

    #[error("backend already registered: {0}")]
    BackendExists(String),

    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    #[error("buffer import failed: {0}")]
    ImportFailed(String),

    #[error("geometry mismatch: {0}")]
    GeometryMismatch(String),

    #[error("export not supported: {0}")]
    ExportUnsupported(String),

    #[error("invalid buffer size {0}x{1}")]
    InvalidSize(u32, u32),

    #[error("unknown pixel format: {0}")]
    UnknownFormat(String),

    #[error("invalid or stale buffer handle")]
    InvalidBuffer,

    #[error("buffer was not acquired by this provider")]
    NotAcquiredByThisProvider,

    #[error("queue is full")]
    QueueFull,

    #[error("buffer is not owned by the consumer")]
    NotOwnedByConsumer,

    #[error("queue endpoint is disconnected")]
    Disconnected,

    #[error("queue '{0}' already has this endpoint attached")]
    EndpointTaken(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("framebuffer is busy")]
    FbBusy,

    #[error("page flip failed on every output")]
    NoOutputsFlipped,

    #[error("timed out waiting for page flip completion")]
    FlipTimeout,

    #[error("DRM error: {0}")]
    Drm(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}
