//! Error types for the frame transport.

use thiserror::Error;

/// Errors raised by [`SharedFrameChannel`](crate::SharedFrameChannel).
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel was closed before the access. Renderers treat this as a
    /// skipped frame.
    #[error("shared frame channel already released")]
    Released,

    /// No segment has been allocated or attached yet.
    #[error("shared frame channel has no buffer yet")]
    NotAllocated,

    /// A channel gets exactly one buffer; new dimensions need a new channel.
    #[error("shared frame channel already allocated ({size} bytes)")]
    AlreadyAllocated { size: usize },

    #[error("zero-sized frame buffer requested")]
    EmptyBuffer,

    /// The frame's byte size does not fit the platform's integer range.
    #[error("frame of {width}x{height} pixels is too large")]
    FrameTooLarge { width: u32, height: u32 },

    #[error("segment size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("timed out waiting for the channel lock")]
    LockTimeout,

    #[error("segment I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Conditions a renderer logs and skips instead of failing on.
    pub fn is_stale(&self) -> bool {
        matches!(self, ChannelError::Released | ChannelError::NotAllocated)
    }
}

/// Errors raised by the worker pool and its slot table.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("too many concurrent software-decoded videos (limit {capacity})")]
    CapacityExhausted { capacity: usize },

    #[error("pool capacity must be between 1 and {max}, got {requested}")]
    InvalidCapacity { requested: usize, max: usize },

    #[error("worker {0} already owns a slot")]
    DuplicateOwner(String),

    #[error("no slot is owned by worker {0}")]
    UnknownOwner(String),

    #[error("invalid worker identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("slot table is malformed: {0}")]
    InvalidTable(String),

    #[error("slot table I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors loading a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] PoolError),
}

/// Errors raised by native decoder backends.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{backend} backend cannot play {media}")]
    Unsupported { backend: &'static str, media: String },

    #[error("failed to open media: {0}")]
    Open(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Fatal conditions for a single decode worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("frame buffer allocation failed: {0}")]
    Allocation(#[source] ChannelError),

    #[error("decoder reported ready twice without video dimensions")]
    MissingDimensions,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("worker already terminated")]
    Terminated,
}

/// Errors on the host/worker line protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed protocol message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the protocol stream")]
    Closed,
}

/// Errors raised while spawning or driving a worker process.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("failed to wait for worker process: {0}")]
    Wait(#[source] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
