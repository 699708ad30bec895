use std::time::Duration;

/// Errors that can occur in channel, stream and worker operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The connection could not be opened, or it closed or failed mid-call.
    #[error("connection error: {0}")]
    Connection(String),

    /// The local worker could not be started or died before it was reachable.
    #[error("worker spawn failed: {0}")]
    WorkerSpawn(#[from] muxrpc_transport::SpawnError),

    /// A frame arrived that does not fit the call it was routed to.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A blocking wait passed its outer deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] muxrpc_transport::TransportError),

    /// Frame-level error (malformed or oversized frame).
    #[error("frame error: {0}")]
    Frame(#[from] muxrpc_frame::FrameError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error outside of frame traffic (thread spawn, socket options).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Another blocking wait is already running on this channel.
    #[error("a blocking call is already waiting on this channel")]
    WaitInProgress,

    /// The stream was deleted or already received its final reply.
    #[error("stream {0} is closed")]
    StreamClosed(i64),

    /// Worker method registration was rejected.
    #[error("invalid route: {0}")]
    InvalidRoute(String),
}

impl ChannelError {
    /// True for the errors that mean the wire itself is unusable.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, ChannelError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
