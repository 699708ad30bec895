use std::path::PathBuf;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The target could not be parsed or resolved to a socket address.
    #[error("invalid address '{0}' (expected host:port)")]
    InvalidAddress(String),

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

/// Errors raised while launching or supervising a local worker process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The worker program could not be started.
    #[error("failed to launch worker '{program}': {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },

    /// The worker log file could not be created.
    #[error("failed to create worker log {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The port assigned to the worker cannot be bound.
    #[error("worker port unavailable at {addr}: {source}")]
    PortUnavailable {
        addr: String,
        source: std::io::Error,
    },

    /// The worker exited before accepting a connection.
    #[error("worker exited early ({status}); see {log_path}{log_tail}")]
    Exited {
        status: String,
        log_path: PathBuf,
        log_tail: String,
    },

    /// Any other I/O failure while supervising the worker.
    #[error("worker supervision I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
