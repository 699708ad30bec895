//! Byte transport and worker supervision for muxrpc.
//!
//! This is the lowest layer of muxrpc:
//! - [`WireStream`]: a connected duplex byte stream (TCP)
//! - [`TcpEndpoint`]: bind/accept/connect helpers for worker endpoints
//! - [`supervisor`]: spawn a local worker in its own process group and
//!   terminate the whole group when done
//!
//! Everything else builds on top of these types.

pub mod error;
pub mod stream;
pub mod supervisor;
pub mod tcp;

pub use error::{Result, SpawnError, TransportError};
pub use stream::WireStream;
pub use supervisor::{WorkerCommand, WorkerProcess, HOST_PLACEHOLDER, PORT_PLACEHOLDER};
pub use tcp::{resolve, TcpEndpoint, DEFAULT_HOST};
