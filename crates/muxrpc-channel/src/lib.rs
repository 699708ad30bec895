//! Call multiplexing over a single muxrpc connection.
//!
//! A [`Channel`] owns one connection to a worker and routes every reply frame
//! to the continuation registered for its correlation id. [`RpcServer`] layers
//! the three call disciplines on top: callback ([`RpcServer::call`]),
//! blocking ([`RpcServer::call_sync`]) and streaming
//! ([`RpcServer::call_stream`]).
//!
//! The [`worker`] module is the other end of the wire: a registration table of
//! handlers and a serve loop.

pub mod channel;
pub mod connector;
pub mod error;
mod keepalive;
pub mod server;
pub mod stream;
#[cfg(test)]
mod testing;
pub mod worker;

pub use channel::{Channel, ChannelConfig, Continuation, Dispatched, PollOutcome};
pub use connector::{ConnectConfig, Connection, ReadOutcome, ReaderGuard, Status};
pub use error::{ChannelError, Result};
pub use keepalive::DEFAULT_KEEPALIVE_INTERVAL;
pub use server::RpcServer;
pub use stream::Stream;
pub use worker::{HandlerResult, ReplySink, RouteTable, Router, WorkerServer};
