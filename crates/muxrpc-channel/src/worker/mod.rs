//! Worker side of the wire: method registration and the serve loop.

mod router;
mod server;

pub use router::{HandlerResult, ReplySink, RouteTable, Router};
pub use server::WorkerServer;
