//! Multiplexed RPC to a worker process over one line-framed connection.
//!
//! Many logical calls share a single duplex byte stream; every frame carries a
//! correlation id, and replies are routed back to the call that owns the id,
//! whatever order they arrive in.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP byte streams and local worker supervision
//! - [`frame`]: line framing and record codecs
//! - [`channel`]: the multiplexer, streams, the client call surface and the
//!   worker-side serve loop
//!
//! # Example
//!
//! ```no_run
//! use muxrpc::channel::{ChannelConfig, RpcServer};
//! use serde_json::json;
//!
//! let rpc = RpcServer::open(Some("127.0.0.1:7000"), ChannelConfig::default())?;
//! let payload = rpc.call_sync("echo", vec![json!("hi")])?;
//! assert_eq!(payload, json!("hi"));
//! # Ok::<(), muxrpc::channel::ChannelError>(())
//! ```

/// Re-export transport types.
pub mod transport {
    pub use muxrpc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use muxrpc_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use muxrpc_channel::*;
}
