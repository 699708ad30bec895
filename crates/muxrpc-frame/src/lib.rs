//! Line-delimited record framing for muxrpc.
//!
//! Every frame is one line: a JSON record followed by `\n`. Calls carry
//! `[id, method, args]`, responses carry `[id, is_final, payload]`, and id
//! `-1` is reserved for keepalive traffic in both directions.
//!
//! [`FrameReader`] and [`FrameWriter`] handle partial reads and writes, so
//! callers always deal in complete frames.

pub mod codec;
pub mod error;
pub mod keyed;
pub mod reader;
pub mod reserved;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, ArrayCodec, Call, FrameConfig, Message, Reply, Response,
    WireCodec, DEFAULT_MAX_FRAME_SIZE,
};
pub use error::{FrameError, Result};
pub use keyed::KeyedCodec;
pub use reader::FrameReader;
pub use reserved::{is_keepalive, KEEPALIVE_ACK, KEEPALIVE_ID, KEEPALIVE_METHOD};
pub use writer::FrameWriter;
