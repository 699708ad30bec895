use std::fmt;

use bytes::{BufMut, BytesMut};
use serde_json::Value;

use crate::error::{FrameError, Result};
use crate::reserved::{KEEPALIVE_ACK, KEEPALIVE_ID, KEEPALIVE_METHOD};

/// Default maximum frame size: 16 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Line terminator appended to every frame.
pub const TERMINATOR: u8 = b'\n';

/// One reply to a call: either an intermediate chunk or the terminal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Partial(Value),
    Final(Value),
}

impl Reply {
    pub fn new(is_final: bool, payload: Value) -> Self {
        if is_final {
            Reply::Final(payload)
        } else {
            Reply::Partial(payload)
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Reply::Final(_))
    }

    pub fn payload(&self) -> &Value {
        match self {
            Reply::Partial(payload) | Reply::Final(payload) => payload,
        }
    }

    pub fn into_payload(self) -> Value {
        match self {
            Reply::Partial(payload) | Reply::Final(payload) => payload,
        }
    }
}

/// A call record: `[id, method, args]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub id: i64,
    pub method: String,
    pub args: Vec<Value>,
}

impl Call {
    pub fn new(id: i64, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            args,
        }
    }

    /// The client keepalive frame: `[-1, "keeplive", []]`.
    pub fn keepalive() -> Self {
        Self::new(KEEPALIVE_ID, KEEPALIVE_METHOD, Vec::new())
    }
}

/// A response record: `[id, is_final, payload]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: i64,
    pub reply: Reply,
}

impl Response {
    pub fn new(id: i64, reply: Reply) -> Self {
        Self { id, reply }
    }

    /// The worker's answer to a keepalive call: `[-1, true, "ok"]`.
    pub fn keepalive_ack() -> Self {
        Self::new(KEEPALIVE_ID, Reply::Final(Value::from(KEEPALIVE_ACK)))
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call(Call),
    Response(Response),
}

impl Message {
    pub fn id(&self) -> i64 {
        match self {
            Message::Call(call) => call.id,
            Message::Response(response) => response.id,
        }
    }

    pub fn is_keepalive(&self) -> bool {
        self.id() == KEEPALIVE_ID
    }
}

impl From<Call> for Message {
    fn from(call: Call) -> Self {
        Message::Call(call)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

/// Record-level serialization used inside a frame.
///
/// Implementations produce the record body without the line terminator;
/// [`encode_frame`] and [`decode_frame`] handle terminators and limits.
pub trait WireCodec: Send + Sync + fmt::Debug {
    /// Codec name for diagnostics.
    fn name(&self) -> &'static str;

    /// Serialize a message into a single-line record body.
    fn encode_record(&self, message: &Message) -> Result<Vec<u8>>;

    /// Parse a record body (terminator already stripped).
    fn decode_record(&self, record: &[u8]) -> Result<Message>;
}

/// Positional array records: `[id, method, args]` and `[id, is_final, payload]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrayCodec;

impl WireCodec for ArrayCodec {
    fn name(&self) -> &'static str {
        "array"
    }

    fn encode_record(&self, message: &Message) -> Result<Vec<u8>> {
        let body = match message {
            Message::Call(call) => serde_json::to_vec(&(call.id, &call.method, &call.args))?,
            Message::Response(response) => serde_json::to_vec(&(
                response.id,
                response.reply.is_final(),
                response.reply.payload(),
            ))?,
        };
        Ok(body)
    }

    fn decode_record(&self, record: &[u8]) -> Result<Message> {
        let value: Value = serde_json::from_slice(record)
            .map_err(|e| FrameError::Malformed(format!("invalid json: {e}")))?;

        let Value::Array(items) = value else {
            return Err(FrameError::Malformed("record is not an array".to_string()));
        };
        let [id, second, third]: [Value; 3] = items.try_into().map_err(|items: Vec<Value>| {
            FrameError::Malformed(format!("expected 3 elements, got {}", items.len()))
        })?;

        let id = parse_id(&id)?;
        match second {
            Value::String(method) => Ok(Message::Call(Call {
                id,
                method,
                args: parse_args(third)?,
            })),
            Value::Bool(is_final) => Ok(Message::Response(Response {
                id,
                reply: Reply::new(is_final, third),
            })),
            other => Err(FrameError::Malformed(format!(
                "second element must be a method name or final flag, got {other}"
            ))),
        }
    }
}

pub(crate) fn parse_id(value: &Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| FrameError::Malformed(format!("id must be an integer, got {value}")))
}

pub(crate) fn parse_args(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(args) => Ok(args),
        Value::Null => Ok(Vec::new()),
        other => Err(FrameError::Malformed(format!(
            "args must be an array, got {other}"
        ))),
    }
}

/// Encode a message into one wire frame.
///
/// The record's JSON string escaping keeps payload text from ever producing a
/// raw line break; a codec that violates this is rejected rather than
/// allowed to corrupt the stream.
pub fn encode_frame(codec: &dyn WireCodec, message: &Message, dst: &mut BytesMut) -> Result<()> {
    let body = codec.encode_record(message)?;
    if body.iter().any(|b| *b == b'\n' || *b == b'\r') {
        return Err(FrameError::Malformed(format!(
            "{} codec produced a record containing a line break",
            codec.name()
        )));
    }
    dst.reserve(body.len() + 1);
    dst.put_slice(&body);
    dst.put_u8(TERMINATOR);
    Ok(())
}

/// Decode one wire frame. A trailing `\n` or `\r\n` is ignored.
pub fn decode_frame(codec: &dyn WireCodec, frame: &[u8]) -> Result<Message> {
    let record = strip_terminator(frame);
    if record.iter().all(u8::is_ascii_whitespace) {
        return Err(FrameError::Malformed("empty frame".to_string()));
    }
    codec.decode_record(record)
}

pub(crate) fn strip_terminator(frame: &[u8]) -> &[u8] {
    let frame = frame.strip_suffix(b"\n").unwrap_or(frame);
    frame.strip_suffix(b"\r").unwrap_or(frame)
}

/// Configuration for frame reading and writing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum frame size in bytes, terminator excluded. Default: 16 MiB.
    pub max_frame_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
