//! Keyed object records.
//!
//! Some workers speak objects instead of positional arrays:
//!
//! ```text
//! call:     {"id": 3, "method": "sum", "param": [1, 2]}
//! response: {"id": 3, "res": 3}                 (final)
//!           {"id": 3, "res": 1, "final": false} (partial)
//! ```
//!
//! Such workers may also wrap each response object in a JSON string, so a
//! string record is unwrapped once before it is interpreted.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::codec::{parse_args, parse_id, Call, Message, Reply, Response, WireCodec};
use crate::error::{FrameError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyedCodec;

#[derive(Serialize)]
struct KeyedCall<'a> {
    id: i64,
    method: &'a str,
    param: &'a [Value],
}

#[derive(Serialize)]
struct KeyedResponse<'a> {
    id: i64,
    res: &'a Value,
    #[serde(rename = "final")]
    is_final: bool,
}

impl WireCodec for KeyedCodec {
    fn name(&self) -> &'static str {
        "keyed"
    }

    fn encode_record(&self, message: &Message) -> Result<Vec<u8>> {
        let body = match message {
            Message::Call(call) => serde_json::to_vec(&KeyedCall {
                id: call.id,
                method: &call.method,
                param: &call.args,
            })?,
            Message::Response(response) => serde_json::to_vec(&KeyedResponse {
                id: response.id,
                res: response.reply.payload(),
                is_final: response.reply.is_final(),
            })?,
        };
        Ok(body)
    }

    fn decode_record(&self, record: &[u8]) -> Result<Message> {
        let mut value: Value = serde_json::from_slice(record)
            .map_err(|e| FrameError::Malformed(format!("invalid json: {e}")))?;

        if let Value::String(inner) = &value {
            value = serde_json::from_str(inner)
                .map_err(|e| FrameError::Malformed(format!("invalid wrapped json: {e}")))?;
        }

        let Value::Object(mut fields) = value else {
            return Err(FrameError::Malformed("record is not an object".to_string()));
        };

        let id = fields
            .get("id")
            .ok_or_else(|| FrameError::Malformed("missing id".to_string()))
            .and_then(parse_id)?;

        if let Some(method) = fields.remove("method") {
            let method = match method {
                Value::String(method) => method,
                other => {
                    return Err(FrameError::Malformed(format!(
                        "method must be a string, got {other}"
                    )))
                }
            };
            let args = parse_args(fields.remove("param").unwrap_or(Value::Null))?;
            return Ok(Message::Call(Call { id, method, args }));
        }

        if let Some(payload) = fields.remove("res") {
            let is_final = final_flag(&fields)?;
            return Ok(Message::Response(Response {
                id,
                reply: Reply::new(is_final, payload),
            }));
        }

        Err(FrameError::Malformed(
            "record has neither method nor res".to_string(),
        ))
    }
}

fn final_flag(fields: &Map<String, Value>) -> Result<bool> {
    match fields.get("final") {
        None => Ok(true),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(other) => Err(FrameError::Malformed(format!(
            "final must be a boolean, got {other}"
        ))),
    }
}
