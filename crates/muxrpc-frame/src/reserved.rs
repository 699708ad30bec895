//! Reserved ids and method names.
//!
//! Id `-1` marks out-of-band keepalive frames in either direction. They are
//! never routed to a call's continuation.

/// Correlation id reserved for keepalive frames.
pub const KEEPALIVE_ID: i64 = -1;

/// Method name carried by client keepalive calls.
///
/// The spelling matches what deployed workers already expect on the wire.
pub const KEEPALIVE_METHOD: &str = "keeplive";

/// Payload a worker returns for a keepalive call.
pub const KEEPALIVE_ACK: &str = "ok";

/// Returns true if the id is the reserved keepalive id.
pub fn is_keepalive(id: i64) -> bool {
    id == KEEPALIVE_ID
}
