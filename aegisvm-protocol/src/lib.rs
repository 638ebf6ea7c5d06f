//! Wire types shared by the host daemon and the in-guest harness.
//!
//! The control stream is newline-delimited JSON-RPC 2.0 over a duplex byte
//! channel (§6 of the control-plane contract): each line is one JSON object
//! shaped `{jsonrpc, id?, method?, params?, result?, error?}`. This crate
//! owns the line codec, the id-normalization rule, and the notification
//! payload shapes both sides agree on; it does not know about instances,
//! backends, or HTTP.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Maximum size of one message line, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message exceeds {MAX_MESSAGE_BYTES} bytes")]
    TooLarge,
    #[error("malformed JSON-RPC line: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("stream closed")]
    StreamClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// A JSON-RPC id normalized so that `1`, `1.0`, and `int64(1)` compare equal.
///
/// The wire form may be a string or a number; numbers are canonicalized to
/// an `i64` when they carry no fractional part, otherwise to a bit-pattern
/// comparable float key. This mirrors the classification rule's
/// requirement that numeric ids "collide" regardless of how a given
/// JSON-RPC implementation chose to serialize them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RpcId {
    Num(i64),
    Str(String),
}

impl RpcId {
    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Null => None,
            Value::String(s) => Some(RpcId::Str(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(RpcId::Num(i))
                } else if let Some(f) = n.as_f64() {
                    // Whole-valued floats (`1.0`) normalize to the same
                    // integer key as `1`.
                    if f.fract() == 0.0 && f.is_finite() {
                        Some(RpcId::Num(f as i64))
                    } else {
                        Some(RpcId::Str(n.to_string()))
                    }
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RpcId::Num(n) => Value::from(*n),
            RpcId::Str(s) => Value::from(s.clone()),
        }
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Num(n) => write!(f, "{n}"),
            RpcId::Str(s) => write!(f, "{s}"),
        }
    }
}

/// One line on the wire, in its raw (not-yet-classified) shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }
}

/// The four-way classification from the control-stream contract.
#[derive(Debug, Clone)]
pub enum Classified {
    /// A response to a call this side made earlier.
    Response { id: RpcId, result: Option<Value>, error: Option<RpcErrorObject> },
    /// A request originated by the other side; must be answered with the
    /// same id.
    GuestRequest { id: Value, method: String, params: Option<Value> },
    /// A one-way notification; handlers must not block.
    Notification { method: String, params: Option<Value> },
    /// Did not match any of the above — caller should log and drop.
    Unrecognized,
}

pub fn classify(raw: &RawMessage) -> Classified {
    let has_id = raw.id.as_ref().is_some_and(|v| !v.is_null());
    let has_method = raw.method.as_deref().is_some_and(|m| !m.is_empty());
    match (has_id, has_method) {
        (true, false) => {
            let Some(id) = raw.id.as_ref().and_then(RpcId::from_value) else {
                return Classified::Unrecognized;
            };
            Classified::Response { id, result: raw.result.clone(), error: raw.error.clone() }
        }
        (true, true) => Classified::GuestRequest {
            id: raw.id.clone().unwrap_or(Value::Null),
            method: raw.method.clone().unwrap_or_default(),
            params: raw.params.clone(),
        },
        (false, true) => Classified::Notification {
            method: raw.method.clone().unwrap_or_default(),
            params: raw.params.clone(),
        },
        (false, false) => Classified::Unrecognized,
    }
}

pub fn new_request(id: RpcId, method: impl Into<String>, params: Option<Value>) -> RawMessage {
    RawMessage {
        jsonrpc: "2.0".to_string(),
        id: Some(id.to_value()),
        method: Some(method.into()),
        params,
        result: None,
        error: None,
    }
}

pub fn new_notification(method: impl Into<String>, params: Option<Value>) -> RawMessage {
    RawMessage {
        jsonrpc: "2.0".to_string(),
        id: None,
        method: Some(method.into()),
        params,
        result: None,
        error: None,
    }
}

pub fn new_response(id: Value, result: Value) -> RawMessage {
    RawMessage {
        jsonrpc: "2.0".to_string(),
        id: Some(id),
        method: None,
        params: None,
        result: Some(result),
        error: None,
    }
}

pub fn new_error_response(id: Value, error: RpcErrorObject) -> RawMessage {
    RawMessage {
        jsonrpc: "2.0".to_string(),
        id: Some(id),
        method: None,
        params: None,
        result: None,
        error: Some(error),
    }
}

/// Encode one message as a single newline-terminated line.
pub fn encode_line(msg: &RawMessage) -> ProtocolResult<Vec<u8>> {
    let mut buf = serde_json::to_vec(msg)?;
    if buf.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge);
    }
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one line (without its trailing newline) into a [`RawMessage`].
pub fn decode_line(line: &[u8]) -> ProtocolResult<RawMessage> {
    if line.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge);
    }
    Ok(serde_json::from_slice(line)?)
}

/// Payload of a `log` notification (§4.E.2 step 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    pub stream: String,
    pub line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_id: Option<String>,
}

/// Payload of a `processExited` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessExitedPayload {
    pub exit_code: i32,
}

/// Payload of an `execDone` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecDonePayload {
    pub exec_id: String,
    pub exit_code: i32,
}

/// Parameters for the boot-time `run` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParams {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

/// Parameters for an `exec` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecParams {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    pub exec_id: String,
}

/// A tether frame as it travels the wire (host-to-guest ingress, or
/// guest-to-host egress notification params). `payload` is an opaque JSON
/// value; callers are responsible for whatever shape their frame type
/// carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTetherFrame {
    pub version: u8,
    #[serde(rename = "type")]
    pub frame_type: String,
    pub ts_ms: i64,
    pub channel: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    pub payload: Value,
}
