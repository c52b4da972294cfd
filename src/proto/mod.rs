pub mod client;
pub mod server;

pub use client::RpcClient;
pub use server::{serve, serve_listener};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Message kinds carried in the envelope `type` field. The numeric ranges
/// are part of the wire contract: 1-9 handshake/generic, 10-19 memory data
/// ops, 20-29 process lifecycle, 30-39 CPU control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum MessageKind {
    Handshake = 1,
    Operation = 2,
    ReadMem = 10,
    WriteMem = 11,
    ObtainFrame = 12,
    FetchInstruction = 13,
    FreeSpace = 14,
    DumpMemory = 15,
    InitProcess = 20,
    DestroyProcess = 21,
    SuspendProcess = 22,
    ResumeProcess = 23,
    Execute = 30,
    Interrupt = 31,
}

impl From<MessageKind> for u32 {
    fn from(kind: MessageKind) -> u32 {
        kind as u32
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = String;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        use MessageKind::*;
        Ok(match code {
            1 => Handshake,
            2 => Operation,
            10 => ReadMem,
            11 => WriteMem,
            12 => ObtainFrame,
            13 => FetchInstruction,
            14 => FreeSpace,
            15 => DumpMemory,
            20 => InitProcess,
            21 => DestroyProcess,
            22 => SuspendProcess,
            23 => ResumeProcess,
            30 => Execute,
            31 => Interrupt,
            other => return Err(format!("unknown message type {}", other)),
        })
    }
}

/// The typed envelope exchanged between services. `data` is left as a raw
/// JSON object; each handler extracts what it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub operation: String,
    pub origin: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: MessageKind, operation: &str, origin: &str, data: Value) -> Self {
        Envelope {
            kind,
            operation: operation.to_string(),
            origin: origin.to_string(),
            data,
        }
    }

    /// Fetch a numeric field from the payload as u64.
    pub fn field_u64(&self, name: &str) -> Option<u64> {
        self.data.get(name).and_then(Value::as_u64)
    }

    /// Fetch a string field from the payload.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }
}

/// Errors raised by the RPC plumbing.
#[derive(Debug)]
pub enum ProtoError {
    /// Transport-level failure: connect, read or write.
    Io(std::io::Error),
    /// The bytes on the wire were not a valid envelope or response.
    Malformed(String),
    /// The peer answered but reported an error payload.
    Remote(String),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtoError::Io(e) => write!(f, "transport error: {}", e),
            ProtoError::Malformed(m) => write!(f, "malformed message: {}", m),
            ProtoError::Remote(m) => write!(f, "peer reported: {}", m),
        }
    }
}

pub type ProtoResult<T> = Result<T, ProtoError>;

/// A plain `{"status":"OK"}` response.
pub fn ok() -> Value {
    json!({"status": "OK"})
}

/// Operation-level error response, matching the `{"error": msg}` convention.
pub fn fail(msg: impl fmt::Display) -> Value {
    json!({"error": msg.to_string()})
}

/// Protocol-level error response for malformed requests.
pub fn reject(msg: impl fmt::Display) -> Value {
    json!({"status": "ERROR", "message": msg.to_string()})
}

/// Extract the error message from a response, if it carries one under
/// either convention.
pub fn response_error(response: &Value) -> Option<String> {
    if let Some(err) = response.get("error").and_then(Value::as_str) {
        return Some(err.to_string());
    }
    if response.get("status").and_then(Value::as_str) == Some("ERROR") {
        let msg = response
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unspecified error");
        return Some(msg.to_string());
    }
    None
}
