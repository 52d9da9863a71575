// ABOUTME: JSON-RPC 2.0 framing for the office bridge wire protocol
// ABOUTME: Newline-delimited requests and responses shared by the client transport and the stub service

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Handshake sent once when a channel is opened
pub const METHOD_INITIALIZE: &str = "bridge.initialize";

/// Resolve a named service object
pub const METHOD_SERVICE: &str = "bridge.service";

/// Resolve the component loader
pub const METHOD_LOADER: &str = "bridge.loader";

/// Close open documents and terminate the remote desktop
pub const METHOD_TERMINATE: &str = "bridge.terminate";

/// Interface name reported for the component loader
pub const LOADER_INTERFACE: &str = "com.sun.star.frame.XComponentLoader";

/// Service that owns the remote desktop and its termination call
pub const DESKTOP_SERVICE: &str = "com.sun.star.frame.Desktop";

// === JSON-RPC Error Codes ===

/// Malformed request line
pub const ERROR_INVALID_REQUEST: i32 = -32600;

/// Unknown method
pub const ERROR_METHOD_NOT_FOUND: i32 = -32601;

/// The named service could not be instantiated
pub const ERROR_SERVICE_UNAVAILABLE: i32 = -32010;

/// Error object carried in a failed response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("remote error {code}: {message}")]
pub struct RpcError {
    /// JSON-RPC error code
    pub code: i32,
    /// Human-readable message from the service
    pub message: String,
}

/// Reference to an object living inside the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Opaque object identifier, unique per remote process
    pub object: String,
    /// Interface or service name the object was resolved as
    pub interface: String,
}

/// A single request line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// A single response line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<u64>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Split into the result value or the remote error.
    ///
    /// A response carrying neither is treated as a null result.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Serialize a message as one protocol line, including the trailing newline
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
