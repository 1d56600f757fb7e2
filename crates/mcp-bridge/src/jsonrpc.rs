use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    schema::*,
};

/// Hands out monotonically increasing integer request ids, starting at 1.
/// Zero is never produced since it marks an id the caller wants generated.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize typed params, mapping `()` and `null` to no params at all.
pub fn to_params<P: Serialize>(params: &P) -> Result<Option<Value>> {
    match serde_json::to_value(params)? {
        Value::Null => Ok(None),
        v => Ok(Some(v)),
    }
}

/// Decode request params into a typed value. Missing params decode from an
/// empty object so that all-optional param structs work.
pub fn from_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let value = match params {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(v) => v,
    };
    serde_json::from_value(value).map_err(|e| Error::InvalidParams(e.to_string()))
}

/// Decode a result value returned by the peer.
pub fn from_result<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::Protocol(format!("unexpected result shape: {e}")))
}

/// Convert a handler outcome into the envelope sent back to the caller.
pub fn result_to_message(id: RequestId, result: Result<Value>) -> JSONRPCMessage {
    match result {
        Ok(value) => JSONRPCMessage::Response(JSONRPCResponse::new(id, value)),
        Err(e) => JSONRPCMessage::Error(e.to_jsonrpc_response(id)),
    }
}

/// An error reply that is not tied to any request, such as a parse failure.
pub fn orphan_error(error: &Error) -> JSONRPCMessage {
    JSONRPCMessage::Error(JSONRPCError {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id: None,
        error: error.to_error_object(),
    })
}

pub fn notification<P: Serialize>(method: &str, params: &P) -> Result<JSONRPCNotification> {
    Ok(JSONRPCNotification::new(method, to_params(params)?))
}
