use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";
pub const PREVIOUS_PROTOCOL_VERSION: &str = "2025-03-26";
pub const LEGACY_PROTOCOL_VERSION: &str = "2024-11-05";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[
    LATEST_PROTOCOL_VERSION,
    PREVIOUS_PROTOCOL_VERSION,
    LEGACY_PROTOCOL_VERSION,
];
pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Domain error codes
pub const UNAUTHORIZED: i32 = -32001;
pub const RESOURCE_NOT_FOUND: i32 = -32002;

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

/// Refers to any valid JSON-RPC object that can be decoded off the wire, or
/// encoded to be sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JSONRPCMessage {
    Request(JSONRPCRequest),
    Notification(JSONRPCNotification),
    Response(JSONRPCResponse),
    Error(JSONRPCError),
}

impl JSONRPCMessage {
    /// The method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            JSONRPCMessage::Request(r) => Some(&r.method),
            JSONRPCMessage::Notification(n) => Some(&n.method),
            _ => None,
        }
    }
}

/// A uniquely identifying ID for a request in JSON-RPC. Integer and string ids
/// are both accepted and echoed in the shape they arrived in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl RequestId {
    /// Zero and the empty string ask the sender to generate an id.
    pub fn is_unset(&self) -> bool {
        match self {
            RequestId::String(s) => s.is_empty(),
            RequestId::Number(n) => *n == 0,
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::String(s) => s.fmt(f),
            RequestId::Number(n) => n.fmt(f),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// A progress token, used to associate progress notifications with the original
/// request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ProgressToken {
    String(String),
    Number(i64),
}

/// An opaque token used to represent a cursor for pagination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl From<&str> for Cursor {
    fn from(s: &str) -> Self {
        Cursor(s.to_string())
    }
}

impl From<String> for Cursor {
    fn from(s: String) -> Self {
        Cursor(s)
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A request that expects a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JSONRPCRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// The reserved `_meta` object of the params, when present.
    pub fn meta(&self) -> Option<RequestMeta> {
        self.params
            .as_ref()
            .and_then(|p| p.get("_meta"))
            .and_then(|m| serde_json::from_value(m.clone()).ok())
    }

    /// Look up a top-level string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(Value::as_str)
    }

    /// Store `token` under `params._meta.authorization.token`.
    pub fn set_meta_token(&mut self, token: &str) {
        let params = self
            .params
            .get_or_insert_with(|| Value::Object(Map::new()));
        if !params.is_object() {
            *params = Value::Object(Map::new());
        }
        if let Some(obj) = params.as_object_mut() {
            let meta = obj
                .entry("_meta")
                .or_insert_with(|| Value::Object(Map::new()));
            if !meta.is_object() {
                *meta = Value::Object(Map::new());
            }
            if let Some(meta) = meta.as_object_mut() {
                meta.insert(
                    "authorization".to_string(),
                    serde_json::json!({ "token": token }),
                );
            }
        }
    }

    /// Remove and return `params._meta.authorization.token`. An emptied
    /// `_meta` object is dropped as well.
    pub fn take_meta_token(&mut self) -> Option<String> {
        let obj = self.params.as_mut()?.as_object_mut()?;
        let meta = obj.get_mut("_meta")?.as_object_mut()?;
        let token = meta
            .remove("authorization")
            .and_then(|a| a.get("token").and_then(Value::as_str).map(String::from));
        if meta.is_empty() {
            obj.remove("_meta");
        }
        token
    }
}

/// Reserved request metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMeta {
    /// If specified, the caller is requesting out-of-band progress
    /// notifications for this request.
    #[serde(rename = "progressToken", skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<ProgressToken>,
    /// Credentials carried in-band when the transport has no header channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationMeta>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// A notification which does not expect a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCNotification {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JSONRPCNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A successful (non-error) response to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCResponse {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Value,
}

impl JSONRPCResponse {
    pub fn new(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

/// A response to a request that indicates an error occurred. Parse errors
/// carry a null id since they cannot be tied to any request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCError {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    pub error: ErrorObject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// The error type that occurred.
    pub code: i32,
    /// A short description of the error.
    pub message: String,
    /// Additional information about the error, defined by the sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
