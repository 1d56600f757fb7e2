use serde_json::Value;
use thiserror::Error;

use crate::schema::{
    ErrorObject, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION, JSONRPCError,
    METHOD_NOT_FOUND, PARSE_ERROR, RESOURCE_NOT_FOUND, RequestId, UNAUTHORIZED,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport disconnected")]
    TransportDisconnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Resource not found: {uri}")]
    ResourceNotFound { uri: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String, data: Option<Value> },

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("JSON-RPC error {}: {}", .0.code, .0.message)]
    Rpc(ErrorObject),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// The JSON-RPC code this error is reported with.
    pub fn code(&self) -> i32 {
        match self {
            Error::Parse(_) => PARSE_ERROR,
            Error::InvalidRequest(_) => INVALID_REQUEST,
            Error::MethodNotFound(_) => METHOD_NOT_FOUND,
            Error::InvalidParams(_) | Error::ToolNotFound(_) => INVALID_PARAMS,
            Error::ResourceNotFound { .. } => RESOURCE_NOT_FOUND,
            Error::Unauthorized { .. } => UNAUTHORIZED,
            Error::Rpc(obj) => obj.code,
            _ => INTERNAL_ERROR,
        }
    }

    /// Convert into the error object carried on the wire.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            Error::Rpc(obj) => obj.clone(),
            Error::Unauthorized { message, data } => ErrorObject {
                code: UNAUTHORIZED,
                message: message.clone(),
                data: data.clone(),
            },
            Error::ResourceNotFound { uri } => ErrorObject {
                code: RESOURCE_NOT_FOUND,
                message: self.to_string(),
                data: Some(serde_json::json!({ "uri": uri })),
            },
            _ => ErrorObject {
                code: self.code(),
                message: self.to_string(),
                data: None,
            },
        }
    }

    /// Build a JSON-RPC error response for the given request id.
    pub fn to_jsonrpc_response(&self, id: RequestId) -> JSONRPCError {
        JSONRPCError {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            error: self.to_error_object(),
        }
    }

    /// True when the error reports that the remote no longer knows our session.
    pub fn is_session_not_found(&self) -> bool {
        let text = self.to_string().to_lowercase();
        match text.find("session") {
            Some(pos) => text[pos..].contains("not found"),
            None => false,
        }
    }

    pub fn unauthorized(message: impl Into<String>, data: Option<Value>) -> Self {
        Error::Unauthorized {
            message: message.into(),
            data,
        }
    }
}

impl From<ErrorObject> for Error {
    fn from(obj: ErrorObject) -> Self {
        Error::Rpc(obj)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::InvalidConfiguration(format!("invalid URL: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(Error::MethodNotFound("x".into()).code(), METHOD_NOT_FOUND);
        assert_eq!(Error::ToolNotFound("x".into()).code(), INVALID_PARAMS);
        assert_eq!(
            Error::ResourceNotFound { uri: "a".into() }.code(),
            RESOURCE_NOT_FOUND
        );
        assert_eq!(Error::Cancelled("gone".into()).code(), INTERNAL_ERROR);
        assert_eq!(Error::unauthorized("no", None).code(), UNAUTHORIZED);
    }

    #[test]
    fn test_rpc_error_passes_through() {
        let obj = ErrorObject {
            code: -32001,
            message: "unauthorized".into(),
            data: Some(serde_json::json!({"requiredScopes": ["a"]})),
        };
        let resp = Error::Rpc(obj).to_jsonrpc_response(RequestId::Number(4));
        assert_eq!(resp.id, Some(RequestId::Number(4)));
        assert_eq!(resp.error.code, -32001);
        assert!(resp.error.data.is_some());
    }

    #[test]
    fn test_session_not_found_detection() {
        assert!(Error::Transport("session abc123 not found".into()).is_session_not_found());
        assert!(
            Error::Rpc(ErrorObject {
                code: INTERNAL_ERROR,
                message: "Session 7 Not Found".into(),
                data: None,
            })
            .is_session_not_found()
        );
        assert!(!Error::Transport("not found: session".into()).is_session_not_found());
        assert!(!Error::ConnectionClosed.is_session_not_found());
    }
}
