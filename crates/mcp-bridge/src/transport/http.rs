use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use http::{HeaderMap, HeaderValue, Method, header};
use tracing::{debug, warn};

use crate::{
    codec::decode_message,
    error::{Error, Result},
    schema::{
        ErrorObject, INTERNAL_ERROR, JSONRPC_VERSION, JSONRPCError, JSONRPCMessage,
        LATEST_PROTOCOL_VERSION, UNAUTHORIZED,
    },
};

pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Executes outbound HTTP requests. Implemented by a plain `reqwest::Client`
/// and by the authorizing round-tripper, so transports work the same with or
/// without OAuth in front of them.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response>;
}

#[async_trait]
impl HttpSender for reqwest::Client {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        Ok(reqwest::Client::execute(self, request).await?)
    }
}

/// Build a request carrying the MCP headers shared by every call.
pub(crate) fn mcp_request(
    method: Method,
    url: &url::Url,
    extra: &HeaderMap,
    session_id: Option<&str>,
    accept: &'static str,
) -> reqwest::Request {
    let mut request = reqwest::Request::new(method, url.clone());
    let headers = request.headers_mut();
    for (name, value) in extra {
        headers.insert(name.clone(), value.clone());
    }
    headers.insert(header::ACCEPT, HeaderValue::from_static(accept));
    headers.insert(
        MCP_PROTOCOL_VERSION_HEADER,
        HeaderValue::from_static(LATEST_PROTOCOL_VERSION),
    );
    if let Some(sid) = session_id.and_then(|s| HeaderValue::from_str(s).ok()) {
        headers.insert(MCP_SESSION_ID_HEADER, sid);
    }
    request
}

/// Attach a JSON body, moving any in-band token into the `Authorization`
/// header since HTTP has a channel for it.
pub(crate) fn with_json_body(
    mut request: reqwest::Request,
    message: JSONRPCMessage,
) -> Result<reqwest::Request> {
    let message = match message {
        JSONRPCMessage::Request(mut req) => {
            if let Some(token) = req.take_meta_token() {
                let value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| Error::InvalidRequest("token is not a valid header".into()))?;
                request.headers_mut().insert(header::AUTHORIZATION, value);
            }
            JSONRPCMessage::Request(req)
        }
        other => other,
    };
    let body = serde_json::to_vec(&message)?;
    request.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    *request.body_mut() = Some(body.into());
    Ok(request)
}

pub(crate) fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false)
}

/// Decode JSON-RPC envelopes carried by `message` events of an SSE body.
pub(crate) fn sse_messages<S>(bytes: S) -> impl Stream<Item = Result<JSONRPCMessage>> + Send
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    bytes.eventsource().filter_map(|event| async move {
        match event {
            Ok(event) if event.event.is_empty() || event.event == "message" => {
                if event.data.trim().is_empty() {
                    return None;
                }
                Some(decode_message(event.data.as_bytes()))
            }
            Ok(event) => {
                debug!("Ignoring SSE event {:?}", event.event);
                None
            }
            Err(e) => {
                warn!("SSE stream error: {}", e);
                Some(Err(Error::Transport(format!("SSE stream error: {e}"))))
            }
        }
    })
}

/// The error a pending call resolves with when its POST could not deliver a
/// response, so callers never hang on a dead request.
pub(crate) fn synthesized_error(
    request: &JSONRPCMessage,
    status: Option<http::StatusCode>,
    session_id: Option<&str>,
    detail: &str,
) -> Option<JSONRPCMessage> {
    let JSONRPCMessage::Request(req) = request else {
        return None;
    };
    let error = match (status, session_id) {
        (Some(http::StatusCode::NOT_FOUND), Some(sid)) => ErrorObject {
            code: INTERNAL_ERROR,
            message: format!("session {sid} not found"),
            data: None,
        },
        (Some(http::StatusCode::UNAUTHORIZED), _) => ErrorObject {
            code: UNAUTHORIZED,
            message: "unauthorized".to_string(),
            data: None,
        },
        (Some(status), _) => ErrorObject {
            code: INTERNAL_ERROR,
            message: format!("HTTP {status}: {detail}"),
            data: None,
        },
        (None, _) => ErrorObject {
            code: INTERNAL_ERROR,
            message: detail.to_string(),
            data: None,
        },
    };
    Some(JSONRPCMessage::Error(JSONRPCError {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id: Some(req.id.clone()),
        error,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{JSONRPCRequest, RequestId};

    #[test]
    fn test_token_moves_to_header() {
        let mut req = JSONRPCRequest::new(RequestId::Number(1), "tools/list", None);
        req.set_meta_token("tok");
        let url = url::Url::parse("http://localhost/mcp").unwrap();
        let http = mcp_request(
            Method::POST,
            &url,
            &HeaderMap::new(),
            Some("s1"),
            "application/json, text/event-stream",
        );
        let http = with_json_body(http, JSONRPCMessage::Request(req)).unwrap();
        assert_eq!(http.headers()[header::AUTHORIZATION], "Bearer tok");
        assert_eq!(http.headers()[MCP_SESSION_ID_HEADER], "s1");
        let body = http.body().and_then(|b| b.as_bytes()).unwrap();
        assert!(!String::from_utf8_lossy(body).contains("_meta"));
    }

    #[test]
    fn test_missing_session_is_recoverable() {
        let req =
            JSONRPCMessage::Request(JSONRPCRequest::new(RequestId::Number(9), "tools/list", None));
        let Some(JSONRPCMessage::Error(err)) =
            synthesized_error(&req, Some(http::StatusCode::NOT_FOUND), Some("abc"), "")
        else {
            panic!("expected error");
        };
        assert_eq!(err.id, Some(RequestId::Number(9)));
        assert!(Error::Rpc(err.error).is_session_not_found());
    }
}
