use std::sync::Arc;

use http::{HeaderMap, Method, StatusCode};
use tracing::{debug, info};
use url::Url;

use super::{
    SseTransport, StreamableHttpTransport, Transport,
    http::{HttpSender, MCP_SESSION_ID_HEADER, mcp_request, with_json_body},
};
use crate::{
    error::Result,
    schema::{
        ClientCapabilities, Implementation, InitializeParams, JSONRPCMessage, JSONRPCRequest,
        LATEST_PROTOCOL_VERSION, RequestId,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Streamable,
    Sse,
}

/// Test `url` with a POST `initialize`. A 200 means Streamable HTTP; any
/// other status selects the legacy SSE transport. Network failures are
/// errors.
pub async fn detect(
    url: &Url,
    sender: &Arc<dyn HttpSender>,
    headers: &HeaderMap,
) -> Result<TransportKind> {
    let params = InitializeParams {
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    };
    let attempt = JSONRPCRequest::new(
        RequestId::String("detect".into()),
        "initialize",
        Some(serde_json::to_value(params)?),
    );
    let request = mcp_request(
        Method::POST,
        url,
        headers,
        None,
        "application/json, text/event-stream",
    );
    let request = with_json_body(request, JSONRPCMessage::Request(attempt))?;
    let response = sender.execute(request).await?;
    let status = response.status();
    debug!("Transport detection against {} returned {}", url, status);

    if status != StatusCode::OK {
        info!("Detected legacy SSE transport at {}", url);
        return Ok(TransportKind::Sse);
    }

    // Release the session detection created.
    if let Some(sid) = response
        .headers()
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    {
        drop(response);
        let request = mcp_request(Method::DELETE, url, headers, Some(&sid), "application/json");
        if let Err(e) = sender.execute(request).await {
            debug!("Failed to release detection session: {}", e);
        }
    }
    info!("Detected Streamable HTTP transport at {}", url);
    Ok(TransportKind::Streamable)
}

/// Detect the flavor of the remote and build the matching transport.
pub async fn connect_http(
    url: &Url,
    sender: Arc<dyn HttpSender>,
    headers: HeaderMap,
) -> Result<Box<dyn Transport>> {
    let transport: Box<dyn Transport> = match detect(url, &sender, &headers).await? {
        TransportKind::Streamable => {
            Box::new(StreamableHttpTransport::new(url.clone(), sender).with_headers(headers))
        }
        TransportKind::Sse => {
            Box::new(SseTransport::new(url.clone(), sender).with_headers(headers))
        }
    };
    Ok(transport)
}
