use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::{StreamExt, channel::mpsc};
use http::{HeaderMap, Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    ChannelTransport, Transport, TransportStream,
    http::{
        HttpSender, MCP_SESSION_ID_HEADER, is_event_stream, mcp_request, sse_messages,
        synthesized_error, with_json_body,
    },
};
use crate::{error::Result, schema::JSONRPCMessage};

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Client side of the single-endpoint Streamable HTTP transport.
///
/// Each outbound message is POSTed on its own task so a long-running call
/// never blocks the server-initiated requests it may trigger. Replies arrive
/// either as a JSON body or as an SSE segment on the same POST. Once the
/// server assigns a session id, a standby `GET` stream is opened for
/// server-initiated traffic.
pub struct StreamableHttpTransport {
    url: Url,
    sender: Arc<dyn HttpSender>,
    headers: HeaderMap,
}

impl StreamableHttpTransport {
    pub fn new(url: Url, sender: Arc<dyn HttpSender>) -> Self {
        Self {
            url,
            sender,
            headers: HeaderMap::new(),
        }
    }

    /// Extra headers sent with every request.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

#[derive(Clone)]
struct Driver {
    url: Url,
    sender: Arc<dyn HttpSender>,
    headers: HeaderMap,
    session_id: Arc<RwLock<Option<String>>>,
    inbound: mpsc::UnboundedSender<Result<JSONRPCMessage>>,
    cancel: CancellationToken,
}

impl Driver {
    fn session_id(&self) -> Option<String> {
        self.session_id.read().ok().and_then(|s| s.clone())
    }

    fn forward(&self, item: Result<JSONRPCMessage>) {
        let _ = self.inbound.unbounded_send(item);
    }

    /// Record a session id from a response; returns true the first time one
    /// is seen.
    fn capture_session(&self, response: &reqwest::Response) -> bool {
        let Some(sid) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let Ok(mut slot) = self.session_id.write() else {
            return false;
        };
        let first = slot.is_none();
        if slot.as_deref() != Some(sid) {
            debug!("Streamable HTTP session id: {}", sid);
            *slot = Some(sid.to_string());
        }
        first
    }

    async fn post(self, message: JSONRPCMessage) {
        let session = self.session_id();
        let request = mcp_request(
            Method::POST,
            &self.url,
            &self.headers,
            session.as_deref(),
            ACCEPT_BOTH,
        );
        let request = match with_json_body(request, message.clone()) {
            Ok(r) => r,
            Err(e) => {
                if let Some(err) = synthesized_error(&message, None, None, &e.to_string()) {
                    self.forward(Ok(err));
                }
                return;
            }
        };

        let response = match self.sender.execute(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!("POST to {} failed: {}", self.url, e);
                if let Some(err) = synthesized_error(&message, None, None, &e.to_string()) {
                    self.forward(Ok(err));
                }
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("POST to {} returned {}: {}", self.url, status, body);
            if let Some(err) = synthesized_error(&message, Some(status), session.as_deref(), &body)
            {
                self.forward(Ok(err));
            }
            return;
        }

        if self.capture_session(&response) {
            tokio::spawn(self.clone().standby());
        }

        if status == StatusCode::ACCEPTED {
            return;
        }

        if is_event_stream(&response) {
            let mut events = Box::pin(sse_messages(response.bytes_stream()));
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    item = events.next() => match item {
                        Some(item) => self.forward(item),
                        None => break,
                    },
                }
            }
            return;
        }

        match response.bytes().await {
            Ok(body) if body.iter().all(u8::is_ascii_whitespace) => {}
            Ok(body) => self.forward(crate::codec::decode_message(&body)),
            Err(e) => {
                if let Some(err) = synthesized_error(&message, None, None, &e.to_string()) {
                    self.forward(Ok(err));
                }
            }
        }
    }

    /// Long-lived GET stream for server-initiated messages.
    async fn standby(self) {
        let session = self.session_id();
        let request = mcp_request(
            Method::GET,
            &self.url,
            &self.headers,
            session.as_deref(),
            "text/event-stream",
        );
        let response = match self.sender.execute(request).await {
            Ok(r) => r,
            Err(e) => {
                debug!("Standby stream unavailable: {}", e);
                return;
            }
        };
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            debug!("Server does not offer a standby stream");
            return;
        }
        if !response.status().is_success() {
            debug!("Standby stream returned {}", response.status());
            return;
        }
        let mut events = Box::pin(sse_messages(response.bytes_stream()));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                item = events.next() => match item {
                    Some(Ok(msg)) => self.forward(Ok(msg)),
                    Some(Err(e)) => {
                        debug!("Standby stream ended: {}", e);
                        break;
                    }
                    None => break,
                },
            }
        }
    }

    /// Tell the server the session is over.
    async fn terminate(self) {
        let Some(session) = self.session_id() else {
            return;
        };
        let request = mcp_request(
            Method::DELETE,
            &self.url,
            &self.headers,
            Some(&session),
            ACCEPT_BOTH,
        );
        if let Err(e) = self.sender.execute(request).await {
            debug!("Session DELETE failed: {}", e);
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn connect(&mut self) -> Result<()> {
        info!("Using Streamable HTTP endpoint {}", self.url);
        Ok(())
    }

    fn framed(self: Box<Self>) -> Result<Box<dyn TransportStream>> {
        let (out_tx, mut out_rx) = mpsc::unbounded::<JSONRPCMessage>();
        let (in_tx, in_rx) = mpsc::unbounded();
        let cancel = CancellationToken::new();

        let driver = Driver {
            url: self.url,
            sender: self.sender,
            headers: self.headers,
            session_id: Arc::new(RwLock::new(None)),
            inbound: in_tx,
            cancel: cancel.clone(),
        };

        tokio::spawn(async move {
            while let Some(message) = out_rx.next().await {
                tokio::spawn(driver.clone().post(message));
            }
            driver.cancel.cancel();
            driver.terminate().await;
        });

        Box::new(ChannelTransport::new(out_tx, in_rx).with_guard(cancel.drop_guard())).framed()
    }
}
