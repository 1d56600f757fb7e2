use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt, channel::mpsc};
use http::{HeaderMap, Method};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    ChannelTransport, Transport, TransportStream,
    http::{HttpSender, mcp_request, synthesized_error, with_json_body},
};
use crate::{
    codec::decode_message,
    error::{Error, Result},
    schema::JSONRPCMessage,
};

const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client side of the legacy two-endpoint transport: a `GET` event stream for
/// server→client traffic and a `POST` endpoint, announced by the first
/// `endpoint` event, for client→server traffic.
pub struct SseTransport {
    url: Url,
    sender: Arc<dyn HttpSender>,
    headers: HeaderMap,
    connected: Option<Connected>,
}

struct Connected {
    endpoint: Url,
    inbound: mpsc::UnboundedReceiver<Result<JSONRPCMessage>>,
    cancel: CancellationToken,
}

impl SseTransport {
    pub fn new(url: Url, sender: Arc<dyn HttpSender>) -> Self {
        Self {
            url,
            sender,
            headers: HeaderMap::new(),
            connected: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// The message endpoint, once connected.
    pub fn endpoint(&self) -> Option<&Url> {
        self.connected.as_ref().map(|c| &c.endpoint)
    }
}

async fn wait_for_endpoint<S, E>(base: &Url, events: &mut S) -> Result<Url>
where
    S: Stream<Item = std::result::Result<eventsource_stream::Event, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(event) = events.next().await {
        match event {
            Ok(event) if event.event == "endpoint" => return Ok(base.join(event.data.trim())?),
            Ok(event) => debug!("Skipping SSE event {:?} before endpoint", event.event),
            Err(e) => return Err(Error::Transport(format!("SSE stream error: {e}"))),
        }
    }
    Err(Error::Transport(
        "SSE stream closed before the endpoint event".into(),
    ))
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&mut self) -> Result<()> {
        info!("Connecting to SSE endpoint {}", self.url);
        let request = mcp_request(
            Method::GET,
            &self.url,
            &self.headers,
            None,
            "text/event-stream",
        );
        let response = self.sender.execute(request).await?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "SSE connection to {} failed with status {}",
                self.url,
                response.status()
            )));
        }

        let mut events = Box::pin(response.bytes_stream().eventsource());
        let endpoint =
            tokio::time::timeout(ENDPOINT_TIMEOUT, wait_for_endpoint(&self.url, &mut events))
                .await
                .map_err(|_| {
                    Error::Transport("timed out waiting for the endpoint event".into())
                })??;
        debug!("SSE message endpoint: {}", endpoint);

        let (in_tx, in_rx) = mpsc::unbounded();
        let cancel = CancellationToken::new();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(Ok(event)) if event.event.is_empty() || event.event == "message" => {
                            let message = decode_message(event.data.as_bytes());
                            if in_tx.unbounded_send(message).is_err() {
                                break;
                            }
                        }
                        Some(Ok(event)) => debug!("Ignoring SSE event {:?}", event.event),
                        Some(Err(e)) => {
                            warn!("SSE stream error: {}", e);
                            break;
                        }
                        None => {
                            debug!("SSE stream closed by server");
                            break;
                        }
                    },
                }
            }
        });

        self.connected = Some(Connected {
            endpoint,
            inbound: in_rx,
            cancel,
        });
        Ok(())
    }

    fn framed(self: Box<Self>) -> Result<Box<dyn TransportStream>> {
        let Connected {
            endpoint,
            inbound,
            cancel,
        } = self.connected.ok_or(Error::TransportDisconnected)?;
        let session_id = endpoint
            .query_pairs()
            .find(|(k, _)| k == "session_id" || k == "sessionId")
            .map(|(_, v)| v.into_owned());

        let (out_tx, mut out_rx) = mpsc::unbounded::<JSONRPCMessage>();
        let (in_tx, in_rx) = mpsc::unbounded();
        let sender = self.sender;
        let headers = self.headers;

        // Errors synthesized for failed POSTs share the inbound channel with
        // messages read off the event stream.
        let merged = in_tx.clone();
        tokio::spawn(async move {
            let mut inbound = inbound;
            while let Some(item) = inbound.next().await {
                if merged.unbounded_send(item).is_err() {
                    break;
                }
            }
            merged.close_channel();
        });

        tokio::spawn(async move {
            while let Some(message) = out_rx.next().await {
                let sender = sender.clone();
                let endpoint = endpoint.clone();
                let headers = headers.clone();
                let session_id = session_id.clone();
                let in_tx = in_tx.clone();
                tokio::spawn(async move {
                    let request = mcp_request(
                        Method::POST,
                        &endpoint,
                        &headers,
                        None,
                        "application/json, text/event-stream",
                    );
                    let result = match with_json_body(request, message.clone()) {
                        Ok(request) => sender.execute(request).await,
                        Err(e) => Err(e),
                    };
                    let failure = match result {
                        Ok(response) if response.status().is_success() => return,
                        Ok(response) => {
                            let status = response.status();
                            let body = response.text().await.unwrap_or_default();
                            warn!("POST to {} returned {}: {}", endpoint, status, body);
                            synthesized_error(&message, Some(status), session_id.as_deref(), &body)
                        }
                        Err(e) => {
                            warn!("POST to {} failed: {}", endpoint, e);
                            synthesized_error(&message, None, None, &e.to_string())
                        }
                    };
                    if let Some(err) = failure {
                        let _ = in_tx.unbounded_send(Ok(err));
                    }
                });
            }
        });

        Box::new(ChannelTransport::new(out_tx, in_rx).with_guard(cancel.drop_guard())).framed()
    }
}
