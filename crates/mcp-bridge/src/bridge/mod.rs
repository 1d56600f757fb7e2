//! Expose a remote MCP server to local clients.
//!
//! The [`Bridge`] holds one upstream [`Client`] speaking Streamable HTTP or
//! legacy SSE, and serves a local [`Server`] whose sessions forward every
//! request upstream. Requests the upstream server sends back are routed
//! through a [`HandlerSlot`] to the downstream client that is currently
//! bound, or answered by the built-in [`Elicitator`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use http::HeaderMap;
use serde_json::{Value, json};
use tracing::{debug, info};
use url::Url;

use crate::{
    api::ClientAPI,
    client::{CallOptions, Client, ClientHandler, Connector, TokenProvider},
    context::RequestContext,
    error::{Error, Result},
    jsonrpc::from_params,
    schema::*,
    server::{ClientOps, HttpOptions, HttpServerHandle, Server, ServerHandler, SessionCtx},
    transport::{HttpSender, Transport, connect_http},
};

mod elicit;
mod slot;

pub use elicit::Elicitator;
pub use slot::HandlerSlot;

const BRIDGE_NAME: &str = env!("CARGO_PKG_NAME");
const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How to reach the upstream server and what to offer downstream.
pub struct BridgeOptions {
    url: Url,
    sender: Arc<dyn HttpSender>,
    headers: HeaderMap,
    token_provider: Option<Arc<dyn TokenProvider>>,
    elicitator: Option<Arc<Elicitator>>,
    ping_interval: Option<Duration>,
}

impl BridgeOptions {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            sender: Arc::new(reqwest::Client::new()),
            headers: HeaderMap::new(),
            token_provider: None,
            elicitator: None,
            ping_interval: None,
        }
    }

    /// The HTTP sender for upstream traffic, typically an
    /// [`AuthTransport`](crate::auth::AuthTransport).
    pub fn with_sender(mut self, sender: Arc<dyn HttpSender>) -> Self {
        self.sender = sender;
        self
    }

    /// Extra headers sent with every upstream request.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Answers -32001 challenges from the upstream server.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Serve elicitation through a local web page for downstream clients
    /// that do not support it.
    pub fn with_elicitation_ui(mut self, elicitator: Elicitator) -> Self {
        self.elicitator = Some(Arc::new(elicitator));
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }
}

/// Builds upstream transports, probing the remote for its flavor each time.
#[derive(Clone)]
struct UpstreamConnector {
    url: Url,
    sender: Arc<dyn HttpSender>,
    headers: HeaderMap,
}

#[async_trait]
impl Connector for UpstreamConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        connect_http(&self.url, self.sender.clone(), self.headers.clone()).await
    }
}

/// A connected bridge.
pub struct Bridge {
    upstream: Client,
    connector: UpstreamConnector,
    slot: HandlerSlot,
    elicitator: Option<Arc<Elicitator>>,
}

impl Bridge {
    /// Detect the upstream transport and connect. The handshake happens when
    /// the first downstream client initializes.
    pub async fn connect(options: BridgeOptions) -> Result<Self> {
        let connector = UpstreamConnector {
            url: options.url,
            sender: options.sender,
            headers: options.headers,
        };
        let slot = HandlerSlot::new();
        let mut builder = Client::builder(BRIDGE_NAME, BRIDGE_VERSION)
            .with_handler(slot.clone())
            .with_connector(connector.clone());
        if let Some(provider) = options.token_provider {
            builder = builder.with_token_provider(provider);
        }
        if let Some(interval) = options.ping_interval {
            builder = builder.with_ping_interval(interval);
        }
        let upstream = builder.build();
        upstream.connect(connector.connect().await?).await?;
        info!("Bridge connected to {}", connector.url);

        Ok(Self {
            upstream,
            connector,
            slot,
            elicitator: options.elicitator,
        })
    }

    pub fn upstream(&self) -> &Client {
        &self.upstream
    }

    pub fn elicitator(&self) -> Option<&Arc<Elicitator>> {
        self.elicitator.as_ref()
    }

    /// The local server. Every session proxies to the shared upstream.
    pub fn server(&self) -> Server {
        let upstream = self.upstream.clone();
        let connector = self.connector.clone();
        let slot = self.slot.clone();
        let elicitator = self.elicitator.clone();
        Server::new(BRIDGE_NAME, BRIDGE_VERSION).with_handler(move |ctx: SessionCtx| {
            let downstream: Arc<dyn ClientHandler> = Arc::new(Downstream {
                client: ctx.client().clone(),
                elicitator: elicitator.clone(),
            });
            ProxyHandler {
                upstream: upstream.clone(),
                connector: connector.clone(),
                slot: slot.clone(),
                downstream,
                elicitation: elicitator.is_some(),
            }
        })
    }

    /// Serve stdin/stdout until the local client goes away.
    pub async fn serve_stdio(&self) -> Result<()> {
        let result = self.server().serve_stdio().await;
        self.upstream.close();
        result
    }

    pub async fn serve_http(&self, options: HttpOptions) -> Result<HttpServerHandle> {
        self.server().serve_http(options).await
    }
}

/// Proxies one downstream session's requests to the upstream client.
struct ProxyHandler {
    upstream: Client,
    connector: UpstreamConnector,
    slot: HandlerSlot,
    downstream: Arc<dyn ClientHandler>,
    elicitation: bool,
}

#[async_trait]
impl ServerHandler for ProxyHandler {
    async fn initialize(
        &self,
        _ctx: &RequestContext,
        params: &InitializeParams,
        result: InitializeResult,
    ) -> Result<InitializeResult> {
        let mut capabilities = params.capabilities.clone();
        if self.elicitation && capabilities.elicitation.is_none() {
            capabilities.elicitation = Some(json!({}));
        }
        self.upstream.set_capabilities(capabilities);
        self.upstream.set_client_info(params.client_info.clone());
        if self.slot.set(self.downstream.clone()).await.is_some() {
            debug!("Replaced previous downstream client");
        }

        // A second downstream gets its own upstream session.
        if self.upstream.is_initialized() {
            let transport = self.connector.connect().await?;
            self.upstream.connect(transport).await?;
        }
        let upstream = self.upstream.initialize().await?;
        Ok(InitializeResult {
            protocol_version: result.protocol_version,
            ..upstream
        })
    }

    async fn on_notification(&self, notification: JSONRPCNotification) {
        // The upstream handshake already sent its own.
        if notification.method == NOTIFY_INITIALIZED {
            return;
        }
        if let Err(e) = self
            .upstream
            .notify(&notification.method, notification.params)
            .await
        {
            debug!("Failed to forward {}: {}", notification.method, e);
        }
    }

    async fn on_close(&self) {
        if self.slot.release(&self.downstream).await {
            debug!("Downstream client unbound");
        }
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        let options = CallOptions::new().with_cancel(ctx.cancellation_token().clone());
        self.upstream.request_with(method, params, &options).await
    }
}

/// Forwards upstream server-initiated traffic to one downstream client.
struct Downstream {
    client: ClientOps,
    elicitator: Option<Arc<Elicitator>>,
}

#[async_trait]
impl ClientHandler for Downstream {
    async fn on_notification(&self, notification: JSONRPCNotification) {
        if let Err(e) = self
            .client
            .notify(&notification.method, notification.params)
            .await
        {
            debug!("Failed to forward {} downstream: {}", notification.method, e);
        }
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        match method {
            PING => Ok(Value::Object(Default::default())),
            ELICITATION_CREATE if !self.client.supports(ELICITATION_CREATE) => {
                let Some(elicitator) = &self.elicitator else {
                    return Err(Error::MethodNotFound(ELICITATION_CREATE.into()));
                };
                let result = elicitator.elicit(ctx, from_params(params)?).await?;
                Ok(serde_json::to_value(result)?)
            }
            _ => self.client.request_value(method, params).await,
        }
    }
}
