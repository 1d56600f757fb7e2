//! The MCP client.
//!
//! A [`Client`] wraps one live connection at a time. It performs the
//! handshake, exposes the typed operations of [`ServerAPI`], answers
//! server-initiated requests through a [`ClientHandler`], and transparently
//! recovers from lost sessions when it knows how to reconnect.

use std::{
    sync::{
        Arc, RwLock as StdRwLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex, RwLock},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::ServerAPI,
    auth::Authorization,
    context::RequestContext,
    error::{Error, Result},
    jsonrpc::{IdGenerator, from_params, from_result, to_params},
    peer::{Handler, Peer},
    schema::*,
    transport::{StreamTransport, Transport},
};

/// Answers requests the server sends to the client.
///
/// Every method has a default: typed operations answer method-not-found,
/// [`ClientHandler::handle`] decodes params and routes to them.
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    async fn list_roots(&self, _ctx: &RequestContext) -> Result<ListRootsResult> {
        Err(Error::MethodNotFound(ROOTS_LIST.into()))
    }

    async fn create_message(
        &self,
        _ctx: &RequestContext,
        _params: CreateMessageParams,
    ) -> Result<CreateMessageResult> {
        Err(Error::MethodNotFound(SAMPLING_CREATE_MESSAGE.into()))
    }

    async fn elicit(&self, _ctx: &RequestContext, _params: ElicitParams) -> Result<ElicitResult> {
        Err(Error::MethodNotFound(ELICITATION_CREATE.into()))
    }

    async fn interact(
        &self,
        _ctx: &RequestContext,
        _params: InteractParams,
    ) -> Result<InteractResult> {
        Err(Error::MethodNotFound(INTERACTION_CREATE.into()))
    }

    async fn on_notification(&self, _notification: JSONRPCNotification) {}

    /// Route one server-initiated request.
    async fn handle(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        match method {
            PING => Ok(Value::Object(Default::default())),
            ROOTS_LIST => Ok(serde_json::to_value(self.list_roots(ctx).await?)?),
            SAMPLING_CREATE_MESSAGE => Ok(serde_json::to_value(
                self.create_message(ctx, from_params(params)?).await?,
            )?),
            ELICITATION_CREATE => Ok(serde_json::to_value(
                self.elicit(ctx, from_params(params)?).await?,
            )?),
            INTERACTION_CREATE => Ok(serde_json::to_value(
                self.interact(ctx, from_params(params)?).await?,
            )?),
            other => Err(Error::MethodNotFound(other.to_string())),
        }
    }
}

/// A handler that supports nothing beyond ping.
pub struct NoopClientHandler;

impl ClientHandler for NoopClientHandler {}

/// Produces a fresh transport when the client has to reconnect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

/// Obtains a bearer token satisfying an `Authorization` challenge carried by
/// a -32001 error.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn token_for(&self, authorization: &Authorization) -> Result<String>;
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Use this id instead of a generated one.
    pub id: Option<RequestId>,
    /// Attach an explicit bearer token.
    pub token: Option<String>,
    /// Cancelling this token abandons the call and notifies the server.
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    info: Implementation,
    capabilities: ClientCapabilities,
    handler: Arc<dyn ClientHandler>,
    connector: Option<Arc<dyn Connector>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    ping_interval: Option<Duration>,
}

impl ClientBuilder {
    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_handler(mut self, handler: impl ClientHandler) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn with_handler_arc(mut self, handler: Arc<dyn ClientHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Enables session recovery: on "session not found" the client builds a
    /// new transport with `connector`, re-initializes and retries once.
    pub fn with_connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Answer -32001 challenges with tokens from `provider`.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Ping the server at this interval once initialized.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                info: StdRwLock::new(self.info),
                capabilities: StdRwLock::new(self.capabilities),
                handler: self.handler,
                connector: self.connector,
                token_provider: self.token_provider,
                ping_interval: self.ping_interval,
                peer: RwLock::new(None),
                generation: AtomicU64::new(0),
                initialized: AtomicBool::new(false),
                server: StdRwLock::new(None),
                ids: IdGenerator::new(),
                ping: CancellationToken::new(),
                ping_started: AtomicBool::new(false),
                reconnecting: Mutex::new(()),
            }),
        }
    }
}

/// MCP client handle. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    info: StdRwLock<Implementation>,
    capabilities: StdRwLock<ClientCapabilities>,
    handler: Arc<dyn ClientHandler>,
    connector: Option<Arc<dyn Connector>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    ping_interval: Option<Duration>,
    peer: RwLock<Option<Peer>>,
    generation: AtomicU64,
    initialized: AtomicBool,
    server: StdRwLock<Option<InitializeResult>>,
    ids: IdGenerator,
    ping: CancellationToken,
    ping_started: AtomicBool,
    reconnecting: Mutex<()>,
}

struct ClientPeerHandler {
    handler: Arc<dyn ClientHandler>,
}

#[async_trait]
impl Handler for ClientPeerHandler {
    async fn serve(&self, ctx: RequestContext, request: JSONRPCRequest) -> Result<Value> {
        self.handler
            .handle(&ctx, &request.method, request.params)
            .await
    }

    async fn on_notification(&self, _peer: &Peer, notification: JSONRPCNotification) {
        self.handler.on_notification(notification).await
    }
}

impl Client {
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> ClientBuilder {
        ClientBuilder {
            info: Implementation::new(name, version),
            capabilities: ClientCapabilities::default(),
            handler: Arc::new(NoopClientHandler),
            connector: None,
            token_provider: None,
            ping_interval: None,
        }
    }

    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self::builder(name, version).build()
    }

    /// Connect using the provided transport. Any previous connection is
    /// replaced and the client must be initialized again.
    pub async fn connect(&self, transport: Box<dyn Transport>) -> Result<()> {
        let handler = Arc::new(ClientPeerHandler {
            handler: self.inner.handler.clone(),
        });
        let peer = Peer::connect(transport, handler).await?;
        let mut slot = self.inner.peer.write().await;
        if let Some(old) = slot.replace(peer) {
            old.close();
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.initialized.store(false, Ordering::SeqCst);
        info!("MCP client connected");
        Ok(())
    }

    /// Connect over an arbitrary reader/writer pair, e.g. a child process.
    pub async fn connect_stream<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
        W: AsyncWrite + Send + Sync + Unpin + 'static,
    {
        self.connect(Box::new(StreamTransport::from_pair(reader, writer)))
            .await
    }

    /// The capabilities advertised on the next `initialize`.
    pub fn set_capabilities(&self, capabilities: ClientCapabilities) {
        if let Ok(mut slot) = self.inner.capabilities.write() {
            *slot = capabilities;
        }
    }

    pub fn capabilities(&self) -> ClientCapabilities {
        self.inner
            .capabilities
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn set_client_info(&self, info: Implementation) {
        if let Ok(mut slot) = self.inner.info.write() {
            *slot = info;
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// The server's answer to the last successful `initialize`.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.inner.server.read().ok().and_then(|s| s.clone())
    }

    /// The current connection.
    pub async fn peer(&self) -> Result<Peer> {
        self.inner
            .peer
            .read()
            .await
            .clone()
            .ok_or(Error::TransportDisconnected)
    }

    /// Perform the handshake: send `initialize`, then
    /// `notifications/initialized`. Starts the ping task when configured.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let peer = self.peer().await?;
        let result = self.handshake(&peer).await?;
        self.start_ping();
        Ok(result)
    }

    async fn handshake(&self, peer: &Peer) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.capabilities(),
            client_info: self
                .inner
                .info
                .read()
                .map(|i| i.clone())
                .map_err(|_| Error::InternalError("client info lock poisoned".into()))?,
        };
        let request =
            JSONRPCRequest::new(self.inner.ids.next_id(), INITIALIZE, to_params(&params)?);
        let value = peer.request_with(request, &CancellationToken::new()).await?;
        let result: InitializeResult = from_result(value)?;
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(Error::Protocol(format!(
                "server selected unsupported protocol version {}",
                result.protocol_version
            )));
        }
        peer.notify(NOTIFY_INITIALIZED, None).await?;
        if let Ok(mut slot) = self.inner.server.write() {
            *slot = Some(result.clone());
        }
        self.inner.initialized.store(true, Ordering::SeqCst);
        info!(
            "Initialized with {} {} (protocol {})",
            result.server_info.name, result.server_info.version, result.protocol_version
        );
        Ok(result)
    }

    /// Stop the background ping. The transport stays open; it belongs to
    /// whoever connected it.
    pub fn close(&self) {
        self.inner.ping.cancel();
    }

    /// Send a notification to the server.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.peer().await?.notify(method, params).await
    }

    /// Scope typed calls to `options`.
    pub fn with_options(&self, options: CallOptions) -> CallScope<'_> {
        CallScope {
            client: self,
            options,
        }
    }

    /// Issue one request, applying session recovery and the auth
    /// interceptor.
    pub async fn request_with(
        &self,
        method: &str,
        params: Option<Value>,
        options: &CallOptions,
    ) -> Result<Value> {
        if !self.is_initialized() {
            return Err(Error::InternalError("not initialized".into()));
        }
        let mut request = JSONRPCRequest::new(
            options
                .id
                .clone()
                .unwrap_or_else(|| self.inner.ids.next_id()),
            method,
            params,
        );
        if let Some(token) = &options.token {
            request.set_meta_token(token);
        }

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let result = match self.send_once(request.clone(), options).await {
            Err(e) if e.is_session_not_found() && self.inner.connector.is_some() => {
                warn!("Session lost ({}), reconnecting", e);
                self.reconnect_and_initialize(generation).await?;
                request.id = self.inner.ids.next_id();
                self.send_once(request.clone(), options).await
            }
            other => other,
        };

        match result {
            Err(Error::Rpc(obj)) if obj.code == UNAUTHORIZED => {
                self.retry_authorized(request, obj, options).await
            }
            other => other,
        }
    }

    async fn send_once(&self, request: JSONRPCRequest, options: &CallOptions) -> Result<Value> {
        let peer = self.peer().await?;
        match &options.cancel {
            Some(cancel) => peer.request_with(request, cancel).await,
            None => peer.request_with(request, &CancellationToken::new()).await,
        }
    }

    async fn retry_authorized(
        &self,
        mut request: JSONRPCRequest,
        error: ErrorObject,
        options: &CallOptions,
    ) -> Result<Value> {
        let Some(provider) = &self.inner.token_provider else {
            return Err(Error::Rpc(error));
        };
        let Some(authorization) = error
            .data
            .clone()
            .and_then(|d| serde_json::from_value::<Authorization>(d).ok())
        else {
            return Err(Error::Rpc(error));
        };
        debug!("Server requires authorization for {}", request.method);
        let token = provider.token_for(&authorization).await?;
        request.set_meta_token(&token);
        request.id = self.inner.ids.next_id();
        self.send_once(request, options).await
    }

    /// Replace the connection with a fresh one and run the handshake again.
    /// Concurrent callers that observed the same failed connection reconnect
    /// only once.
    pub async fn reconnect_and_initialize(&self, seen_generation: u64) -> Result<()> {
        let Some(connector) = &self.inner.connector else {
            return Err(Error::TransportDisconnected);
        };
        let _guard = self.inner.reconnecting.lock().await;
        if self.inner.generation.load(Ordering::SeqCst) != seen_generation {
            return Ok(());
        }
        let transport = connector.connect().await?;
        self.connect(transport).await?;
        let peer = self.peer().await?;
        self.handshake(&peer).await?;
        info!("Session re-established");
        Ok(())
    }

    fn start_ping(&self) {
        let Some(interval) = self.inner.ping_interval else {
            return;
        };
        if self.inner.ping_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let stop = self.inner.ping.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let client = Client { inner };
                let generation = client.inner.generation.load(Ordering::SeqCst);
                let ping = tokio::time::timeout(interval, client.ping()).await;
                let failure = match ping {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "timed out".to_string(),
                };
                warn!("Ping failed: {}", failure);
                if client.inner.connector.is_some() {
                    if let Err(e) = client.reconnect_and_initialize(generation).await {
                        warn!("Reconnect after failed ping failed: {}", e);
                    }
                }
            }
            debug!("Ping task stopped");
        });
    }
}

#[async_trait]
impl ServerAPI for Client {
    async fn request_value(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with(method, params, &CallOptions::default())
            .await
    }
}

/// A [`Client`] paired with [`CallOptions`] applied to every call.
pub struct CallScope<'a> {
    client: &'a Client,
    options: CallOptions,
}

#[async_trait]
impl ServerAPI for CallScope<'_> {
    async fn request_value(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.client
            .request_with(method, params, &self.options)
            .await
    }
}
