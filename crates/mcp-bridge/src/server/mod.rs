//! The MCP server runtime.
//!
//! A [`Server`] holds configuration shared by every connection. Each
//! connection gets its own session: a negotiated protocol version, the
//! client's capabilities, an initialized flag, a logging level, and a
//! [`ServerHandler`] produced by the embedder's factory.

use std::sync::{
    Arc, RwLock,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::OnceCell,
};
use tracing::{debug, info, warn};

use crate::{
    api::ClientAPI,
    client::{Client, ClientHandler},
    context::RequestContext,
    error::{Error, Result},
    jsonrpc::{from_params, to_params},
    peer::{Handler, Peer},
    schema::*,
    transport::{ChannelTransport, StdioTransport, StreamTransport, Transport},
};

pub mod http;
mod middleware;

pub use http::{DEFAULT_ADDR, HttpOptions, HttpServerHandle};
pub use middleware::{Admission, AuthToken, CorsOptions, HttpAuthorizer};

/// Handles client requests for one session.
///
/// Typed operations default to method-not-found. [`ServerHandler::handle`]
/// decodes params and routes to them; override it to take over routing
/// entirely.
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    /// Claim support for a method. Unclaimed methods answer method-not-found
    /// without reaching the handler.
    fn implements(&self, _method: &str) -> bool {
        true
    }

    /// Adjust the `initialize` answer. `result` is prefilled from the server
    /// configuration and the negotiated protocol version.
    async fn initialize(
        &self,
        _ctx: &RequestContext,
        _params: &InitializeParams,
        result: InitializeResult,
    ) -> Result<InitializeResult> {
        Ok(result)
    }

    async fn list_resources(
        &self,
        _ctx: &RequestContext,
        _params: PaginatedParams,
    ) -> Result<ListResourcesResult> {
        Err(Error::MethodNotFound(RESOURCES_LIST.into()))
    }

    async fn list_resource_templates(
        &self,
        _ctx: &RequestContext,
        _params: PaginatedParams,
    ) -> Result<ListResourceTemplatesResult> {
        Err(Error::MethodNotFound(RESOURCES_TEMPLATES_LIST.into()))
    }

    async fn read_resource(
        &self,
        _ctx: &RequestContext,
        params: ResourceParams,
    ) -> Result<ReadResourceResult> {
        Err(Error::ResourceNotFound { uri: params.uri })
    }

    async fn subscribe(&self, _ctx: &RequestContext, _params: ResourceParams) -> Result<()> {
        Err(Error::MethodNotFound(RESOURCES_SUBSCRIBE.into()))
    }

    async fn unsubscribe(&self, _ctx: &RequestContext, _params: ResourceParams) -> Result<()> {
        Err(Error::MethodNotFound(RESOURCES_UNSUBSCRIBE.into()))
    }

    async fn list_prompts(
        &self,
        _ctx: &RequestContext,
        _params: PaginatedParams,
    ) -> Result<ListPromptsResult> {
        Err(Error::MethodNotFound(PROMPTS_LIST.into()))
    }

    async fn get_prompt(
        &self,
        _ctx: &RequestContext,
        _params: GetPromptParams,
    ) -> Result<GetPromptResult> {
        Err(Error::MethodNotFound(PROMPTS_GET.into()))
    }

    async fn list_tools(
        &self,
        _ctx: &RequestContext,
        _params: PaginatedParams,
    ) -> Result<ListToolsResult> {
        Err(Error::MethodNotFound(TOOLS_LIST.into()))
    }

    async fn call_tool(
        &self,
        _ctx: &RequestContext,
        params: CallToolParams,
    ) -> Result<CallToolResult> {
        Err(Error::ToolNotFound(params.name))
    }

    async fn complete(
        &self,
        _ctx: &RequestContext,
        _params: CompleteParams,
    ) -> Result<CompleteResult> {
        Err(Error::MethodNotFound(COMPLETION_COMPLETE.into()))
    }

    /// Observe a level change. The runtime already filters log
    /// notifications by it.
    async fn set_level(&self, _ctx: &RequestContext, _params: SetLevelParams) -> Result<()> {
        Ok(())
    }

    async fn on_notification(&self, _notification: JSONRPCNotification) {}

    /// The session's transport closed.
    async fn on_close(&self) {}

    /// Route one request to the typed operations.
    async fn handle(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        let empty = || Value::Object(Default::default());
        Ok(match method {
            RESOURCES_LIST => serde_json::to_value(
                self.list_resources(ctx, from_params(params)?).await?,
            )?,
            RESOURCES_TEMPLATES_LIST => serde_json::to_value(
                self.list_resource_templates(ctx, from_params(params)?).await?,
            )?,
            RESOURCES_READ => serde_json::to_value(
                self.read_resource(ctx, from_params(params)?).await?,
            )?,
            RESOURCES_SUBSCRIBE => {
                self.subscribe(ctx, from_params(params)?).await?;
                empty()
            }
            RESOURCES_UNSUBSCRIBE => {
                self.unsubscribe(ctx, from_params(params)?).await?;
                empty()
            }
            PROMPTS_LIST => serde_json::to_value(
                self.list_prompts(ctx, from_params(params)?).await?,
            )?,
            PROMPTS_GET => serde_json::to_value(
                self.get_prompt(ctx, from_params(params)?).await?,
            )?,
            TOOLS_LIST => serde_json::to_value(
                self.list_tools(ctx, from_params(params)?).await?,
            )?,
            TOOLS_CALL => serde_json::to_value(
                self.call_tool(ctx, from_params(params)?).await?,
            )?,
            COMPLETION_COMPLETE => serde_json::to_value(
                self.complete(ctx, from_params(params)?).await?,
            )?,
            LOGGING_SET_LEVEL => {
                self.set_level(ctx, from_params(params)?).await?;
                empty()
            }
            other => return Err(Error::MethodNotFound(other.to_string())),
        })
    }
}

/// A handler that serves nothing but the handshake and ping.
struct EmptyHandler;

impl ServerHandler for EmptyHandler {
    fn implements(&self, _method: &str) -> bool {
        false
    }
}

/// Decides whether a JSON-RPC request may proceed.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    /// `Ok(Some(token))` admits the call with an authenticated token,
    /// `Ok(None)` admits it anonymously, an error is sent back as the reply.
    async fn authorize(&self, request: &JSONRPCRequest) -> Result<Option<String>>;
}

type HandlerFactory = dyn Fn(SessionCtx) -> Box<dyn ServerHandler> + Send + Sync;

/// Server configuration, cloned into every session.
#[derive(Clone)]
pub struct Server {
    info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    factory: Arc<HandlerFactory>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl Server {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: Implementation::new(name, version),
            capabilities: ServerCapabilities::default(),
            instructions: None,
            factory: Arc::new(|_| Box::new(EmptyHandler)),
            authorizer: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Build a fresh handler for every session.
    pub fn with_handler<F, H>(mut self, factory: F) -> Self
    where
        F: Fn(SessionCtx) -> H + Send + Sync + 'static,
        H: ServerHandler,
    {
        self.factory = Arc::new(move |ctx| Box::new(factory(ctx)));
        self
    }

    pub fn with_authorizer(mut self, authorizer: impl Authorizer) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    pub fn with_authorizer_arc(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn info(&self) -> &Implementation {
        &self.info
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    /// Serve one connection in the background.
    pub async fn serve(&self, transport: Box<dyn Transport>) -> Result<ServerHandle> {
        let session = Arc::new(Session::new(self.clone()));
        let peer = Peer::connect(transport, session).await?;
        info!("MCP server session started");
        Ok(ServerHandle { peer })
    }

    /// Serve stdin/stdout until the client goes away.
    pub async fn serve_stdio(&self) -> Result<()> {
        let handle = self.serve(Box::new(StdioTransport::new())).await?;
        handle.wait().await;
        Ok(())
    }

    /// Serve a reader/writer pair in the background.
    pub async fn serve_stream<R, W>(&self, reader: R, writer: W) -> Result<ServerHandle>
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
        W: AsyncWrite + Send + Sync + Unpin + 'static,
    {
        self.serve(Box::new(StreamTransport::from_pair(reader, writer)))
            .await
    }

    /// Serve HTTP ingress with the given options.
    pub async fn serve_http(&self, options: HttpOptions) -> Result<HttpServerHandle> {
        http::serve(self.clone(), options).await
    }

    /// An initialized [`Client`] wired to a session of this server in
    /// memory, so handlers can be exercised through the client API.
    pub async fn as_client(&self, handler: impl ClientHandler) -> Result<Client> {
        self.as_client_with(
            Client::builder("in-process", env!("CARGO_PKG_VERSION")).with_handler(handler),
        )
        .await
    }

    pub async fn as_client_with(&self, builder: crate::client::ClientBuilder) -> Result<Client> {
        let (server_side, client_side) = ChannelTransport::pair();
        self.serve(Box::new(server_side)).await?;
        let client = builder.build();
        client.connect(Box::new(client_side)).await?;
        client.initialize().await?;
        Ok(client)
    }
}

/// A running server session.
pub struct ServerHandle {
    peer: Peer,
}

impl ServerHandle {
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Wait for the session to end.
    pub async fn wait(&self) {
        self.peer.closed().await
    }

    pub async fn stop(self) {
        self.peer.close();
        self.peer.closed().await
    }
}

/// Everything a handler factory gets to work with for one session.
#[derive(Clone)]
pub struct SessionCtx {
    notifier: Notifier,
    logger: Logger,
    client: ClientOps,
}

impl SessionCtx {
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Issue server-to-client requests over the session's transport.
    pub fn client(&self) -> &ClientOps {
        &self.client
    }
}

/// Sends list-changed and resource-updated notifications.
#[derive(Clone)]
pub struct Notifier {
    peer: Peer,
}

impl Notifier {
    pub async fn resource_updated(&self, uri: impl Into<String>) -> Result<()> {
        let params = to_params(&ResourceUpdatedParams { uri: uri.into() })?;
        self.peer.notify(NOTIFY_RESOURCE_UPDATED, params).await
    }

    pub async fn resource_list_changed(&self) -> Result<()> {
        self.peer.notify(NOTIFY_RESOURCE_LIST_CHANGED, None).await
    }

    pub async fn tool_list_changed(&self) -> Result<()> {
        self.peer.notify(NOTIFY_TOOL_LIST_CHANGED, None).await
    }

    pub async fn prompt_list_changed(&self) -> Result<()> {
        self.peer.notify(NOTIFY_PROMPT_LIST_CHANGED, None).await
    }
}

/// Emits `notifications/message`, honoring the level the client set.
#[derive(Clone)]
pub struct Logger {
    peer: Peer,
    level: Arc<RwLock<LoggingLevel>>,
    name: Option<String>,
}

impl Logger {
    /// A logger reporting under `name`.
    pub fn named(&self, name: impl Into<String>) -> Logger {
        Logger {
            name: Some(name.into()),
            ..self.clone()
        }
    }

    pub fn level(&self) -> LoggingLevel {
        self.level.read().map(|l| *l).unwrap_or_default()
    }

    pub fn enabled(&self, level: LoggingLevel) -> bool {
        level >= self.level()
    }

    pub async fn log(&self, level: LoggingLevel, data: impl Into<Value>) -> Result<()> {
        if !self.enabled(level) {
            return Ok(());
        }
        let params = to_params(&LoggingMessageParams {
            level,
            logger: self.name.clone(),
            data: data.into(),
        })?;
        self.peer.notify(NOTIFY_MESSAGE, params).await
    }

    pub async fn debug(&self, data: impl Into<Value>) -> Result<()> {
        self.log(LoggingLevel::Debug, data).await
    }

    pub async fn info(&self, data: impl Into<Value>) -> Result<()> {
        self.log(LoggingLevel::Info, data).await
    }

    pub async fn warning(&self, data: impl Into<Value>) -> Result<()> {
        self.log(LoggingLevel::Warning, data).await
    }

    pub async fn error(&self, data: impl Into<Value>) -> Result<()> {
        self.log(LoggingLevel::Error, data).await
    }
}

/// Server-to-client requests for one session.
#[derive(Clone)]
pub struct ClientOps {
    peer: Peer,
    capabilities: Arc<RwLock<Option<ClientCapabilities>>>,
}

impl ClientOps {
    /// The capabilities the client advertised in `initialize`.
    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.capabilities.read().ok().and_then(|c| c.clone())
    }

    pub fn supports(&self, method: &str) -> bool {
        self.client_capabilities()
            .map(|c| c.supports(method))
            .unwrap_or(false)
    }

    /// Send a notification to the client.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.peer.notify(method, params).await
    }
}

#[async_trait]
impl ClientAPI for ClientOps {
    async fn request_value(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if let Some(caps) = self.client_capabilities() {
            if !caps.supports(method) {
                return Err(Error::MethodNotFound(format!(
                    "client did not advertise support for {method}"
                )));
            }
        }
        self.peer.request(method, params).await
    }
}

/// Per-connection state.
struct Session {
    server: Server,
    handler: OnceCell<Arc<dyn ServerHandler>>,
    init_received: AtomicBool,
    initialized: AtomicBool,
    protocol_version: RwLock<Option<String>>,
    capabilities: Arc<RwLock<Option<ClientCapabilities>>>,
    level: Arc<RwLock<LoggingLevel>>,
}

impl Session {
    fn new(server: Server) -> Self {
        Self {
            server,
            handler: OnceCell::new(),
            init_received: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            protocol_version: RwLock::new(None),
            capabilities: Arc::new(RwLock::new(None)),
            level: Arc::new(RwLock::new(LoggingLevel::default())),
        }
    }

    async fn handler(&self, peer: &Peer) -> Arc<dyn ServerHandler> {
        self.handler
            .get_or_init(|| async {
                let ctx = SessionCtx {
                    notifier: Notifier { peer: peer.clone() },
                    logger: Logger {
                        peer: peer.clone(),
                        level: self.level.clone(),
                        name: None,
                    },
                    client: ClientOps {
                        peer: peer.clone(),
                        capabilities: self.capabilities.clone(),
                    },
                };
                Arc::from((self.server.factory)(ctx))
            })
            .await
            .clone()
    }

    fn negotiate(requested: &str) -> String {
        if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested) {
            requested.to_string()
        } else {
            LATEST_PROTOCOL_VERSION.to_string()
        }
    }

    async fn initialize(
        &self,
        ctx: &RequestContext,
        handler: &Arc<dyn ServerHandler>,
        params: Option<Value>,
    ) -> Result<Value> {
        let params: InitializeParams = from_params(params)?;
        let version = Self::negotiate(&params.protocol_version);
        debug!(
            "Client {} {} requested protocol {}, using {}",
            params.client_info.name, params.client_info.version, params.protocol_version, version
        );
        if let Ok(mut slot) = self.capabilities.write() {
            *slot = Some(params.capabilities.clone());
        }
        if let Ok(mut slot) = self.protocol_version.write() {
            *slot = Some(version.clone());
        }

        let mut result = InitializeResult::new(
            self.server.info.name.clone(),
            self.server.info.version.clone(),
        )
        .with_capabilities(self.server.capabilities.clone());
        result.server_info = self.server.info.clone();
        result.protocol_version = version;
        result.instructions = self.server.instructions.clone();

        let result = handler.initialize(ctx, &params, result).await?;
        self.init_received.store(true, Ordering::SeqCst);
        Ok(serde_json::to_value(result)?)
    }

    fn require_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::InvalidRequest("client not initialized".into()))
        }
    }
}

#[async_trait]
impl Handler for Session {
    async fn serve(&self, mut ctx: RequestContext, request: JSONRPCRequest) -> Result<Value> {
        let handler = self.handler(ctx.peer()).await;
        let method = request.method.as_str();
        debug!("Server handling request {} {}", request.id, method);

        match method {
            INITIALIZE => return self.initialize(&ctx, &handler, request.params).await,
            PING => return Ok(Value::Object(Default::default())),
            LOGGING_SET_LEVEL => self.require_initialized()?,
            _ => {
                self.require_initialized()?;
                if !handler.implements(method) {
                    return Err(Error::MethodNotFound(method.to_string()));
                }
            }
        }

        let token = match &self.server.authorizer {
            Some(authorizer) => authorizer.authorize(&request).await?,
            None => request
                .meta()
                .and_then(|m| m.authorization)
                .and_then(|a| a.token),
        };
        ctx.set_auth_token(token);

        if method == LOGGING_SET_LEVEL {
            let params: SetLevelParams = from_params(request.params.clone())?;
            if let Ok(mut level) = self.level.write() {
                *level = params.level;
            }
        }

        handler.handle(&ctx, method, request.params).await
    }

    async fn on_notification(&self, peer: &Peer, notification: JSONRPCNotification) {
        if notification.method == NOTIFY_INITIALIZED {
            if self.init_received.load(Ordering::SeqCst) {
                self.initialized.store(true, Ordering::SeqCst);
                debug!("Session initialized");
            } else {
                warn!("Ignoring initialized notification received before initialize");
            }
        }
        if notification.method == NOTIFY_CANCELLED {
            return;
        }
        self.handler(peer).await.on_notification(notification).await;
    }

    async fn on_close(&self) {
        if let Some(handler) = self.handler.get() {
            handler.on_close().await;
        }
        info!("MCP server session closed");
    }
}
