//! HTTP ingress for a [`Server`].
//!
//! Mounts, in order: embedder routes, the protected resource metadata
//! document, the legacy SSE pair (`GET /sse` + `POST /message`) and the
//! Streamable HTTP endpoint (`/mcp`). Each HTTP session runs its own
//! server session over an in-memory channel; replies are routed back to
//! the HTTP exchange that carried the request.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, OnceLock, Weak},
    time::Duration,
};

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use dashmap::DashMap;
use futures::{StreamExt, channel::mpsc};
use serde::Deserialize;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Server,
    middleware::{
        AuthToken, CorsOptions, HttpAuthorizer, authorize, protocol_version, validate_origin,
    },
};
use crate::{
    auth::{PROTECTED_RESOURCE_PATH, ProtectedResourceMetadata, bearer_token},
    codec::decode_message,
    error::{Error, Result},
    jsonrpc::orphan_error,
    peer::Peer,
    schema::{
        CancelledParams, INITIALIZE, JSONRPCMessage, JSONRPCNotification, NOTIFY_CANCELLED,
        RequestId,
    },
    transport::{ChannelTransport, MCP_SESSION_ID_HEADER, Outbound},
};

pub const DEFAULT_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Options for [`Server::serve_http`].
#[derive(Clone)]
pub struct HttpOptions {
    /// Bind address. Defaults to `127.0.0.1:5000`.
    pub addr: String,
    pub streamable_path: String,
    pub sse_path: String,
    pub sse_message_path: String,
    /// Embedder routes, mounted ahead of everything else.
    pub routes: Option<Router>,
    /// Published at `/.well-known/oauth-protected-resource` when set.
    pub protected_resource: Option<ProtectedResourceMetadata>,
    pub cors: CorsOptions,
    pub authorizer: Option<Arc<dyn HttpAuthorizer>>,
    /// How long a JSON (non-streaming) reply is awaited.
    pub request_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.into(),
            streamable_path: "/mcp".into(),
            sse_path: "/sse".into(),
            sse_message_path: "/message".into(),
            routes: None,
            protected_resource: None,
            cors: CorsOptions::default(),
            authorizer: None,
            request_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl HttpOptions {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn with_protected_resource(mut self, metadata: ProtectedResourceMetadata) -> Self {
        self.protected_resource = Some(metadata);
        self
    }

    pub fn with_cors(mut self, cors: CorsOptions) -> Self {
        self.cors = cors;
        self
    }

    pub fn with_authorizer(mut self, authorizer: impl HttpAuthorizer) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A running HTTP ingress.
pub struct HttpServerHandle {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl HttpServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute URL of `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Ends every session and stops accepting connections.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.wait().await
    }

    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::InternalError(format!("HTTP server task failed: {e}")))?
    }
}

type Sessions = Arc<DashMap<String, Arc<HttpSession>>>;

/// The reply channel of one in-flight request.
struct Exchange {
    tx: mpsc::UnboundedSender<JSONRPCMessage>,
    /// Answered as an event stream, so it may also carry server-initiated
    /// traffic ahead of the reply.
    streaming: bool,
}

#[derive(Clone)]
struct IngressState {
    server: Server,
    sessions: Sessions,
    message_path: String,
    request_timeout: Duration,
}

/// One HTTP session and the routing of its outbound traffic.
struct HttpSession {
    id: String,
    inbound: mpsc::UnboundedSender<Result<JSONRPCMessage>>,
    /// Reply channels of in-flight requests, keyed by request id.
    routes: DashMap<RequestId, Exchange>,
    /// The long-lived server-to-client stream, when one is open.
    standby: Mutex<Option<mpsc::UnboundedSender<JSONRPCMessage>>>,
    /// Server-initiated traffic produced while no stream was open.
    backlog: Mutex<Vec<JSONRPCMessage>>,
    peer: OnceLock<Peer>,
}

impl HttpSession {
    fn route(&self, message: JSONRPCMessage) -> Result<()> {
        let reply_to = match &message {
            JSONRPCMessage::Response(r) => Some(r.id.clone()),
            JSONRPCMessage::Error(e) => e.id.clone(),
            _ => None,
        };
        if let Some((_, exchange)) = reply_to.and_then(|id| self.routes.remove(&id)) {
            if exchange.tx.unbounded_send(message).is_err() {
                debug!("Reply for session {} dropped, caller went away", self.id);
            }
            return Ok(());
        }

        let mut message = message;
        if let Ok(standby) = self.standby.lock() {
            if let Some(tx) = standby.as_ref() {
                match tx.unbounded_send(message) {
                    Ok(()) => return Ok(()),
                    Err(e) => message = e.into_inner(),
                }
            }
        }
        // A JSON exchange takes exactly one message, its own reply.
        if let Some(route) = self.routes.iter().find(|r| r.value().streaming) {
            match route.value().tx.unbounded_send(message) {
                Ok(()) => return Ok(()),
                Err(e) => message = e.into_inner(),
            }
        }
        if let Ok(mut backlog) = self.backlog.lock() {
            backlog.push(message);
        }
        Ok(())
    }

    /// Install a fresh standby stream, flushing anything queued.
    fn open_standby(&self) -> mpsc::UnboundedReceiver<JSONRPCMessage> {
        let (tx, rx) = mpsc::unbounded();
        if let Ok(mut backlog) = self.backlog.lock() {
            for message in backlog.drain(..) {
                let _ = tx.unbounded_send(message);
            }
        }
        if let Ok(mut standby) = self.standby.lock() {
            *standby = Some(tx);
        }
        rx
    }

    fn submit(&self, message: JSONRPCMessage) -> Result<()> {
        if let JSONRPCMessage::Notification(notification) = &message {
            if notification.method == NOTIFY_CANCELLED {
                self.forget_cancelled(notification);
            }
        }
        self.inbound
            .unbounded_send(Ok(message))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// A cancelled request is never answered; end its exchange now.
    fn forget_cancelled(&self, notification: &JSONRPCNotification) {
        let cancelled = notification
            .params
            .clone()
            .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok());
        if let Some(params) = cancelled {
            if self.routes.remove(&params.request_id).is_some() {
                debug!(
                    "Closed exchange for cancelled request {} in session {}",
                    params.request_id, self.id
                );
            }
        }
    }

    fn close(&self) {
        if let Ok(mut standby) = self.standby.lock() {
            standby.take();
        }
        self.routes.clear();
        self.inbound.close_channel();
        if let Some(peer) = self.peer.get() {
            peer.close();
        }
    }
}

/// Delivers a session runtime's output into the HTTP routing table.
struct SessionOutbound(Weak<HttpSession>);

impl Outbound for SessionOutbound {
    fn deliver(&self, message: JSONRPCMessage) -> Result<()> {
        match self.0.upgrade() {
            Some(session) => session.route(message),
            None => Err(Error::ConnectionClosed),
        }
    }
}

/// Removes a legacy SSE session when its event stream is dropped.
struct SessionGuard {
    sessions: Sessions,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some((_, session)) = self.sessions.remove(&self.id) {
            debug!("SSE session {} closed", self.id);
            session.close();
        }
    }
}

impl IngressState {
    async fn open_session(&self) -> Result<Arc<HttpSession>> {
        let id = Uuid::new_v4().to_string();
        let (inbound, inbound_rx) = mpsc::unbounded();
        let session = Arc::new(HttpSession {
            id: id.clone(),
            inbound,
            routes: DashMap::new(),
            standby: Mutex::new(None),
            backlog: Mutex::new(Vec::new()),
            peer: OnceLock::new(),
        });
        let transport =
            ChannelTransport::new(SessionOutbound(Arc::downgrade(&session)), inbound_rx);
        let handle = self.server.serve(Box::new(transport)).await?;
        let _ = session.peer.set(handle.peer().clone());
        self.sessions.insert(id.clone(), session.clone());
        info!("HTTP session {} opened", id);
        Ok(session)
    }

    fn session(&self, id: &str) -> std::result::Result<Arc<HttpSession>, Response> {
        self.sessions
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| session_not_found(id))
    }
}

fn session_not_found(id: &str) -> Response {
    (StatusCode::NOT_FOUND, format!("session {id} not found")).into_response()
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

/// Carry the HTTP credential in-band so the JSON-RPC authorizer sees it.
fn attach_token(message: &mut JSONRPCMessage, token: Option<String>) {
    let (JSONRPCMessage::Request(request), Some(token)) = (message, token) else {
        return;
    };
    let present = request
        .meta()
        .and_then(|m| m.authorization)
        .and_then(|a| a.token)
        .is_some();
    if !present {
        request.set_meta_token(&token);
    }
}

fn decode_body(body: &[u8]) -> std::result::Result<JSONRPCMessage, Response> {
    decode_message(body).map_err(|e| {
        warn!("Rejecting undecodable body: {}", e);
        (StatusCode::BAD_REQUEST, Json(orphan_error(&e))).into_response()
    })
}

fn message_event(message: &JSONRPCMessage) -> std::result::Result<Event, axum::Error> {
    Event::default().event("message").json_data(message)
}

async fn streamable_post(
    State(state): State<IngressState>,
    auth: Option<Extension<AuthToken>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut message = match decode_body(&body) {
        Ok(message) => message,
        Err(response) => return response,
    };
    let token = auth.map(|Extension(AuthToken(t))| t).or_else(|| bearer_token(&headers));
    attach_token(&mut message, token);

    let is_initialize = message.method() == Some(INITIALIZE);
    let session = match session_header(&headers) {
        Some(id) if !is_initialize => match state.session(&id) {
            Ok(session) => session,
            Err(response) => return response,
        },
        Some(id) if state.sessions.contains_key(&id) => match state.session(&id) {
            Ok(session) => session,
            Err(response) => return response,
        },
        None if !is_initialize => {
            return (StatusCode::BAD_REQUEST, "Missing session ID").into_response();
        }
        _ => match state.open_session().await {
            Ok(session) => session,
            Err(e) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        },
    };

    let request_id = match &message {
        JSONRPCMessage::Request(request) => Some(request.id.clone()),
        _ => None,
    };
    let Some(request_id) = request_id else {
        return match session.submit(message) {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(_) => session_not_found(&session.id),
        };
    };

    let streaming = accepts_event_stream(&headers);
    let (tx, mut rx) = mpsc::unbounded();
    session
        .routes
        .insert(request_id.clone(), Exchange { tx, streaming });
    if session.submit(message).is_err() {
        session.routes.remove(&request_id);
        return session_not_found(&session.id);
    }

    let mut response = if streaming {
        let stream = async_stream::stream! {
            while let Some(message) = rx.next().await {
                yield message_event(&message);
            }
        };
        Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response()
    } else {
        match tokio::time::timeout(state.request_timeout, rx.next()).await {
            Ok(Some(reply)) => Json(reply).into_response(),
            Ok(None) => (StatusCode::INTERNAL_SERVER_ERROR, "No response").into_response(),
            Err(_) => {
                session.routes.remove(&request_id);
                (StatusCode::REQUEST_TIMEOUT, "Request timeout").into_response()
            }
        }
    };
    if let Ok(value) = HeaderValue::from_str(&session.id) {
        response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
    }
    response
}

async fn streamable_get(State(state): State<IngressState>, headers: HeaderMap) -> Response {
    let Some(id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "Missing session ID").into_response();
    };
    let session = match state.session(&id) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let mut rx = session.open_standby();
    let stream = async_stream::stream! {
        while let Some(message) = rx.next().await {
            yield message_event(&message);
        }
    };
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn streamable_delete(State(state): State<IngressState>, headers: HeaderMap) -> Response {
    let Some(id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "Missing session ID").into_response();
    };
    match state.sessions.remove(&id) {
        Some((_, session)) => {
            info!("HTTP session {} terminated by client", id);
            session.close();
            StatusCode::NO_CONTENT.into_response()
        }
        None => session_not_found(&id),
    }
}

async fn sse_get(State(state): State<IngressState>) -> Response {
    let session = match state.open_session().await {
        Ok(session) => session,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let guard = SessionGuard {
        sessions: state.sessions.clone(),
        id: session.id.clone(),
    };
    let endpoint = format!("{}?session_id={}", state.message_path, session.id);
    let mut rx = session.open_standby();
    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok::<_, axum::Error>(Event::default().event("endpoint").data(endpoint));
        while let Some(message) = rx.next().await {
            yield message_event(&message);
        }
    };
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    session_id: Option<String>,
}

async fn sse_message(
    State(state): State<IngressState>,
    Query(query): Query<MessageQuery>,
    auth: Option<Extension<AuthToken>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(id) = query.session_id else {
        return (StatusCode::BAD_REQUEST, "Missing session_id").into_response();
    };
    let session = match state.session(&id) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let mut message = match decode_body(&body) {
        Ok(message) => message,
        Err(response) => return response,
    };
    let token = auth.map(|Extension(AuthToken(t))| t).or_else(|| bearer_token(&headers));
    attach_token(&mut message, token);
    match session.submit(message) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => session_not_found(&id),
    }
}

fn router(state: IngressState, options: &HttpOptions) -> Router {
    let cors = Arc::new(options.cors.clone());
    let mut rpc = Router::new()
        .route(
            &options.streamable_path,
            post(streamable_post)
                .get(streamable_get)
                .delete(streamable_delete),
        )
        .route(&options.sse_path, get(sse_get))
        .route(&options.sse_message_path, post(sse_message))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(protocol_version))
                // Origins are checked ahead of CORS so preflights are refused too.
                .layer(middleware::from_fn_with_state(cors, validate_origin))
                .layer(options.cors.layer())
                .map_response(IntoResponse::into_response)
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        );
    if let Some(authorizer) = &options.authorizer {
        rpc = rpc.layer(middleware::from_fn_with_state(authorizer.clone(), authorize));
    }

    let mut app = options.routes.clone().unwrap_or_default();
    if let Some(metadata) = &options.protected_resource {
        let metadata = metadata.clone();
        app = app.route(
            PROTECTED_RESOURCE_PATH,
            get(move || {
                let metadata = metadata.clone();
                async move { Json(metadata) }
            }),
        );
    }
    app.merge(rpc)
}

pub(crate) async fn serve(server: Server, options: HttpOptions) -> Result<HttpServerHandle> {
    let listener = TcpListener::bind(&options.addr)
        .await
        .map_err(|e| Error::Transport(format!("Failed to bind to {}: {}", options.addr, e)))?;
    let addr = listener
        .local_addr()
        .map_err(|e| Error::Transport(format!("Failed to get local address: {e}")))?;

    let state = IngressState {
        server,
        sessions: Arc::new(DashMap::new()),
        message_path: options.sse_message_path.clone(),
        request_timeout: options.request_timeout,
    };
    let sessions = state.sessions.clone();
    let app = router(state, &options);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        info!("HTTP server listening on {}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                token.cancelled().await;
                // Open event streams only end once their sessions are gone.
                let ids: Vec<String> = sessions.iter().map(|s| s.key().clone()).collect();
                for id in ids {
                    if let Some((_, session)) = sessions.remove(&id) {
                        session.close();
                    }
                }
            })
            .await
            .map_err(|e| Error::Transport(format!("Server error: {e}")))
    });

    Ok(HttpServerHandle {
        addr,
        shutdown,
        task,
    })
}
