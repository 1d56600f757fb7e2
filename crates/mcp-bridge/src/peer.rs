//! The connection runtime shared by clients and servers.
//!
//! A [`Peer`] owns the write half of a transport and a background task
//! reading the other half. Outbound requests are correlated with their
//! replies by id; inbound requests are fanned out to a [`Handler`], each on
//! its own task with its own cancellation token.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    context::RequestContext,
    error::{Error, Result},
    jsonrpc::{IdGenerator, orphan_error, result_to_message},
    schema::{
        CancelledParams, JSONRPC_VERSION, JSONRPCMessage, JSONRPCNotification, JSONRPCRequest,
        NOTIFY_CANCELLED, RequestId,
    },
    transport::TransportStream,
};

pub(crate) type TransportSink = Mutex<SplitSink<Box<dyn TransportStream>, JSONRPCMessage>>;

/// Receives peer-originated traffic.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Serve one request. The returned value becomes the `result` of the
    /// reply, an error becomes a JSON-RPC error.
    async fn serve(&self, ctx: RequestContext, request: JSONRPCRequest) -> Result<Value>;

    /// Notifications are delivered in arrival order on the reader task, so
    /// implementations should not block on further traffic from this peer.
    async fn on_notification(&self, _peer: &Peer, _notification: JSONRPCNotification) {}

    /// Called once when the connection ends.
    async fn on_close(&self) {}
}

/// A live JSON-RPC connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    sink: TransportSink,
    pending: DashMap<RequestId, oneshot::Sender<Result<Value>>>,
    active: DashMap<RequestId, CancellationToken>,
    ids: IdGenerator,
    closed: CancellationToken,
}

impl Peer {
    /// Start serving `stream`, delivering inbound traffic to `handler`.
    pub fn start(stream: Box<dyn TransportStream>, handler: Arc<dyn Handler>) -> Peer {
        let (sink, stream) = stream.split();
        let peer = Peer {
            inner: Arc::new(PeerInner {
                sink: Mutex::new(sink),
                pending: DashMap::new(),
                active: DashMap::new(),
                ids: IdGenerator::new(),
                closed: CancellationToken::new(),
            }),
        };
        tokio::spawn(peer.clone().read_loop(stream, handler));
        peer
    }

    /// Connect `transport` and start serving it.
    pub async fn connect(
        mut transport: Box<dyn crate::transport::Transport>,
        handler: Arc<dyn Handler>,
    ) -> Result<Peer> {
        transport.connect().await?;
        Ok(Peer::start(transport.framed()?, handler))
    }

    pub fn next_id(&self) -> RequestId {
        self.inner.ids.next_id()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection has ended.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Stop reading and fail every pending request.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Write one envelope to the transport.
    pub async fn send(&self, message: JSONRPCMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let mut sink = self.inner.sink.lock().await;
        sink.send(message).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send(JSONRPCMessage::Notification(JSONRPCNotification::new(
            method, params,
        )))
        .await
    }

    /// Send a request with a generated id and wait for the reply.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let request = JSONRPCRequest::new(self.next_id(), method, params);
        self.request_with(request, &CancellationToken::new()).await
    }

    /// Send `request` and wait for the reply. An unset id is replaced with a
    /// generated one. If `cancel` fires first, the remote is sent
    /// `notifications/cancelled` and the call fails with [`Error::Cancelled`];
    /// dropping the returned future has the same effect.
    pub async fn request_with(
        &self,
        mut request: JSONRPCRequest,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if request.id.is_unset() {
            request.id = self.next_id();
        }
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);
        let mut guard = PendingGuard {
            peer: self.clone(),
            id: id.clone(),
            armed: true,
        };

        debug!("Sending request {} {}", id, request.method);
        if let Err(e) = self.send(JSONRPCMessage::Request(request)).await {
            guard.armed = false;
            return Err(e);
        }

        tokio::select! {
            reply = rx => {
                guard.armed = false;
                reply.unwrap_or(Err(Error::ConnectionClosed))
            }
            _ = cancel.cancelled() => {
                Err(Error::Cancelled(format!("request {id} cancelled")))
            }
        }
    }

    async fn read_loop(
        self,
        mut stream: futures::stream::SplitStream<Box<dyn TransportStream>>,
        handler: Arc<dyn Handler>,
    ) {
        loop {
            let item = tokio::select! {
                _ = self.inner.closed.cancelled() => break,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(message)) => self.dispatch(message, &handler).await,
                Some(Err(e @ Error::Parse(_))) => {
                    if let Err(e) = self.send(orphan_error(&e)).await {
                        warn!("Failed to report parse error: {}", e);
                    }
                }
                Some(Err(e)) => {
                    warn!("Transport error, closing connection: {}", e);
                    break;
                }
                None => {
                    debug!("Transport stream ended");
                    break;
                }
            }
        }

        self.inner.closed.cancel();
        self.inner.pending.clear();
        for entry in self.inner.active.iter() {
            entry.value().cancel();
        }
        handler.on_close().await;
    }

    async fn dispatch(&self, message: JSONRPCMessage, handler: &Arc<dyn Handler>) {
        match message {
            JSONRPCMessage::Request(request) => self.serve_request(request, handler),
            JSONRPCMessage::Notification(notification) => {
                if notification.method == NOTIFY_CANCELLED {
                    self.cancel_inbound(&notification);
                }
                handler.on_notification(self, notification).await;
            }
            JSONRPCMessage::Response(response) => {
                self.resolve(&response.id, Ok(response.result));
            }
            JSONRPCMessage::Error(error) => match error.id {
                Some(id) => self.resolve(&id, Err(Error::Rpc(error.error))),
                None => warn!(
                    "Peer reported an error without an id: {} {}",
                    error.error.code, error.error.message
                ),
            },
        }
    }

    fn resolve(&self, id: &RequestId, reply: Result<Value>) {
        match self.inner.pending.remove(id) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
            }
            None => warn!("Received reply for unknown request id {}", id),
        }
    }

    fn cancel_inbound(&self, notification: &JSONRPCNotification) {
        let Some(params) = notification
            .params
            .clone()
            .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok())
        else {
            warn!("Malformed cancellation notification");
            return;
        };
        if let Some(token) = self.inner.active.get(&params.request_id) {
            debug!(
                "Cancelling request {} ({})",
                params.request_id,
                params.reason.as_deref().unwrap_or("no reason")
            );
            token.cancel();
        }
    }

    fn serve_request(&self, request: JSONRPCRequest, handler: &Arc<dyn Handler>) {
        let peer = self.clone();
        let id = request.id.clone();

        if request.jsonrpc != JSONRPC_VERSION {
            let err = Error::InvalidRequest(format!(
                "unsupported jsonrpc version {:?}",
                request.jsonrpc
            ));
            tokio::spawn(async move {
                let _ = peer.send(result_to_message(id, Err(err))).await;
            });
            return;
        }

        let cancel = self.inner.closed.child_token();
        self.inner.active.insert(id.clone(), cancel.clone());
        let handler = handler.clone();
        let ctx = RequestContext::new(&request, cancel.clone(), self.clone());

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                result = handler.serve(ctx, request) => Some(result),
            };
            peer.inner.active.remove(&id);
            match outcome {
                Some(result) => {
                    if let Err(e) = peer.send(result_to_message(id, result)).await {
                        debug!("Failed to send reply: {}", e);
                    }
                }
                None => debug!("Request {} cancelled, reply discarded", id),
            }
        });
    }
}

/// Removes a pending entry when a request future ends, and tells the remote
/// to stop work if it ended without a reply.
struct PendingGuard {
    peer: Peer,
    id: RequestId,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.peer.inner.pending.remove(&self.id);
        if !self.armed || self.peer.is_closed() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let peer = self.peer.clone();
        let params = CancelledParams {
            request_id: self.id.clone(),
            reason: Some("request cancelled by caller".into()),
        };
        runtime.spawn(async move {
            let params = serde_json::to_value(params).ok();
            if let Err(e) = peer.notify(NOTIFY_CANCELLED, params).await {
                debug!("Failed to send cancellation: {}", e);
            }
        });
    }
}
