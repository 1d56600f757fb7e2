//! Test utilities for `mcp_bridge`.
//!
//! Helpers shared by the unit tests and the integration tests under
//! `tests/`: in-memory client/server wiring, a tracing initializer, mock
//! HTTP servers, and an [`AuthFlow`] that hands out canned tokens.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::io::{self, AsyncRead, AsyncWrite};
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

use crate::{
    auth::{AuthFlow, AuthorizationServerMetadata, ClientConfig, Token},
    client::Client,
    error::Result,
    server::{Server, ServerHandle},
};

/// Install a fmt subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two in-memory pipes forming a bidirectional channel. The first pair goes
/// to the server, the second to the client.
pub fn make_duplex_pair() -> (
    impl AsyncRead + Send + Sync + Unpin + 'static,
    impl AsyncWrite + Send + Sync + Unpin + 'static,
    impl AsyncRead + Send + Sync + Unpin + 'static,
    impl AsyncWrite + Send + Sync + Unpin + 'static,
) {
    let (server_reader, client_writer) = io::duplex(64 * 1024);
    let (client_reader, server_writer) = io::duplex(64 * 1024);
    (server_reader, server_writer, client_reader, client_writer)
}

/// Serve `server` over an in-memory stream and return a connected,
/// initialized client.
pub async fn connected_client_and_server(server: &Server) -> Result<(Client, ServerHandle)> {
    connected_client_and_server_with(server, Client::new("test-client", "1.0.0")).await
}

pub async fn connected_client_and_server_with(
    server: &Server,
    client: Client,
) -> Result<(Client, ServerHandle)> {
    let (server_reader, server_writer, client_reader, client_writer) = make_duplex_pair();
    let handle = server.serve_stream(server_reader, server_writer).await?;
    client.connect_stream(client_reader, client_writer).await?;
    client.initialize().await?;
    Ok((client, handle))
}

/// Close the client side and wait briefly for the server session to end.
pub async fn shutdown_client_and_server(client: Client, server: ServerHandle) {
    use tokio::time::{Duration, timeout};

    client.close();
    if let Ok(peer) = client.peer().await {
        peer.close();
    }
    drop(client);
    let _ = timeout(Duration::from_millis(100), server.stop()).await;
}

/// An axum router served on an ephemeral loopback port until dropped.
pub struct MockServer {
    addr: SocketAddr,
    _shutdown: DropGuard,
}

impl MockServer {
    pub async fn start(router: axum::Router) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
        });
        Ok(Self {
            addr,
            _shutdown: shutdown.drop_guard(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Absolute URL for `path` on this server.
    pub fn url(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&format!("http://{}{}", self.addr, path))?)
    }
}

/// An [`AuthFlow`] returning a fixed token and counting invocations.
#[derive(Clone)]
pub struct StaticFlow {
    token: Token,
    calls: Arc<AtomicUsize>,
}

impl StaticFlow {
    pub fn new(token: Token) -> Self {
        Self {
            token,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthFlow for StaticFlow {
    async fn token(
        &self,
        _client: &ClientConfig,
        _metadata: &AuthorizationServerMetadata,
        _scopes: &[String],
    ) -> Result<Token> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.token.clone())
    }
}
