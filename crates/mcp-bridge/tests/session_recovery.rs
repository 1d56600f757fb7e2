use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use http::HeaderMap;
use mcp_bridge::{
    Client, Connector, HttpOptions, RequestContext, Result, Server, ServerAPI, ServerHandler,
    schema::*,
    testutils::init_tracing,
    transport::{HttpSender, MCP_SESSION_ID_HEADER, Transport, connect_http},
};
use url::Url;

const CLIENT_NAME: &str = "recovering-client";

/// Passes requests through and remembers the last session id handed out.
#[derive(Default)]
struct SessionRecorder {
    http: reqwest::Client,
    last: Mutex<Option<String>>,
}

impl SessionRecorder {
    fn last(&self) -> Option<String> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpSender for SessionRecorder {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let response = self.http.execute(request).await?;
        if let Some(sid) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.last.lock().unwrap() = Some(sid.to_string());
        }
        Ok(response)
    }
}

struct Reconnect {
    url: Url,
    sender: Arc<SessionRecorder>,
}

#[async_trait]
impl Connector for Reconnect {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        connect_http(&self.url, self.sender.clone(), HeaderMap::new()).await
    }
}

struct Counting {
    handshakes: Arc<AtomicUsize>,
}

#[async_trait]
impl ServerHandler for Counting {
    async fn initialize(
        &self,
        _ctx: &RequestContext,
        params: &InitializeParams,
        result: InitializeResult,
    ) -> Result<InitializeResult> {
        // Transport detection sends initialize too; only count the real client.
        if params.client_info.name == CLIENT_NAME {
            self.handshakes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(result)
    }

    async fn list_tools(
        &self,
        _ctx: &RequestContext,
        _params: PaginatedParams,
    ) -> Result<ListToolsResult> {
        Ok(ListToolsResult::new().with_tool(Tool::new("noop", ToolSchema::default())))
    }
}

#[tokio::test]
async fn test_lost_session_is_recovered_transparently() {
    init_tracing();
    let handshakes = Arc::new(AtomicUsize::new(0));
    let counter = handshakes.clone();
    let handle = Server::new("recoverable", "1.0.0")
        .with_handler(move |_ctx| Counting {
            handshakes: counter.clone(),
        })
        .serve_http(HttpOptions::new("127.0.0.1:0"))
        .await
        .unwrap();

    let url = Url::parse(&handle.url("/mcp")).unwrap();
    let sender = Arc::new(SessionRecorder::default());
    let connector = Reconnect {
        url: url.clone(),
        sender: sender.clone(),
    };
    let client = Client::builder(CLIENT_NAME, "1.0.0")
        .with_connector(connector)
        .build();
    client
        .connect(connect_http(&url, sender.clone(), HeaderMap::new()).await.unwrap())
        .await
        .unwrap();
    client.initialize().await.unwrap();
    client.list_tools(None).await.unwrap();
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);

    // Drop the session behind the client's back.
    let session = sender.last().unwrap();
    let response = reqwest::Client::new()
        .delete(url.as_str())
        .header(MCP_SESSION_ID_HEADER, &session)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    let tools = client.list_tools(None).await.unwrap();
    assert_eq!(tools.tools[0].name, "noop");
    assert_eq!(handshakes.load(Ordering::SeqCst), 2);
    assert_ne!(sender.last(), Some(session));

    client.close();
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_lost_session_without_connector_surfaces_error() {
    init_tracing();
    let handle = Server::new("recoverable", "1.0.0")
        .with_handler(|_ctx| Counting {
            handshakes: Arc::new(AtomicUsize::new(0)),
        })
        .serve_http(HttpOptions::new("127.0.0.1:0"))
        .await
        .unwrap();

    let url = Url::parse(&handle.url("/mcp")).unwrap();
    let sender = Arc::new(SessionRecorder::default());
    let client = Client::new(CLIENT_NAME, "1.0.0");
    client
        .connect(connect_http(&url, sender.clone(), HeaderMap::new()).await.unwrap())
        .await
        .unwrap();
    client.initialize().await.unwrap();

    let session = sender.last().unwrap();
    reqwest::Client::new()
        .delete(url.as_str())
        .header(MCP_SESSION_ID_HEADER, &session)
        .send()
        .await
        .unwrap();

    let err = client.list_tools(None).await.unwrap_err();
    assert!(err.is_session_not_found(), "unexpected error: {err}");

    client.close();
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_ping_reconnects_in_background() {
    init_tracing();
    let handshakes = Arc::new(AtomicUsize::new(0));
    let counter = handshakes.clone();
    let handle = Server::new("recoverable", "1.0.0")
        .with_handler(move |_ctx| Counting {
            handshakes: counter.clone(),
        })
        .serve_http(HttpOptions::new("127.0.0.1:0"))
        .await
        .unwrap();

    let url = Url::parse(&handle.url("/mcp")).unwrap();
    let sender = Arc::new(SessionRecorder::default());
    let client = Client::builder(CLIENT_NAME, "1.0.0")
        .with_connector(Reconnect {
            url: url.clone(),
            sender: sender.clone(),
        })
        .with_ping_interval(Duration::from_millis(100))
        .build();
    client
        .connect(connect_http(&url, sender.clone(), HeaderMap::new()).await.unwrap())
        .await
        .unwrap();
    client.initialize().await.unwrap();
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);

    let session = sender.last().unwrap();
    reqwest::Client::new()
        .delete(url.as_str())
        .header(MCP_SESSION_ID_HEADER, &session)
        .send()
        .await
        .unwrap();

    // No call is made; the ping loop notices and re-establishes the session.
    let recovered = tokio::time::timeout(Duration::from_secs(5), async {
        while handshakes.load(Ordering::SeqCst) < 2 || !client.is_initialized() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(recovered.is_ok(), "ping loop never reconnected");
    assert_ne!(sender.last(), Some(session));

    let tools = client.list_tools(None).await.unwrap();
    assert_eq!(tools.tools[0].name, "noop");

    client.close();
    handle.stop().await.unwrap();
}
