use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{Router, routing::post};
use http::{HeaderMap, StatusCode};
use mcp_bridge::{
    Client, HttpOptions, Logger, RequestContext, Result, Server, ServerAPI, ServerHandler,
    SessionCtx,
    auth::{PROTECTED_RESOURCE_PATH, ProtectedResourceMetadata},
    schema::*,
    server::CorsOptions,
    testutils::{MockServer, init_tracing},
    transport::{
        HttpSender, MCP_PROTOCOL_VERSION_HEADER, MCP_SESSION_ID_HEADER, SseTransport,
        StreamableHttpTransport, TransportKind, detect,
    },
};
use serde_json::{Value, json};
use url::Url;

struct Echo;

#[async_trait]
impl ServerHandler for Echo {
    async fn list_tools(
        &self,
        _ctx: &RequestContext,
        _params: PaginatedParams,
    ) -> Result<ListToolsResult> {
        Ok(ListToolsResult::new().with_tool(Tool::new("echo", ToolSchema::default())))
    }

    async fn call_tool(
        &self,
        _ctx: &RequestContext,
        params: CallToolParams,
    ) -> Result<CallToolResult> {
        let text = params
            .arguments
            .and_then(|a| a.get("text").and_then(Value::as_str).map(String::from))
            .unwrap_or_default();
        Ok(CallToolResult::new().with_text_content(text))
    }
}

fn echo_server() -> Server {
    Server::new("echo", "1.0.0").with_handler(|_ctx| Echo)
}

fn initialize_body() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "curl", "version": "1"}
        }
    })
}

async fn post_json(
    http: &reqwest::Client,
    url: &str,
    session: Option<&str>,
    body: Value,
) -> reqwest::Response {
    let mut request = http
        .post(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .json(&body);
    if let Some(session) = session {
        request = request.header(MCP_SESSION_ID_HEADER, session);
    }
    request.send().await.unwrap()
}

#[tokio::test]
async fn test_streamable_session_lifecycle() {
    init_tracing();
    let handle = echo_server()
        .serve_http(HttpOptions::new("127.0.0.1:0"))
        .await
        .unwrap();
    let url = handle.url("/mcp");
    let http = reqwest::Client::new();

    let response = post_json(&http, &url, None, initialize_body()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[MCP_PROTOCOL_VERSION_HEADER],
        LATEST_PROTOCOL_VERSION
    );
    let session = response.headers()[MCP_SESSION_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();
    let reply: Value = response.json().await.unwrap();
    assert_eq!(reply["result"]["serverInfo"]["name"], "echo");

    let response = post_json(
        &http,
        &url,
        Some(&session),
        json!({"jsonrpc": "2.0", "method": NOTIFY_INITIALIZED}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = post_json(
        &http,
        &url,
        Some(&session),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
    )
    .await;
    let reply: Value = response.json().await.unwrap();
    assert_eq!(reply["result"]["tools"][0]["name"], "echo");

    let response = http
        .delete(&url)
        .header(MCP_SESSION_ID_HEADER, &session)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = post_json(
        &http,
        &url,
        Some(&session),
        json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_streamable_rejects_bad_requests() {
    init_tracing();
    let handle = echo_server()
        .serve_http(HttpOptions::new("127.0.0.1:0"))
        .await
        .unwrap();
    let url = handle.url("/mcp");
    let http = reqwest::Client::new();
    let ping = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});

    let response = post_json(&http, &url, None, ping.clone()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = post_json(&http, &url, Some("no-such-session"), ping.clone()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = http
        .post(&url)
        .header(reqwest::header::ORIGIN, "https://evil.example")
        .json(&initialize_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = http
        .post(&url)
        .header(MCP_PROTOCOL_VERSION_HEADER, "1999-01-01")
        .json(&initialize_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = http
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let reply: Value = response.json().await.unwrap();
    assert_eq!(reply["error"]["code"], PARSE_ERROR);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_allowed_origin_passes() {
    init_tracing();
    let cors = CorsOptions {
        allow_origins: vec!["https://app.example".into()],
        ..Default::default()
    };
    let handle = echo_server()
        .serve_http(HttpOptions::new("127.0.0.1:0").with_cors(cors))
        .await
        .unwrap();
    let response = reqwest::Client::new()
        .post(handle.url("/mcp"))
        .header(reqwest::header::ORIGIN, "https://app.example")
        .header(reqwest::header::ACCEPT, "application/json")
        .json(&initialize_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_preflight_checks_origin() {
    init_tracing();
    let cors = CorsOptions {
        allow_origins: vec!["https://app.example".into()],
        ..Default::default()
    };
    let handle = echo_server()
        .serve_http(HttpOptions::new("127.0.0.1:0").with_cors(cors))
        .await
        .unwrap();
    let http = reqwest::Client::new();
    let preflight = |origin: &'static str| {
        http.request(reqwest::Method::OPTIONS, handle.url("/mcp"))
            .header(reqwest::header::ORIGIN, origin)
            .header("access-control-request-method", "POST")
            .send()
    };

    let response = preflight("https://evil.example").await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = preflight("https://app.example").await.unwrap();
    assert!(response.status().is_success());
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "https://app.example"
    );
    assert_eq!(response.headers()["access-control-allow-methods"], "POST");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_protected_resource_metadata_served() {
    init_tracing();
    let metadata = ProtectedResourceMetadata::new("http://mcp.local", "http://issuer.local");
    let handle = echo_server()
        .serve_http(HttpOptions::new("127.0.0.1:0").with_protected_resource(metadata.clone()))
        .await
        .unwrap();
    let served: ProtectedResourceMetadata = reqwest::get(handle.url(PROTECTED_RESOURCE_PATH))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(served, metadata);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_detect_transport_kind() {
    init_tracing();
    let sender: Arc<dyn HttpSender> = Arc::new(reqwest::Client::new());
    let handle = echo_server()
        .serve_http(HttpOptions::new("127.0.0.1:0"))
        .await
        .unwrap();
    let url = Url::parse(&handle.url("/mcp")).unwrap();
    let kind = detect(&url, &sender, &HeaderMap::new()).await.unwrap();
    assert_eq!(kind, TransportKind::Streamable);

    let legacy = MockServer::start(
        Router::new().route("/sse", post(|| async { StatusCode::METHOD_NOT_ALLOWED })),
    )
    .await
    .unwrap();
    let kind = detect(&legacy.url("/sse").unwrap(), &sender, &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(kind, TransportKind::Sse);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_over_streamable_http() {
    init_tracing();
    let handle = echo_server()
        .serve_http(HttpOptions::new("127.0.0.1:0"))
        .await
        .unwrap();
    let url = Url::parse(&handle.url("/mcp")).unwrap();
    let transport = StreamableHttpTransport::new(url, Arc::new(reqwest::Client::new()));

    let client = Client::new("http-client", "1.0.0");
    client.connect(Box::new(transport)).await.unwrap();
    client.initialize().await.unwrap();

    let mut args = serde_json::Map::new();
    args.insert("text".into(), json!("hello"));
    let result = client.call_tool("echo", Some(args)).await.unwrap();
    assert!(matches!(&result.content[0], Content::Text(t) if t.text == "hello"));
    client.ping().await.unwrap();

    client.close();
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_over_legacy_sse() {
    init_tracing();
    let handle = echo_server()
        .serve_http(HttpOptions::new("127.0.0.1:0"))
        .await
        .unwrap();
    let url = Url::parse(&handle.url("/sse")).unwrap();
    let transport = SseTransport::new(url, Arc::new(reqwest::Client::new()));

    let client = Client::new("sse-client", "1.0.0");
    client.connect(Box::new(transport)).await.unwrap();
    client.initialize().await.unwrap();

    let tools = client.list_tools(None).await.unwrap();
    assert_eq!(tools.tools[0].name, "echo");

    client.close();
    handle.stop().await.unwrap();
}

/// Logs while it works, so the session has server-initiated traffic to route.
struct Announcer {
    logger: Logger,
}

#[async_trait]
impl ServerHandler for Announcer {
    async fn list_tools(
        &self,
        _ctx: &RequestContext,
        _params: PaginatedParams,
    ) -> Result<ListToolsResult> {
        Ok(ListToolsResult::new()
            .with_tool(Tool::new("announce", ToolSchema::default()))
            .with_tool(Tool::new("wait", ToolSchema::default())))
    }

    async fn call_tool(
        &self,
        _ctx: &RequestContext,
        params: CallToolParams,
    ) -> Result<CallToolResult> {
        self.logger.info("working").await?;
        if params.name == "wait" {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(CallToolResult::new().with_text_content("done"))
    }
}

async fn open_announcer_session(http: &reqwest::Client, url: &str) -> String {
    let response = post_json(http, url, None, initialize_body()).await;
    let session = response.headers()[MCP_SESSION_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();
    let response = post_json(
        http,
        url,
        Some(&session),
        json!({"jsonrpc": "2.0", "method": NOTIFY_INITIALIZED}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    session
}

/// Read an event stream until `needle` shows up or the stream ends.
async fn read_until(mut response: reqwest::Response, needle: &str) -> (String, bool) {
    let mut seen = String::new();
    while let Some(chunk) = response.chunk().await.unwrap() {
        seen.push_str(&String::from_utf8_lossy(&chunk));
        if !needle.is_empty() && seen.contains(needle) {
            return (seen, true);
        }
    }
    (seen, false)
}

#[tokio::test]
async fn test_json_reply_is_not_displaced_by_notifications() {
    init_tracing();
    let handle = Server::new("announcer", "1.0.0")
        .with_handler(|ctx: SessionCtx| Announcer {
            logger: ctx.logger().clone(),
        })
        .serve_http(HttpOptions::new("127.0.0.1:0"))
        .await
        .unwrap();
    let url = handle.url("/mcp");
    let http = reqwest::Client::new();
    let session = open_announcer_session(&http, &url).await;

    let call = json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": TOOLS_CALL,
        "params": {"name": "announce"}
    });
    let reply: Value = post_json(&http, &url, Some(&session), call)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(reply["id"], 2);
    assert_eq!(reply["result"]["content"][0]["text"], "done");

    // The log line waits for the standby stream instead.
    let standby = http
        .get(&url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .header(MCP_SESSION_ID_HEADER, &session)
        .send()
        .await
        .unwrap();
    assert_eq!(standby.status(), StatusCode::OK);
    let (seen, found) = tokio::time::timeout(
        Duration::from_secs(5),
        read_until(standby, NOTIFY_MESSAGE),
    )
    .await
    .unwrap();
    assert!(found, "no log notification in {seen:?}");
    assert!(seen.contains("working"));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_stream_exchange_ends() {
    init_tracing();
    let handle = Server::new("announcer", "1.0.0")
        .with_handler(|ctx: SessionCtx| Announcer {
            logger: ctx.logger().clone(),
        })
        .serve_http(HttpOptions::new("127.0.0.1:0"))
        .await
        .unwrap();
    let url = handle.url("/mcp");
    let http = reqwest::Client::new();
    let session = open_announcer_session(&http, &url).await;

    let streaming = http
        .post(&url)
        .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
        .header(MCP_SESSION_ID_HEADER, &session)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": TOOLS_CALL,
            "params": {"name": "wait"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(streaming.status(), StatusCode::OK);

    let response = post_json(
        &http,
        &url,
        Some(&session),
        json!({
            "jsonrpc": "2.0",
            "method": NOTIFY_CANCELLED,
            "params": {"requestId": 7, "reason": "user abort"}
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let (seen, _) = tokio::time::timeout(Duration::from_secs(5), read_until(streaming, ""))
        .await
        .expect("stream stayed open after cancellation");
    assert!(!seen.contains("\"done\""));

    handle.stop().await.unwrap();
}
