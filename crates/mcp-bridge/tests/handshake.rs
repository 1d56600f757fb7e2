use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use mcp_bridge::{
    CallOptions, Client, ClientHandler, Error, Logger, RequestContext, Result, Server, ServerAPI,
    ServerHandle, ServerHandler, SessionCtx, TokenProvider,
    auth::{Authorization, Policy, PolicyAuthorizer, ProtectedResourceMetadata},
    schema::*,
    testutils::{
        connected_client_and_server, connected_client_and_server_with, init_tracing,
        make_duplex_pair, shutdown_client_and_server,
    },
};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

struct Calculator {
    dropped: Arc<AtomicBool>,
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServerHandler for Calculator {
    async fn list_tools(
        &self,
        _ctx: &RequestContext,
        _params: PaginatedParams,
    ) -> Result<ListToolsResult> {
        let schema = ToolSchema::default()
            .with_property("a", json!({"type": "integer"}))
            .with_property("b", json!({"type": "integer"}))
            .with_required("a")
            .with_required("b");
        Ok(ListToolsResult::new()
            .with_tool(Tool::new("add", schema))
            .with_tool(Tool::new("slow", ToolSchema::default()))
            .with_tool(Tool::new("terminal", ToolSchema::default())))
    }

    async fn call_tool(
        &self,
        ctx: &RequestContext,
        params: CallToolParams,
    ) -> Result<CallToolResult> {
        let args = params.arguments.unwrap_or_default();
        match params.name.as_str() {
            "add" => {
                let (Some(a), Some(b)) = (
                    args.get("a").and_then(Value::as_i64),
                    args.get("b").and_then(Value::as_i64),
                ) else {
                    return Err(Error::InvalidParams("a and b must be integers".into()));
                };
                Ok(CallToolResult::new().with_structured(&json!({"sum": a + b}))?)
            }
            "slow" => {
                let _flag = SetOnDrop(self.dropped.clone());
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(CallToolResult::new().with_text_content("finished"))
            }
            "terminal" => Ok(CallToolResult::new()
                .with_text_content(ctx.auth_token().unwrap_or("anonymous").to_string())),
            other => Err(Error::ToolNotFound(other.into())),
        }
    }
}

fn calculator_server() -> (Server, Arc<AtomicBool>) {
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = dropped.clone();
    let server = Server::new("calculator", "1.0.0").with_handler(move |_ctx| Calculator {
        dropped: flag.clone(),
    });
    (server, dropped)
}

async fn read_message<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> Value {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn test_raw_handshake_and_ping() {
    init_tracing();
    let (server, _) = calculator_server();
    let (server_reader, server_writer, client_reader, mut client_writer) = make_duplex_pair();
    let _handle = server.serve_stream(server_reader, server_writer).await.unwrap();
    let mut reader = BufReader::new(client_reader);

    let initialize = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "raw", "version": "0.0.1"}
        }
    });
    client_writer
        .write_all(format!("{initialize}\n").as_bytes())
        .await
        .unwrap();
    let reply = read_message(&mut reader).await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["protocolVersion"], LATEST_PROTOCOL_VERSION);
    assert_eq!(reply["result"]["serverInfo"]["name"], "calculator");

    // Operations wait for the initialized notification.
    client_writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/list\"}\n")
        .await
        .unwrap();
    let reply = read_message(&mut reader).await;
    assert_eq!(reply["id"], 2);
    assert_eq!(reply["error"]["code"], INVALID_REQUEST);

    client_writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
        .await
        .unwrap();
    client_writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"p\",\"method\":\"ping\"}\n")
        .await
        .unwrap();
    let reply = read_message(&mut reader).await;
    assert_eq!(reply, json!({"jsonrpc": "2.0", "id": "p", "result": {}}));

    client_writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"tools/list\"}\n")
        .await
        .unwrap();
    let reply = read_message(&mut reader).await;
    assert_eq!(reply["result"]["tools"].as_array().map(Vec::len), Some(3));
}

#[tokio::test]
async fn test_unknown_version_negotiates_latest() {
    init_tracing();
    let (server, _) = calculator_server();
    let (server_reader, server_writer, client_reader, mut client_writer) = make_duplex_pair();
    let _handle = server.serve_stream(server_reader, server_writer).await.unwrap();
    let mut reader = BufReader::new(client_reader);

    let initialize = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "1999-01-01",
            "capabilities": {},
            "clientInfo": {"name": "raw", "version": "0.0.1"}
        }
    });
    client_writer
        .write_all(format!("{initialize}\n").as_bytes())
        .await
        .unwrap();
    let reply = read_message(&mut reader).await;
    assert_eq!(reply["result"]["protocolVersion"], LATEST_PROTOCOL_VERSION);
}

#[tokio::test]
async fn test_typed_tool_call() {
    init_tracing();
    let (server, _) = calculator_server();
    let (client, handle) = connected_client_and_server(&server).await.unwrap();

    let info = client.server_info().unwrap();
    assert_eq!(info.server_info.name, "calculator");

    let mut args = serde_json::Map::new();
    args.insert("a".into(), json!(2));
    args.insert("b".into(), json!(3));
    let result = client.call_tool("add", Some(args)).await.unwrap();
    assert_eq!(result.structured_content, Some(json!({"sum": 5})));
    assert!(matches!(&result.content[0], Content::Text(t) if t.text == r#"{"sum":5}"#));

    let err = client.call_tool("missing", None).await.unwrap_err();
    assert_eq!(err.code(), INVALID_PARAMS);

    shutdown_client_and_server(client, handle).await;
}

#[tokio::test]
async fn test_cancellation_stops_handler() {
    init_tracing();
    let (server, dropped) = calculator_server();
    let (client, handle) = connected_client_and_server(&server).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let params = serde_json::to_value(CallToolParams {
        name: "slow".into(),
        arguments: None,
    })
    .unwrap();
    let options = CallOptions::new().with_cancel(cancel);
    let err = client
        .request_with(TOOLS_CALL, Some(params), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));

    let stopped = tokio::time::timeout(Duration::from_secs(2), async {
        while !dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(stopped.is_ok(), "server handler kept running");

    // The connection stays usable.
    client.ping().await.unwrap();
    shutdown_client_and_server(client, handle).await;
}

fn terminal_policy() -> (Policy, Authorization) {
    let authorization = Authorization::new(
        ProtectedResourceMetadata::new("https://mcp.example", "https://issuer.example"),
        vec!["tools".into()],
    );
    let policy = Policy::default().with_tool("terminal", authorization.clone());
    (policy, authorization)
}

#[tokio::test]
async fn test_policy_denies_without_token() {
    init_tracing();
    let (server, _) = calculator_server();
    let (policy, authorization) = terminal_policy();
    let server = server.with_authorizer(PolicyAuthorizer::new(policy));
    let (client, handle) = connected_client_and_server(&server).await.unwrap();

    // Unguarded tools pass.
    let mut args = serde_json::Map::new();
    args.insert("a".into(), json!(1));
    args.insert("b".into(), json!(1));
    client.call_tool("add", Some(args)).await.unwrap();

    let err = client.call_tool("terminal", None).await.unwrap_err();
    let Error::Rpc(obj) = err else {
        panic!("expected an rpc error, got {err:?}");
    };
    assert_eq!(obj.code, UNAUTHORIZED);
    let data: Authorization = serde_json::from_value(obj.data.unwrap()).unwrap();
    assert_eq!(data, authorization);

    // An explicit token is admitted and reaches the handler.
    let result = client
        .with_options(CallOptions::new().with_token("explicit"))
        .call_tool("terminal", None)
        .await
        .unwrap();
    assert!(matches!(&result.content[0], Content::Text(t) if t.text == "explicit"));

    shutdown_client_and_server(client, handle).await;
}

struct FixedProvider;

#[async_trait]
impl TokenProvider for FixedProvider {
    async fn token_for(&self, authorization: &Authorization) -> Result<String> {
        assert_eq!(authorization.required_scopes, vec!["tools".to_string()]);
        Ok("provided".into())
    }
}

#[tokio::test]
async fn test_client_retries_with_provided_token() {
    init_tracing();
    let (server, _) = calculator_server();
    let (policy, _) = terminal_policy();
    let server = server.with_authorizer(PolicyAuthorizer::new(policy));
    let client = Client::builder("test-client", "1.0.0")
        .with_token_provider(Arc::new(FixedProvider))
        .build();
    let (client, handle) = connected_client_and_server_with(&server, client)
        .await
        .unwrap();

    let result = client.call_tool("terminal", None).await.unwrap();
    assert!(matches!(&result.content[0], Content::Text(t) if t.text == "provided"));

    shutdown_client_and_server(client, handle).await;
}

/// Reports progress and logs at two levels on every call.
struct Reporter {
    logger: Logger,
}

#[async_trait]
impl ServerHandler for Reporter {
    async fn list_tools(
        &self,
        _ctx: &RequestContext,
        _params: PaginatedParams,
    ) -> Result<ListToolsResult> {
        Ok(ListToolsResult::new().with_tool(Tool::new("work", ToolSchema::default())))
    }

    async fn call_tool(
        &self,
        ctx: &RequestContext,
        _params: CallToolParams,
    ) -> Result<CallToolResult> {
        ctx.progress(0.5, Some(1.0), Some("halfway".into())).await?;
        self.logger.info("info line").await?;
        self.logger.warning("warning line").await?;
        Ok(CallToolResult::new().with_text_content("worked"))
    }
}

struct Recorder(mpsc::UnboundedSender<JSONRPCNotification>);

#[async_trait]
impl ClientHandler for Recorder {
    async fn on_notification(&self, notification: JSONRPCNotification) {
        let _ = self.0.send(notification);
    }
}

async fn reporting_client() -> (
    Client,
    ServerHandle,
    mpsc::UnboundedReceiver<JSONRPCNotification>,
) {
    let server = Server::new("reporter", "1.0.0").with_handler(|ctx: SessionCtx| Reporter {
        logger: ctx.logger().clone(),
    });
    let (tx, rx) = mpsc::unbounded_channel();
    let client = Client::builder("recorder", "1.0.0")
        .with_handler(Recorder(tx))
        .build();
    let (client, handle) = connected_client_and_server_with(&server, client)
        .await
        .unwrap();
    (client, handle, rx)
}

/// Notifications precede the reply on the wire, so they are all in by the
/// time the call returns.
fn drain(rx: &mut mpsc::UnboundedReceiver<JSONRPCNotification>) -> Vec<JSONRPCNotification> {
    let mut seen = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        seen.push(notification);
    }
    seen
}

#[tokio::test]
async fn test_progress_only_with_token() {
    init_tracing();
    let (client, handle, mut rx) = reporting_client().await;

    client.call_tool("work", None).await.unwrap();
    let seen = drain(&mut rx);
    assert!(seen.iter().all(|n| n.method != NOTIFY_PROGRESS));

    let params = json!({"name": "work", "_meta": {"progressToken": "job-1"}});
    client.request_value(TOOLS_CALL, Some(params)).await.unwrap();
    let progress: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|n| n.method == NOTIFY_PROGRESS)
        .collect();
    assert_eq!(progress.len(), 1);
    let params = progress[0].params.clone().unwrap();
    assert_eq!(params["progressToken"], "job-1");
    assert_eq!(params["progress"], 0.5);
    assert_eq!(params["total"], 1.0);
    assert_eq!(params["message"], "halfway");

    shutdown_client_and_server(client, handle).await;
}

#[tokio::test]
async fn test_log_level_filters_messages() {
    init_tracing();
    let (client, handle, mut rx) = reporting_client().await;
    let logged = |seen: Vec<JSONRPCNotification>| -> Vec<Value> {
        seen.into_iter()
            .filter(|n| n.method == NOTIFY_MESSAGE)
            .filter_map(|n| n.params.map(|p| p["data"].clone()))
            .collect()
    };

    client.call_tool("work", None).await.unwrap();
    assert_eq!(
        logged(drain(&mut rx)),
        vec![json!("info line"), json!("warning line")]
    );

    client.set_level(LoggingLevel::Warning).await.unwrap();
    client.call_tool("work", None).await.unwrap();
    assert_eq!(logged(drain(&mut rx)), vec![json!("warning line")]);

    shutdown_client_and_server(client, handle).await;
}
