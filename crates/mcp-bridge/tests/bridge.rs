use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use mcp_bridge::{
    Client, ClientAPI, ClientHandler, ClientOps, HttpOptions, HttpServerHandle, RequestContext,
    Result, Server, ServerAPI, ServerHandler, SessionCtx,
    bridge::{Bridge, BridgeOptions, Elicitator},
    schema::*,
    testutils::{
        connected_client_and_server, connected_client_and_server_with, init_tracing,
        shutdown_client_and_server,
    },
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use url::Url;

/// Upstream server whose `signup` tool asks its client for details.
struct Signup {
    client: ClientOps,
}

#[async_trait]
impl ServerHandler for Signup {
    async fn list_tools(
        &self,
        _ctx: &RequestContext,
        _params: PaginatedParams,
    ) -> Result<ListToolsResult> {
        Ok(ListToolsResult::new().with_tool(Tool::new("signup", ToolSchema::default())))
    }

    async fn call_tool(
        &self,
        _ctx: &RequestContext,
        _params: CallToolParams,
    ) -> Result<CallToolResult> {
        let schema = ElicitSchema::default()
            .with_property("email", json!({"type": "string"}))
            .with_property("code", json!({"type": "integer"}))
            .with_required("email");
        let answer = self
            .client
            .elicit(ElicitParams::new("Please register", schema))
            .await?;
        Ok(CallToolResult::new().with_structured(&answer)?)
    }
}

async fn upstream() -> HttpServerHandle {
    Server::new("upstream", "1.0.0")
        .with_handler(|ctx: SessionCtx| Signup {
            client: ctx.client().clone(),
        })
        .serve_http(HttpOptions::new("127.0.0.1:0"))
        .await
        .unwrap()
}

fn answer_of(result: &CallToolResult) -> ElicitResult {
    serde_json::from_value(result.structured_content.clone().unwrap()).unwrap()
}

#[tokio::test]
async fn test_bridge_serves_elicitation_page() {
    init_tracing();
    let upstream = upstream().await;

    let (opened_tx, mut opened) = mpsc::unbounded_channel::<Url>();
    let elicitator = Elicitator::new().with_opener(move |url: &Url| {
        let _ = opened_tx.send(url.clone());
        Ok(())
    });
    let url = Url::parse(&upstream.url("/mcp")).unwrap();
    let bridge = Bridge::connect(BridgeOptions::new(url).with_elicitation_ui(elicitator))
        .await
        .unwrap();
    let server = bridge.server();
    let (client, handle) = connected_client_and_server(&server).await.unwrap();

    let info = client.server_info().unwrap();
    assert_eq!(info.server_info.name, "upstream");
    let tools = client.list_tools(None).await.unwrap();
    assert_eq!(tools.tools[0].name, "signup");

    let call = tokio::spawn(async move {
        let result = client.call_tool("signup", None).await;
        (client, result)
    });

    let page = opened.recv().await.unwrap();
    let id = page
        .query_pairs()
        .find(|(k, _)| k == "elicitation_id")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    let html = reqwest::get(page.as_str()).await.unwrap().text().await.unwrap();
    assert!(html.contains("Please register"));

    let mut submit = page.clone();
    submit.set_path("/submit");
    submit.set_query(None);
    let http = reqwest::Client::new();

    // Missing required field is refused and the request stays pending.
    let response = http
        .post(submit.as_str())
        .form(&[("elicitation_id", id.as_str()), ("code", "1234")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert!(response.text().await.unwrap().contains("email"));

    let response = http
        .post(submit.as_str())
        .form(&[
            ("email", "user@example.com"),
            ("code", "1234"),
            ("required", "email"),
            ("elicitation_id", id.as_str()),
        ])
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let (client, result) = call.await.unwrap();
    let answer = answer_of(&result.unwrap());
    let expected: HashMap<String, Value> = [
        ("email".to_string(), json!("user@example.com")),
        ("code".to_string(), json!(1234)),
    ]
    .into_iter()
    .collect();
    assert_eq!(answer, ElicitResult::accept(expected));

    shutdown_client_and_server(client, handle).await;
    upstream.stop().await.unwrap();
}

#[tokio::test]
async fn test_bridge_decline_from_page() {
    init_tracing();
    let upstream = upstream().await;

    let (opened_tx, mut opened) = mpsc::unbounded_channel::<Url>();
    let elicitator = Elicitator::new().with_opener(move |url: &Url| {
        let _ = opened_tx.send(url.clone());
        Ok(())
    });
    let url = Url::parse(&upstream.url("/mcp")).unwrap();
    let bridge = Bridge::connect(BridgeOptions::new(url).with_elicitation_ui(elicitator))
        .await
        .unwrap();
    let server = bridge.server();
    let (client, handle) = connected_client_and_server(&server).await.unwrap();

    let call = tokio::spawn(async move {
        let result = client.call_tool("signup", None).await;
        (client, result)
    });

    let mut submit = opened.recv().await.unwrap();
    submit.set_path("/submit");
    submit.set_query(None);
    // A single pending request is found without an id.
    let response = reqwest::Client::new()
        .post(submit.as_str())
        .form(&[("action", "decline")])
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let (client, result) = call.await.unwrap();
    assert_eq!(answer_of(&result.unwrap()), ElicitResult::decline());

    shutdown_client_and_server(client, handle).await;
    upstream.stop().await.unwrap();
}

/// A downstream client that answers elicitation itself.
struct Answering;

#[async_trait]
impl ClientHandler for Answering {
    async fn elicit(&self, _ctx: &RequestContext, params: ElicitParams) -> Result<ElicitResult> {
        assert_eq!(params.message, "Please register");
        let mut content = HashMap::new();
        content.insert("email".to_string(), json!("local@example.com"));
        Ok(ElicitResult::accept(content))
    }
}

#[tokio::test]
async fn test_bridge_forwards_elicitation_to_capable_client() {
    init_tracing();
    let upstream = upstream().await;

    let elicitator = Elicitator::new().with_opener(|_url: &Url| {
        panic!("page must not open for a capable client");
    });
    let url = Url::parse(&upstream.url("/mcp")).unwrap();
    let bridge = Bridge::connect(BridgeOptions::new(url).with_elicitation_ui(elicitator))
        .await
        .unwrap();
    let server = bridge.server();

    let capabilities = ClientCapabilities {
        elicitation: Some(json!({})),
        ..Default::default()
    };
    let client = Client::builder("capable", "1.0.0")
        .with_capabilities(capabilities)
        .with_handler(Answering)
        .build();
    let (client, handle) = connected_client_and_server_with(&server, client)
        .await
        .unwrap();

    let result = client.call_tool("signup", None).await.unwrap();
    let answer = answer_of(&result);
    assert_eq!(answer.action, ElicitAction::Accept);
    assert_eq!(
        answer.content.unwrap()["email"],
        json!("local@example.com")
    );

    shutdown_client_and_server(client, handle).await;
    upstream.stop().await.unwrap();
}

#[tokio::test]
async fn test_bridge_without_ui_reports_missing_capability() {
    init_tracing();
    let upstream = upstream().await;
    let url = Url::parse(&upstream.url("/mcp")).unwrap();
    let bridge = Bridge::connect(BridgeOptions::new(url)).await.unwrap();
    let server = bridge.server();
    let (client, handle) = connected_client_and_server(&server).await.unwrap();

    let err = client.call_tool("signup", None).await.unwrap_err();
    assert_eq!(err.code(), METHOD_NOT_FOUND);

    shutdown_client_and_server(client, handle).await;
    upstream.stop().await.unwrap();
}

#[tokio::test]
async fn test_bridge_shares_upstream_with_next_client() {
    init_tracing();
    let upstream = upstream().await;
    let url = Url::parse(&upstream.url("/mcp")).unwrap();
    let bridge = Arc::new(Bridge::connect(BridgeOptions::new(url)).await.unwrap());
    let server = bridge.server();

    let (first, first_handle) = connected_client_and_server(&server).await.unwrap();
    first.list_tools(None).await.unwrap();
    shutdown_client_and_server(first, first_handle).await;

    // A later client gets a fresh upstream session.
    let (second, second_handle) = connected_client_and_server(&server).await.unwrap();
    let tools = second.list_tools(None).await.unwrap();
    assert_eq!(tools.tools[0].name, "signup");
    assert!(bridge.upstream().is_initialized());

    shutdown_client_and_server(second, second_handle).await;
    upstream.stop().await.unwrap();
}
