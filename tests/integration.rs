//! Integration tests for mcp-relay
//!
//! Drives the axum routes end to end: SSE session lifecycle, tool and
//! resource dispatch, error handling, streamable HTTP and relaying between
//! two instances over a shared queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use mcp_relay::transport::http::MCP_SESSION_ID_HEADER;
use mcp_relay::{
    Backplane, BackplaneConfig, ClientStateCodec, Error, HttpTransport, InMemoryQueueService,
    InstanceId, McpRouter, MessageDispatcher, Registry, ResourceBuilder, SecretString,
    NoParams, SessionManager, ToolBuilder, ToolContext, ToolOutput,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;

// =============================================================================
// Test fixtures
// =============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
struct EchoInput {
    message: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AddInput {
    a: i64,
    b: i64,
}

fn create_test_registry() -> Registry {
    let echo = ToolBuilder::new("echo")
        .description("Echo a message")
        .handler(|input: EchoInput| async move { Ok(ToolOutput::text(input.message)) })
        .build()
        .expect("valid tool");

    let add = ToolBuilder::new("add")
        .description("Add two numbers")
        .handler(|input: AddInput| async move {
            Ok(ToolOutput::text(format!("{}", input.a + input.b)))
        })
        .build()
        .expect("valid tool");

    let fail = ToolBuilder::new("fail")
        .description("Always fails")
        .raw_handler(|_| async move { Err(Error::tool("disk on fire")) })
        .expect("valid tool");

    let wait = ToolBuilder::new("wait")
        .description("Runs until cancelled")
        .handler_with_context(|ctx: ToolContext, _: NoParams| async move {
            ctx.cancelled().await;
            Ok(ToolOutput::text("cancelled"))
        })
        .build()
        .expect("valid tool");

    let readme = ResourceBuilder::new("file:///readme.md")
        .name("README")
        .mime_type("text/markdown")
        .text("# Hello")
        .expect("valid resource");

    Registry::new()
        .with_tool(echo)
        .and_then(|r| r.with_tool(add))
        .and_then(|r| r.with_tool(fail))
        .and_then(|r| r.with_tool(wait))
        .and_then(|r| r.with_resource(readme))
        .expect("unique registrations")
}

struct Instance {
    app: Router,
    dispatcher: Arc<MessageDispatcher>,
}

fn instance(id: &str, codec: ClientStateCodec, base_path: &str) -> Instance {
    let sessions = Arc::new(SessionManager::new(InstanceId::new(id), Arc::new(codec)));
    let router = McpRouter::new(Arc::new(create_test_registry())).server_info("test-server", "1.0.0");
    let dispatcher = Arc::new(MessageDispatcher::new(sessions, router));
    let app = HttpTransport::new(dispatcher.clone())
        .base_path(base_path)
        .into_router();
    Instance { app, dispatcher }
}

fn plain_app() -> Router {
    instance("test", ClientStateCodec::plain(), "").app
}

/// One event read back off an SSE body
#[derive(Debug)]
struct SseEvent {
    event: Option<String>,
    data: String,
}

impl SseEvent {
    fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental SSE parser fed with body chunks as they arrive
#[derive(Debug, Default)]
struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() || self.event.is_some() {
                    events.push(SseEvent {
                        event: self.event.take(),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value).to_string();
            match field {
                "event" => self.event = Some(value),
                "data" => self.data.push(value),
                _ => {}
            }
        }
        events
    }
}

#[test]
fn test_sse_parser_handles_split_chunks_and_comments() {
    let mut parser = SseParser::new();
    assert!(parser.push(": keep-alive\n\nevent: end").is_empty());
    assert!(parser.push("point\ndata: /m").is_empty());
    let events = parser.push("sg\n\ndata: {}\n\n");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].name(), "endpoint");
    assert_eq!(events[0].data, "/msg");
    assert_eq!(events[1].name(), "message");
    assert_eq!(events[1].data, "{}");
}

/// Reads SSE events off a streaming response body
struct EventReader {
    body: Body,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
}

impl EventReader {
    fn new(body: Body) -> Self {
        Self {
            body,
            parser: SseParser::new(),
            pending: VecDeque::new(),
        }
    }

    async fn next_event(&mut self) -> SseEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            let frame = tokio::time::timeout(Duration::from_secs(5), self.body.frame())
                .await
                .expect("timed out waiting for an event")
                .expect("stream ended")
                .expect("body error");
            if let Ok(data) = frame.into_data() {
                let text = std::str::from_utf8(&data).expect("utf-8 stream");
                self.pending.extend(self.parser.push(text));
            }
        }
    }

    async fn next_message(&mut self) -> Value {
        loop {
            let event = self.next_event().await;
            if event.name() == "message" {
                return serde_json::from_str(&event.data).expect("JSON message");
            }
        }
    }
}

/// Open `GET {base}/sse`; returns the stream and the advertised endpoint
async fn open_sse(app: &Router, uri: &str) -> (EventReader, String) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let mut reader = EventReader::new(response.into_body());
    let endpoint = reader.next_event().await;
    assert_eq!(endpoint.name(), "endpoint");
    (reader, endpoint.data)
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, String) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

fn request(id: Value, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

// =============================================================================
// Legacy SSE transport
// =============================================================================

#[tokio::test]
async fn test_initialize_over_sse() {
    let app = plain_app();
    let (mut events, endpoint) = open_sse(&app, "/sse").await;
    assert!(endpoint.starts_with("/message?state="));

    let (status, body) = post(&app, &endpoint, request(json!(1), "initialize", json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, "Accepted");

    let message = events.next_message().await;
    assert_eq!(message["id"], 1);
    assert!(message["result"]["protocolVersion"].is_string());
    assert_eq!(message["result"]["serverInfo"]["name"], "test-server");
    assert!(message["result"]["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn test_tools_list_over_sse() {
    let app = plain_app();
    let (mut events, endpoint) = open_sse(&app, "/sse").await;

    let (status, _) = post(&app, &endpoint, request(json!("list-1"), "tools/list", json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let message = events.next_message().await;
    assert_eq!(message["id"], "list-1");
    let names: Vec<&str> = message["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["echo", "add", "fail", "wait"]);
    assert_eq!(message["result"]["tools"][0]["inputSchema"]["type"], "object");
}

#[tokio::test]
async fn test_unknown_tool_over_sse() {
    let app = plain_app();
    let (mut events, endpoint) = open_sse(&app, "/sse").await;

    post(
        &app,
        &endpoint,
        request(json!(3), "tools/call", json!({"name": "unknown-tool", "arguments": {}})),
    )
    .await;

    let message = events.next_message().await;
    assert_eq!(message["id"], 3);
    assert_eq!(message["error"]["code"], -32601);
}

#[tokio::test]
async fn test_garbled_state_token() {
    let app = plain_app();
    let (status, body) = post(
        &app,
        "/message?state=not-json",
        request(json!(1), "ping", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("/sse"), "body was: {}", body);
}

#[tokio::test]
async fn test_tool_call_result_is_correlated() {
    let app = plain_app();
    let (mut events, endpoint) = open_sse(&app, "/sse").await;

    post(
        &app,
        &endpoint,
        request(json!(42), "tools/call", json!({"name": "add", "arguments": {"a": 2, "b": 3}})),
    )
    .await;

    let message = events.next_message().await;
    assert_eq!(message["id"], 42);
    assert_eq!(message["result"]["content"][0]["type"], "text");
    assert_eq!(message["result"]["content"][0]["text"], "5");
}

#[tokio::test]
async fn test_failing_tool_keeps_session_alive() {
    let app = plain_app();
    let (mut events, endpoint) = open_sse(&app, "/sse").await;

    post(&app, &endpoint, request(json!(1), "tools/call", json!({"name": "fail"}))).await;
    let message = events.next_message().await;
    assert_eq!(message["error"]["code"], -32603);
    assert_eq!(message["error"]["message"], "disk on fire");

    post(
        &app,
        &endpoint,
        request(json!(2), "tools/call", json!({"name": "echo", "arguments": {"message": "still here"}})),
    )
    .await;
    let message = events.next_message().await;
    assert_eq!(message["id"], 2);
    assert_eq!(message["result"]["content"][0]["text"], "still here");
}

#[tokio::test]
async fn test_invalid_arguments() {
    let app = plain_app();
    let (mut events, endpoint) = open_sse(&app, "/sse").await;

    post(
        &app,
        &endpoint,
        request(json!(1), "tools/call", json!({"name": "add", "arguments": {"a": "x"}})),
    )
    .await;
    let message = events.next_message().await;
    assert_eq!(message["error"]["code"], -32602);
}

#[tokio::test]
async fn test_resources_over_sse() {
    let app = plain_app();
    let (mut events, endpoint) = open_sse(&app, "/sse").await;

    post(&app, &endpoint, request(json!(1), "resources/list", json!({}))).await;
    let message = events.next_message().await;
    assert_eq!(message["result"]["resources"][0]["uri"], "file:///readme.md");
    assert_eq!(message["result"]["resources"][0]["mimeType"], "text/markdown");

    post(
        &app,
        &endpoint,
        request(json!(2), "resources/read", json!({"uri": "file:///readme.md"})),
    )
    .await;
    let message = events.next_message().await;
    assert_eq!(message["result"]["contents"][0]["text"], "# Hello");

    post(
        &app,
        &endpoint,
        request(json!(3), "resources/read", json!({"uri": "file:///missing"})),
    )
    .await;
    let message = events.next_message().await;
    assert_eq!(message["error"]["code"], -32601);
    assert_eq!(message["error"]["data"]["uri"], "file:///missing");
}

#[tokio::test]
async fn test_unknown_method() {
    let app = plain_app();
    let (mut events, endpoint) = open_sse(&app, "/sse").await;

    post(&app, &endpoint, request(json!(9), "prompts/list", json!({}))).await;
    let message = events.next_message().await;
    assert_eq!(message["id"], 9);
    assert_eq!(message["error"]["code"], -32601);
}

#[tokio::test]
async fn test_notifications_get_no_response() {
    let app = plain_app();
    let (mut events, endpoint) = open_sse(&app, "/sse").await;

    post(&app, &endpoint, request(json!(1), "initialize", json!({}))).await;
    events.next_message().await;

    let (status, _) = post(
        &app,
        &endpoint,
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    post(&app, &endpoint, request(json!(2), "ping", json!({}))).await;
    let message = events.next_message().await;
    assert_eq!(message["id"], 2);
}

async fn post_raw(app: &Router, uri: &str, body: &'static str) -> (StatusCode, String) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

#[tokio::test]
async fn test_unparseable_body_is_answered_on_the_stream() {
    let app = plain_app();
    let (mut events, endpoint) = open_sse(&app, "/sse").await;

    let (status, body) = post_raw(&app, &endpoint, "{oops").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(!body.contains("Reconnect"));

    let message = events.next_message().await;
    assert_eq!(message["error"]["code"], -32700);
    assert!(message["id"].is_null());

    // The session is still usable
    post(&app, &endpoint, request(json!(2), "ping", json!({}))).await;
    assert_eq!(events.next_message().await["id"], 2);
}

#[tokio::test]
async fn test_invalid_request_keeps_its_id() {
    let app = plain_app();
    let (mut events, endpoint) = open_sse(&app, "/sse").await;

    let (status, _) = post_raw(&app, &endpoint, r#"{"jsonrpc":"2.0","id":3,"method":42}"#).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let message = events.next_message().await;
    assert_eq!(message["id"], 3);
    assert_eq!(message["error"]["code"], -32600);
}

#[tokio::test]
async fn test_unparseable_body_for_closed_session_asks_for_reconnect() {
    let inst = instance("test", ClientStateCodec::plain(), "");
    let (events, endpoint) = open_sse(&inst.app, "/sse").await;
    drop(events);
    wait_until_empty(&inst.dispatcher).await;

    let (status, body) = post_raw(&inst.app, &endpoint, "{oops").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Reconnect to /sse"));
}

async fn wait_until_empty(dispatcher: &MessageDispatcher) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !dispatcher.sessions().is_empty().await {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("session detached after disconnect");
}

#[tokio::test]
async fn test_closed_session_asks_for_reconnect() {
    let inst = instance("test", ClientStateCodec::plain(), "");
    let (events, endpoint) = open_sse(&inst.app, "/sse").await;
    drop(events);
    wait_until_empty(&inst.dispatcher).await;

    let (status, body) = post(&inst.app, &endpoint, request(json!(1), "ping", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Reconnect to /sse"));
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let app = plain_app();
    let (mut first, first_endpoint) = open_sse(&app, "/sse").await;
    let (second, second_endpoint) = open_sse(&app, "/sse").await;
    assert_ne!(first_endpoint, second_endpoint);

    drop(second);
    post(&app, &first_endpoint, request(json!(1), "ping", json!({}))).await;
    assert_eq!(first.next_message().await["id"], 1);
}

#[tokio::test]
async fn test_base_path_and_access_code() {
    let app = instance("test", ClientStateCodec::plain(), "/api").app;
    let (mut events, endpoint) = open_sse(&app, "/api/sse?code=k3y").await;
    assert!(endpoint.starts_with("/api/message?state="));
    assert!(endpoint.ends_with("&code=k3y"));

    let (status, _) = post(&app, &endpoint, request(json!(1), "ping", json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(events.next_message().await["id"], 1);

    let (status, body) = post(&app, "/api/message?state=bad", request(json!(2), "ping", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("/api/sse"));
}

#[tokio::test]
async fn test_encrypted_tokens_reject_tampering() {
    let codec = ClientStateCodec::new(Some(&SecretString::new("operator secret"))).unwrap();
    let app = instance("test", codec, "").app;
    let (mut events, endpoint) = open_sse(&app, "/sse").await;

    let (status, _) = post(&app, &endpoint, request(json!(1), "ping", json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(events.next_message().await["id"], 1);

    // Flip one character of the token
    let (prefix, token) = endpoint.split_once("state=").unwrap();
    let mut chars: Vec<char> = token.chars().collect();
    chars[10] = if chars[10] == 'A' { 'B' } else { 'A' };
    let tampered = format!("{}state={}", prefix, chars.into_iter().collect::<String>());

    let (status, _) = post(&app, &tampered, request(json!(2), "ping", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// =============================================================================
// Streamable HTTP
// =============================================================================

async fn post_streamable(app: &Router, body: Value) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("Content-Type", "application/json")
                .header("Accept", "application/json, text/event-stream")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn collect_messages(response: axum::response::Response) -> Vec<Value> {
    let bytes = tokio::time::timeout(Duration::from_secs(5), response.into_body().collect())
        .await
        .expect("stream ended")
        .unwrap()
        .to_bytes();
    SseParser::new()
        .push(std::str::from_utf8(&bytes).unwrap())
        .into_iter()
        .filter(|e| e.name() == "message")
        .map(|e| serde_json::from_str(&e.data).unwrap())
        .collect()
}

#[tokio::test]
async fn test_streamable_initialize() {
    let app = plain_app();
    let response = post_streamable(
        &app,
        request(
            json!(1),
            "initialize",
            json!({"protocolVersion": "2025-03-26", "clientInfo": {"name": "t", "version": "1"}}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    let token = response.headers()[MCP_SESSION_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();
    assert!(ClientStateCodec::plain().try_parse(&token, false).is_some());

    let messages = collect_messages(response).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["id"], 1);
    assert_eq!(messages[0]["result"]["protocolVersion"], "2025-03-26");
}

#[tokio::test]
async fn test_streamable_batch_with_session() {
    let app = plain_app();
    let first = post_streamable(&app, request(json!(1), "initialize", json!({}))).await;
    let token = first.headers()[MCP_SESSION_ID_HEADER].clone();
    collect_messages(first).await;

    let batch = json!([
        {"jsonrpc": "2.0", "method": "notifications/initialized"},
        request(json!("a"), "tools/call", json!({"name": "echo", "arguments": {"message": "hi"}})),
        request(json!("b"), "tools/call", json!({"name": "nope"})),
    ]);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("Accept", "application/json, text/event-stream")
                .header(MCP_SESSION_ID_HEADER, token.clone())
                .body(Body::from(batch.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // Each exchange is its own session with its own token
    let exchange_token = response.headers()[MCP_SESSION_ID_HEADER].clone();
    assert_ne!(exchange_token, token);
    assert!(
        ClientStateCodec::plain()
            .try_parse(exchange_token.to_str().unwrap(), false)
            .is_some()
    );

    let mut messages = collect_messages(response).await;
    messages.sort_by_key(|m| m["id"].as_str().unwrap().to_string());
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["result"]["content"][0]["text"], "hi");
    assert_eq!(messages[1]["error"]["code"], -32601);
}

#[tokio::test]
async fn test_streamable_requires_accept() {
    let app = plain_app();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("Accept", "text/event-stream")
                .body(Body::from(request(json!(1), "ping", json!({})).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
}

// =============================================================================
// Multi-instance relay
// =============================================================================

#[tokio::test]
async fn test_message_relayed_to_owning_instance() {
    let queues = Arc::new(InMemoryQueueService::new());
    let config = BackplaneConfig {
        min_poll_interval_ms: 10,
        max_poll_interval_ms: 50,
        ..BackplaneConfig::default()
    };

    // Instance "owner" holds the session and consumes its queue
    let owner = instance("owner", ClientStateCodec::plain(), "");
    let owner_backplane = Arc::new(Backplane::new(
        InstanceId::new("owner"),
        queues.clone(),
        config.clone(),
    ));
    let (relay_tx, relay_rx) = mpsc::channel(16);
    tokio::spawn({
        let backplane = owner_backplane.clone();
        async move { backplane.run(relay_tx).await }
    });
    tokio::spawn({
        let dispatcher = owner.dispatcher.clone();
        async move { dispatcher.deliver_remote(relay_rx).await }
    });

    // Instance "front" only forwards
    let front = front_instance(queues, config);

    let (mut events, endpoint) = open_sse(&owner.app, "/sse").await;
    let (status, _) = post(
        &front,
        &endpoint,
        request(json!(7), "tools/call", json!({"name": "echo", "arguments": {"message": "relayed"}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let message = events.next_message().await;
    assert_eq!(message["id"], 7);
    assert_eq!(message["result"]["content"][0]["text"], "relayed");

    owner_backplane.shutdown().await;
}

fn front_instance(queues: Arc<InMemoryQueueService>, config: BackplaneConfig) -> Router {
    let sessions = Arc::new(SessionManager::new(
        InstanceId::new("front"),
        Arc::new(ClientStateCodec::plain()),
    ));
    let dispatcher = Arc::new(
        MessageDispatcher::new(sessions, McpRouter::new(Arc::new(Registry::new()))).backplane(
            Arc::new(Backplane::new(InstanceId::new("front"), queues, config)),
        ),
    );
    HttpTransport::new(dispatcher).into_router()
}

#[tokio::test]
async fn test_streamable_cancel_relayed_to_owning_instance() {
    let queues = Arc::new(InMemoryQueueService::new());
    let config = BackplaneConfig {
        min_poll_interval_ms: 10,
        max_poll_interval_ms: 50,
        ..BackplaneConfig::default()
    };

    let owner = instance("owner", ClientStateCodec::plain(), "");
    let owner_backplane = Arc::new(Backplane::new(
        InstanceId::new("owner"),
        queues.clone(),
        config.clone(),
    ));
    let (relay_tx, relay_rx) = mpsc::channel(16);
    tokio::spawn({
        let backplane = owner_backplane.clone();
        async move { backplane.run(relay_tx).await }
    });
    tokio::spawn({
        let dispatcher = owner.dispatcher.clone();
        async move { dispatcher.deliver_remote(relay_rx).await }
    });
    let front = front_instance(queues, config);

    // A long-running call on the owner
    let response = post_streamable(
        &owner.app,
        request(json!(1), "tools/call", json!({"name": "wait", "arguments": {}})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let token = response.headers()[MCP_SESSION_ID_HEADER].clone();
    let collecting = tokio::spawn(collect_messages(response));

    let client_id = ClientStateCodec::plain()
        .try_parse(token.to_str().unwrap(), false)
        .unwrap()
        .client_id;
    let session = owner
        .dispatcher
        .sessions()
        .try_get_session(&client_id)
        .await
        .expect("exchange is live on the owner");
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.in_flight_count() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("call started");

    // The cancellation lands on the other instance
    let cancel = json!({
        "jsonrpc": "2.0",
        "method": "notifications/cancelled",
        "params": {"requestId": 1}
    });
    let relayed = front
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("Accept", "application/json, text/event-stream")
                .header(MCP_SESSION_ID_HEADER, token)
                .body(Body::from(cancel.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(relayed.status(), StatusCode::ACCEPTED);

    // The owner drops the cancelled response and ends the exchange
    let messages = collecting.await.unwrap();
    assert!(messages.is_empty());

    owner_backplane.shutdown().await;
}
