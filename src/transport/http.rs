//! HTTP surface for MCP sessions
//!
//! Two transports share one [`MessageDispatcher`]:
//!
//! - **Legacy SSE**: `GET {base}/sse` opens the event stream and announces
//!   where to POST; `POST {base}/message?state=<token>` delivers one message
//!   to the session the token names, wherever it lives
//! - **Streamable HTTP**: `POST {base}/mcp` carries a message or batch and
//!   streams the responses back on the same request
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mcp_relay::{ClientStateCodec, HttpTransport, InstanceId, McpRouter, MessageDispatcher,
//!     Registry, SessionManager};
//!
//! # async fn run() -> mcp_relay::Result<()> {
//! let sessions = Arc::new(SessionManager::new(
//!     InstanceId::detect(),
//!     Arc::new(ClientStateCodec::plain()),
//! ));
//! let router = McpRouter::new(Arc::new(Registry::new())).server_info("my-server", "1.0.0");
//! let dispatcher = Arc::new(MessageDispatcher::new(sessions, router));
//!
//! HttpTransport::new(dispatcher)
//!     .base_path("/api")
//!     .serve("127.0.0.1:3000", async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response, Sse,
        sse::{Event, KeepAlive},
    },
    routing::{get, post},
};
use serde_json::Value;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::client_state::ClientState;
use crate::config::RelayConfig;
use crate::dispatch::MessageDispatcher;
use crate::error::{Error, JsonRpcError, Result};
use crate::protocol::{JsonRpcMessage, JsonRpcResponse, RequestId};
use crate::session::{Session, StreamKind};
use crate::transport::message::TransportEvent;

/// Header carrying the client state token on streamable-HTTP requests
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Query parameter carrying the client state token on `/message`
pub const STATE_QUERY: &str = "state";

/// Query parameter carrying a function access key, echoed into the endpoint
const CODE_QUERY: &str = "code";

/// SSE event announcing the POST endpoint
const SSE_ENDPOINT_EVENT: &str = "endpoint";

/// SSE event carrying one JSON-RPC message
const SSE_MESSAGE_EVENT: &str = "message";

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

struct AppState {
    dispatcher: Arc<MessageDispatcher>,
    base_path: String,
    keep_alive: Option<Duration>,
    shutdown: CancellationToken,
}

impl AppState {
    fn reconnect(&self, reason: &str) -> Response {
        (
            StatusCode::BAD_REQUEST,
            format!(
                "{}. Reconnect to {}/sse to establish a new session.",
                reason, self.base_path
            ),
        )
            .into_response()
    }

    /// Stream a session's events as the SSE response body
    fn event_stream(&self, session: &Session) -> Response {
        let events = match session.events() {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(client_id = %session.client_id(), error = %e, "Event stream unavailable");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Session stream unavailable")
                    .into_response();
            }
        };

        let client_id = session.client_id().to_string();
        let stream = events.filter_map(move |event| sse_event(&client_id, event));
        let sse = Sse::new(stream);
        let mut response = match self.keep_alive {
            Some(interval) => sse
                .keep_alive(KeepAlive::new().interval(interval).text("keep-alive"))
                .into_response(),
            None => sse.into_response(),
        };

        let headers = response.headers_mut();
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache,no-store"),
        );
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
        response
    }
}

fn sse_event(client_id: &str, event: TransportEvent) -> Option<std::result::Result<Event, Infallible>> {
    let event = match event {
        TransportEvent::Endpoint(url) => Event::default().event(SSE_ENDPOINT_EVENT).data(url),
        TransportEvent::Message(message) => match serde_json::to_string(&message) {
            Ok(data) => Event::default().event(SSE_MESSAGE_EVENT).data(data),
            Err(e) => {
                tracing::error!(client_id = %client_id, error = %e, "Failed to serialize outbound message");
                return None;
            }
        },
    };
    Some(Ok(event))
}

/// axum routes for both transports
pub struct HttpTransport {
    dispatcher: Arc<MessageDispatcher>,
    base_path: String,
    enable_sse: bool,
    enable_streamable_http: bool,
    keep_alive: Option<Duration>,
    shutdown: CancellationToken,
}

impl HttpTransport {
    pub fn new(dispatcher: Arc<MessageDispatcher>) -> Self {
        Self {
            dispatcher,
            base_path: String::new(),
            enable_sse: true,
            enable_streamable_http: true,
            keep_alive: Some(DEFAULT_KEEP_ALIVE),
            shutdown: CancellationToken::new(),
        }
    }

    /// Apply route prefix, transport toggles and keep-alive from configuration
    pub fn from_config(dispatcher: Arc<MessageDispatcher>, config: &RelayConfig) -> Self {
        Self::new(dispatcher)
            .base_path(&config.normalized_base_path())
            .enable_sse(config.enable_sse)
            .enable_streamable_http(config.enable_streamable_http)
            .keep_alive(config.sse_keep_alive())
    }

    /// Prefix for every route, e.g. `/api`
    pub fn base_path(mut self, path: &str) -> Self {
        let trimmed = path.trim_matches('/');
        self.base_path = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        };
        self
    }

    pub fn enable_sse(mut self, enabled: bool) -> Self {
        self.enable_sse = enabled;
        self
    }

    pub fn enable_streamable_http(mut self, enabled: bool) -> Self {
        self.enable_streamable_http = enabled;
        self
    }

    /// Interval between keep-alive comments on event streams; `None`
    /// disables them
    pub fn keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Build the axum router
    pub fn into_router(self) -> Router {
        let base = self.base_path.clone();
        let state = Arc::new(AppState {
            dispatcher: self.dispatcher,
            base_path: self.base_path,
            keep_alive: self.keep_alive,
            shutdown: self.shutdown,
        });

        let mut router = Router::new();
        if self.enable_sse {
            router = router
                .route(
                    &format!("{}/sse", base),
                    get(handle_sse).post(handle_sse_post),
                )
                .route(&format!("{}/message", base), post(handle_message));
        }
        if self.enable_streamable_http {
            router = router.route(
                &format!("{}/mcp", base),
                post(handle_streamable).delete(handle_delete),
            );
        }
        router.with_state(state)
    }

    /// Serve on `addr` until `shutdown` resolves, then close every session
    /// so that open streams end and the server can drain.
    pub async fn serve<F>(self, addr: &str, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind to {}: {}", addr, e)))?;

        tracing::info!(addr = %addr, base_path = %self.base_path, "MCP relay listening");

        let sessions = self.dispatcher.sessions().clone();
        let server_cancel = self.shutdown.clone();
        let router = self.into_router();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                tracing::info!("Shutting down, closing sessions");
                server_cancel.cancel();
                sessions.close_all().await;
            })
            .await
            .map_err(|e| Error::Transport(format!("Server error: {}", e)))?;

        Ok(())
    }
}

fn get_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn accepts(headers: &HeaderMap, media: &str) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|accept| accept.contains(media))
}

/// Streamable HTTP clients must accept both JSON and event streams
fn accepts_streamable(headers: &HeaderMap) -> bool {
    accepts(headers, "application/json") && accepts(headers, "text/event-stream")
}

/// Best-effort `id` of a body that failed to parse as a message
fn recover_request_id(body: &str) -> Option<RequestId> {
    let value: Value = serde_json::from_str(body).ok()?;
    serde_json::from_value(value.get("id")?.clone()).ok()
}

fn json_rpc_error_response(status: StatusCode, id: Option<RequestId>, error: JsonRpcError) -> Response {
    (status, axum::Json(JsonRpcResponse::error(id, error))).into_response()
}

/// `GET {base}/sse`: open a session and stream its events
async fn handle_sse(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let kind = StreamKind::Sse {
        message_url: format!("{}/message", state.base_path),
        access_code: query.get(CODE_QUERY).cloned(),
    };

    let session = match state
        .dispatcher
        .sessions()
        .create_session(kind, &state.shutdown, state.dispatcher.clone())
        .await
    {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create SSE session");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create session")
                .into_response();
        }
    };

    tracing::info!(client_id = %session.client_id(), "SSE session opened");
    state.event_stream(&session)
}

/// `POST {base}/sse`. A client asking for JSON is a streamable-HTTP client
/// on the wrong endpoint and is refused so it falls back to `GET`; anything
/// else opens the stream as `GET` would.
async fn handle_sse_post(
    state: State<Arc<AppState>>,
    query: Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if accepts(&headers, "application/json") {
        tracing::debug!("Rejecting JSON POST to SSE endpoint");
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "GET")],
            "This endpoint only supports GET for Server-Sent Events",
        )
            .into_response();
    }
    handle_sse(state, query).await
}

/// `POST {base}/message?state=<token>`: deliver to the named session
async fn handle_message(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let Some(token) = query.get(STATE_QUERY) else {
        return state.reconnect("Missing client state");
    };
    let codec = state.dispatcher.sessions().codec();
    let Some(client) = codec.try_parse(token, codec.encrypts()) else {
        tracing::debug!("Rejecting message with invalid client state");
        return state.reconnect("Invalid client state");
    };

    let messages = match JsonRpcMessage::parse_body(&body) {
        Ok(messages) => messages,
        Err(e) => return reject_message(&state, &client, recover_request_id(&body), e).await,
    };

    for message in messages {
        match state.dispatcher.deliver(&client, message).await {
            Ok(()) => {}
            Err(Error::SessionNotFound(_)) => {
                return state.reconnect("Session not found or expired");
            }
            Err(e) => {
                tracing::error!(client_id = %client.client_id, error = %e, "Failed to deliver message");
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("Unable to reach the session owner: {}", e),
                )
                    .into_response();
            }
        }
    }

    (StatusCode::ACCEPTED, "Accepted").into_response()
}

/// Answer a malformed message on a valid token. A live local session gets
/// the JSON-RPC error on its stream; a session owned elsewhere gets it as
/// the response body. Only a local session that is gone asks for a
/// reconnect.
async fn reject_message(
    state: &AppState,
    client: &ClientState,
    id: Option<RequestId>,
    error: JsonRpcError,
) -> Response {
    tracing::debug!(client_id = %client.client_id, code = error.code, error = %error.message, "Rejecting malformed message");

    if !client.is_local(state.dispatcher.instance_id()) {
        return json_rpc_error_response(StatusCode::BAD_REQUEST, id, error);
    }

    let session = state
        .dispatcher
        .sessions()
        .try_get_session(&client.client_id)
        .await;
    let answered = match session {
        Some(session) => session.send(JsonRpcResponse::error(id, error).into()).is_ok(),
        None => false,
    };
    if answered {
        (StatusCode::ACCEPTED, "Accepted").into_response()
    } else {
        state.reconnect("Session not found or expired")
    }
}

/// `POST {base}/mcp`: one streamable-HTTP exchange.
///
/// Every exchange carrying requests runs as its own short-lived session and
/// returns that session's token. A body of only notifications or responses
/// is routed to the session its `MCP-Session-Id` names, on whichever
/// instance owns it.
async fn handle_streamable(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !accepts_streamable(&headers) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            "Accept header must include application/json and text/event-stream",
        )
            .into_response();
    }

    let codec = state.dispatcher.sessions().codec();
    let addressed = match get_session_id(&headers) {
        Some(token) => match codec.try_parse(&token, codec.encrypts()) {
            Some(client) => Some(client),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    "Invalid MCP-Session-Id. Omit the header to start a new session.",
                )
                    .into_response();
            }
        },
        None => None,
    };

    let messages = match JsonRpcMessage::parse_body(&body) {
        Ok(messages) => messages,
        Err(e) => {
            return json_rpc_error_response(StatusCode::BAD_REQUEST, recover_request_id(&body), e);
        }
    };

    let expected_responses = messages.iter().filter(|m| m.is_request()).count();
    if expected_responses == 0 {
        return match addressed {
            Some(client) => route_to_session(&state, &client, messages).await,
            None => {
                tracing::debug!(count = messages.len(), "Accepted notifications without a session");
                StatusCode::ACCEPTED.into_response()
            }
        };
    }

    let session = match state
        .dispatcher
        .sessions()
        .create_session(
            StreamKind::StreamableHttp { expected_responses },
            &state.shutdown,
            state.dispatcher.clone(),
        )
        .await
    {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create streamable session");
            return json_rpc_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                None,
                JsonRpcError::internal_error("Failed to create session"),
            );
        }
    };
    if let Some(previous) = &addressed {
        tracing::debug!(
            client_id = %session.client_id(),
            previous = %previous.client_id,
            "Starting new exchange for an existing client"
        );
    }

    for message in messages {
        if let Err(e) = session.transport().process_message(message).await {
            tracing::warn!(client_id = %session.client_id(), error = %e, "Streamable session closed early");
            break;
        }
    }

    let mut response = state.event_stream(&session);
    match HeaderValue::from_str(session.token()) {
        Ok(value) => {
            response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
        }
        Err(e) => tracing::warn!(error = %e, "Client state token is not a valid header value"),
    }
    response
}

/// Deliver notifications and responses to the exchange a token names.
/// An exchange that already finished on this instance has nothing left to
/// notify, so those messages are accepted and dropped.
async fn route_to_session(
    state: &AppState,
    client: &ClientState,
    messages: Vec<JsonRpcMessage>,
) -> Response {
    let local = client.is_local(state.dispatcher.instance_id());
    for message in messages {
        match state.dispatcher.deliver(client, message).await {
            Ok(()) => {}
            Err(Error::SessionNotFound(_)) if local => {
                tracing::debug!(client_id = %client.client_id, "Exchange already finished, dropping message");
            }
            Err(Error::SessionNotFound(_)) => {
                return (
                    StatusCode::BAD_REQUEST,
                    "MCP-Session-Id names a session on another instance that cannot be reached",
                )
                    .into_response();
            }
            Err(e) => {
                tracing::error!(client_id = %client.client_id, error = %e, "Failed to deliver message");
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("Unable to reach the session owner: {}", e),
                )
                    .into_response();
            }
        }
    }
    StatusCode::ACCEPTED.into_response()
}

/// `DELETE {base}/mcp`: streamable sessions hold nothing between requests
async fn handle_delete(headers: HeaderMap) -> Response {
    match get_session_id(&headers) {
        Some(_) => StatusCode::OK.into_response(),
        None => (StatusCode::BAD_REQUEST, "Missing MCP-Session-Id header").into_response(),
    }
}
