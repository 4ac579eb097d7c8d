//! MCP request tracing middleware.
//!
//! [`McpTracingLayer`] wraps the method table and opens one span per request
//! carrying the method, request id, client id and, where there is one, the
//! tool name or resource URI. Completion is logged with the duration; error
//! responses are logged at `WARN` with their JSON-RPC code.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::Layer;
use tower_service::Service;
use tracing::{Instrument, Level, Span};

use crate::protocol::McpRequest;
use crate::router::{RouterRequest, RouterResponse};

/// Tower layer that adds structured tracing to MCP requests.
#[derive(Debug, Clone, Copy)]
pub struct McpTracingLayer {
    level: Level,
}

impl Default for McpTracingLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl McpTracingLayer {
    /// Create a new tracing layer logging at `INFO`.
    pub fn new() -> Self {
        Self { level: Level::INFO }
    }

    /// Set the level for the request span and the completion event.
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }
}

impl<S> Layer<S> for McpTracingLayer {
    type Service = McpTracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        McpTracingService {
            inner,
            level: self.level,
        }
    }
}

/// Tower service that adds tracing to MCP requests.
///
/// Created by [`McpTracingLayer`].
#[derive(Debug, Clone)]
pub struct McpTracingService<S> {
    inner: S,
    level: Level,
}

impl<S> Service<RouterRequest> for McpTracingService<S>
where
    S: Service<RouterRequest, Response = RouterResponse, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = RouterResponse;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<RouterResponse, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: RouterRequest) -> Self::Future {
        let method = req.inner.method_name().to_string();
        let target = operation_target(&req.inner);
        let span = create_span(
            self.level,
            &method,
            &req.id.to_string(),
            &req.client_id,
            target.as_deref(),
        );

        let start = Instant::now();
        let fut = self.inner.call(req);
        let level = self.level;

        Box::pin(
            async move {
                let result = fut.await;
                let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

                if let Ok(response) = &result {
                    match &response.inner {
                        Ok(_) => log_success(level, &method, duration_ms),
                        Err(err) => {
                            tracing::warn!(
                                method = %method,
                                error_code = err.code,
                                error_message = %err.message,
                                duration_ms = duration_ms,
                                "MCP request failed"
                            );
                        }
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}

/// The tool name or resource URI a request acts on
fn operation_target(req: &McpRequest) -> Option<String> {
    match req {
        McpRequest::CallTool(params) => Some(params.name.clone()),
        McpRequest::ReadResource(params) => Some(params.uri.clone()),
        _ => None,
    }
}

fn create_span(
    level: Level,
    method: &str,
    request_id: &str,
    client_id: &str,
    target: Option<&str>,
) -> Span {
    match level {
        Level::TRACE => tracing::trace_span!(
            "mcp_request",
            method = %method,
            request_id = %request_id,
            client_id = %client_id,
            target = target,
        ),
        Level::DEBUG => tracing::debug_span!(
            "mcp_request",
            method = %method,
            request_id = %request_id,
            client_id = %client_id,
            target = target,
        ),
        Level::INFO => tracing::info_span!(
            "mcp_request",
            method = %method,
            request_id = %request_id,
            client_id = %client_id,
            target = target,
        ),
        Level::WARN => tracing::warn_span!(
            "mcp_request",
            method = %method,
            request_id = %request_id,
            client_id = %client_id,
            target = target,
        ),
        Level::ERROR => tracing::error_span!(
            "mcp_request",
            method = %method,
            request_id = %request_id,
            client_id = %client_id,
            target = target,
        ),
    }
}

fn log_success(level: Level, method: &str, duration_ms: f64) {
    match level {
        Level::TRACE => tracing::trace!(method = %method, duration_ms, "MCP request completed"),
        Level::DEBUG => tracing::debug!(method = %method, duration_ms, "MCP request completed"),
        Level::INFO => tracing::info!(method = %method, duration_ms, "MCP request completed"),
        Level::WARN => tracing::warn!(method = %method, duration_ms, "MCP request completed"),
        Level::ERROR => tracing::error!(method = %method, duration_ms, "MCP request completed"),
    }
}
