//! JSON-RPC 2.0 service layer
//!
//! Provides a Tower [`Layer`] and [`Service`] for JSON-RPC framing of MCP requests.
//!
//! - [`JsonRpcLayer`] - Tower layer for [`ServiceBuilder`](tower::ServiceBuilder) composition
//! - [`JsonRpcService`] - Tower service wrapping an MCP router
//!
//! The service validates the JSON-RPC version, parses the MCP request and
//! turns every failure into a JSON-RPC error response carrying the request's
//! own id. It never fails at the Tower level.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio_util::sync::CancellationToken;
use tower::Layer;
use tower_service::Service;

use crate::error::JsonRpcError;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, McpRequest};
use crate::router::{RouterRequest, RouterResponse};

/// A JSON-RPC request together with the session it arrived on
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub client_id: String,
    pub cancel: CancellationToken,
    pub request: JsonRpcRequest,
}

/// Tower layer that adds JSON-RPC 2.0 framing to an MCP service.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tower::ServiceBuilder;
/// use mcp_relay::{JsonRpcLayer, McpRouter, McpTracingLayer, Registry};
///
/// let router = McpRouter::new(Arc::new(Registry::new()));
///
/// let service = ServiceBuilder::new()
///     .layer(JsonRpcLayer::new())
///     .layer(McpTracingLayer::new())
///     .service(router);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcLayer {
    _priv: (),
}

impl JsonRpcLayer {
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl<S> Layer<S> for JsonRpcLayer {
    type Service = JsonRpcService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        JsonRpcService::new(inner)
    }
}

/// Service that handles JSON-RPC framing.
#[derive(Debug, Clone)]
pub struct JsonRpcService<S> {
    inner: S,
}

impl<S> JsonRpcService<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> Service<SessionRequest> for JsonRpcService<S>
where
    S: Service<RouterRequest, Response = RouterResponse, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = JsonRpcResponse;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: SessionRequest) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(process_request(inner, req).await) })
    }
}

async fn process_request<S>(mut inner: S, req: SessionRequest) -> JsonRpcResponse
where
    S: Service<RouterRequest, Response = RouterResponse, Error = Infallible> + Send + 'static,
    S::Future: Send,
{
    let SessionRequest {
        client_id,
        cancel,
        request,
    } = req;

    if let Err(e) = request.validate() {
        return JsonRpcResponse::error(Some(request.id), e);
    }

    let mcp_request = match McpRequest::from_jsonrpc(&request) {
        Ok(r) => r,
        Err(e) => {
            return JsonRpcResponse::error(
                Some(request.id),
                JsonRpcError::invalid_params(e.to_string()),
            );
        }
    };

    let router_req = RouterRequest {
        id: request.id,
        inner: mcp_request,
        client_id,
        cancel,
    };

    match inner.call(router_req).await {
        Ok(response) => response.into_jsonrpc(),
        Err(never) => match never {},
    }
}
