//! MCP Router - the method table
//!
//! Maps `initialize`, `ping`, `tools/*` and `resources/*` onto the
//! [`Registry`]. The router implements Tower's `Service` trait, so it
//! composes with [`McpTracingLayer`](crate::McpTracingLayer) and any other
//! tower middleware.
//!
//! The router never sees transports or sessions, only a [`RouterRequest`]
//! naming the client it serves. Ownership routing happens before a request
//! ever reaches it.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio_util::sync::CancellationToken;
use tower_service::Service;

use crate::error::{JsonRpcError, Result};
use crate::protocol::*;
use crate::registry::Registry;
use crate::tool::ToolContext;

/// MCP Router that dispatches requests to registered handlers
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use mcp_relay::{McpRouter, Registry, ToolBuilder, ToolOutput};
///
/// let mut registry = Registry::new();
/// registry
///     .register_tool(
///         ToolBuilder::new("echo")
///             .raw_handler(|args| async move { Ok(ToolOutput::Json(args)) })
///             .unwrap(),
///     )
///     .unwrap();
///
/// let router = McpRouter::new(Arc::new(registry)).server_info("my-server", "1.0.0");
/// ```
#[derive(Clone)]
pub struct McpRouter {
    inner: Arc<McpRouterInner>,
}

impl std::fmt::Debug for McpRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpRouter")
            .field("server_name", &self.inner.server_name)
            .field("server_version", &self.inner.server_version)
            .field("tools_count", &self.inner.registry.tools().count())
            .field("resources_count", &self.inner.registry.resources().count())
            .finish()
    }
}

#[derive(Clone)]
struct McpRouterInner {
    server_name: String,
    server_version: String,
    instructions: Option<String>,
    registry: Arc<Registry>,
}

impl McpRouter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            inner: Arc::new(McpRouterInner {
                server_name: env!("CARGO_PKG_NAME").to_string(),
                server_version: env!("CARGO_PKG_VERSION").to_string(),
                instructions: None,
                registry,
            }),
        }
    }

    /// Set server info reported by `initialize`
    pub fn server_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        let inner = Arc::make_mut(&mut self.inner);
        inner.server_name = name.into();
        inner.server_version = version.into();
        self
    }

    /// Set instructions returned by `initialize`
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.inner).instructions = Some(instructions.into());
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    fn capabilities(&self) -> ServerCapabilities {
        let registry = &self.inner.registry;
        ServerCapabilities {
            tools: registry.has_tools().then(ToolsCapability::default),
            resources: registry.has_resources().then(ResourcesCapability::default),
        }
    }

    /// Handle an MCP request
    async fn handle(&self, req: RouterRequest) -> Result<McpResponse> {
        let RouterRequest {
            id,
            inner,
            client_id,
            cancel,
        } = req;

        match inner {
            McpRequest::Initialize(params) => {
                let client = params.client_info.as_ref();
                tracing::info!(
                    client_id = %client_id,
                    client = client.map(|c| c.name.as_str()).unwrap_or("unknown"),
                    version = client.map(|c| c.version.as_str()).unwrap_or("unknown"),
                    "Client initializing"
                );

                Ok(McpResponse::Initialize(InitializeResult {
                    protocol_version: negotiate_protocol_version(params.protocol_version.as_deref()),
                    capabilities: self.capabilities(),
                    server_info: Implementation {
                        name: self.inner.server_name.clone(),
                        version: self.inner.server_version.clone(),
                    },
                    instructions: self.inner.instructions.clone(),
                }))
            }

            McpRequest::Ping => Ok(McpResponse::Pong(EmptyResult {})),

            McpRequest::ListTools(_params) => Ok(McpResponse::ListTools(ListToolsResult {
                tools: self.inner.registry.tool_definitions(),
                next_cursor: None,
            })),

            McpRequest::CallTool(params) => {
                let tool = self
                    .inner
                    .registry
                    .tool(&params.name)
                    .ok_or_else(|| JsonRpcError::tool_not_found(&params.name))?;

                tracing::debug!(tool = %params.name, client_id = %client_id, "Calling tool");
                let ctx = ToolContext::new(id, client_id, cancel);
                let result = tool.call(ctx, params.arguments).await?;

                Ok(McpResponse::CallTool(result))
            }

            McpRequest::ListResources(_params) => {
                Ok(McpResponse::ListResources(ListResourcesResult {
                    resources: self.inner.registry.resource_definitions(),
                    next_cursor: None,
                }))
            }

            McpRequest::ReadResource(params) => {
                let resource = self
                    .inner
                    .registry
                    .resource(&params.uri)
                    .ok_or_else(|| JsonRpcError::resource_not_found(&params.uri))?;

                tracing::debug!(uri = %params.uri, client_id = %client_id, "Reading resource");
                let result = resource.read(&client_id).await?;

                Ok(McpResponse::ReadResource(result))
            }

            McpRequest::Unknown { method, .. } => Err(JsonRpcError::method_not_found(&method).into()),
        }
    }
}

/// Echo the client's protocol version when supported, otherwise offer the
/// latest one we speak.
pub fn negotiate_protocol_version(requested: Option<&str>) -> String {
    match requested {
        Some(v) if SUPPORTED_PROTOCOL_VERSIONS.contains(&v) => v.to_string(),
        _ => LATEST_PROTOCOL_VERSION.to_string(),
    }
}

// =============================================================================
// Tower Service implementation
// =============================================================================

/// Request type for the tower Service implementation
#[derive(Debug)]
pub struct RouterRequest {
    pub id: RequestId,
    pub inner: McpRequest,
    /// Session the request arrived on
    pub client_id: String,
    /// Fires when the client cancels the request or the session ends
    pub cancel: CancellationToken,
}

/// Response type for the tower Service implementation
#[derive(Debug)]
pub struct RouterResponse {
    pub id: RequestId,
    pub inner: std::result::Result<McpResponse, JsonRpcError>,
}

impl RouterResponse {
    /// Convert to JSON-RPC response
    pub fn into_jsonrpc(self) -> JsonRpcResponse {
        match self.inner {
            Ok(response) => match serde_json::to_value(response) {
                Ok(result) => JsonRpcResponse::result(self.id, result),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize response");
                    JsonRpcResponse::error(
                        Some(self.id),
                        JsonRpcError::internal_error(format!("Serialization error: {}", e)),
                    )
                }
            },
            Err(error) => JsonRpcResponse::error(Some(self.id), error),
        }
    }
}

impl Service<RouterRequest> for McpRouter {
    type Response = RouterResponse;
    type Error = Infallible; // Errors are in the response
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RouterRequest) -> Self::Future {
        let router = self.clone();
        let request_id = req.id.clone();
        Box::pin(async move {
            let result = router.handle(req).await;
            Ok(RouterResponse {
                id: request_id,
                inner: result.map_err(|e| e.into_jsonrpc()),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::resource::ResourceBuilder;
    use crate::tool::{ToolBuilder, ToolOutput};
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::json;
    use tower::ServiceExt;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    fn router() -> McpRouter {
        let registry = Registry::new()
            .with_tool(
                ToolBuilder::new("add")
                    .description("Add two numbers")
                    .handler(|i: AddInput| async move {
                        Ok(ToolOutput::text((i.a + i.b).to_string()))
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .with_tool(
                ToolBuilder::new("fail")
                    .raw_handler(|_| async move { Err(Error::tool("backend unavailable")) })
                    .unwrap(),
            )
            .unwrap()
            .with_resource(
                ResourceBuilder::new("file:///readme.md")
                    .name("readme")
                    .mime_type("text/markdown")
                    .text("# hi")
                    .unwrap(),
            )
            .unwrap();
        McpRouter::new(Arc::new(registry)).server_info("test-server", "9.9.9")
    }

    async fn call(router: &McpRouter, id: i64, req: McpRequest) -> JsonRpcResponse {
        router
            .clone()
            .oneshot(RouterRequest {
                id: RequestId::Number(id),
                inner: req,
                client_id: "c1".to_string(),
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap()
            .into_jsonrpc()
    }

    fn result_of(resp: JsonRpcResponse) -> serde_json::Value {
        match resp {
            JsonRpcResponse::Result(r) => r.result,
            JsonRpcResponse::Error(e) => panic!("expected result, got {:?}", e.error),
        }
    }

    fn error_of(resp: JsonRpcResponse) -> JsonRpcError {
        match resp {
            JsonRpcResponse::Error(e) => e.error,
            JsonRpcResponse::Result(r) => panic!("expected error, got {}", r.result),
        }
    }

    #[tokio::test]
    async fn test_initialize() {
        let resp = call(
            &router(),
            1,
            McpRequest::Initialize(InitializeParams {
                protocol_version: Some("2025-03-26".into()),
                ..Default::default()
            }),
        )
        .await;
        assert_eq!(resp.id(), Some(&RequestId::Number(1)));
        let result = result_of(resp);
        assert_eq!(result["protocolVersion"], "2025-03-26");
        assert_eq!(result["serverInfo"]["name"], "test-server");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], false);
        assert!(result["capabilities"]["resources"].is_object());
    }

    #[test]
    fn test_version_negotiation() {
        assert_eq!(negotiate_protocol_version(Some("2024-11-05")), "2024-11-05");
        assert_eq!(negotiate_protocol_version(Some("1999-01-01")), LATEST_PROTOCOL_VERSION);
        assert_eq!(negotiate_protocol_version(None), LATEST_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_list_and_call_tool() {
        let router = router();
        let tools = result_of(call(&router, 2, McpRequest::ListTools(Default::default())).await);
        let names: Vec<_> = tools["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["add", "fail"]);

        let resp = call(
            &router,
            3,
            McpRequest::CallTool(CallToolParams {
                name: "ADD".into(),
                arguments: json!({"a": 40, "b": 2}),
                meta: None,
            }),
        )
        .await;
        assert_eq!(resp.id(), Some(&RequestId::Number(3)));
        let result = result_of(resp);
        assert_eq!(result["content"][0]["type"], "text");
        assert_eq!(result["content"][0]["text"], "42");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_method_not_found() {
        let err = error_of(
            call(
                &router(),
                4,
                McpRequest::CallTool(CallToolParams {
                    name: "unknown-tool".into(),
                    arguments: json!({}),
                    meta: None,
                }),
            )
            .await,
        );
        assert_eq!(err.code, -32601);
    }

    #[tokio::test]
    async fn test_tool_failure_is_internal_error_with_message() {
        let err = error_of(
            call(
                &router(),
                5,
                McpRequest::CallTool(CallToolParams {
                    name: "fail".into(),
                    arguments: json!({}),
                    meta: None,
                }),
            )
            .await,
        );
        assert_eq!(err.code, -32603);
        assert_eq!(err.message, "backend unavailable");
    }

    #[tokio::test]
    async fn test_resources() {
        let router = router();
        let list = result_of(call(&router, 6, McpRequest::ListResources(Default::default())).await);
        assert_eq!(list["resources"][0]["uri"], "file:///readme.md");
        assert_eq!(list["resources"][0]["mimeType"], "text/markdown");

        let read = result_of(
            call(
                &router,
                7,
                McpRequest::ReadResource(ReadResourceParams {
                    uri: "file:///readme.md".into(),
                }),
            )
            .await,
        );
        assert_eq!(read["contents"][0]["text"], "# hi");

        let err = error_of(
            call(
                &router,
                8,
                McpRequest::ReadResource(ReadResourceParams {
                    uri: "file:///missing".into(),
                }),
            )
            .await,
        );
        assert_eq!(err.code, -32601);
        assert_eq!(err.data.unwrap()["uri"], "file:///missing");
    }

    #[tokio::test]
    async fn test_ping_and_unknown_method() {
        let router = router();
        let pong = result_of(call(&router, 9, McpRequest::Ping).await);
        assert_eq!(pong, json!({}));

        let err = error_of(
            call(
                &router,
                10,
                McpRequest::Unknown {
                    method: "prompts/list".into(),
                    params: None,
                },
            )
            .await,
        );
        assert_eq!(err.code, -32601);
    }

    #[tokio::test]
    async fn test_empty_registry_has_no_capabilities() {
        let router = McpRouter::new(Arc::new(Registry::new()));
        let result = result_of(
            call(&router, 1, McpRequest::Initialize(InitializeParams::default())).await,
        );
        assert!(result["capabilities"].get("tools").is_none());
        assert!(result["capabilities"].get("resources").is_none());
    }
}
