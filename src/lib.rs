//! # mcp-relay
//!
//! Session, transport and routing core for hosting Model Context Protocol
//! (MCP) servers over HTTP, including deployments scaled out across several
//! processes.
//!
//! A client opens a session on whichever instance its load balancer picks.
//! Every later request carries an opaque client state token naming the
//! session and the instance that owns it. The instance that receives the
//! request either hands it to the local session or relays it, unprocessed,
//! through a durable [`Backplane`] to the owner. Tools and resources only
//! ever run in the process holding the session.
//!
//! ## Layers
//!
//! ```text
//! HTTP (axum)          GET /sse, POST /message, POST /mcp
//!   │
//! MessageDispatcher    owner check → local inbound queue | backplane
//!   │
//! SessionManager       sessions, watcher + pump tasks per session
//!   │
//! JsonRpcService       JSON-RPC framing (tower Service)
//!   │
//! McpTracingService    one span per request
//!   │
//! McpRouter            initialize, ping, tools/*, resources/*
//!   │
//! Registry             tools and resources, registered at startup
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mcp_relay::{
//!     ClientStateCodec, HttpTransport, InstanceId, McpRouter, MessageDispatcher, Registry,
//!     SessionManager, ToolBuilder, ToolOutput,
//! };
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize, JsonSchema)]
//! struct GreetInput {
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> mcp_relay::Result<()> {
//!     let greet = ToolBuilder::new("greet")
//!         .description("Greet someone by name")
//!         .handler(|input: GreetInput| async move {
//!             Ok(ToolOutput::text(format!("Hello, {}!", input.name)))
//!         })
//!         .build()?;
//!     let registry = Registry::new().with_tool(greet)?;
//!
//!     let sessions = Arc::new(SessionManager::new(
//!         InstanceId::detect(),
//!         Arc::new(ClientStateCodec::plain()),
//!     ));
//!     let router = McpRouter::new(Arc::new(registry)).server_info("my-server", "1.0.0");
//!     let dispatcher = Arc::new(MessageDispatcher::new(sessions, router));
//!
//!     HttpTransport::new(dispatcher)
//!         .serve("127.0.0.1:3000", async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! ## Key Types
//!
//! - [`Registry`], [`ToolBuilder`], [`ResourceBuilder`] - what the server offers
//! - [`McpRouter`] - the method table, as a tower `Service`
//! - [`ClientStateCodec`] - issues and verifies client state tokens
//! - [`SessionManager`] - the table of live sessions in this process
//! - [`MessageDispatcher`] - routing and per-session protocol handling
//! - [`Backplane`] - relay between instances over a [`QueueService`]
//! - [`HttpTransport`] - the axum routes
//! - [`RelayConfig`] - TOML and environment configuration

pub mod backplane;
pub mod client_state;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod jsonrpc;
pub mod protocol;
pub mod registry;
pub mod resource;
pub mod router;
pub mod secret;
pub mod session;
pub mod tool;
pub mod tracing_layer;
pub mod transport;

pub use backplane::{
    Backplane, BackplaneMessage, InMemoryQueueService, LocalDelivery, QueueEntry, QueueService,
};
pub use client_state::{ClientState, ClientStateCodec};
pub use config::{BackplaneConfig, InstanceId, RelayConfig};
pub use dispatch::{McpService, MessageDispatcher};
pub use error::{BoxError, Error, JsonRpcError, Result};
pub use jsonrpc::{JsonRpcLayer, JsonRpcService, SessionRequest};
pub use protocol::{
    CallToolResult, Content, Implementation, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, McpRequest, ReadResourceResult, RequestId, ResourceContent,
};
pub use registry::Registry;
pub use resource::{Resource, ResourceBuilder, ResourceContext, ResourceHandler, ResourceOutput};
pub use router::{McpRouter, RouterRequest, RouterResponse};
pub use secret::SecretString;
pub use session::{
    InFlight, InboundHandler, Session, SessionManager, SessionPhase, SessionState, StreamKind,
};
pub use tool::{NoParams, Tool, ToolBuilder, ToolContext, ToolHandler, ToolOutput};
pub use tracing_layer::{McpTracingLayer, McpTracingService};
pub use transport::{HttpTransport, MessageTransport, TransportEvent};
