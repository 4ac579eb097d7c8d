//! HTTP transports for MCP sessions
//!
//! - `message` - the per-session [`MessageTransport`] with its outbound and
//!   inbound queues
//! - `http` - axum routes for legacy SSE and streamable HTTP
//!
//! ## Synchronization
//!
//! - **Session storage**: `RwLock` in [`SessionManager`](crate::SessionManager)
//! - **Outbound**: unbounded `mpsc`; sends never block
//! - **Inbound**: bounded `mpsc` sized by `inbound_queue_capacity`
//! - **Shutdown**: one `CancellationToken` per session, child of the
//!   server's shutdown token

pub mod http;
pub mod message;

pub use http::{HttpTransport, MCP_SESSION_ID_HEADER};
pub use message::{Framing, MessageTransport, TransportEvent};
