//! Message routing and the per-session protocol state machine.
//!
//! [`MessageDispatcher`] decides, for every message addressed by a client
//! state token, whether this instance owns the session. Owned sessions get
//! the message on their inbound queue; anything else goes to the
//! [`Backplane`] untouched, so the method table only ever runs in the
//! process holding the session.
//!
//! As the sessions' [`InboundHandler`], the dispatcher then answers what the
//! pump hands it:
//!
//! - requests run on their own task through the JSON-RPC service, and the
//!   response is written back on the session's transport
//! - notifications are handled inline (`initialized`, `cancelled`)
//! - responses from the client are logged and dropped

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tower::{Layer, ServiceExt};

use crate::backplane::{Backplane, BackplaneMessage};
use crate::client_state::ClientState;
use crate::config::InstanceId;
use crate::error::{Error, JsonRpcError, Result};
use crate::jsonrpc::{JsonRpcService, SessionRequest};
use crate::protocol::{
    InitializeParams, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    McpNotification,
};
use crate::router::McpRouter;
use crate::session::{InboundHandler, Session, SessionManager};
use crate::tracing_layer::{McpTracingLayer, McpTracingService};

/// The service stack every request runs through
pub type McpService = JsonRpcService<McpTracingService<McpRouter>>;

pub struct MessageDispatcher {
    sessions: Arc<SessionManager>,
    service: McpService,
    backplane: Option<Arc<Backplane>>,
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("instance_id", self.instance_id())
            .field("backplane", &self.backplane.is_some())
            .finish_non_exhaustive()
    }
}

impl MessageDispatcher {
    pub fn new(sessions: Arc<SessionManager>, router: McpRouter) -> Self {
        Self::with_tracing(sessions, router, McpTracingLayer::new())
    }

    /// Like [`new`](Self::new) with a custom tracing layer
    pub fn with_tracing(
        sessions: Arc<SessionManager>,
        router: McpRouter,
        layer: McpTracingLayer,
    ) -> Self {
        Self {
            sessions,
            service: JsonRpcService::new(layer.layer(router)),
            backplane: None,
        }
    }

    /// Forward messages for sessions owned elsewhere through `backplane`
    pub fn backplane(mut self, backplane: Arc<Backplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.sessions.instance_id()
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Route one inbound message to the session named by `state`.
    ///
    /// Returns once the message is queued, locally or on the backplane.
    /// Fails with [`Error::SessionNotFound`] when the session is local but
    /// gone, or remote with no backplane to reach it.
    pub async fn deliver(&self, state: &ClientState, message: JsonRpcMessage) -> Result<()> {
        if state.is_local(self.instance_id()) {
            return self.deliver_local(&state.client_id, message).await;
        }

        match &self.backplane {
            Some(backplane) => {
                backplane
                    .send_message(message, &state.instance_id, &state.client_id)
                    .await
            }
            None => {
                tracing::warn!(
                    client_id = %state.client_id,
                    owner = %state.instance_id,
                    "Session is owned by another instance and no backplane is configured"
                );
                Err(Error::SessionNotFound(state.client_id.clone()))
            }
        }
    }

    async fn deliver_local(&self, client_id: &str, message: JsonRpcMessage) -> Result<()> {
        let session = self
            .sessions
            .try_get_session(client_id)
            .await
            .ok_or_else(|| Error::SessionNotFound(client_id.to_string()))?;
        session
            .transport()
            .process_message(message)
            .await
            .map_err(|_| Error::SessionNotFound(client_id.to_string()))
    }

    /// Feed messages relayed by the backplane into their local sessions
    /// until the channel closes.
    pub async fn deliver_remote(&self, mut relayed: mpsc::Receiver<BackplaneMessage>) {
        while let Some(envelope) = relayed.recv().await {
            if let Err(e) = self
                .deliver_local(&envelope.client_id, envelope.message)
                .await
            {
                tracing::warn!(
                    client_id = %envelope.client_id,
                    error = %e,
                    "Dropping relayed message for a session that is gone"
                );
            }
        }
        tracing::debug!("Backplane delivery channel closed");
    }

    /// Run one request through the service stack and bind the session's
    /// server handle when it was a successful `initialize`. Returns `None`
    /// when the client cancelled the request. A handler that panics is
    /// answered with an internal error.
    pub async fn handle_request(
        &self,
        session: &Session,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        run_request(self.service.clone(), session, request).await
    }

    fn handle_notification(&self, session: &Session, notification: JsonRpcNotification) {
        let parsed = match McpNotification::from_jsonrpc(&notification) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(
                    client_id = %session.client_id(),
                    method = %notification.method,
                    error = %e,
                    "Ignoring malformed notification"
                );
                return;
            }
        };

        match parsed {
            McpNotification::Initialized => match session.server_handle() {
                Some(state) if state.mark_initialized() => {
                    tracing::debug!(client_id = %session.client_id(), "Handshake complete");
                }
                _ => tracing::warn!(
                    client_id = %session.client_id(),
                    "Received initialized notification outside of the handshake"
                ),
            },
            McpNotification::Cancelled(params) => {
                let known = session.cancel_request(&params.request_id);
                tracing::debug!(
                    client_id = %session.client_id(),
                    request_id = %params.request_id,
                    reason = ?params.reason,
                    known,
                    "Client cancelled request"
                );
            }
            McpNotification::Unknown { method, .. } => {
                tracing::debug!(client_id = %session.client_id(), method = %method, "Ignoring notification");
            }
        }
    }
}

async fn run_request(
    service: McpService,
    session: &Session,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    let id = request.id.clone();
    let in_flight = session.begin_request(&id);
    let initialize = (request.method == "initialize").then(|| request.params.clone());
    let method = request.method.clone();

    let outcome = AssertUnwindSafe(service.oneshot(SessionRequest {
        client_id: session.client_id().to_string(),
        cancel: in_flight.token().clone(),
        request,
    }))
    .catch_unwind()
    .await;
    session.finish_request(&in_flight);

    let response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(never)) => match never {},
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(
                client_id = %session.client_id(),
                request_id = %id,
                method = %method,
                panic = %message,
                "Request handler panicked"
            );
            return Some(JsonRpcResponse::error(
                Some(id),
                JsonRpcError::internal_error(message),
            ));
        }
    };

    if in_flight.is_cancelled() {
        tracing::debug!(client_id = %session.client_id(), request_id = %id, "Request cancelled, dropping response");
        return None;
    }

    if let (Some(params), JsonRpcResponse::Result(result)) = (initialize, &response) {
        let version = result
            .result
            .get("protocolVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let client_info = params
            .and_then(|p| serde_json::from_value::<InitializeParams>(p).ok())
            .and_then(|p| p.client_info);
        tracing::info!(
            client_id = %session.client_id(),
            protocol_version = %version,
            client = ?client_info.as_ref().map(|c| &c.name),
            "Session initialized"
        );
        session.init_server_handle(version, client_info);
    }

    Some(response)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "request handler panicked".to_string()
    }
}

fn write_back(session: &Session, response: Option<JsonRpcResponse>) {
    let sent = match response {
        Some(response) => session.send(response.into()),
        None => session.transport().abandon_response(),
    };
    if let Err(e) = sent {
        tracing::debug!(client_id = %session.client_id(), error = %e, "Session gone, dropping response");
    }
}

#[async_trait]
impl InboundHandler for MessageDispatcher {
    async fn handle(&self, session: Arc<Session>, message: JsonRpcMessage) {
        match message {
            // Answered inline so `initialized` always finds the server handle
            JsonRpcMessage::Request(request) if request.method == "initialize" => {
                let response = self.handle_request(&session, request).await;
                write_back(&session, response);
            }
            JsonRpcMessage::Request(request) => {
                let service = self.service.clone();
                tokio::spawn(async move {
                    let response = run_request(service, &session, request).await;
                    write_back(&session, response);
                });
            }
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(&session, notification);
            }
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => {
                tracing::debug!(
                    client_id = %session.client_id(),
                    id = ?message.id(),
                    "Dropping client response; no server requests are outstanding"
                );
            }
        }
    }
}
