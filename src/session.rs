//! Sessions and the session table.
//!
//! A [`Session`] is one logical client connection: a client id, the instance
//! that owns it, its [`MessageTransport`] and, once the client has completed
//! `initialize`, a [`SessionState`] server handle.
//!
//! [`SessionManager`] owns the table of live sessions in this process. Every
//! session runs two background tasks:
//!
//! - the **watcher**, which detaches the session once its event stream is
//!   dropped (the response body ended or the client went away)
//! - the **pump**, which feeds the transport's inbound queue, in arrival
//!   order, to an [`InboundHandler`]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client_state::ClientStateCodec;
use crate::config::InstanceId;
use crate::error::Result;
use crate::protocol::{Implementation, JsonRpcMessage, RequestId};
use crate::transport::message::{Framing, MessageTransport, TransportEvent};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionPhase {
    /// No `initialize` answered yet
    Uninitialized = 0,
    /// Server has responded to `initialize`, waiting for `initialized` notification
    Initializing = 1,
    /// `initialized` notification received, normal operation
    Initialized = 2,
}

impl From<u8> for SessionPhase {
    fn from(value: u8) -> Self {
        match value {
            1 => SessionPhase::Initializing,
            2 => SessionPhase::Initialized,
            _ => SessionPhase::Uninitialized,
        }
    }
}

/// Protocol-level server handle bound to a session.
///
/// Created on the first successful `initialize`; records what was
/// negotiated and tracks the handshake with atomic transitions.
#[derive(Debug)]
pub struct SessionState {
    phase: AtomicU8,
    protocol_version: String,
    client_info: Option<Implementation>,
}

impl SessionState {
    pub fn new(protocol_version: impl Into<String>, client_info: Option<Implementation>) -> Self {
        Self {
            phase: AtomicU8::new(SessionPhase::Uninitialized as u8),
            protocol_version: protocol_version.into(),
            client_info,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from(self.phase.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.phase() == SessionPhase::Initialized
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub fn client_info(&self) -> Option<&Implementation> {
        self.client_info.as_ref()
    }

    /// Uninitialized -> Initializing. Returns whether the transition happened.
    pub fn mark_initializing(&self) -> bool {
        self.transition(SessionPhase::Uninitialized, SessionPhase::Initializing)
    }

    /// Initializing -> Initialized. Returns whether the transition happened.
    pub fn mark_initialized(&self) -> bool {
        self.transition(SessionPhase::Initializing, SessionPhase::Initialized)
    }

    fn transition(&self, from: SessionPhase, to: SessionPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Consumer of a session's inbound messages.
///
/// Called by the pump once per message, in arrival order. Implementations
/// must not fail: errors become JSON-RPC error responses on the session.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle(&self, session: Arc<Session>, message: JsonRpcMessage);
}

/// What kind of response body a new session streams into
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    /// Legacy SSE. The endpoint event points at `message_url` with the
    /// session's token appended, plus `code` when the stream was opened
    /// with a function access key.
    Sse {
        message_url: String,
        access_code: Option<String>,
    },
    /// One streamable-HTTP exchange expecting this many responses
    StreamableHttp { expected_responses: usize },
}

/// One registered in-flight request. Hand it back to
/// [`Session::finish_request`] when the request completes.
#[derive(Debug)]
pub struct InFlight {
    id: RequestId,
    seq: u64,
    token: CancellationToken,
}

impl InFlight {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Fires when the client cancels the request or the session ends
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// One logical client connection
pub struct Session {
    client_id: String,
    instance_id: InstanceId,
    token: String,
    transport: Arc<MessageTransport>,
    cancel: CancellationToken,
    server: OnceLock<SessionState>,
    // A client may reuse an id while the first request is still running
    in_flight: Mutex<HashMap<RequestId, Vec<(u64, CancellationToken)>>>,
    next_seq: AtomicU64,
    watcher: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("instance_id", &self.instance_id)
            .field("phase", &self.server.get().map(|s| s.phase()))
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// The client state token issued for this session
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn transport(&self) -> &Arc<MessageTransport> {
        &self.transport
    }

    /// Fires when the session ends for any reason
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a message for the client
    pub fn send(&self, message: JsonRpcMessage) -> Result<()> {
        self.transport.send(message)
    }

    /// Take the session's outgoing event stream for the response body.
    /// Dropping it ends the session.
    pub fn events(&self) -> Result<impl Stream<Item = TransportEvent> + Send + 'static> {
        self.transport.events()
    }

    pub fn server_handle(&self) -> Option<&SessionState> {
        self.server.get()
    }

    /// Bind the server handle after a successful `initialize`. A repeated
    /// `initialize` keeps the first handle.
    pub fn init_server_handle(
        &self,
        protocol_version: &str,
        client_info: Option<Implementation>,
    ) -> &SessionState {
        let state = self
            .server
            .get_or_init(|| SessionState::new(protocol_version, client_info));
        state.mark_initializing();
        state
    }

    /// Register an in-flight request
    pub fn begin_request(&self, id: &RequestId) -> InFlight {
        let token = self.cancel.child_token();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        lock(&self.in_flight)
            .entry(id.clone())
            .or_default()
            .push((seq, token.clone()));
        InFlight {
            id: id.clone(),
            seq,
            token,
        }
    }

    /// Unregister exactly this request, leaving others with the same id
    pub fn finish_request(&self, request: &InFlight) {
        let mut in_flight = lock(&self.in_flight);
        if let Some(entries) = in_flight.get_mut(&request.id) {
            entries.retain(|(seq, _)| *seq != request.seq);
            if entries.is_empty() {
                in_flight.remove(&request.id);
            }
        }
    }

    /// Cancel every in-flight request with this id. Returns whether any
    /// was known.
    pub fn cancel_request(&self, id: &RequestId) -> bool {
        match lock(&self.in_flight).remove(id) {
            Some(entries) => {
                for (_, token) in entries {
                    token.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Number of requests currently running
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).values().map(Vec::len).sum()
    }

    /// Flip to closed and stop everything. Returns false if already closed.
    fn shut_down(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        self.transport.dispose();
        true
    }
}

/// Table of the sessions owned by this process
pub struct SessionManager {
    instance_id: InstanceId,
    codec: Arc<ClientStateCodec>,
    inbound_capacity: usize,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("instance_id", &self.instance_id)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(instance_id: InstanceId, codec: Arc<ClientStateCodec>) -> Self {
        Self {
            instance_id,
            codec,
            inbound_capacity: 64,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Bound of each session's inbound queue
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn codec(&self) -> &Arc<ClientStateCodec> {
        &self.codec
    }

    /// Create a session and start its watcher and pump tasks. Returns
    /// without waiting for either; the caller takes the session's
    /// [`events`](Session::events) for the response body.
    ///
    /// The session ends when `parent` fires, the event stream is dropped
    /// or [`close_session`](Self::close_session) is called.
    pub async fn create_session(
        self: &Arc<Self>,
        kind: StreamKind,
        parent: &CancellationToken,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Arc<Session>> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let token = self
            .codec
            .format(&client_id, &self.instance_id, self.codec.encrypts())?;

        let framing = match kind {
            StreamKind::Sse {
                message_url,
                access_code,
            } => Framing::Sse {
                endpoint: endpoint_url(&message_url, &token, access_code.as_deref()),
            },
            StreamKind::StreamableHttp { expected_responses } => {
                Framing::StreamableHttp { expected_responses }
            }
        };

        let transport = Arc::new(MessageTransport::new(
            client_id.clone(),
            framing,
            self.inbound_capacity,
        ));
        let inbound = transport.take_inbound();

        let session = Arc::new(Session {
            client_id: client_id.clone(),
            instance_id: self.instance_id.clone(),
            token,
            transport,
            cancel: parent.child_token(),
            server: OnceLock::new(),
            in_flight: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            watcher: Mutex::new(None),
            pump: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let total = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(client_id.clone(), session.clone());
            sessions.len()
        };
        tracing::debug!(client_id = %client_id, total, "Created new session");

        if let Some(mut inbound) = inbound {
            let pump_session = session.clone();
            let pump = tokio::spawn(async move {
                let cancel = pump_session.cancel.clone();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        message = inbound.recv() => match message {
                            Some(message) => handler.handle(pump_session.clone(), message).await,
                            None => break,
                        },
                    }
                }
                tracing::trace!(client_id = %pump_session.client_id, "Pump stopped");
            });
            *lock(&session.pump) = Some(pump);
        }

        let watched = session.clone();
        let manager = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = watched.cancel.cancelled() => {
                    tracing::debug!(client_id = %watched.client_id, "Session cancelled");
                }
                _ = watched.transport.stream_dropped() => {
                    tracing::debug!(client_id = %watched.client_id, "Event stream dropped");
                }
            }
            detach(&manager, &watched).await;
        });
        *lock(&session.watcher) = Some(watcher);

        Ok(session)
    }

    /// Look up a live session. No side effects.
    pub async fn try_get_session(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(client_id).cloned()
    }

    /// Dispose the session's transport, wait for its background tasks and
    /// drop it from the table. Closing an already closed session does
    /// nothing.
    pub async fn close_session(&self, session: &Arc<Session>) {
        if !session.shut_down() {
            return;
        }
        self.remove(session).await;

        let watcher = lock(&session.watcher).take();
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                tracing::warn!(client_id = %session.client_id, error = %e, "Session watcher panicked");
            }
        }
        let pump = lock(&session.pump).take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        tracing::debug!(client_id = %session.client_id, "Closed session");
    }

    /// Close every session; used at shutdown
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        for session in &sessions {
            self.close_session(session).await;
        }
        tracing::info!(count = sessions.len(), "Closed all sessions");
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn remove(&self, session: &Session) {
        let mut sessions = self.sessions.write().await;
        // Only drop the entry if it is still this session
        if sessions
            .get(&session.client_id)
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session))
        {
            sessions.remove(&session.client_id);
        }
    }
}

/// Called by the watcher when the session ends on its own. Never awaits the
/// watcher itself.
async fn detach(manager: &Weak<SessionManager>, session: &Arc<Session>) {
    if !session.shut_down() {
        return;
    }
    if let Some(manager) = manager.upgrade() {
        manager.remove(session).await;
    }
    tracing::debug!(client_id = %session.client_id, "Session ended");
}

fn endpoint_url(message_url: &str, token: &str, access_code: Option<&str>) -> String {
    let mut url = format!("{}?state={}", message_url, token);
    if let Some(code) = access_code {
        url.push_str("&code=");
        url.extend(url::form_urlencoded::byte_serialize(code.as_bytes()));
    }
    url
}
