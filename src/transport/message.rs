//! Per-connection message transport.
//!
//! SSE only flows server to client, so a [`MessageTransport`] carries two
//! independent queues joined only by the session's identity:
//!
//! - **outbound**: unbounded, filled by [`send`](MessageTransport::send) and
//!   drained by the stream from [`events`](MessageTransport::events), which
//!   the HTTP layer turns into the response body
//! - **inbound**: bounded, filled by [`process_message`](MessageTransport::process_message)
//!   from the POST endpoint and drained by the session's pump
//!
//! [`dispose`](MessageTransport::dispose) closes both so that nobody waits on
//! a queue whose other end is gone.

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::Stream;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::JsonRpcMessage;

/// How a transport frames its response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Legacy SSE: an `endpoint` event first, then messages until disconnect
    Sse { endpoint: String },
    /// Streamable HTTP: messages only, ending once `expected_responses`
    /// responses have been sent or abandoned
    StreamableHttp { expected_responses: usize },
}

/// One item on a transport's outgoing stream
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Where the client should POST its messages
    Endpoint(String),
    Message(JsonRpcMessage),
}

#[derive(Debug)]
enum Outbound {
    Message(JsonRpcMessage),
    /// A request whose response will never be written
    Abandoned,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MessageTransport {
    client_id: String,
    framing: Framing,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    inbound_tx: mpsc::Sender<JsonRpcMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<JsonRpcMessage>>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for MessageTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTransport")
            .field("client_id", &self.client_id)
            .field("framing", &self.framing)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl MessageTransport {
    pub fn new(client_id: impl Into<String>, framing: Framing, inbound_capacity: usize) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        Self {
            client_id: client_id.into(),
            framing,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            closed: CancellationToken::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Queue a message for the client. Returns once queued, not once written.
    pub fn send(&self, message: JsonRpcMessage) -> Result<()> {
        if self.is_closed() {
            return Err(closed());
        }
        self.outbound_tx
            .send(Outbound::Message(message))
            .map_err(|_| closed())
    }

    /// Record that a request will get no response, so a streamable body
    /// still ends once everything else has been answered.
    pub fn abandon_response(&self) -> Result<()> {
        if self.is_closed() {
            return Err(closed());
        }
        self.outbound_tx
            .send(Outbound::Abandoned)
            .map_err(|_| closed())
    }

    /// Queue a message that arrived out-of-band for the session's pump.
    ///
    /// Waits while the inbound queue is full; fails as soon as the transport
    /// is disposed.
    pub async fn process_message(&self, message: JsonRpcMessage) -> Result<()> {
        if self.is_closed() {
            return Err(closed());
        }
        tokio::select! {
            sent = self.inbound_tx.send(message) => sent.map_err(|_| closed()),
            _ = self.closed.cancelled() => Err(closed()),
        }
    }

    /// Hand the inbound queue to its single consumer. Only the first call
    /// gets it.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<JsonRpcMessage>> {
        lock(&self.inbound_rx).take()
    }

    /// Resolves once the transport is disposed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Resolves once the stream from [`events`](Self::events) has been
    /// dropped, or the transport disposed before anyone took it.
    pub async fn stream_dropped(&self) {
        self.outbound_tx.closed().await
    }

    /// Take the outgoing event stream. Only the first call gets it.
    ///
    /// SSE framing yields the endpoint first and then messages until the
    /// transport is disposed. Streamable framing ends after the last
    /// expected response.
    pub fn events(&self) -> Result<impl Stream<Item = TransportEvent> + Send + 'static> {
        let outbound = lock(&self.outbound_rx)
            .take()
            .ok_or_else(|| Error::Transport("event stream already taken".to_string()))?;

        let (endpoint, remaining) = match &self.framing {
            Framing::Sse { endpoint } => (Some(endpoint.clone()), None),
            Framing::StreamableHttp { expected_responses } => (None, Some(*expected_responses)),
        };

        let messages = stream::unfold((outbound, remaining), |(mut outbound, mut remaining)| async move {
            loop {
                if remaining == Some(0) {
                    return None;
                }
                match outbound.recv().await? {
                    Outbound::Abandoned => remaining = remaining.map(|n| n.saturating_sub(1)),
                    Outbound::Message(message) => {
                        if matches!(message, JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_)) {
                            remaining = remaining.map(|n| n.saturating_sub(1));
                        }
                        return Some((TransportEvent::Message(message), (outbound, remaining)));
                    }
                }
            }
        });

        Ok(stream::iter(endpoint.map(TransportEvent::Endpoint))
            .chain(messages)
            .take_until(self.closed.clone().cancelled_owned()))
    }

    /// Close both queues. Later `send`/`process_message` calls fail and any
    /// open event stream or pump stops.
    pub fn dispose(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        lock(&self.inbound_rx).take();
        lock(&self.outbound_rx).take();
        tracing::debug!(client_id = %self.client_id, "Transport disposed");
    }
}

fn closed() -> Error {
    Error::Transport("transport closed".to_string())
}
