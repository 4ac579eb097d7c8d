//! Cross-instance message relay.
//!
//! When the instance that receives an HTTP request does not own the session
//! named by its client state token, the message is forwarded through a
//! durable queue scoped to the owning instance. Each instance runs one
//! consumer loop over its own queue and hands what it receives to the local
//! dispatcher.
//!
//! Delivery is at-least-once: an entry is deleted only after the local
//! hand-off succeeded, and the queue service redelivers anything left
//! undeleted once its visibility timeout expires.
//!
//! ```rust
//! use std::sync::Arc;
//! use mcp_relay::backplane::{Backplane, InMemoryQueueService};
//! use mcp_relay::config::{BackplaneConfig, InstanceId};
//!
//! let service = Arc::new(InMemoryQueueService::new());
//! let backplane = Backplane::new(InstanceId::new("web-1"), service, BackplaneConfig::default());
//! assert!(backplane.queue_name().starts_with("mcp-backplane-web-1-"));
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{BackplaneConfig, InstanceId};
use crate::error::{Error, Result};
use crate::protocol::JsonRpcMessage;

const QUEUE_PREFIX: &str = "mcp-backplane-";

/// Readable part of a queue name; with the prefix, a dash and the hash the
/// name stays within 63 characters
const MAX_READABLE_LEN: usize = 40;

/// Queue name for an instance: lowercase alphanumerics and single dashes,
/// at most 63 characters.
///
/// Sanitizing and truncating are lossy, so the name ends with the first
/// 8 hex digits of the SHA-256 of the full instance id. Distinct ids that
/// read the same still get distinct queues.
pub fn queue_name(instance_id: &InstanceId) -> String {
    let mut readable = String::new();
    for c in instance_id.as_str().chars() {
        let c = if c.is_ascii_alphanumeric() {
            c.to_ascii_lowercase()
        } else {
            '-'
        };
        if c == '-' && (readable.is_empty() || readable.ends_with('-')) {
            continue;
        }
        readable.push(c);
    }
    readable.truncate(MAX_READABLE_LEN);
    let readable = readable.trim_end_matches('-');

    let digest = Sha256::digest(instance_id.as_str().as_bytes());
    let hash: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();

    if readable.is_empty() {
        format!("{}{}", QUEUE_PREFIX, hash)
    } else {
        format!("{}{}-{}", QUEUE_PREFIX, readable, hash)
    }
}

/// One relayed message as it sits on the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackplaneMessage {
    pub target_instance_id: InstanceId,
    pub client_id: String,
    pub message: JsonRpcMessage,
}

/// An entry leased from a queue by [`QueueService::receive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: String,
    /// Proof of the current lease; required to delete the entry
    pub pop_receipt: String,
    pub body: String,
    /// How many times this entry has been received, this time included
    pub dequeue_count: u32,
}

/// A durable queue store.
///
/// Received entries stay on the queue, hidden for the visibility timeout,
/// until deleted with the pop receipt of their latest lease.
#[async_trait]
pub trait QueueService: Send + Sync + 'static {
    /// Idempotent, and safe to race from several instances
    async fn create_queue_if_not_exists(&self, queue: &str) -> Result<()>;

    async fn delete_queue(&self, queue: &str) -> Result<()>;

    async fn send(&self, queue: &str, body: String) -> Result<()>;

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueEntry>>;

    async fn delete(&self, queue: &str, id: &str, pop_receipt: &str) -> Result<()>;
}

#[derive(Debug)]
struct StoredEntry {
    id: String,
    body: String,
    visible_at: Instant,
    pop_receipt: Option<String>,
    dequeue_count: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-local [`QueueService`] with lease and redelivery semantics.
///
/// Share one instance (via `Arc`) between several [`Backplane`]s to relay
/// between instances living in the same process.
#[derive(Debug, Default)]
pub struct InMemoryQueueService {
    queues: Mutex<HashMap<String, VecDeque<StoredEntry>>>,
}

impl InMemoryQueueService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.queues).contains_key(queue)
    }

    /// Entries on the queue, visible or not
    pub fn len(&self, queue: &str) -> usize {
        lock(&self.queues).get(queue).map_or(0, VecDeque::len)
    }
}

fn no_queue(queue: &str) -> Error {
    Error::Backplane(format!("queue '{}' does not exist", queue))
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn create_queue_if_not_exists(&self, queue: &str) -> Result<()> {
        lock(&self.queues).entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        lock(&self.queues).remove(queue);
        Ok(())
    }

    async fn send(&self, queue: &str, body: String) -> Result<()> {
        let mut queues = lock(&self.queues);
        let entries = queues.get_mut(queue).ok_or_else(|| no_queue(queue))?;
        entries.push_back(StoredEntry {
            id: uuid::Uuid::new_v4().to_string(),
            body,
            visible_at: Instant::now(),
            pop_receipt: None,
            dequeue_count: 0,
        });
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueEntry>> {
        let now = Instant::now();
        let mut queues = lock(&self.queues);
        let entries = queues.get_mut(queue).ok_or_else(|| no_queue(queue))?;

        let mut leased = Vec::new();
        for entry in entries.iter_mut() {
            if leased.len() >= max_messages {
                break;
            }
            if entry.visible_at > now {
                continue;
            }
            let receipt = uuid::Uuid::new_v4().to_string();
            entry.visible_at = now + visibility_timeout;
            entry.pop_receipt = Some(receipt.clone());
            entry.dequeue_count += 1;
            leased.push(QueueEntry {
                id: entry.id.clone(),
                pop_receipt: receipt,
                body: entry.body.clone(),
                dequeue_count: entry.dequeue_count,
            });
        }
        Ok(leased)
    }

    async fn delete(&self, queue: &str, id: &str, pop_receipt: &str) -> Result<()> {
        let mut queues = lock(&self.queues);
        let entries = queues.get_mut(queue).ok_or_else(|| no_queue(queue))?;
        let position = entries
            .iter()
            .position(|e| e.id == id && e.pop_receipt.as_deref() == Some(pop_receipt))
            .ok_or_else(|| {
                Error::Backplane(format!("entry '{}' is not leased with that receipt", id))
            })?;
        entries.remove(position);
        Ok(())
    }
}

/// In-process hand-off of a relayed message to the owning dispatcher
#[async_trait]
pub trait LocalDelivery: Send + Sync {
    async fn deliver(&self, message: BackplaneMessage) -> Result<()>;
}

#[async_trait]
impl LocalDelivery for mpsc::Sender<BackplaneMessage> {
    async fn deliver(&self, message: BackplaneMessage) -> Result<()> {
        self.send(message)
            .await
            .map_err(|_| Error::Backplane("local delivery channel closed".to_string()))
    }
}

/// Relay between instances over a [`QueueService`]
pub struct Backplane {
    instance_id: InstanceId,
    queue: String,
    service: Arc<dyn QueueService>,
    config: BackplaneConfig,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Backplane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backplane")
            .field("instance_id", &self.instance_id)
            .field("queue", &self.queue)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Backplane {
    pub fn new(
        instance_id: InstanceId,
        service: Arc<dyn QueueService>,
        config: BackplaneConfig,
    ) -> Self {
        Self {
            queue: queue_name(&instance_id),
            instance_id,
            service,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// This instance's own queue
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Enqueue `message` for the session `client_id` owned by `target`.
    /// The target's queue is created if it does not exist yet.
    pub async fn send_message(
        &self,
        message: JsonRpcMessage,
        target: &InstanceId,
        client_id: &str,
    ) -> Result<()> {
        let queue = queue_name(target);
        let envelope = BackplaneMessage {
            target_instance_id: target.clone(),
            client_id: client_id.to_string(),
            message,
        };
        let body = serde_json::to_string(&envelope)?;

        self.service.create_queue_if_not_exists(&queue).await?;
        self.service.send(&queue, body).await?;
        tracing::debug!(
            target_instance = %target,
            client_id = %client_id,
            queue = %queue,
            "Relayed message to owning instance"
        );
        Ok(())
    }

    /// Receive one batch and hand each entry to `delivery`.
    ///
    /// Entries are deleted once delivered. Entries that fail to deserialize
    /// are logged and deleted. Entries naming another instance are moved to
    /// that instance's queue, or left for it when it shares this queue.
    /// Entries whose delivery fails are left for redelivery. Returns how
    /// many entries were received.
    pub async fn poll_once(&self, delivery: &dyn LocalDelivery) -> Result<usize> {
        let entries = self
            .service
            .receive(
                &self.queue,
                self.config.batch_size.max(1),
                self.config.visibility_timeout(),
            )
            .await?;
        let received = entries.len();

        for entry in entries {
            let envelope = match serde_json::from_str::<BackplaneMessage>(&entry.body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(
                        queue = %self.queue,
                        entry_id = %entry.id,
                        error = %e,
                        "Dropping malformed backplane entry"
                    );
                    self.delete_entry(&entry).await;
                    continue;
                }
            };

            if envelope.target_instance_id != self.instance_id {
                self.forward_misaddressed(&entry, &envelope.target_instance_id)
                    .await;
                continue;
            }

            let client_id = envelope.client_id.clone();
            match delivery.deliver(envelope).await {
                Ok(()) => self.delete_entry(&entry).await,
                Err(e) => tracing::warn!(
                    queue = %self.queue,
                    entry_id = %entry.id,
                    client_id = %client_id,
                    dequeue_count = entry.dequeue_count,
                    error = %e,
                    "Local delivery failed, leaving entry for redelivery"
                ),
            }
        }

        Ok(received)
    }

    /// Consume this instance's queue until [`shutdown`](Self::shutdown).
    ///
    /// Empty polls back off from the minimum to the maximum poll interval,
    /// doubling each time; any non-empty poll resets the delay.
    pub async fn run(&self, delivery: impl LocalDelivery) -> Result<()> {
        self.service.create_queue_if_not_exists(&self.queue).await?;
        tracing::info!(queue = %self.queue, "Backplane consumer started");

        let mut idle_polls: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.poll_once(&delivery).await {
                Ok(0) => idle_polls = idle_polls.saturating_add(1),
                Ok(_) => {
                    idle_polls = 0;
                    continue;
                }
                Err(e) => {
                    idle_polls = idle_polls.saturating_add(1);
                    tracing::warn!(queue = %self.queue, error = %e, "Backplane receive failed");
                }
            }

            let delay = self.poll_delay(idle_polls);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(queue = %self.queue, "Backplane consumer stopped");
        Ok(())
    }

    /// Stop the consumer loop and delete this instance's queue. Queue
    /// deletion is best effort.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Err(e) = self.service.delete_queue(&self.queue).await {
            tracing::warn!(queue = %self.queue, error = %e, "Failed to delete backplane queue");
        }
    }

    fn poll_delay(&self, idle_polls: u32) -> Duration {
        let min = self.config.min_poll_interval();
        let max = self.config.max_poll_interval();
        let exp = idle_polls.saturating_sub(1).min(16);
        min.saturating_mul(1u32 << exp).min(max)
    }

    async fn forward_misaddressed(&self, entry: &QueueEntry, target: &InstanceId) {
        let target_queue = queue_name(target);
        if target_queue == self.queue {
            tracing::warn!(
                queue = %self.queue,
                entry_id = %entry.id,
                target_instance = %target,
                "Leaving backplane entry for another instance sharing this queue"
            );
            return;
        }

        let forwarded = match self.service.create_queue_if_not_exists(&target_queue).await {
            Ok(()) => self.service.send(&target_queue, entry.body.clone()).await,
            Err(e) => Err(e),
        };
        match forwarded {
            Ok(()) => {
                tracing::warn!(
                    queue = %self.queue,
                    entry_id = %entry.id,
                    target_instance = %target,
                    target_queue = %target_queue,
                    "Moved misaddressed backplane entry to its owner's queue"
                );
                self.delete_entry(entry).await;
            }
            Err(e) => tracing::warn!(
                queue = %self.queue,
                entry_id = %entry.id,
                target_queue = %target_queue,
                error = %e,
                "Failed to move misaddressed backplane entry, leaving it for redelivery"
            ),
        }
    }

    async fn delete_entry(&self, entry: &QueueEntry) {
        if let Err(e) = self
            .service
            .delete(&self.queue, &entry.id, &entry.pop_receipt)
            .await
        {
            tracing::warn!(queue = %self.queue, entry_id = %entry.id, error = %e, "Failed to delete backplane entry");
        }
    }
}
