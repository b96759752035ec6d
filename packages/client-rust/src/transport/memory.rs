//! In-process pub/sub broker.
//!
//! Every [`MemoryTransport`] is one connection to a shared [`MemoryBroker`]
//! with a bounded mpsc inbox for backpressure. Topics match exactly (no
//! wildcards). Publishing fans out to every connection subscribed to the
//! topic, including the publisher itself. Delivery is at-most-once: a full
//! inbox drops the message.
//!
//! A broker built with [`MemoryBroker::recording`] also keeps, per
//! connection, the published messages and subscribe/unsubscribe counts. The
//! default broker records nothing, so long-lived connections stay bounded.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tether_core::Payload;
use tokio::sync::mpsc;

use super::{InboundMessage, PublishOptions, SubscribeOptions, Transport, TransportError};

/// Default capacity of each connection inbox.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Unique identifier for a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Per-topic subscribe/unsubscribe call counts for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionStats {
    pub subscribes: u64,
    pub unsubscribes: u64,
}

#[derive(Debug)]
struct Connection {
    tx: mpsc::Sender<InboundMessage>,
    topics: RwLock<HashSet<String>>,
    stats: RwLock<HashMap<String, SubscriptionStats>>,
    published: RwLock<Vec<InboundMessage>>,
    connected: AtomicBool,
}

#[derive(Debug)]
struct BrokerState {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_id: AtomicU64,
    inbox_capacity: usize,
    recording: bool,
}

/// Shared in-memory broker. Cloning yields another handle to the same bus.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_inbox_capacity(DEFAULT_INBOX_CAPACITY)
    }

    /// Creates a broker whose connection inboxes hold `capacity` messages.
    #[must_use]
    pub fn with_inbox_capacity(capacity: usize) -> Self {
        Self::build(capacity, false)
    }

    /// Creates a broker that records every connection's publishes and
    /// subscription counts, for inspection through
    /// [`MemoryTransport::published`] and [`MemoryTransport::stats`].
    #[must_use]
    pub fn recording() -> Self {
        Self::build(DEFAULT_INBOX_CAPACITY, true)
    }

    fn build(capacity: usize, recording: bool) -> Self {
        Self {
            state: Arc::new(BrokerState {
                connections: DashMap::new(),
                next_id: AtomicU64::new(1),
                inbox_capacity: capacity.max(1),
                recording,
            }),
        }
    }

    /// Opens a connection, returning the transport and its inbox receiver.
    ///
    /// The receiver should be handed to the client's router, which drains
    /// inbound messages and dispatches them.
    #[must_use]
    pub fn connect(&self) -> (Arc<MemoryTransport>, mpsc::Receiver<InboundMessage>) {
        let id = ConnectionId(self.state.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.state.inbox_capacity);
        let connection = Arc::new(Connection {
            tx,
            topics: RwLock::new(HashSet::new()),
            stats: RwLock::new(HashMap::new()),
            published: RwLock::new(Vec::new()),
            connected: AtomicBool::new(true),
        });
        self.state.connections.insert(id, Arc::clone(&connection));
        let transport = MemoryTransport {
            id,
            state: Arc::clone(&self.state),
            connection,
        };
        (Arc::new(transport), rx)
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    /// Number of connections currently subscribed to `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .connections
            .iter()
            .filter(|entry| entry.value().topics.read().contains(topic))
            .count()
    }

    fn deliver(&self, message: &InboundMessage) -> usize {
        let mut delivered = 0;
        for entry in self.state.connections.iter() {
            let connection = entry.value();
            if !connection.topics.read().contains(&message.topic) {
                continue;
            }
            match connection.tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(
                        connection = entry.key().0,
                        topic = %message.topic,
                        error = %err,
                        "dropping message for connection"
                    );
                }
            }
        }
        delivered
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// One connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryTransport {
    id: ConnectionId,
    state: Arc<BrokerState>,
    connection: Arc<Connection>,
}

impl MemoryTransport {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Simulates a lost session: every later operation fails with
    /// `TransportError::Disconnected` and nothing is delivered to this
    /// connection any more.
    pub fn disconnect(&self) {
        self.connection.connected.store(false, Ordering::SeqCst);
        self.connection.topics.write().clear();
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.connected.load(Ordering::SeqCst)
    }

    /// Topics this connection is currently subscribed to, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.connection.topics.read().iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Subscribe/unsubscribe call counts recorded for `topic`. Always zero
    /// unless the broker is recording.
    #[must_use]
    pub fn stats(&self, topic: &str) -> SubscriptionStats {
        self.connection
            .stats
            .read()
            .get(topic)
            .copied()
            .unwrap_or_default()
    }

    /// Every message this connection published, in order. Empty unless the
    /// broker is recording.
    #[must_use]
    pub fn published(&self) -> Vec<InboundMessage> {
        self.connection.published.read().clone()
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    fn record(&self, topic: &str, update: impl FnOnce(&mut SubscriptionStats)) {
        if self.state.recording {
            update(
                self.connection
                    .stats
                    .write()
                    .entry(topic.to_string())
                    .or_default(),
            );
        }
    }

    fn broker(&self) -> MemoryBroker {
        MemoryBroker {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        _opts: &PublishOptions,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let message = InboundMessage::new(topic, payload);
        if self.state.recording {
            self.connection.published.write().push(message.clone());
        }
        let delivered = self.broker().deliver(&message);
        tracing::trace!(topic, delivered, "memory broker publish");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _opts: &SubscribeOptions) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.connection.topics.write().insert(topic.to_string());
        self.record(topic, |stats| stats.subscribes += 1);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.connection.topics.write().remove(topic);
        self.record(topic, |stats| stats.unsubscribes += 1);
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.state.connections.remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
