//! Reference-counted transport subscriptions.
//!
//! Several concurrent operations may need the same topic (two in-flight calls
//! to one service share its response topic). The manager issues exactly one
//! transport subscribe for the first user and exactly one unsubscribe after
//! the last user released it.
//!
//! An acquire runs to completion on its own task. If the caller stops
//! waiting, the reference it would have received is handed straight back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::error::ClientError;
use crate::transport::{SubscribeOptions, Transport};

pub(crate) struct SubscriptionManager {
    transport: Arc<dyn Transport>,
    // Held across the transport acknowledgment so a concurrent acquire of the
    // same topic cannot issue a second subscribe.
    counts: Mutex<HashMap<String, usize>>,
    // Set by `release_all`; later releases are no-ops and acquires fail.
    closed: AtomicBool,
}

impl SubscriptionManager {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            counts: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Takes one reference on `topic`, subscribing on first use.
    ///
    /// A failed subscribe leaves no entry behind. Dropping the returned
    /// future before it resolves leaves the count unchanged once the
    /// background acquire settles.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        topic: &str,
        opts: &SubscribeOptions,
    ) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        let manager = Arc::clone(self);
        let owned = topic.to_string();
        let opts = *opts;
        tokio::spawn(async move {
            let result = manager.acquire_now(&owned, &opts).await;
            if let Err(Ok(())) = tx.send(result) {
                manager.release_abandoned(&owned).await;
            }
        });
        let mut reply = AcquireReply {
            manager: Arc::clone(self),
            topic: topic.to_string(),
            rx,
        };
        (&mut reply.rx).await.unwrap_or(Err(ClientError::Closed))
    }

    async fn acquire_now(&self, topic: &str, opts: &SubscribeOptions) -> Result<(), ClientError> {
        let mut counts = self.counts.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if let Some(count) = counts.get_mut(topic) {
            *count += 1;
            return Ok(());
        }
        self.transport.subscribe(topic, opts).await?;
        tracing::debug!(topic, "subscribed");
        counts.insert(topic.to_string(), 1);
        Ok(())
    }

    /// Drops one reference on `topic`, unsubscribing when none remain.
    ///
    /// The entry is deleted before the unsubscribe is issued, so a failed
    /// unsubscribe is reported but never leaves a zero count behind.
    pub(crate) async fn release(&self, topic: &str) -> Result<(), ClientError> {
        let mut counts = self.counts.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(count) = counts.get_mut(topic) else {
            return Err(ClientError::SubscriptionUnderflow {
                topic: topic.to_string(),
            });
        };
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }
        counts.remove(topic);
        self.transport.unsubscribe(topic).await?;
        tracing::debug!(topic, "unsubscribed");
        Ok(())
    }

    async fn release_abandoned(&self, topic: &str) {
        if let Err(err) = self.release(topic).await {
            tracing::warn!(topic, error = %err, "failed to release abandoned subscription");
        }
    }

    /// Releases every reference on every topic, unsubscribing each once, and
    /// shuts the manager down.
    ///
    /// Returns the unsubscribe failures; the table is empty afterwards.
    pub(crate) async fn release_all(&self) -> Vec<ClientError> {
        let mut counts = self.counts.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        let mut failures = Vec::new();
        for (topic, _) in counts.drain() {
            if let Err(err) = self.transport.unsubscribe(&topic).await {
                failures.push(ClientError::from(err));
            } else {
                tracing::debug!(topic, "unsubscribed");
            }
        }
        failures
    }

    /// Current reference count of `topic` (0 when untracked).
    #[cfg(test)]
    pub(crate) async fn count(&self, topic: &str) -> usize {
        self.counts.lock().await.get(topic).copied().unwrap_or(0)
    }
}

/// Receiving side of one acquire. A result that was sent but never taken
/// is released on drop.
struct AcquireReply {
    manager: Arc<SubscriptionManager>,
    topic: String,
    rx: oneshot::Receiver<Result<(), ClientError>>,
}

impl Drop for AcquireReply {
    fn drop(&mut self) {
        // After close() the acquiring task can no longer send, so exactly one
        // side owns a successful result.
        self.rx.close();
        if !matches!(self.rx.try_recv(), Ok(Ok(()))) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(topic = %self.topic, "no runtime to release abandoned subscription");
            return;
        };
        let manager = Arc::clone(&self.manager);
        let topic = std::mem::take(&mut self.topic);
        handle.spawn(async move { manager.release_abandoned(&topic).await });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
