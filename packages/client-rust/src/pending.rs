//! Pending-request table and the per-call cleanup guard.
//!
//! Each in-flight call owns one entry keyed by its request id. Whichever of
//! response, publish failure, timeout or close reaches the entry first
//! removes it; every later attempt finds nothing and becomes a no-op, so a
//! call resolves exactly once.

use std::sync::Arc;

use dashmap::DashMap;
use tether_core::Value;
use tokio::sync::{broadcast, oneshot};

use crate::error::ClientError;
use crate::subscriptions::SubscriptionManager;

pub(crate) type CallOutcome = Result<Value, ClientError>;

struct PendingCall {
    name: String,
    tx: oneshot::Sender<CallOutcome>,
}

pub(crate) struct PendingTable {
    calls: DashMap<String, PendingCall>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Registers a call and returns the receiver its outcome arrives on.
    pub(crate) fn insert(&self, rid: &str, name: &str) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            rid.to_string(),
            PendingCall {
                name: name.to_string(),
                tx,
            },
        );
        rx
    }

    /// Completes the call `rid` if it is pending and targets `name`.
    ///
    /// Returns `false` when no such call exists, which covers late responses,
    /// duplicates and responses that arrived on another name's topic.
    pub(crate) fn resolve(&self, rid: &str, name: &str, outcome: CallOutcome) -> bool {
        match self.calls.remove_if(rid, |_, call| call.name == name) {
            Some((_, call)) => {
                // The caller may have stopped waiting; the entry is gone either way.
                let _ = call.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Removes the entry without resolving it.
    pub(crate) fn remove(&self, rid: &str) -> bool {
        self.calls.remove(rid).is_some()
    }

    /// Resolves every pending call with `err`.
    pub(crate) fn fail_all(&self, err: &ClientError) -> usize {
        let rids: Vec<String> = self.calls.iter().map(|entry| entry.key().clone()).collect();
        let mut failed = 0;
        for rid in rids {
            if let Some((_, call)) = self.calls.remove(&rid) {
                let _ = call.tx.send(Err(err.clone()));
                failed += 1;
            }
        }
        failed
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, rid: &str) -> bool {
        self.calls.contains_key(rid)
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}

// ---------------------------------------------------------------------------
// CallGuard
// ---------------------------------------------------------------------------

/// Owns the cleanup of one in-flight call: its pending entry and its
/// reference on the response topic.
///
/// [`CallGuard::finish`] performs the cleanup inline. If the call future is
/// dropped before finishing, `Drop` removes the entry and releases the
/// subscription on a background task.
pub(crate) struct CallGuard {
    pending: Arc<PendingTable>,
    subscriptions: Arc<SubscriptionManager>,
    errors: broadcast::Sender<ClientError>,
    rid: String,
    topic: String,
    armed: bool,
}

impl CallGuard {
    pub(crate) fn new(
        pending: Arc<PendingTable>,
        subscriptions: Arc<SubscriptionManager>,
        errors: broadcast::Sender<ClientError>,
        rid: String,
        topic: String,
    ) -> Self {
        Self {
            pending,
            subscriptions,
            errors,
            rid,
            topic,
            armed: true,
        }
    }

    pub(crate) async fn finish(mut self) {
        self.armed = false;
        self.pending.remove(&self.rid);
        if let Err(err) = self.subscriptions.release(&self.topic).await {
            report(&self.errors, err);
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.pending.remove(&self.rid);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(topic = %self.topic, "no runtime to release abandoned call subscription");
            return;
        };
        let subscriptions = Arc::clone(&self.subscriptions);
        let errors = self.errors.clone();
        let topic = std::mem::take(&mut self.topic);
        handle.spawn(async move {
            if let Err(err) = subscriptions.release(&topic).await {
                report(&errors, err);
            }
        });
    }
}

/// Logs a background failure and fans it out to error listeners.
pub(crate) fn report(errors: &broadcast::Sender<ClientError>, err: ClientError) {
    tracing::warn!(error = %err, "background error");
    // No listener is not an error.
    let _ = errors.send(err);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingTransport;
    use crate::transport::SubscribeOptions;

    #[tokio::test]
    async fn resolves_exactly_once() {
        let table = PendingTable::new();
        let rx = table.insert("c:1", "sum");
        assert!(table.resolve("c:1", "sum", Ok(Value::from(5))));
        assert!(!table.resolve("c:1", "sum", Ok(Value::from(6))));
        assert_eq!(rx.await.unwrap().unwrap(), Value::from(5));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn response_for_other_name_is_ignored() {
        let table = PendingTable::new();
        let rx = table.insert("c:1", "sum");
        assert!(!table.resolve("c:1", "mul", Ok(Value::from(5))));
        assert!(table.contains("c:1"));
        assert!(table.resolve("c:1", "sum", Ok(Value::from(1))));
        assert_eq!(rx.await.unwrap().unwrap(), Value::from(1));
    }

    #[tokio::test]
    async fn unknown_rid_is_a_noop() {
        let table = PendingTable::new();
        assert!(!table.resolve("c:404", "sum", Ok(Value::Nil)));
        assert!(!table.remove("c:404"));
    }

    #[tokio::test]
    async fn fail_all_resolves_every_call() {
        let table = PendingTable::new();
        let a = table.insert("c:1", "sum");
        let b = table.insert("c:2", "sum");
        assert_eq!(table.fail_all(&ClientError::Closed), 2);
        assert_eq!(a.await.unwrap(), Err(ClientError::Closed));
        assert_eq!(b.await.unwrap(), Err(ClientError::Closed));
        assert_eq!(table.len(), 0);
    }

    fn guard_fixture() -> (
        Arc<RecordingTransport>,
        Arc<PendingTable>,
        Arc<SubscriptionManager>,
        broadcast::Sender<ClientError>,
    ) {
        let transport = Arc::new(RecordingTransport::new());
        let subscriptions = Arc::new(SubscriptionManager::new(transport.clone()));
        let (errors, _) = broadcast::channel(8);
        (transport, Arc::new(PendingTable::new()), subscriptions, errors)
    }

    #[tokio::test]
    async fn finish_removes_entry_and_releases_topic() {
        let (transport, pending, subscriptions, errors) = guard_fixture();
        subscriptions
            .acquire("sum/service-response/c", &SubscribeOptions::default())
            .await
            .unwrap();
        let _rx = pending.insert("c:1", "sum");
        let guard = CallGuard::new(
            Arc::clone(&pending),
            Arc::clone(&subscriptions),
            errors,
            "c:1".into(),
            "sum/service-response/c".into(),
        );
        guard.finish().await;
        assert!(!pending.contains("c:1"));
        assert_eq!(transport.unsubscribe_count("sum/service-response/c"), 1);
    }

    #[tokio::test]
    async fn dropped_guard_cleans_up_in_background() {
        let (transport, pending, subscriptions, errors) = guard_fixture();
        subscriptions
            .acquire("sum/service-response/c", &SubscribeOptions::default())
            .await
            .unwrap();
        let _rx = pending.insert("c:1", "sum");
        drop(CallGuard::new(
            Arc::clone(&pending),
            Arc::clone(&subscriptions),
            errors,
            "c:1".into(),
            "sum/service-response/c".into(),
        ));
        assert!(!pending.contains("c:1"));

        for _ in 0..10 {
            if subscriptions.count("sum/service-response/c").await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.unsubscribe_count("sum/service-response/c"), 1);
    }
}
