//! Test doubles shared by the unit tests of this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::Payload;

use crate::transport::{PublishOptions, SubscribeOptions, Transport, TransportError};

/// A transport operation as observed by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Publish(String, Payload),
    Subscribe(String),
    Unsubscribe(String),
}

/// Transport that records every call and delivers nothing. Failures and
/// slow subscribes are injected on demand.
#[derive(Debug, Default)]
pub(crate) struct RecordingTransport {
    calls: Mutex<Vec<Call>>,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    subscribe_delay: Mutex<Option<Duration>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Holds every later subscribe acknowledgment back by `delay`.
    pub(crate) fn delay_subscribe(&self, delay: Duration) {
        *self.subscribe_delay.lock() = Some(delay);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn published(&self) -> Vec<(String, Payload)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Publish(topic, payload) => Some((topic.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn subscribe_count(&self, topic: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, Call::Subscribe(t) if t == topic))
            .count()
    }

    pub(crate) fn unsubscribe_count(&self, topic: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, Call::Unsubscribe(t) if t == topic))
            .count()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        _opts: &PublishOptions,
    ) -> Result<(), TransportError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".into(),
            });
        }
        self.calls
            .lock()
            .push(Call::Publish(topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _opts: &SubscribeOptions) -> Result<(), TransportError> {
        let delay = *self.subscribe_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "injected failure".into(),
            });
        }
        self.calls.lock().push(Call::Subscribe(topic.to_string()));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Unsubscribe(topic.to_string()));
        Ok(())
    }
}
