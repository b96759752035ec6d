//! Inbound message routing.
//!
//! Every inbound `(topic, payload)` goes through [`dispatch`], which decides
//! in a fixed order:
//!
//! 1. classify the topic as event notice, service request or service
//!    response, otherwise ignore it;
//! 2. ignore directed topics addressed to another instance;
//! 3. decode the payload, reporting and dropping it on failure;
//! 4. hand the envelope to the event handler, the service handler or the
//!    pending-request table, ignoring envelopes whose kind does not belong
//!    to the topic family they arrived on.
//!
//! Dispatch never blocks. Service handlers run on their own task, so a slow
//! handler never delays routing of later messages. That task is spawned on
//! the client's runtime, which lets dispatch run on foreign threads.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use tether_core::{ClientId, Envelope, RequestId, RpcError, TopicFamily, TopicMatch, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument};

use crate::client::ClientInner;
use crate::error::ClientError;
use crate::params::{InvocationInfo, Params};
use crate::pending::report;
use crate::transport::InboundMessage;

/// Drains `inbound` until the transport closes it.
pub(crate) fn spawn_router(
    inner: Arc<ClientInner>,
    mut inbound: mpsc::Receiver<InboundMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            if inner.is_closed() {
                break;
            }
            dispatch(&inner, message);
        }
        tracing::debug!(client_id = %inner.client_id, "router stopped");
    })
}

pub(crate) fn dispatch(inner: &Arc<ClientInner>, message: InboundMessage) {
    if inner.is_closed() {
        return;
    }
    let Some((family, matched)) = inner.config.topics.classify(&message.topic) else {
        tracing::trace!(topic = %message.topic, "ignoring non-rpc topic");
        return;
    };
    if let Some(addressee) = matched.addressee.as_deref() {
        if addressee != inner.client_id.as_str() {
            tracing::debug!(topic = %message.topic, "ignoring message addressed to another instance");
            return;
        }
    }

    let envelope = match inner.codec.decode(&message.payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            report(&inner.errors, ClientError::Codec(err));
            return;
        }
    };

    match (family, envelope) {
        (TopicFamily::EventNotice, Envelope::Notification { name, params }) => {
            if name == matched.name {
                deliver_event(inner, matched, params);
            } else {
                ignore_cross_talk(&message.topic, "notification", &name);
            }
        }
        (TopicFamily::ServiceRequest, Envelope::Request { id, name, params }) => {
            if name == matched.name {
                serve(inner, matched, id, params);
            } else {
                ignore_cross_talk(&message.topic, "request", &name);
            }
        }
        (TopicFamily::ServiceResponse, Envelope::Success { id, result }) => {
            resolve(inner, &matched, &id, Ok(result));
        }
        (TopicFamily::ServiceResponse, Envelope::Error { id, error }) => {
            resolve(inner, &matched, &id, Err(ClientError::Remote(error)));
        }
        (family, envelope) => {
            tracing::debug!(
                topic = %message.topic,
                ?family,
                kind = envelope.kind(),
                "ignoring envelope that does not belong to its topic family"
            );
        }
    }
}

fn ignore_cross_talk(topic: &str, kind: &str, method: &str) {
    tracing::debug!(topic, kind, method, "ignoring envelope for another name");
}

fn deliver_event(inner: &Arc<ClientInner>, matched: TopicMatch, values: Vec<Value>) {
    let Some(handler) = inner.registry.event(&matched.name) else {
        tracing::debug!(
            name = %matched.name,
            role = ?inner.registry.role(&matched.name),
            "no event subscription; dropping notification"
        );
        return;
    };
    let params = Params::new(
        values,
        InvocationInfo {
            name: matched.name,
            sender: None,
            receiver: matched.addressee,
        },
    );
    let name = params.info().name.clone();
    if std::panic::catch_unwind(AssertUnwindSafe(|| handler(params))).is_err() {
        tracing::warn!(name = %name, "event handler panicked");
    }
}

fn resolve(
    inner: &Arc<ClientInner>,
    matched: &TopicMatch,
    rid: &RequestId,
    outcome: Result<Value, ClientError>,
) {
    if !inner.pending.resolve(rid.as_str(), &matched.name, outcome) {
        tracing::debug!(
            name = %matched.name,
            rid = %rid,
            "ignoring response with no matching pending call"
        );
    }
}

fn serve(inner: &Arc<ClientInner>, matched: TopicMatch, rid: RequestId, values: Vec<Value>) {
    let Some(runtime) = inner.runtime() else {
        report(
            &inner.errors,
            ClientError::NoRuntime {
                name: matched.name,
            },
        );
        return;
    };
    let inner = Arc::clone(inner);
    let span = info_span!(
        "rpc_serve",
        name = %matched.name,
        rid = %rid,
        duration_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    runtime.spawn(
        async move {
            let start = Instant::now();
            let name = matched.name.clone();
            let outcome = invoke(&inner, matched, &rid, values).await;

            let label = match &outcome {
                Ok(_) => "ok",
                Err(err) if err.is_method_not_found() => "not_found",
                Err(_) => "error",
            };
            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", label);

            respond(&inner, &name, rid, outcome).await;
        }
        .instrument(span),
    );
}

async fn invoke(
    inner: &Arc<ClientInner>,
    matched: TopicMatch,
    rid: &RequestId,
    values: Vec<Value>,
) -> Result<Value, RpcError> {
    let Some(handler) = inner.registry.service(&matched.name) else {
        tracing::debug!(
            name = %matched.name,
            role = ?inner.registry.role(&matched.name),
            "no service registered"
        );
        return Err(RpcError::method_not_found(&matched.name));
    };
    let params = Params::new(
        values,
        InvocationInfo {
            sender: rid.client_id().and_then(|id| ClientId::new(id).ok()),
            name: matched.name,
            receiver: matched.addressee,
        },
    );
    // The handler runs on its own task so a panic surfaces as a JoinError.
    match tokio::spawn(async move { handler(params).await }).await {
        Ok(result) => result.map_err(tether_core::HandlerError::into_rpc_error),
        Err(err) => {
            tracing::warn!(error = %err, "service handler panicked");
            Err(RpcError::internal("handler panicked"))
        }
    }
}

async fn respond(
    inner: &Arc<ClientInner>,
    name: &str,
    rid: RequestId,
    outcome: Result<Value, RpcError>,
) {
    let Some(caller) = rid
        .client_id()
        .filter(|id| inner.config.topics.validate_addressee(id).is_ok())
    else {
        report(
            &inner.errors,
            ClientError::Unroutable {
                id: rid.as_str().to_string(),
            },
        );
        return;
    };
    let topic = inner.config.topics.response_topic(name, caller);

    let envelope = match outcome {
        Ok(result) => Envelope::Success {
            id: rid.clone(),
            result,
        },
        Err(error) => Envelope::Error {
            id: rid.clone(),
            error,
        },
    };
    let payload = match inner.codec.encode(&envelope) {
        Ok(payload) => payload,
        Err(err) => {
            report(&inner.errors, ClientError::Codec(err.clone()));
            // The caller still gets an answer instead of waiting for its timeout.
            let fallback = Envelope::Error {
                id: rid,
                error: RpcError::internal("response encoding failed")
                    .with_data(Value::from(err.to_string())),
            };
            match inner.codec.encode(&fallback) {
                Ok(payload) => payload,
                Err(err) => {
                    report(&inner.errors, ClientError::Codec(err));
                    return;
                }
            }
        }
    };

    if let Err(err) = inner
        .transport
        .publish(&topic, payload, &inner.config.publish)
        .await
    {
        report(&inner.errors, ClientError::Transport(err));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tether_core::{Codec, JsonCodec, Payload};

    use super::*;
    use crate::client::RpcClient;
    use crate::config::ClientConfig;
    use crate::test_support::RecordingTransport;

    fn client(transport: &Arc<RecordingTransport>) -> RpcClient {
        let config = ClientConfig {
            client_id: Some("me".into()),
            ..ClientConfig::default()
        };
        RpcClient::new(transport.clone(), config).unwrap()
    }

    fn json(envelope: &Envelope) -> Payload {
        JsonCodec.encode(envelope).unwrap()
    }

    fn request(id: &str, name: &str, params: Vec<Value>) -> Payload {
        json(&Envelope::Request {
            id: RequestId::from(id),
            name: name.into(),
            params,
        })
    }

    async fn wait_for_publish(transport: &RecordingTransport) -> (String, Envelope) {
        for _ in 0..50 {
            if let Some((topic, payload)) = transport.published().pop() {
                return (topic, JsonCodec.decode(&payload).unwrap());
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("nothing published");
    }

    #[tokio::test]
    async fn request_for_unknown_name_gets_method_not_found() {
        let transport = Arc::new(RecordingTransport::new());
        let client = client(&transport);
        client.dispatch("nosuch/service-request", request("caller:1", "nosuch", vec![]));

        let (topic, envelope) = wait_for_publish(&transport).await;
        assert_eq!(topic, "nosuch/service-response/caller");
        match envelope {
            Envelope::Error { id, error } => {
                assert_eq!(id.as_str(), "caller:1");
                assert!(error.is_method_not_found());
                assert_eq!(error.data, Some(Value::from("nosuch")));
            }
            other => panic!("expected error envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_goes_to_topic_derived_from_request_id() {
        let transport = Arc::new(RecordingTransport::new());
        let client = client(&transport);
        client
            .register("sum", |p: Params| async move {
                Ok::<_, tether_core::HandlerError>(p.arg::<i64>(0)? + p.arg::<i64>(1)?)
            })
            .await
            .unwrap();

        client.dispatch(
            "sum/service-request/me",
            request("other:7", "sum", crate::params![2, 3]),
        );
        let (topic, envelope) = wait_for_publish(&transport).await;
        assert_eq!(topic, "sum/service-response/other");
        assert_eq!(
            envelope,
            Envelope::Success {
                id: RequestId::from("other:7"),
                result: Value::from(5),
            }
        );
    }

    #[tokio::test]
    async fn panicking_handler_answers_internal_error() {
        let transport = Arc::new(RecordingTransport::new());
        let client = client(&transport);
        client
            .register("explode", |_p: Params| async move {
                if true {
                    panic!("kaboom");
                }
                Ok::<Value, tether_core::HandlerError>(Value::Nil)
            })
            .await
            .unwrap();

        client.dispatch("explode/service-request", request("c:1", "explode", vec![]));
        let (_, envelope) = wait_for_publish(&transport).await;
        match envelope {
            Envelope::Error { error, .. } => assert_eq!(error.message, "handler panicked"),
            other => panic!("expected error envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_without_client_prefix_is_unroutable() {
        let transport = Arc::new(RecordingTransport::new());
        let client = client(&transport);
        let mut errors = client.errors();
        client.dispatch("nosuch/service-request", request("no-prefix", "nosuch", vec![]));

        let err = tokio::time::timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err, ClientError::Unroutable { id: "no-prefix".into() });
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn messages_for_other_instances_are_ignored() {
        let transport = Arc::new(RecordingTransport::new());
        let client = client(&transport);
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        client
            .subscribe("tick", move |_p: Params| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        let notice = json(&Envelope::Notification {
            name: "tick".into(),
            params: vec![],
        });
        client.dispatch("tick/event-notice/someone-else", notice.clone());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        client.dispatch("tick/event-notice/me", notice.clone());
        client.dispatch("tick/event-notice", notice);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn envelope_on_wrong_family_is_ignored() {
        let transport = Arc::new(RecordingTransport::new());
        let client = client(&transport);
        let mut errors = client.errors();

        // A request arriving on an event topic is cross-talk, not an error.
        client.dispatch("tick/event-notice", request("c:1", "tick", vec![]));
        tokio::task::yield_now().await;
        assert!(transport.published().is_empty());
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn undecodable_payload_is_reported_and_dropped() {
        let transport = Arc::new(RecordingTransport::new());
        let client = client(&transport);
        let mut errors = client.errors();
        client.dispatch("sum/service-request", Payload::from("{not json"));
        let err = errors.try_recv().unwrap();
        assert!(matches!(err, ClientError::Codec(ref e) if e.is_decode()));
    }

    #[tokio::test]
    async fn panicking_event_handler_does_not_stop_dispatch() {
        let transport = Arc::new(RecordingTransport::new());
        let client = client(&transport);
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        client
            .subscribe("tick", move |_p: Params| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first delivery explodes");
                }
            })
            .await
            .unwrap();
        let notice = json(&Envelope::Notification {
            name: "tick".into(),
            params: vec![],
        });
        client.dispatch("tick/event-notice", notice.clone());
        client.dispatch("tick/event-notice", notice);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
