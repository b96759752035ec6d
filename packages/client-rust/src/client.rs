//! The public client: service registration, event subscriptions, calls and
//! emits over one transport connection.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::{
    ClientId, Codec, CodecError, Envelope, HandlerError, Payload, RequestId, RpcError, Value,
};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument};

use crate::config::{CallOptions, ClientConfig, EmitOptions, HandlerOptions};
use crate::error::ClientError;
use crate::params::Params;
use crate::pending::{report, CallGuard, PendingTable};
use crate::registry::{EventFn, Handler, HandlerEntry, HandlerRegistry, ServiceFn};
use crate::router;
use crate::subscriptions::SubscriptionManager;
use crate::transport::{InboundMessage, PublishOptions, QoS, SubscribeOptions, Transport};

// ---------------------------------------------------------------------------
// ClientInner
// ---------------------------------------------------------------------------

/// State owned by one client instance and shared with its router and
/// handles.
pub(crate) struct ClientInner {
    pub(crate) client_id: ClientId,
    pub(crate) config: ClientConfig,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) subscriptions: Arc<SubscriptionManager>,
    pub(crate) pending: Arc<PendingTable>,
    pub(crate) errors: broadcast::Sender<ClientError>,
    // Runtime current at construction, used when dispatch runs elsewhere.
    runtime: Option<Handle>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl ClientInner {
    /// The runtime service handlers are spawned on: the current one, or the
    /// one the client was created in.
    pub(crate) fn runtime(&self) -> Option<Handle> {
        Handle::try_current().ok().or_else(|| self.runtime.clone())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    fn subscribe_options(&self, qos: Option<QoS>) -> SubscribeOptions {
        SubscribeOptions {
            qos: qos.unwrap_or(self.config.subscribe.qos),
        }
    }

    fn publish_options(&self, qos: Option<QoS>, retain: bool) -> PublishOptions {
        PublishOptions {
            qos: qos.unwrap_or(self.config.publish.qos),
            retain: retain || self.config.publish.retain,
        }
    }

    fn validate_target(&self, name: &str, addressee: Option<&str>) -> Result<(), ClientError> {
        self.config.topics.validate_name(name)?;
        if let Some(addressee) = addressee {
            self.config.topics.validate_addressee(addressee)?;
        }
        Ok(())
    }

    /// Inserts `handler` and subscribes its topics, rolling back on failure
    /// or when abandoned. Returns the generation of the new entry.
    async fn install(
        &self,
        name: &str,
        handler: Handler,
        topics: Vec<String>,
        qos: Option<QoS>,
    ) -> Result<u64, ClientError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.registry.insert(
            name,
            HandlerEntry {
                handler,
                topics: topics.clone(),
                generation,
            },
        )?;
        let mut rollback = InstallRollback {
            inner: self,
            name,
            generation,
            acquired: Vec::with_capacity(topics.len()),
            armed: true,
        };
        let opts = self.subscribe_options(qos);
        for topic in topics {
            if let Err(err) = self.subscriptions.acquire(&topic, &opts).await {
                rollback.armed = false;
                for topic in std::mem::take(&mut rollback.acquired) {
                    if let Err(release_err) = self.subscriptions.release(&topic).await {
                        report(&self.errors, release_err);
                    }
                }
                let _ = self.registry.remove_generation(name, generation);
                return Err(err);
            }
            rollback.acquired.push(topic);
        }
        rollback.armed = false;
        Ok(generation)
    }

    async fn release_topics(&self, entry: HandlerEntry) -> Result<(), ClientError> {
        let mut first_failure = None;
        for topic in &entry.topics {
            if let Err(err) = self.subscriptions.release(topic).await {
                first_failure.get_or_insert(err);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    async fn unregister(&self, name: &str) -> Result<(), ClientError> {
        self.ensure_open()?;
        let entry = self.registry.remove_service(name)?;
        tracing::debug!(name, "service unregistered");
        self.release_topics(entry).await
    }

    async fn unsubscribe(&self, name: &str) -> Result<(), ClientError> {
        self.ensure_open()?;
        let entry = self.registry.remove_event(name)?;
        tracing::debug!(name, "event unsubscribed");
        self.release_topics(entry).await
    }

    /// Removes the registration a handle was issued for, leaving any newer
    /// registration of the same name alone.
    async fn release_handle(&self, name: &str, generation: u64) -> Result<(), ClientError> {
        self.ensure_open()?;
        let entry = self.registry.remove_generation(name, generation)?;
        tracing::debug!(name, role = entry.handler.role(), "handler released");
        self.release_topics(entry).await
    }

    async fn call(
        &self,
        name: &str,
        rid: &RequestId,
        addressee: Option<&str>,
        opts: CallOptions,
        params: Vec<Value>,
    ) -> Result<Value, ClientError> {
        let timeout = opts.timeout.unwrap_or(self.config.timeout);
        let payload = self.codec.encode(&Envelope::Request {
            id: rid.clone(),
            name: name.to_string(),
            params,
        })?;
        let response_topic = self
            .config
            .topics
            .response_topic(name, self.client_id.as_str());
        let request_topic = self.config.topics.request_topic(name, addressee);

        // The response topic is live before the request can be answered.
        self.subscriptions
            .acquire(&response_topic, &self.subscribe_options(opts.qos))
            .await?;
        let mut rx = self.pending.insert(rid.as_str(), name);
        let guard = CallGuard::new(
            Arc::clone(&self.pending),
            Arc::clone(&self.subscriptions),
            self.errors.clone(),
            rid.as_str().to_string(),
            response_topic,
        );

        let publish_opts = self.publish_options(opts.qos, false);
        let exchange = async {
            if let Err(err) = self
                .transport
                .publish(&request_topic, payload, &publish_opts)
                .await
            {
                return Err(ClientError::Transport(err));
            }
            (&mut rx).await.unwrap_or(Err(ClientError::Closed))
        };
        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            // Whoever removes the entry first owns the outcome.
            Err(_elapsed) if self.pending.remove(rid.as_str()) => Err(ClientError::Timeout {
                name: name.to_string(),
                timeout_ms: duration_ms(timeout),
            }),
            Err(_elapsed) => rx.await.unwrap_or(Err(ClientError::Closed)),
        };
        guard.finish().await;
        result
    }

    async fn emit(
        &self,
        name: &str,
        addressee: Option<&str>,
        opts: EmitOptions,
        params: Vec<Value>,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.validate_target(name, addressee)?;
        let payload = self.codec.encode(&Envelope::Notification {
            name: name.to_string(),
            params,
        })?;
        let topic = self.config.topics.event_topic(name, addressee);
        self.transport
            .publish(&topic, payload, &self.publish_options(opts.qos, opts.retain))
            .await?;
        tracing::debug!(topic = %topic, "event emitted");
        Ok(())
    }
}

/// Undoes a partial [`ClientInner::install`] whose future was dropped.
struct InstallRollback<'a> {
    inner: &'a ClientInner,
    name: &'a str,
    generation: u64,
    acquired: Vec<String>,
    armed: bool,
}

impl Drop for InstallRollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let _ = self
            .inner
            .registry
            .remove_generation(self.name, self.generation);
        let topics = std::mem::take(&mut self.acquired);
        if topics.is_empty() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            tracing::warn!(name = self.name, "no runtime to release abandoned registration");
            return;
        };
        let subscriptions = Arc::clone(&self.inner.subscriptions);
        let errors = self.inner.errors.clone();
        handle.spawn(async move {
            for topic in topics {
                if let Err(err) = subscriptions.release(&topic).await {
                    report(&errors, err);
                }
            }
        });
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

// ---------------------------------------------------------------------------
// RpcClient
// ---------------------------------------------------------------------------

/// Aborts the router task when the last client handle goes away.
struct RouterTask(Mutex<Option<JoinHandle<()>>>);

impl RouterTask {
    fn abort(&self) {
        if let Some(handle) = self.0.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for RouterTask {
    fn drop(&mut self) {
        self.abort();
    }
}

/// RPC and event client over a topic pub/sub transport.
///
/// Cloning yields another handle to the same instance: one client id, one
/// registry, one pending-request table and one set of subscriptions.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
    router: Arc<RouterTask>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("client_id", &self.inner.client_id)
            .field("codec", &self.inner.config.codec)
            .field("handlers", &self.inner.registry.len())
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.inner.is_closed())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Creates a client without a router. Inbound messages must be fed in
    /// through [`RpcClient::dispatch`].
    ///
    /// When called inside a Tokio runtime, that runtime is remembered and
    /// runs service handlers for messages dispatched from other threads.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTopic` when the configured client id cannot be used
    /// as a topic segment.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self, ClientError> {
        let client_id = match config.client_id.as_deref() {
            Some(id) => {
                config.topics.validate_addressee(id)?;
                ClientId::new(id)?
            }
            None => ClientId::generate(),
        };
        let (errors, _) = broadcast::channel(config.error_channel_capacity.max(1));
        let inner = ClientInner {
            client_id,
            codec: config.codec.codec(),
            subscriptions: Arc::new(SubscriptionManager::new(Arc::clone(&transport))),
            pending: Arc::new(PendingTable::new()),
            registry: HandlerRegistry::new(),
            transport,
            errors,
            config,
            runtime: Handle::try_current().ok(),
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        };
        tracing::debug!(client_id = %inner.client_id, codec = %inner.config.codec, "client created");
        Ok(Self {
            inner: Arc::new(inner),
            router: Arc::new(RouterTask(Mutex::new(None))),
        })
    }

    /// Creates a client and spawns a router draining `inbound`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::new`].
    pub fn start(
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundMessage>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let client = Self::new(transport, config)?;
        let handle = router::spawn_router(Arc::clone(&client.inner), inbound);
        *client.router.0.lock() = Some(handle);
        Ok(client)
    }

    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Subscribes to background errors: undecodable inbound payloads,
    /// unroutable requests, failed response publishes and failed releases.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<ClientError> {
        self.inner.errors.subscribe()
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Routes one inbound transport message.
    ///
    /// Never fails: messages that are not for this instance are ignored and
    /// undecodable payloads are reported on [`RpcClient::errors`]. May be
    /// called from any thread. Requests are served on the current runtime or
    /// the one the client was created in; without either they are reported
    /// as `NoRuntime` and dropped.
    pub fn dispatch(&self, topic: &str, payload: impl Into<Payload>) {
        router::dispatch(&self.inner, InboundMessage::new(topic, payload));
    }

    // -- services ------------------------------------------------------------

    /// Registers a service on the broadcast and directed request topics.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::register_with`].
    pub async fn register<F, Fut, R, E>(
        &self,
        name: &str,
        handler: F,
    ) -> Result<Registration, ClientError>
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + 'static,
        E: Into<HandlerError> + 'static,
    {
        self.register_with(name, HandlerOptions::default(), handler)
            .await
    }

    /// Registers a service, resolving once its request topics are subscribed.
    ///
    /// The handler's result is converted into the response `Value`; its
    /// error is normalized into the structured error the caller receives.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` when `name` is taken by a service or an event
    /// subscription, `InvalidTopic` for an unusable name, `Transport` when a
    /// subscribe fails (nothing stays registered), `Closed` after close.
    pub async fn register_with<F, Fut, R, E>(
        &self,
        name: &str,
        opts: HandlerOptions,
        handler: F,
    ) -> Result<Registration, ClientError>
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + 'static,
        E: Into<HandlerError> + 'static,
    {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.validate_target(name, None)?;

        let service: ServiceFn = Arc::new(move |params| {
            let fut = handler(params);
            async move {
                let value = fut.await.map_err(Into::<HandlerError>::into)?;
                rmpv::ext::to_value(value).map_err(|err| {
                    HandlerError::Structured(RpcError::internal(format!(
                        "result not representable: {err}"
                    )))
                })
            }
            .boxed()
        });

        let mut topics = Vec::with_capacity(2);
        if opts.broadcast {
            topics.push(inner.config.topics.request_topic(name, None));
        }
        if opts.directed {
            topics.push(
                inner
                    .config
                    .topics
                    .request_topic(name, Some(inner.client_id.as_str())),
            );
        }
        let generation = inner
            .install(name, Handler::Service(service), topics, opts.qos)
            .await?;
        tracing::debug!(name, "service registered");
        Ok(Registration {
            handle: HandleState::new(&self.inner, name, generation),
        })
    }

    /// Unregisters the service `name` and releases its request topics.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if no service of that name is registered.
    pub async fn unregister(&self, name: &str) -> Result<(), ClientError> {
        self.inner.unregister(name).await
    }

    // -- events --------------------------------------------------------------

    /// Subscribes to the broadcast and directed notice topics of `name`.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::subscribe_with`].
    pub async fn subscribe<F>(&self, name: &str, handler: F) -> Result<Subscription, ClientError>
    where
        F: Fn(Params) + Send + Sync + 'static,
    {
        self.subscribe_with(name, HandlerOptions::default(), handler)
            .await
    }

    /// Subscribes an event handler. It runs inline on the dispatch path and
    /// nothing is ever published in reply.
    ///
    /// # Errors
    ///
    /// Same conditions as [`RpcClient::register_with`].
    pub async fn subscribe_with<F>(
        &self,
        name: &str,
        opts: HandlerOptions,
        handler: F,
    ) -> Result<Subscription, ClientError>
    where
        F: Fn(Params) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.validate_target(name, None)?;

        let event: EventFn = Arc::new(handler);
        let mut topics = Vec::with_capacity(2);
        if opts.broadcast {
            topics.push(inner.config.topics.event_topic(name, None));
        }
        if opts.directed {
            topics.push(
                inner
                    .config
                    .topics
                    .event_topic(name, Some(inner.client_id.as_str())),
            );
        }
        let generation = inner
            .install(name, Handler::Event(event), topics, opts.qos)
            .await?;
        tracing::debug!(name, "event subscribed");
        Ok(Subscription {
            handle: HandleState::new(&self.inner, name, generation),
        })
    }

    /// Removes the event subscription `name` and releases its topics.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if no event subscription of that name exists.
    pub async fn unsubscribe(&self, name: &str) -> Result<(), ClientError> {
        self.inner.unsubscribe(name).await
    }

    /// Broadcasts an event to every subscriber of `name`.
    ///
    /// # Errors
    ///
    /// `InvalidTopic`, `Codec` when a parameter cannot be encoded,
    /// `Transport` when the publish fails.
    pub async fn notify(&self, name: &str, params: Vec<Value>) -> Result<(), ClientError> {
        self.inner
            .emit(name, None, EmitOptions::default(), params)
            .await
    }

    /// Publishes an event, directed to `addressee` when given.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::notify`].
    pub async fn emit(
        &self,
        name: &str,
        addressee: Option<&str>,
        opts: EmitOptions,
        params: Vec<Value>,
    ) -> Result<(), ClientError> {
        self.inner.emit(name, addressee, opts, params).await
    }

    /// Sends an event to exactly one instance.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::notify`].
    pub async fn control(
        &self,
        name: &str,
        addressee: &str,
        params: Vec<Value>,
    ) -> Result<(), ClientError> {
        self.inner
            .emit(name, Some(addressee), EmitOptions::default(), params)
            .await
    }

    // -- calls ---------------------------------------------------------------

    /// Calls the service `name` on whichever instance serves it.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call_with`].
    pub async fn call(&self, name: &str, params: Vec<Value>) -> Result<Value, ClientError> {
        self.call_with(name, None, CallOptions::default(), params)
            .await
    }

    /// Calls the service `name`, directed to `addressee` when given, and
    /// waits for its single response.
    ///
    /// Dropping the returned future abandons the call; its pending entry and
    /// response subscription are cleaned up in the background.
    ///
    /// # Errors
    ///
    /// `Remote` with the callee's error (MethodNotFound included), `Timeout`
    /// when no response arrives in time, `Transport` when the subscribe or
    /// publish fails, `Codec` when a parameter cannot be encoded,
    /// `InvalidTopic`, and `Closed` when the client closes first.
    pub async fn call_with(
        &self,
        name: &str,
        addressee: Option<&str>,
        opts: CallOptions,
        params: Vec<Value>,
    ) -> Result<Value, ClientError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.validate_target(name, addressee)?;

        let rid = RequestId::generate(&inner.client_id);
        let span = info_span!(
            "rpc_call",
            name,
            rid = %rid,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        async {
            let start = Instant::now();
            let result = inner.call(name, &rid, addressee, opts, params).await;

            let outcome = match &result {
                Ok(_) => "ok",
                Err(ClientError::Timeout { .. }) => "timeout",
                Err(ClientError::Remote(_)) => "remote_error",
                Err(_) => "error",
            };
            let duration_ms = duration_ms(start.elapsed());
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", outcome);
            tracing::debug!(name, rid = %rid, duration_ms, outcome, "call complete");
            result
        }
        .instrument(span)
        .await
    }

    /// Calls `name` and decodes the result into `T`.
    ///
    /// # Errors
    ///
    /// Everything [`RpcClient::call`] returns, plus `Codec` when the result
    /// does not have the shape of `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        name: &str,
        params: Vec<Value>,
    ) -> Result<T, ClientError> {
        let value = self.call(name, params).await?;
        rmpv::ext::from_value(value).map_err(|err| {
            ClientError::Codec(CodecError::Decode {
                format: self.inner.config.codec,
                reason: format!("result of {name}: {err}"),
            })
        })
    }

    /// Shuts the client down.
    ///
    /// Stops the router, fails every pending call with `Closed`, unsubscribes
    /// every remaining topic once and clears the registry. Later operations
    /// fail with `Closed`. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.router.abort();
        let failed = self.inner.pending.fail_all(&ClientError::Closed);
        let handlers = self.inner.registry.drain().len();
        for err in self.inner.subscriptions.release_all().await {
            report(&self.inner.errors, err);
        }
        tracing::debug!(
            client_id = %self.inner.client_id,
            failed_calls = failed,
            handlers,
            "client closed"
        );
    }
}

// ---------------------------------------------------------------------------
// Registration / Subscription
// ---------------------------------------------------------------------------

/// What a handle releases: one registration, identified by its generation.
struct HandleState {
    inner: Arc<ClientInner>,
    name: String,
    generation: u64,
}

impl HandleState {
    fn new(inner: &Arc<ClientInner>, name: &str, generation: u64) -> Self {
        Self {
            inner: Arc::clone(inner),
            name: name.to_string(),
            generation,
        }
    }

    async fn release(&self) -> Result<(), ClientError> {
        self.inner.release_handle(&self.name, self.generation).await
    }
}

/// Handle to a registered service. Dropping it keeps the service registered.
pub struct Registration {
    handle: HandleState,
}

impl Registration {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// Unregisters the service.
    ///
    /// # Errors
    ///
    /// `NotRegistered` on a second release, or when this registration was
    /// already removed through [`RpcClient::unregister`]. A later
    /// registration of the same name is never touched.
    pub async fn unregister(&self) -> Result<(), ClientError> {
        self.handle.release().await
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.handle.name)
            .finish_non_exhaustive()
    }
}

/// Handle to an event subscription. Dropping it keeps the subscription.
pub struct Subscription {
    handle: HandleState,
}

impl Subscription {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// Removes the event subscription.
    ///
    /// # Errors
    ///
    /// `NotRegistered` on a second release, or when this subscription was
    /// already removed.
    pub async fn unsubscribe(&self) -> Result<(), ClientError> {
        self.handle.release().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.handle.name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
