use std::sync::Arc;
use std::time::Duration;

use tether_core::{CodecFormat, DefaultTopicScheme, TopicScheme};

use crate::transport::{PublishOptions, QoS, SubscribeOptions};

/// Default call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Client-level configuration. Every field has a default.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Stable, addressable identity. `None` generates a random id.
    pub client_id: Option<String>,
    /// Wire format for outbound envelopes and expected format of inbound ones.
    pub codec: CodecFormat,
    /// Default time a `call` waits for its response.
    pub timeout: Duration,
    /// Mapping between names and topics.
    pub topics: Arc<dyn TopicScheme>,
    /// Options for every transport subscribe issued by the client.
    pub subscribe: SubscribeOptions,
    /// Options for every transport publish issued by the client.
    pub publish: PublishOptions,
    /// Capacity of the background error broadcast channel.
    pub error_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            codec: CodecFormat::Json,
            timeout: DEFAULT_CALL_TIMEOUT,
            topics: Arc::new(DefaultTopicScheme),
            subscribe: SubscribeOptions::default(),
            publish: PublishOptions::default(),
            error_channel_capacity: 64,
        }
    }
}

/// Which topic variants a registered service or event subscription listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Listen on the broadcast topic of the name.
    pub broadcast: bool,
    /// Listen on the topic directed to this instance.
    pub directed: bool,
    /// Overrides the configured subscribe QoS.
    pub qos: Option<QoS>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            broadcast: true,
            directed: true,
            qos: None,
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub qos: Option<QoS>,
}

impl CallOptions {
    #[must_use]
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            qos: None,
        }
    }
}

/// Per-emit overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmitOptions {
    pub qos: Option<QoS>,
    pub retain: bool,
}
