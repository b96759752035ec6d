use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tether_core::{HandlerError, Value};

use crate::error::ClientError;
use crate::params::Params;

/// Type-erased service handler.
pub(crate) type ServiceFn =
    Arc<dyn Fn(Params) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// Type-erased event handler. Its return value is ignored.
pub(crate) type EventFn = Arc<dyn Fn(Params) + Send + Sync>;

/// Role of a registered handler.
#[derive(Clone)]
pub(crate) enum Handler {
    Service(ServiceFn),
    Event(EventFn),
}

impl Handler {
    pub(crate) fn role(&self) -> &'static str {
        match self {
            Self::Service(_) => "service",
            Self::Event(_) => "event",
        }
    }
}

/// A registry entry: the handler and the topics subscribed on its behalf.
///
/// `generation` is unique per registration on a client, so a handle can tell
/// its own entry apart from a later one under the same name.
#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub(crate) handler: Handler,
    pub(crate) topics: Vec<String>,
    pub(crate) generation: u64,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("handler", &self.handler.role())
            .field("topics", &self.topics)
            .field("generation", &self.generation)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Name -> handler map shared by services and event subscriptions.
///
/// Services and events live in one namespace: a name registered as a
/// service cannot be subscribed as an event on the same instance, and vice
/// versa. At most one handler exists per name.
pub(crate) struct HandlerRegistry {
    handlers: DashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Inserts a handler, failing if the name is taken by either role.
    pub(crate) fn insert(&self, name: &str, entry: HandlerEntry) -> Result<(), ClientError> {
        match self.handlers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ClientError::AlreadyRegistered {
                name: name.to_string(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    /// Removes the service registered under `name`.
    pub(crate) fn remove_service(&self, name: &str) -> Result<HandlerEntry, ClientError> {
        self.remove_if(name, |entry| matches!(entry.handler, Handler::Service(_)))
    }

    /// Removes the event subscription registered under `name`.
    pub(crate) fn remove_event(&self, name: &str) -> Result<HandlerEntry, ClientError> {
        self.remove_if(name, |entry| matches!(entry.handler, Handler::Event(_)))
    }

    /// Removes `name` only if it is still the registration `generation`.
    pub(crate) fn remove_generation(
        &self,
        name: &str,
        generation: u64,
    ) -> Result<HandlerEntry, ClientError> {
        self.remove_if(name, |entry| entry.generation == generation)
    }

    fn remove_if(
        &self,
        name: &str,
        matches: impl Fn(&HandlerEntry) -> bool,
    ) -> Result<HandlerEntry, ClientError> {
        self.handlers
            .remove_if(name, |_, entry| matches(entry))
            .map(|(_, entry)| entry)
            .ok_or_else(|| ClientError::NotRegistered {
                name: name.to_string(),
            })
    }

    /// Removes and returns every entry.
    pub(crate) fn drain(&self) -> Vec<(String, HandlerEntry)> {
        let names: Vec<String> = self
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names
            .into_iter()
            .filter_map(|name| self.handlers.remove(&name))
            .collect()
    }

    pub(crate) fn service(&self, name: &str) -> Option<ServiceFn> {
        self.handlers
            .get(name)
            .and_then(|entry| match &entry.handler {
                Handler::Service(handler) => Some(Arc::clone(handler)),
                Handler::Event(_) => None,
            })
    }

    pub(crate) fn event(&self, name: &str) -> Option<EventFn> {
        self.handlers
            .get(name)
            .and_then(|entry| match &entry.handler {
                Handler::Event(handler) => Some(Arc::clone(handler)),
                Handler::Service(_) => None,
            })
    }

    pub(crate) fn role(&self, name: &str) -> Option<&'static str> {
        self.handlers.get(name).map(|entry| entry.handler.role())
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
