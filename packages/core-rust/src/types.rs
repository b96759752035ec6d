use std::fmt;

use serde::{Deserialize, Serialize};

use crate::topic::{validate_addressee, TopicError};

/// Dynamic value carried in request params, results, and error data.
///
/// `rmpv::Value` round-trips through both the JSON and the `MsgPack` codec,
/// which keeps one in-memory representation for every wire format.
pub use rmpv::Value;

/// Separator between the client id and the unique token of a request id.
pub const REQUEST_ID_DELIMITER: char = ':';

/// Globally unique identity of one local client instance.
///
/// Generated once per instance (random UUID v4) unless the caller supplies a
/// stable id to be addressable under a known name. It travels as the last
/// segment of directed topics and as the prefix of every request id, so it
/// must not contain `/` or `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Generates a fresh random client id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wraps a caller-supplied id after validating it is topic-safe.
    ///
    /// # Errors
    ///
    /// Returns `TopicError` if the id is empty, contains `/`, `:`, MQTT
    /// wildcards, or collides with a reserved topic segment.
    pub fn new(id: impl Into<String>) -> Result<Self, TopicError> {
        let id = id.into();
        validate_addressee(&id)?;
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of one outbound call: `<clientId>:<token>`.
///
/// The client id prefix is load-bearing: the callee extracts it to address
/// the response topic back to the exact calling instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a new request id owned by `client_id`.
    #[must_use]
    pub fn generate(client_id: &ClientId) -> Self {
        Self(format!(
            "{}{REQUEST_ID_DELIMITER}{}",
            client_id.as_str(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Client id segment of the request id (the substring before the first
    /// `:`). Returns `None` when the id carries no usable prefix.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.0
            .split_once(REQUEST_ID_DELIMITER)
            .map(|(client, _)| client)
            .filter(|client| !client.is_empty())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn generated_client_ids_are_topic_safe_and_distinct() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_ne!(a, b);
        assert!(ClientId::new(a.as_str()).is_ok());
    }

    #[test]
    fn client_id_rejects_delimiters() {
        assert!(ClientId::new("").is_err());
        assert!(ClientId::new("a/b").is_err());
        assert!(ClientId::new("a:b").is_err());
        assert!(ClientId::new("a+").is_err());
        assert!(ClientId::new("node-1").is_ok());
    }

    #[test]
    fn request_id_carries_client_prefix() {
        let client = ClientId::new("caller-7").unwrap();
        let rid = RequestId::generate(&client);
        assert!(rid.as_str().starts_with("caller-7:"));
        assert_eq!(rid.client_id(), Some("caller-7"));
    }

    #[test]
    fn request_ids_are_unique_per_instance() {
        let client = ClientId::generate();
        let ids: HashSet<_> = (0..1000).map(|_| RequestId::generate(&client)).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn request_id_without_prefix_has_no_client() {
        assert_eq!(RequestId::from("no-delimiter").client_id(), None);
        assert_eq!(RequestId::from(":token").client_id(), None);
    }

    #[test]
    fn client_id_serializes_as_plain_string() {
        let id = ClientId::new("n1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"n1\"");
    }
}
