//! Topic scheme: maps logical names (plus an optional addressee) onto
//! pub/sub topic strings and matches inbound topics back.
//!
//! Three topic families exist:
//!
//! | family           | broadcast                  | directed                               |
//! |------------------|----------------------------|----------------------------------------|
//! | event notice     | `<name>/event-notice`      | `<name>/event-notice/<clientId>`       |
//! | service request  | `<name>/service-request`   | `<name>/service-request/<clientId>`    |
//! | service response | n/a                        | `<name>/service-response/<clientId>`   |
//!
//! A topic produced for one family is never accepted by the matcher of
//! another. Custom schemes implement [`TopicScheme`] and must keep that
//! property.

use std::fmt;

/// Marker segment of event-notice topics.
pub const EVENT_NOTICE: &str = "event-notice";
/// Marker segment of service-request topics.
pub const SERVICE_REQUEST: &str = "service-request";
/// Marker segment of service-response topics.
pub const SERVICE_RESPONSE: &str = "service-response";

const RESERVED_SEGMENTS: [&str; 3] = [EVENT_NOTICE, SERVICE_REQUEST, SERVICE_RESPONSE];

/// Characters with transport meaning that may not appear in names or ids.
const FORBIDDEN_CHARS: [char; 3] = ['+', '#', '\0'];

/// Errors from validating names and addressees.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("name {name:?} contains an empty topic segment")]
    EmptySegment { name: String },
    #[error("{value:?} contains forbidden character {ch:?}")]
    ForbiddenCharacter { value: String, ch: char },
    #[error("{value:?} uses reserved topic segment {segment:?}")]
    ReservedSegment { value: String, segment: &'static str },
    #[error("addressee {addressee:?} must be a single non-empty segment without ':'")]
    InvalidAddressee { addressee: String },
}

/// Which family an inbound topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicFamily {
    EventNotice,
    ServiceRequest,
    ServiceResponse,
}

/// Result of matching a topic: the logical name and the addressee, if the
/// topic was directed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMatch {
    pub name: String,
    pub addressee: Option<String>,
}

/// Pluggable mapping between logical names and topic strings.
pub trait TopicScheme: Send + Sync + fmt::Debug {
    /// Event-notice topic, broadcast when `addressee` is `None`.
    fn event_topic(&self, name: &str, addressee: Option<&str>) -> String;

    /// Service-request topic, broadcast when `addressee` is `None`.
    fn request_topic(&self, name: &str, addressee: Option<&str>) -> String;

    /// Service-response topic. Responses are always directed to the caller.
    fn response_topic(&self, name: &str, addressee: &str) -> String;

    fn match_event(&self, topic: &str) -> Option<TopicMatch>;

    fn match_request(&self, topic: &str) -> Option<TopicMatch>;

    fn match_response(&self, topic: &str) -> Option<TopicMatch>;

    /// Classifies an inbound topic, trying event notice, service request and
    /// service response in that order.
    fn classify(&self, topic: &str) -> Option<(TopicFamily, TopicMatch)> {
        if let Some(m) = self.match_event(topic) {
            return Some((TopicFamily::EventNotice, m));
        }
        if let Some(m) = self.match_request(topic) {
            return Some((TopicFamily::ServiceRequest, m));
        }
        self.match_response(topic)
            .map(|m| (TopicFamily::ServiceResponse, m))
    }

    /// Checks that `name` can be embedded into this scheme's topics.
    ///
    /// # Errors
    ///
    /// Returns `TopicError` describing the first violation.
    fn validate_name(&self, name: &str) -> Result<(), TopicError> {
        validate_name(name)
    }

    /// Checks that `addressee` can be embedded into this scheme's topics.
    ///
    /// # Errors
    ///
    /// Returns `TopicError` describing the first violation.
    fn validate_addressee(&self, addressee: &str) -> Result<(), TopicError> {
        validate_addressee(addressee)
    }
}

/// The `<name>/<marker>[/<addressee>]` scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTopicScheme;

impl DefaultTopicScheme {
    fn make(name: &str, marker: &str, addressee: Option<&str>) -> String {
        match addressee {
            Some(addressee) => format!("{name}/{marker}/{addressee}"),
            None => format!("{name}/{marker}"),
        }
    }

    fn parse(topic: &str, marker: &str, addressee_required: bool) -> Option<TopicMatch> {
        if !addressee_required {
            if let Some(name) = topic
                .strip_suffix(marker)
                .and_then(|head| head.strip_suffix('/'))
                .filter(|name| !name.is_empty())
            {
                return Some(TopicMatch {
                    name: name.to_string(),
                    addressee: None,
                });
            }
        }

        let (head, addressee) = topic.rsplit_once('/')?;
        let name = head.strip_suffix(marker)?.strip_suffix('/')?;
        if name.is_empty() || addressee.is_empty() {
            return None;
        }
        Some(TopicMatch {
            name: name.to_string(),
            addressee: Some(addressee.to_string()),
        })
    }
}

impl TopicScheme for DefaultTopicScheme {
    fn event_topic(&self, name: &str, addressee: Option<&str>) -> String {
        Self::make(name, EVENT_NOTICE, addressee)
    }

    fn request_topic(&self, name: &str, addressee: Option<&str>) -> String {
        Self::make(name, SERVICE_REQUEST, addressee)
    }

    fn response_topic(&self, name: &str, addressee: &str) -> String {
        Self::make(name, SERVICE_RESPONSE, Some(addressee))
    }

    fn match_event(&self, topic: &str) -> Option<TopicMatch> {
        Self::parse(topic, EVENT_NOTICE, false)
    }

    fn match_request(&self, topic: &str) -> Option<TopicMatch> {
        Self::parse(topic, SERVICE_REQUEST, false)
    }

    fn match_response(&self, topic: &str) -> Option<TopicMatch> {
        Self::parse(topic, SERVICE_RESPONSE, true)
    }
}

fn check_chars(value: &str) -> Result<(), TopicError> {
    match value.chars().find(|ch| FORBIDDEN_CHARS.contains(ch)) {
        Some(ch) => Err(TopicError::ForbiddenCharacter {
            value: value.to_string(),
            ch,
        }),
        None => Ok(()),
    }
}

fn check_reserved(value: &str, segment: &str) -> Result<(), TopicError> {
    match RESERVED_SEGMENTS.iter().find(|reserved| **reserved == segment) {
        Some(reserved) => Err(TopicError::ReservedSegment {
            value: value.to_string(),
            segment: *reserved,
        }),
        None => Ok(()),
    }
}

/// Validates a service or event name for the default scheme.
///
/// Names may be hierarchical (`a/b/c`) but every segment must be non-empty,
/// free of wildcards, and distinct from the family marker segments.
///
/// # Errors
///
/// Returns `TopicError` describing the first violation.
pub fn validate_name(name: &str) -> Result<(), TopicError> {
    if name.is_empty() {
        return Err(TopicError::EmptyName);
    }
    check_chars(name)?;
    for segment in name.split('/') {
        if segment.is_empty() {
            return Err(TopicError::EmptySegment {
                name: name.to_string(),
            });
        }
        check_reserved(name, segment)?;
    }
    Ok(())
}

/// Validates a client id used as addressee: one segment, no `:`.
///
/// # Errors
///
/// Returns `TopicError` describing the first violation.
pub fn validate_addressee(addressee: &str) -> Result<(), TopicError> {
    if addressee.is_empty() || addressee.contains('/') || addressee.contains(':') {
        return Err(TopicError::InvalidAddressee {
            addressee: addressee.to_string(),
        });
    }
    check_chars(addressee)?;
    check_reserved(addressee, addressee)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
