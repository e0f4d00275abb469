//! The event model: namespaced identifiers and `[id, payload?]` pairs.
//!
//! Every value crossing the channel boundary either satisfies the event
//! shape or is wrapped as `[chsk/bad-event, original]`; malformed input
//! never produces a hard failure on the receiving side.

use core::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::RESERVED_NS;

/// Why a value failed the event shape check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EventShapeError {
    /// The value is not a JSON array.
    #[error("event is not an array")]
    NotAnArray,

    /// The array is empty or has more than two elements.
    #[error("event must have one or two elements")]
    WrongArity,

    /// The first element is not a string.
    #[error("event id is not a string")]
    IdNotAString,

    /// The id is missing its namespace segment, its name segment, or both.
    #[error("event id is not a namespaced identifier")]
    NotNamespaced,
}

/// A namespaced event identifier, e.g. `app/login`.
///
/// Both the namespace and the name segment must be non-empty. The `chsk`
/// namespace is reserved for the channel itself.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(String);

impl EventId {
    /// Parse and validate an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`EventShapeError::NotNamespaced`] unless the string is of
    /// the form `ns/name` with both segments non-empty.
    pub fn new(s: &str) -> Result<Self, EventShapeError> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(Self(s.to_owned())),
            _ => Err(EventShapeError::NotNamespaced),
        }
    }

    /// The namespace segment.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0.split_once('/').map_or("", |(ns, _)| ns)
    }

    /// The name segment.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.split_once('/').map_or("", |(_, name)| name)
    }

    /// Whether this identifier lives in the reserved `chsk` namespace.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.namespace() == RESERVED_NS
    }

    /// The full identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq<&str> for EventId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

// Channel-internal identifiers. Construction is infallible for these
// literals, so the ids are built through `sys_id`.
pub(crate) fn sys_id(name: &str) -> EventId {
    EventId(format!("{RESERVED_NS}/{name}"))
}

/// Identifiers for channel-internal (`chsk/*`) events.
pub mod sys {
    use super::{sys_id, EventId};

    /// `chsk/handshake`: the first frame on any connection.
    #[must_use]
    pub fn handshake() -> EventId {
        sys_id("handshake")
    }

    /// `chsk/state`: client state-change notification.
    #[must_use]
    pub fn state() -> EventId {
        sys_id("state")
    }

    /// `chsk/recv`: wrapper around a received application event.
    #[must_use]
    pub fn recv() -> EventId {
        sys_id("recv")
    }

    /// `chsk/ws-ping`: WebSocket keep-alive.
    #[must_use]
    pub fn ws_ping() -> EventId {
        sys_id("ws-ping")
    }

    /// `chsk/ws-error`: surfaced transport error on the client.
    #[must_use]
    pub fn ws_error() -> EventId {
        sys_id("ws-error")
    }

    /// `chsk/close`: server-initiated connection close.
    #[must_use]
    pub fn close() -> EventId {
        sys_id("close")
    }

    /// `chsk/uidport-open`: first connection of any kind for a uid.
    #[must_use]
    pub fn uidport_open() -> EventId {
        sys_id("uidport-open")
    }

    /// `chsk/uidport-close`: last connection for a uid gone past grace.
    #[must_use]
    pub fn uidport_close() -> EventId {
        sys_id("uidport-close")
    }

    /// `chsk/bad-package`: a frame the packer could not decode.
    #[must_use]
    pub fn bad_package() -> EventId {
        sys_id("bad-package")
    }

    /// `chsk/bad-event`: a decoded value that is not a valid event.
    #[must_use]
    pub fn bad_event() -> EventId {
        sys_id("bad-event")
    }
}

/// An ordered pair `[id, payload?]`.
#[derive(Clone, PartialEq)]
pub struct Event {
    /// The namespaced identifier.
    pub id: EventId,
    /// Optional payload; any value the packer can serialize.
    pub payload: Option<Value>,
}

impl Event {
    /// Build an event from an already-validated id.
    #[must_use]
    pub fn new(id: EventId, payload: Option<Value>) -> Self {
        Self { id, payload }
    }

    /// Validate an arbitrary value against the event shape.
    ///
    /// # Errors
    ///
    /// Returns the first shape violation found; callers that must not fail
    /// use [`Event::from_value_or_bad`] instead.
    pub fn from_value(value: &Value) -> Result<Self, EventShapeError> {
        let arr = value.as_array().ok_or(EventShapeError::NotAnArray)?;
        if arr.is_empty() || arr.len() > 2 {
            return Err(EventShapeError::WrongArity);
        }
        let id_str = arr[0].as_str().ok_or(EventShapeError::IdNotAString)?;
        let id = EventId::new(id_str)?;
        Ok(Self {
            id,
            payload: arr.get(1).cloned(),
        })
    }

    /// Validate, replacing an invalid value with `[chsk/bad-event, value]`.
    #[must_use]
    pub fn from_value_or_bad(value: Value) -> Self {
        match Self::from_value(&value) {
            Ok(event) => event,
            Err(reason) => {
                tracing::debug!(%reason, "replacing malformed event");
                Self::bad_event(value)
            }
        }
    }

    /// The `[chsk/bad-event, original]` wrapper.
    #[must_use]
    pub fn bad_event(original: Value) -> Self {
        Self {
            id: sys_id("bad-event"),
            payload: Some(original),
        }
    }

    /// The wire form: a 1- or 2-element JSON array.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut arr = vec![Value::String(self.id.as_str().to_owned())];
        if let Some(payload) = &self.payload {
            arr.push(payload.clone());
        }
        Value::Array(arr)
    }
}

// The Debug form reads like the wire form.
impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Some(payload) => write!(f, "[{}, {}]", self.id, payload),
            None => write!(f, "[{}]", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_requires_both_segments() {
        assert!(EventId::new("app/login").is_ok());
        assert_eq!(
            EventId::new("login"),
            Err(EventShapeError::NotNamespaced)
        );
        assert_eq!(EventId::new("/login"), Err(EventShapeError::NotNamespaced));
        assert_eq!(EventId::new("app/"), Err(EventShapeError::NotNamespaced));
        assert_eq!(EventId::new(""), Err(EventShapeError::NotNamespaced));
    }

    #[test]
    fn id_segments() {
        let id = EventId::new("app/login").expect("valid id");
        assert_eq!(id.namespace(), "app");
        assert_eq!(id.name(), "login");
        assert!(!id.is_reserved());
        assert!(sys_id("handshake").is_reserved());
    }

    #[test]
    fn event_round_trips_through_value() {
        let ev = Event::new(
            EventId::new("app/ping").expect("valid id"),
            Some(json!({"n": 1})),
        );
        let back = Event::from_value(&ev.to_value()).expect("valid event");
        assert_eq!(back, ev);
    }

    #[test]
    fn payloadless_event_is_one_element() {
        let ev = Event::new(EventId::new("app/ping").expect("valid id"), None);
        assert_eq!(ev.to_value(), json!(["app/ping"]));
    }

    #[test]
    fn shape_errors() {
        assert_eq!(
            Event::from_value(&json!("nope")),
            Err(EventShapeError::NotAnArray)
        );
        assert_eq!(Event::from_value(&json!([])), Err(EventShapeError::WrongArity));
        assert_eq!(
            Event::from_value(&json!(["a/b", 1, 2])),
            Err(EventShapeError::WrongArity)
        );
        assert_eq!(
            Event::from_value(&json!([42])),
            Err(EventShapeError::IdNotAString)
        );
        assert_eq!(
            Event::from_value(&json!(["noslash"])),
            Err(EventShapeError::NotNamespaced)
        );
    }

    #[test]
    fn bad_event_wraps_original() {
        let ev = Event::from_value_or_bad(json!({"not": "an event"}));
        assert_eq!(ev.id, "chsk/bad-event");
        assert_eq!(ev.payload, Some(json!({"not": "an event"})));
    }
}
