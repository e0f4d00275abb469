//! Identifier newtypes used on both sides of the channel.
//!
//! [`ClientId`] names one browser tab / one client process; a single
//! [`Uid`] may own many of them. [`CbId`] correlates a request frame with
//! its reply frame.

use core::fmt;

use serde::{Deserialize, Serialize};

/// A per-connection client identifier.
///
/// Normally supplied by the client as the `client-id` query parameter; the
/// Rust client generates a random one when none is configured. Any
/// non-empty string is accepted from the wire.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Create a new random client ID.
    ///
    /// # Panics
    ///
    /// Panics if the system's random number generator fails.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn random() -> Self {
        let mut bytes = [0u8; 12];
        getrandom::getrandom(&mut bytes).expect("failed to generate random bytes");
        Self(base58::ToBase58::to_base58(&bytes[..]))
    }

    /// Wrap a client-supplied identifier.
    ///
    /// Returns `None` if the string is blank.
    #[must_use]
    pub fn new(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_owned()))
        }
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A short callback-correlation identifier carried inside `+`-prefixed
/// frames.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CbId(String);

impl CbId {
    /// Create a new random correlation ID.
    ///
    /// # Panics
    ///
    /// Panics if the system's random number generator fails.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).expect("failed to generate random bytes");
        Self(base58::ToBase58::to_base58(&bytes[..]))
    }

    /// Wrap an identifier received from the wire.
    ///
    /// Returns `None` if the string is blank.
    #[must_use]
    pub fn new(s: &str) -> Option<Self> {
        if s.is_empty() {
            None
        } else {
            Some(Self(s.to_owned()))
        }
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CbId({})", self.0)
    }
}

impl fmt::Display for CbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An application-assigned user identity: the push address.
///
/// The server's `user_id_fn` may decline to identify a request; such
/// connections are grouped under the reserved [`Uid::nil`] sentinel so
/// they still participate in the registry.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

/// The reserved identity for requests the application declined to identify.
const NIL_UID: &str = "nil-uid";

impl Uid {
    /// Wrap an application-assigned identity.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The reserved sentinel identity.
    #[must_use]
    pub fn nil() -> Self {
        Self(NIL_UID.to_owned())
    }

    /// Whether this is the reserved sentinel identity.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0 == NIL_UID
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
