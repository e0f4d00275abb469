//! # strait_core
//!
//! Shared protocol layer for the strait realtime channel: the event model,
//! the packed-string wire codec, correlation identifiers, and the router
//! loop that drains a receive queue into an application handler.
//!
//! Both sides of the wire speak the same frame format: a single string
//! whose first byte is `-` (a bare value) or `+` (a value wrapped together
//! with a reply-correlation marker). See [`packer`] for the details.
//!
//! The `chsk/*` event namespace is reserved for the channel itself.

pub mod event;
pub mod id;
pub mod packer;
pub mod router;

pub use event::{sys, Event, EventId, EventShapeError};
pub use id::{CbId, ClientId, Uid};
pub use packer::{pack, unpack, Correlation, JsonPacker, PackError, Packer};
pub use router::{start_router, ErrorHandler, HandlerError, Router, RouterError};

/// The event namespace reserved for channel-internal events.
pub const RESERVED_NS: &str = "chsk";

/// Reply body sent for an Ajax send that did not request a callback.
pub const DUMMY_CB_REPLY: &str = "chsk/dummy-cb-200";

/// Milliseconds since the Unix epoch.
///
/// Used for keep-alive and liveness bookkeeping on both sides.
#[must_use]
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
