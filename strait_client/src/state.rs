//! Published client state.

use serde::Serialize;
use serde_json::Value;
use strait_core::Uid;

/// Which transport a client runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Try WebSocket first, permanently downgrade to Ajax on failure.
    Auto,
    /// WebSocket only.
    Ws,
    /// Ajax long-polling only.
    Ajax,
}

/// The client's published connection state.
///
/// Watchable via [`crate::ChannelClient::state`]; every change is also
/// mirrored as a `[chsk/state, state]` event on the receive channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientState {
    /// The transport currently in use (under `Auto` this flips from `ws`
    /// to `ajax` on downgrade).
    pub kind: TransportKind,
    /// Whether the handshake has completed on the current connection.
    ///
    /// A freshly-connected socket is *not* open until the server's
    /// `chsk/handshake` arrives.
    pub open: bool,
    /// Whether any handshake has ever completed on this client.
    pub ever_opened: bool,
    /// Whether the most recent handshake was the uid's first connection.
    pub first_open: bool,
    /// The identity the server assigned in the handshake.
    pub uid: Option<Uid>,
    /// The CSRF token echoed by the server; sent back on Ajax POSTs.
    pub csrf_token: Option<String>,
    /// The application handshake payload, if any.
    pub handshake_data: Option<Value>,
    /// Set between an explicit reconnect request and the next handshake.
    pub reconnect_pending: bool,
}

impl ClientState {
    pub(crate) fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            open: false,
            ever_opened: false,
            first_open: false,
            uid: None,
            csrf_token: None,
            handshake_data: None,
            reconnect_pending: false,
        }
    }
}
