//! # strait_client
//!
//! The client side of the strait realtime channel. A [`ChannelClient`]
//! owns one logical connection to the server endpoint over one of three
//! transports: WebSocket, Ajax long-polling, or `Auto` (WebSocket with a
//! permanent downgrade to Ajax on failure).
//!
//! ```rust,ignore
//! use strait_client::{ChannelClient, ClientOptions};
//! use strait_core::{Event, EventId};
//!
//! let client = ChannelClient::connect("http://localhost:3000/chsk", ClientOptions::default())?;
//!
//! // Fire-and-forget:
//! client.send(Event::new(EventId::new("app/hello")?, None)).await?;
//!
//! // Request/reply with a timeout:
//! let reply = client
//!     .call(Event::new(EventId::new("app/ping")?, None), std::time::Duration::from_secs(1))
//!     .await?;
//!
//! // Receive server pushes and state changes:
//! while let Ok(event) = client.events().recv().await { /* … */ }
//! ```

pub mod backoff;
pub mod error;
pub mod state;

mod ajax;
mod auto;
mod shared;
mod ws;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use strait_core::{ClientId, Event, JsonPacker, Packer};
use tokio::sync::watch;
use url::Url;

pub use backoff::default_backoff;
pub use error::{CallError, ConnectError, SendError};
pub use state::{ClientState, TransportKind};

use auto::ActiveTransport;
use shared::Shared;

/// Reconnect delay strategy: attempt number (from 1) to delay.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Configuration for [`ChannelClient::connect`].
#[derive(Clone)]
pub struct ClientOptions {
    /// Transport selection.
    pub kind: TransportKind,
    /// Codec for the packed-string wire layer; must match the server's.
    pub packer: Arc<dyn Packer>,
    /// Extra query parameters included on every GET.
    pub params: Vec<(String, String)>,
    /// WebSocket keep-alive interval.
    pub ws_kalive: Duration,
    /// How long the server may hold a long-poll GET.
    pub lp_timeout: Duration,
    /// Reconnect backoff.
    pub backoff: BackoffFn,
    /// Explicit client id; a random one is generated when absent.
    pub client_id: Option<ClientId>,
    /// Deliver application events wrapped as `[chsk/recv, ev]` (the
    /// default) rather than bare.
    pub wrap_recv_evs: bool,
    /// Preconfigured HTTP client for the Ajax transport (proxies, extra
    /// headers, TLS setup); one is built when absent.
    pub http_client: Option<reqwest::Client>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            kind: TransportKind::Auto,
            packer: Arc::new(JsonPacker),
            params: Vec::new(),
            ws_kalive: Duration::from_secs(25),
            lp_timeout: Duration::from_secs(20),
            backoff: Arc::new(default_backoff),
            client_id: None,
            wrap_recv_evs: true,
            http_client: None,
        }
    }
}

/// A client channel socket.
///
/// Cloning is cheap and shares the connection.
#[derive(Clone)]
pub struct ChannelClient {
    shared: Arc<Shared>,
    transport: Arc<StdMutex<ActiveTransport>>,
}

impl ChannelClient {
    /// Create a client against the server endpoint at `url` and start
    /// connecting in the background.
    ///
    /// `url` is the endpoint path as an `http(s)` URL (`ws(s)` is also
    /// accepted and normalized). The returned handle is live
    /// immediately; watch [`ChannelClient::state`] for `open`. Must be
    /// called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or uses an unsupported
    /// scheme.
    pub fn connect(url: &str, opts: ClientOptions) -> Result<Self, ConnectError> {
        let parsed = Url::parse(url)?;
        let base = match parsed.scheme() {
            "http" | "https" => parsed,
            // "ws://…" → "http://…", "wss://…" → "https://…"
            "ws" | "wss" => {
                let rest = parsed
                    .as_str()
                    .strip_prefix("ws")
                    .unwrap_or(parsed.as_str());
                Url::parse(&format!("http{rest}"))?
            }
            other => return Err(ConnectError::UnsupportedScheme(other.to_owned())),
        };

        let client_id = opts.client_id.clone().unwrap_or_else(ClientId::random);
        let initial_kind = match opts.kind {
            TransportKind::Ajax => TransportKind::Ajax,
            TransportKind::Auto | TransportKind::Ws => TransportKind::Ws,
        };
        let shared = Arc::new(Shared::new(
            base,
            client_id,
            ClientState::new(initial_kind),
            opts,
        ));
        let transport = auto::start(&shared)?;

        Ok(Self { shared, transport })
    }

    /// The receive channel: application events (wrapped as `chsk/recv`
    /// by default) interleaved with `chsk/state` and `chsk/ws-error`
    /// system events.
    #[must_use]
    pub fn events(&self) -> async_channel::Receiver<Event> {
        self.shared.recv_rx.clone()
    }

    /// Watch the connection state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ClientState> {
        self.shared.state_tx.subscribe()
    }

    /// This client's connection identifier.
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.shared.client_id
    }

    fn active(&self) -> ActiveTransport {
        self.transport
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Send a fire-and-forget event.
    ///
    /// # Errors
    ///
    /// Fails with [`SendError::Closed`] before the handshake completes.
    pub async fn send(&self, event: Event) -> Result<(), SendError> {
        match self.active() {
            ActiveTransport::Ws(ws) => ws.send(&event),
            ActiveTransport::Ajax(ajax) => ajax.send(&event).await,
        }
    }

    /// Send an event and wait up to `timeout` for the server reply.
    ///
    /// At most one outcome is ever delivered per call: the reply, or
    /// exactly one of [`CallError::Timeout`], [`CallError::Closed`],
    /// [`CallError::WriteFailed`]. A reply arriving after the timeout is
    /// dropped.
    ///
    /// # Errors
    ///
    /// See [`CallError`].
    pub async fn call(&self, event: Event, timeout: Duration) -> Result<Value, CallError> {
        match self.active() {
            ActiveTransport::Ws(ws) => ws.call(&event, timeout).await,
            ActiveTransport::Ajax(ajax) => ajax.call(&event, timeout).await,
        }
    }

    /// Tear down the current connection and stay disconnected.
    pub fn disconnect(&self) {
        match self.active() {
            ActiveTransport::Ws(ws) => ws.disconnect(),
            ActiveTransport::Ajax(ajax) => ajax.disconnect(),
        }
    }

    /// Tear down the current connection and connect fresh, superseding
    /// any reconnect timer already pending.
    pub fn reconnect(&self) {
        match self.active() {
            ActiveTransport::Ws(ws) => ws.reconnect(),
            ActiveTransport::Ajax(ajax) => ajax.reconnect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_scheme() {
        let err = ChannelClient::connect("ftp://example.com/chsk", ClientOptions::default());
        assert!(matches!(err, Err(ConnectError::UnsupportedScheme(s)) if s == "ftp"));
    }

    #[tokio::test]
    async fn normalizes_ws_scheme() {
        let client = ChannelClient::connect(
            "ws://127.0.0.1:9/chsk",
            ClientOptions {
                kind: TransportKind::Ajax,
                ..ClientOptions::default()
            },
        )
        .expect("client");
        // The state starts closed regardless of transport.
        assert!(!client.state().borrow().open);
        client.disconnect();
    }

    #[tokio::test]
    async fn send_before_handshake_is_refused() {
        let client = ChannelClient::connect(
            "http://127.0.0.1:9/chsk",
            ClientOptions {
                kind: TransportKind::Ajax,
                ..ClientOptions::default()
            },
        )
        .expect("client");
        let ev = Event::new(
            strait_core::EventId::new("app/hello").expect("id"),
            None,
        );
        assert!(matches!(client.send(ev).await, Err(SendError::Closed)));
        client.disconnect();
    }
}
