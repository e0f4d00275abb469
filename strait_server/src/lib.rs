//! # strait_server
//!
//! The server side of the strait realtime channel: a connection registry
//! over two transports (WebSocket and Ajax long-polling), an HTTP
//! endpoint that normalizes both into one receive queue, and a per-user
//! push API with coalescing and long-poll fan-out.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use strait_server::{ChannelServer, ServerOptions};
//!
//! let server = ChannelServer::new(ServerOptions {
//!     user_id_fn: std::sync::Arc::new(|ctx| {
//!         ctx.query.get("uid").map(strait_core::Uid::new)
//!     }),
//!     ..ServerOptions::default()
//! });
//!
//! let app = axum::Router::new().merge(server.router("/chsk"));
//! // consume server.events(), call server.push(..), watch server.connected()
//! ```
//!
//! A process may create any number of independent [`ChannelServer`]s;
//! there is no global state.

pub mod channel;
pub mod event_msg;
pub mod registry;

mod endpoint;
mod push;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::routing::get;
use serde_json::Value;
use strait_core::{ClientId, Event, JsonPacker, Packer, Uid};
use tokio::sync::watch;

pub use channel::{PollChannel, WsChannel};
pub use event_msg::{ReplySink, ServerEventMsg};
pub use registry::ConnectedUids;

use push::SendBuffers;
use registry::Registry;

/// Request context handed to the identity hooks.
///
/// Carries everything the surrounding HTTP pipeline knows about the
/// request that this crate does not interpret itself.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    /// Request headers (session cookies, CSRF header, …).
    pub headers: HeaderMap,
    /// Query parameters from the request URL.
    pub query: HashMap<String, String>,
    /// The connection's client id.
    pub client_id: ClientId,
}

/// Identity hook: `(request) -> uid`, `None` meaning unidentified.
pub type UserIdFn = Arc<dyn Fn(&RequestCtx) -> Option<Uid> + Send + Sync>;
/// CSRF hook: `(request) -> token`.
pub type CsrfTokenFn = Arc<dyn Fn(&RequestCtx) -> Option<String> + Send + Sync>;
/// Handshake-payload hook: `(request) -> value` appended to the handshake.
pub type HandshakeDataFn = Arc<dyn Fn(&RequestCtx) -> Option<Value> + Send + Sync>;

/// Configuration for [`ChannelServer::new`].
#[derive(Clone)]
pub struct ServerOptions {
    /// Codec for the packed-string wire layer.
    pub packer: Arc<dyn Packer>,
    /// Receive-queue capacity; the oldest message is dropped when full.
    pub recv_buf_len: usize,
    /// WebSocket push-coalescing window.
    pub send_buf_ws: Duration,
    /// Ajax push-coalescing window.
    pub send_buf_ajax: Duration,
    /// WebSocket liveness interval; must exceed the client keep-alive.
    pub ws_conn_gc: Duration,
    /// How long a disconnected client may reconnect before it counts as
    /// gone.
    pub disconnect_grace: Duration,
    /// Long-poll fan-out retry rounds.
    pub lp_max_attempts: u32,
    /// Base delay between fan-out retry rounds.
    pub lp_retry_base: Duration,
    /// Random extra delay added to each retry round.
    pub lp_retry_jitter: Duration,
    /// Maps a request to its user identity.
    pub user_id_fn: UserIdFn,
    /// Extracts the CSRF token echoed in the handshake.
    pub csrf_token_fn: CsrfTokenFn,
    /// Produces the optional application handshake payload.
    pub handshake_data_fn: HandshakeDataFn,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            packer: Arc::new(JsonPacker),
            recv_buf_len: 1000,
            send_buf_ws: Duration::from_millis(30),
            send_buf_ajax: Duration::from_millis(100),
            ws_conn_gc: Duration::from_secs(40),
            disconnect_grace: Duration::from_secs(5),
            lp_max_attempts: 7,
            lp_retry_base: Duration::from_millis(90),
            lp_retry_jitter: Duration::from_millis(90),
            user_id_fn: Arc::new(default_user_id),
            csrf_token_fn: Arc::new(default_csrf_token),
            handshake_data_fn: Arc::new(default_handshake_data),
        }
    }
}

/// Default identity: every request is unidentified (the nil uid).
fn default_user_id(_ctx: &RequestCtx) -> Option<Uid> {
    None
}

/// Default handshake payload: none.
fn default_handshake_data(_ctx: &RequestCtx) -> Option<Value> {
    None
}

/// Default CSRF extraction: the `X-CSRF-Token` header, falling back to a
/// `csrf-token` query parameter.
fn default_csrf_token(ctx: &RequestCtx) -> Option<String> {
    ctx.headers
        .get("x-csrf-token")
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
        .or_else(|| ctx.query.get("csrf-token").cloned())
}

/// Per-push options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PushOptions {
    /// Skip the coalescing window and flush immediately.
    pub flush_now: bool,
}

pub(crate) struct ServerInner {
    pub(crate) packer: Arc<dyn Packer>,
    pub(crate) opts: ServerOptions,
    pub(crate) registry: Registry,
    pub(crate) buffers: SendBuffers,
    pub(crate) recv_tx: async_channel::Sender<ServerEventMsg>,
    pub(crate) recv_rx: async_channel::Receiver<ServerEventMsg>,
    pub(crate) flush_seq: AtomicU64,
}

impl ServerInner {
    /// Put a message on the receive queue, dropping the oldest queued
    /// message if the application has fallen behind (sliding buffer).
    pub(crate) fn enqueue(&self, msg: ServerEventMsg) {
        let mut msg = msg;
        loop {
            match self.recv_tx.try_send(msg) {
                Ok(()) => return,
                Err(async_channel::TrySendError::Full(back)) => {
                    if self.recv_rx.try_recv().is_ok() {
                        tracing::warn!("receive queue full; dropped oldest event");
                    }
                    msg = back;
                }
                Err(async_channel::TrySendError::Closed(_)) => {
                    tracing::debug!("receive queue closed; event dropped");
                    return;
                }
            }
        }
    }

    pub(crate) fn enqueue_internal(&self, id: strait_core::EventId, uid: &Uid) {
        self.enqueue(ServerEventMsg {
            event: Event::new(id, Some(Value::String(uid.as_str().to_owned()))),
            uid: uid.clone(),
            client_id: None,
            reply: None,
        });
    }
}

/// A channel-socket server instance: the registry, the receive queue, the
/// push API, and the two HTTP handlers bundled together.
///
/// Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct ChannelServer {
    pub(crate) inner: Arc<ServerInner>,
}

impl ChannelServer {
    /// Create a server from the given options.
    #[must_use]
    pub fn new(opts: ServerOptions) -> Self {
        let (recv_tx, recv_rx) = async_channel::bounded(opts.recv_buf_len.max(1));
        Self {
            inner: Arc::new(ServerInner {
                packer: opts.packer.clone(),
                opts,
                registry: Registry::new(),
                buffers: SendBuffers::new(),
                recv_tx,
                recv_rx,
                flush_seq: AtomicU64::new(1),
            }),
        }
    }

    /// The receive queue consumed by the application (typically via
    /// [`strait_core::start_router`]).
    #[must_use]
    pub fn events(&self) -> async_channel::Receiver<ServerEventMsg> {
        self.inner.recv_rx.clone()
    }

    /// Watch the connected-users view.
    #[must_use]
    pub fn connected(&self) -> watch::Receiver<ConnectedUids> {
        self.inner.registry.connected()
    }

    /// Push an event to every connection of `uid`, coalescing with other
    /// pushes inside the per-transport send-buffer window. Non-blocking:
    /// the event is buffered before this returns (so sequential pushes
    /// batch in call order) and delivery happens in the background.
    pub fn push(&self, uid: &Uid, event: Event) {
        self.push_with(uid, event, PushOptions::default());
    }

    /// [`ChannelServer::push`] with explicit options.
    pub fn push_with(&self, uid: &Uid, event: Event, opts: PushOptions) {
        ServerInner::buffer_push(&self.inner, uid, event, opts);
    }

    /// Build an axum router exposing the endpoint at `path`: GET is the
    /// WebSocket-or-long-poll handler, POST the one-shot Ajax handler.
    #[must_use]
    pub fn router(&self, path: &str) -> axum::Router {
        axum::Router::new()
            .route(
                path,
                get(endpoint::handshake_or_poll).post(endpoint::ajax_post),
            )
            .with_state(self.clone())
    }
}
