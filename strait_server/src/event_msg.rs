//! Event messages placed on the server receive queue.

use core::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use strait_core::{pack, CbId, ClientId, Correlation, Event, Packer, Uid};
use tokio::sync::oneshot;

use crate::channel::WsChannel;

/// An event plus its delivery metadata, as consumed by the application.
pub struct ServerEventMsg {
    /// The decoded (or `chsk/bad-*`-wrapped) event.
    pub event: Event,
    /// The user identity the originating connection belongs to.
    pub uid: Uid,
    /// The originating client, when the event came off a connection.
    pub client_id: Option<ClientId>,
    /// Present when the client asked for a reply.
    pub reply: Option<ReplySink>,
}

impl fmt::Debug for ServerEventMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEventMsg")
            .field("event", &self.event)
            .field("uid", &self.uid)
            .field("client_id", &self.client_id)
            .field("reply", &self.reply.is_some())
            .finish()
    }
}

enum ReplyTo {
    /// Reply travels back on the originating WebSocket, wrapped with the
    /// client's correlation id.
    Ws {
        chan: WsChannel,
        cb: CbId,
        packer: Arc<dyn Packer>,
    },
    /// Reply completes the pending Ajax POST response.
    Ajax(oneshot::Sender<Value>),
}

/// A consume-once reply destination.
///
/// At most one call to [`ReplySink::resolve`] delivers anything; later
/// calls are no-ops returning `false`.
pub struct ReplySink {
    inner: Mutex<Option<ReplyTo>>,
}

impl ReplySink {
    pub(crate) fn ws(chan: WsChannel, cb: CbId, packer: Arc<dyn Packer>) -> Self {
        Self {
            inner: Mutex::new(Some(ReplyTo::Ws { chan, cb, packer })),
        }
    }

    pub(crate) fn ajax(tx: oneshot::Sender<Value>) -> Self {
        Self {
            inner: Mutex::new(Some(ReplyTo::Ajax(tx))),
        }
    }

    /// Deliver the reply value to the requesting client.
    ///
    /// Returns `true` if the value was handed to the transport; `false`
    /// if the sink was already consumed or the connection is gone.
    pub fn resolve(&self, value: Value) -> bool {
        let Ok(mut guard) = self.inner.lock() else {
            return false;
        };
        let Some(to) = guard.take() else {
            return false;
        };
        drop(guard);

        match to {
            ReplyTo::Ws { chan, cb, packer } => {
                match pack(&*packer, &value, Some(&Correlation::Callback(cb))) {
                    Ok(frame) => chan.send(frame),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to pack reply");
                        false
                    }
                }
            }
            ReplyTo::Ajax(tx) => tx.send(value).is_ok(),
        }
    }

    /// Whether the sink can still deliver a reply.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.lock().map(|g| g.is_some()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strait_core::JsonPacker;

    #[tokio::test]
    async fn ajax_sink_resolves_once() {
        let (tx, rx) = oneshot::channel();
        let sink = ReplySink::ajax(tx);
        assert!(sink.is_pending());
        assert!(sink.resolve(json!("pong")));
        assert!(!sink.resolve(json!("again")));
        assert!(!sink.is_pending());
        assert_eq!(rx.await.expect("reply"), json!("pong"));
    }

    #[tokio::test]
    async fn ws_sink_wraps_with_correlation() {
        let (chan, mut rx) = WsChannel::new();
        let cb = CbId::random();
        let sink = ReplySink::ws(chan, cb.clone(), Arc::new(JsonPacker));
        assert!(sink.resolve(json!("pong")));

        let out = rx.recv().await.expect("frame");
        let crate::channel::WsOut::Frame(frame) = out else {
            panic!("expected frame");
        };
        let (value, corr) =
            strait_core::unpack(&JsonPacker, &frame).expect("well-formed reply frame");
        assert_eq!(value, json!("pong"));
        assert_eq!(corr, Some(Correlation::Callback(cb)));
    }
}
