//! State shared by every transport of one client.
//!
//! The Auto transport swaps its inner transport at most once; because the
//! replacement shares this cell, watchers observe a single continuous
//! state stream across the downgrade.

use std::collections::HashMap;

use async_lock::Mutex;
use serde_json::Value;
use strait_core::{sys, unpack, CbId, ClientId, Correlation, Event, PackError, Packer, Uid};
use tokio::sync::{oneshot, watch};
use url::Url;

use crate::state::ClientState;
use crate::ClientOptions;

pub(crate) struct Shared {
    /// The endpoint as an `http(s)` URL; the WebSocket URL is derived.
    pub(crate) base_url: Url,
    pub(crate) opts: ClientOptions,
    pub(crate) client_id: ClientId,
    pub(crate) state_tx: watch::Sender<ClientState>,
    pub(crate) recv_tx: async_channel::Sender<Event>,
    pub(crate) recv_rx: async_channel::Receiver<Event>,
    /// Outstanding calls awaiting a correlated reply.
    pub(crate) pending: Mutex<HashMap<CbId, oneshot::Sender<Value>>>,
    /// Connection generation. Bumping it supersedes every loop and timer
    /// keyed to an older value; loops watch it so a disconnect aborts
    /// in-flight waits promptly.
    conn_gen: watch::Sender<u64>,
}

impl Shared {
    pub(crate) fn new(base_url: Url, client_id: ClientId, initial: ClientState, opts: ClientOptions) -> Self {
        let (state_tx, _) = watch::channel(initial);
        let (recv_tx, recv_rx) = async_channel::unbounded();
        Self {
            base_url,
            opts,
            client_id,
            state_tx,
            recv_tx,
            recv_rx,
            pending: Mutex::new(HashMap::new()),
            conn_gen: watch::channel(1).0,
        }
    }

    pub(crate) fn packer(&self) -> &dyn Packer {
        &*self.opts.packer
    }

    // ── Generation bookkeeping ──────────────────────────────────────

    pub(crate) fn generation(&self) -> u64 {
        *self.conn_gen.borrow()
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    /// Subscribe to generation changes (to abort in-flight waits).
    pub(crate) fn generation_changes(&self) -> watch::Receiver<u64> {
        self.conn_gen.subscribe()
    }

    /// Invalidate every loop and pending timer; returns the new
    /// generation for whatever replaces them.
    pub(crate) fn supersede(&self) -> u64 {
        self.conn_gen.send_modify(|g| *g += 1);
        self.generation()
    }

    // ── State publication ───────────────────────────────────────────

    /// Mutate the state; when anything actually changed, mirror the new
    /// state as a `[chsk/state, state]` event.
    pub(crate) fn update_state(&self, f: impl FnOnce(&mut ClientState)) {
        let changed = self.state_tx.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
        if changed {
            let snapshot = self.state_tx.borrow().clone();
            if let Ok(value) = serde_json::to_value(&snapshot) {
                self.emit(Event::new(sys::state(), Some(value)));
            }
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state_tx.borrow().open
    }

    pub(crate) fn ever_opened(&self) -> bool {
        self.state_tx.borrow().ever_opened
    }

    pub(crate) fn csrf_token(&self) -> Option<String> {
        self.state_tx.borrow().csrf_token.clone()
    }

    pub(crate) fn set_closed(&self) {
        self.update_state(|state| state.open = false);
    }

    // ── Inbound dispatch (shared by both transports) ────────────────

    /// Decode one server frame and route it: correlated reply, handshake,
    /// or a batch of application events.
    ///
    /// # Errors
    ///
    /// A frame the packer cannot decode is a protocol violation by the
    /// server and is returned to the transport, which treats the
    /// connection as failed.
    pub(crate) async fn dispatch_inbound(&self, pstr: &str) -> Result<(), PackError> {
        let (value, corr) = unpack(self.packer(), pstr)?;

        if let Some(Correlation::Callback(cb)) = corr {
            match self.pending.lock().await.remove(&cb) {
                Some(tx) => {
                    // A waiter that already timed out dropped its receiver.
                    let _ = tx.send(value);
                }
                None => tracing::debug!(%cb, "reply for unknown or expired waiter"),
            }
            return Ok(());
        }

        self.dispatch_value(value);
        Ok(())
    }

    fn dispatch_value(&self, value: Value) {
        match Event::from_value(&value) {
            Ok(event) if event.id == "chsk/handshake" => self.apply_handshake(event.payload),
            Ok(event) if event.id.is_reserved() => {
                tracing::warn!(id = %event.id, "discarding reserved event from server stream");
            }
            Ok(event) => self.deliver(event),
            // Not a single event: the normal case, a batch of buffered
            // events.
            Err(_) => match value {
                Value::Array(items) => {
                    for item in items {
                        match Event::from_value(&item) {
                            Ok(event) if event.id.is_reserved() => {
                                tracing::warn!(id = %event.id, "discarding reserved event from server stream");
                            }
                            Ok(event) => self.deliver(event),
                            Err(reason) => {
                                tracing::warn!(%reason, "discarding malformed batch element");
                            }
                        }
                    }
                }
                other => tracing::warn!(?other, "discarding unrecognized server frame"),
            },
        }
    }

    /// `[chsk/handshake, [uid, csrf, handshake-data, first?]]`.
    fn apply_handshake(&self, payload: Option<Value>) {
        let parts = payload.as_ref().and_then(Value::as_array);
        let uid = parts
            .and_then(|p| p.first())
            .and_then(Value::as_str)
            .map(Uid::new);
        let csrf_token = parts
            .and_then(|p| p.get(1))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        let handshake_data = parts.and_then(|p| p.get(2)).filter(|v| !v.is_null()).cloned();
        let first_open = parts
            .and_then(|p| p.get(3))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if csrf_token.is_none() {
            tracing::warn!("handshake carried no CSRF token");
        }
        tracing::debug!(?uid, first_open, "handshake complete");

        self.update_state(|state| {
            state.open = true;
            state.ever_opened = true;
            state.first_open = first_open;
            state.uid = uid;
            state.csrf_token = csrf_token;
            state.handshake_data = handshake_data;
            state.reconnect_pending = false;
        });
    }

    fn deliver(&self, event: Event) {
        let out = if self.opts.wrap_recv_evs {
            Event::new(sys::recv(), Some(event.to_value()))
        } else {
            event
        };
        self.emit(out);
    }

    pub(crate) fn emit(&self, event: Event) {
        // Unbounded; only fails once the receive channel is closed.
        let _ = self.recv_tx.try_send(event);
    }

    // ── URL construction ────────────────────────────────────────────

    /// The long-poll / POST URL with `client-id` and configured params.
    pub(crate) fn http_url(&self, extra: &[(&str, String)]) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("client-id", self.client_id.as_str());
            for (k, v) in &self.opts.params {
                q.append_pair(k, v);
            }
            for (k, v) in extra {
                q.append_pair(k, v);
            }
        }
        url
    }

    /// The WebSocket URL: same endpoint with `ws`/`wss` scheme.
    pub(crate) fn ws_url(&self) -> String {
        let http = self.http_url(&[]);
        let rest = http
            .as_str()
            .strip_prefix("http")
            .unwrap_or(http.as_str());
        format!("ws{rest}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TransportKind;
    use serde_json::json;

    fn shared() -> Shared {
        let url = Url::parse("http://127.0.0.1:5000/chsk").expect("valid url");
        Shared::new(
            url,
            ClientId::new("tab-1").expect("client id"),
            ClientState::new(TransportKind::Ws),
            ClientOptions::default(),
        )
    }

    #[test]
    fn ws_url_swaps_scheme_and_keeps_query() {
        let s = shared();
        let ws = s.ws_url();
        assert!(ws.starts_with("ws://127.0.0.1:5000/chsk?"), "{ws}");
        assert!(ws.contains("client-id=tab-1"));
    }

    #[tokio::test]
    async fn handshake_opens_and_merges_state() {
        let s = shared();
        assert!(!s.is_open());
        s.dispatch_inbound(
            "-[\"chsk/handshake\",[\"alice\",\"token\",{\"motd\":\"hi\"},true]]",
        )
        .await
        .expect("dispatch");

        let state = s.state_tx.borrow().clone();
        assert!(state.open);
        assert!(state.ever_opened);
        assert!(state.first_open);
        assert_eq!(state.uid, Some(Uid::new("alice")));
        assert_eq!(state.csrf_token.as_deref(), Some("token"));
        assert_eq!(state.handshake_data, Some(json!({"motd": "hi"})));

        // The state change was mirrored on the receive channel.
        let ev = s.recv_rx.try_recv().expect("state event");
        assert_eq!(ev.id, "chsk/state");
    }

    #[tokio::test]
    async fn batch_is_delivered_wrapped() {
        let s = shared();
        s.dispatch_inbound("-[[\"app/a\",1],[\"app/b\"]]")
            .await
            .expect("dispatch");

        let first = s.recv_rx.try_recv().expect("first event");
        assert_eq!(first.id, "chsk/recv");
        assert_eq!(first.payload, Some(json!(["app/a", 1])));
        let second = s.recv_rx.try_recv().expect("second event");
        assert_eq!(second.payload, Some(json!(["app/b"])));
    }

    #[tokio::test]
    async fn reserved_events_are_discarded_from_batches() {
        let s = shared();
        s.dispatch_inbound("-[[\"chsk/evil\"],[\"app/fine\"]]")
            .await
            .expect("dispatch");

        let only = s.recv_rx.try_recv().expect("one event");
        assert_eq!(only.payload, Some(json!(["app/fine"])));
        assert!(s.recv_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn correlated_reply_resolves_waiter() {
        let s = shared();
        let cb = CbId::random();
        let (tx, rx) = oneshot::channel();
        s.pending.lock().await.insert(cb.clone(), tx);

        let frame = strait_core::pack(
            s.packer(),
            &json!("pong"),
            Some(&Correlation::Callback(cb)),
        )
        .expect("pack");
        s.dispatch_inbound(&frame).await.expect("dispatch");

        assert_eq!(rx.await.expect("reply"), json!("pong"));
        assert!(s.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_frame_propagates() {
        let s = shared();
        assert!(s.dispatch_inbound("-not json").await.is_err());
    }

    #[test]
    fn supersede_invalidates_generation() {
        let s = shared();
        let g = s.generation();
        assert!(s.is_current(g));
        let g2 = s.supersede();
        assert!(!s.is_current(g));
        assert!(s.is_current(g2));
    }
}
