//! The connection registry and the derived connected-users view.
//!
//! Two disjoint per-uid maps track live connections: `ws` holds one entry
//! per open WebSocket; `ajax` holds one entry per known long-poll client,
//! whose channel slot is occupied only while a GET is actually held open.
//! Every mutation recomputes the published [`ConnectedUids`] view while
//! still inside the write lock, so watchers never observe a view that
//! disagrees with the registry.
//!
//! Presence *edges* (`uidport-open` / `uidport-close`) are gated by a
//! separate `present` set so each uid fires exactly one open per
//! contiguous period of connectedness; the close edge is only evaluated
//! by the caller after the disconnect grace elapses.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use async_lock::RwLock;
use strait_core::{ClientId, Uid};
use tokio::sync::watch;

use crate::channel::{PollChannel, WsChannel};

/// The published presence view.
///
/// Invariant: `ws ∪ ajax = any`; a uid is in `ws` iff it has at least one
/// open WebSocket, and in `ajax` iff it has at least one long-poll record
/// (held open or between polls).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectedUids {
    /// Uids with at least one open WebSocket.
    pub ws: BTreeSet<Uid>,
    /// Uids with at least one long-poll record.
    pub ajax: BTreeSet<Uid>,
    /// Union of the two.
    pub any: BTreeSet<Uid>,
}

pub(crate) struct AjaxSlot {
    /// Present only while the client's GET is held open.
    pub(crate) chan: Option<PollChannel>,
    /// Advanced every time the client opens a GET.
    pub(crate) last_connected: Instant,
}

#[derive(Default)]
struct RegistryInner {
    ws: HashMap<Uid, HashMap<ClientId, WsChannel>>,
    ajax: HashMap<Uid, HashMap<ClientId, AjaxSlot>>,
    /// Uids for which `uidport-open` has fired and `uidport-close` has not.
    present: HashSet<Uid>,
}

impl RegistryInner {
    fn view(&self) -> ConnectedUids {
        let ws: BTreeSet<Uid> = self.ws.keys().cloned().collect();
        let ajax: BTreeSet<Uid> = self.ajax.keys().cloned().collect();
        let any = ws.union(&ajax).cloned().collect();
        ConnectedUids { ws, ajax, any }
    }

    fn has_any(&self, uid: &Uid) -> bool {
        self.ws.contains_key(uid) || self.ajax.contains_key(uid)
    }
}

/// Result of registering a long-poll GET.
pub(crate) struct OpenPoll {
    /// This GET must be answered with the handshake frame (and closed);
    /// the channel was not parked.
    pub(crate) respond_handshake: bool,
    /// First connection of any kind for this uid.
    pub(crate) first_for_uid: bool,
}

pub(crate) struct Registry {
    inner: RwLock<RegistryInner>,
    connected_tx: watch::Sender<ConnectedUids>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        let (connected_tx, _) = watch::channel(ConnectedUids::default());
        Self {
            inner: RwLock::new(RegistryInner::default()),
            connected_tx,
        }
    }

    pub(crate) fn connected(&self) -> watch::Receiver<ConnectedUids> {
        self.connected_tx.subscribe()
    }

    /// Register an open WebSocket. Returns `true` when this is the uid's
    /// first connection of any kind (the `uidport-open` edge).
    pub(crate) async fn open_ws(&self, uid: &Uid, client_id: &ClientId, chan: WsChannel) -> bool {
        let mut inner = self.inner.write().await;
        let first = inner.present.insert(uid.clone());
        if let Some(old) = inner
            .ws
            .entry(uid.clone())
            .or_default()
            .insert(client_id.clone(), chan)
        {
            // A refreshed tab reused the client id; drop the stale socket.
            old.close();
        }
        self.connected_tx.send_replace(inner.view());
        first
    }

    /// Remove a WebSocket, but only if `conn_id` still names the stored
    /// connection (a page refresh may already have replaced it).
    pub(crate) async fn close_ws(&self, uid: &Uid, client_id: &ClientId, conn_id: u64) {
        let mut inner = self.inner.write().await;
        let mut uid_empty = false;
        if let Some(conns) = inner.ws.get_mut(uid) {
            if conns
                .get(client_id)
                .is_some_and(|c| c.conn_id() == conn_id)
            {
                conns.remove(client_id);
            }
            uid_empty = conns.is_empty();
        }
        if uid_empty {
            inner.ws.remove(uid);
        }
        self.connected_tx.send_replace(inner.view());
    }

    /// Register a long-poll GET, either parking `chan` or handing the
    /// request back for an immediate handshake response.
    pub(crate) async fn open_poll(
        &self,
        uid: &Uid,
        client_id: &ClientId,
        chan: PollChannel,
        want_handshake: bool,
    ) -> OpenPoll {
        let mut inner = self.inner.write().await;
        let first_for_uid = inner.present.insert(uid.clone());

        let slots = inner.ajax.entry(uid.clone()).or_default();
        let newly_created = !slots.contains_key(client_id);
        let respond_handshake = newly_created || want_handshake;

        let slot = slots.entry(client_id.clone()).or_insert_with(|| AjaxSlot {
            chan: None,
            last_connected: Instant::now(),
        });
        slot.last_connected = Instant::now();
        slot.chan = if respond_handshake { None } else { Some(chan) };

        self.connected_tx.send_replace(inner.view());
        OpenPoll {
            respond_handshake,
            first_for_uid,
        }
    }

    /// Null the channel slot when a held GET completes or is aborted.
    /// The record itself is retained until [`Registry::reap_ajax`].
    pub(crate) async fn detach_poll(&self, uid: &Uid, client_id: &ClientId) {
        let mut inner = self.inner.write().await;
        if let Some(slot) = inner
            .ajax
            .get_mut(uid)
            .and_then(|slots| slots.get_mut(client_id))
        {
            slot.chan = None;
        }
    }

    /// Drop a long-poll record whose client has not reconnected since
    /// `disconnected_at`. Returns `true` if the record was removed.
    pub(crate) async fn reap_ajax(
        &self,
        uid: &Uid,
        client_id: &ClientId,
        disconnected_at: Instant,
    ) -> bool {
        let mut inner = self.inner.write().await;
        let Some(slots) = inner.ajax.get_mut(uid) else {
            return false;
        };
        let gone = slots
            .get(client_id)
            .is_some_and(|slot| slot.chan.is_none() && slot.last_connected <= disconnected_at);
        if !gone {
            return false;
        }
        slots.remove(client_id);
        let uid_empty = slots.is_empty();
        if uid_empty {
            inner.ajax.remove(uid);
        }
        self.connected_tx.send_replace(inner.view());
        true
    }

    /// Evaluate the `uidport-close` edge: fires at most once per
    /// connectedness period, and only when the uid has no connections of
    /// any kind left.
    pub(crate) async fn close_edge(&self, uid: &Uid) -> bool {
        let mut inner = self.inner.write().await;
        if inner.has_any(uid) {
            return false;
        }
        inner.present.remove(uid)
    }

    /// All open WebSocket channels for a uid.
    pub(crate) async fn ws_channels(&self, uid: &Uid) -> Vec<WsChannel> {
        let inner = self.inner.read().await;
        inner
            .ws
            .get(uid)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The long-poll client ids currently known for a uid (held open or
    /// between polls): the fan-out target set.
    pub(crate) async fn ajax_client_ids(&self, uid: &Uid) -> HashSet<ClientId> {
        let inner = self.inner.read().await;
        inner
            .ajax
            .get(uid)
            .map(|slots| slots.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Atomically claim the held channels of the given clients.
    pub(crate) async fn claim_polls(
        &self,
        uid: &Uid,
        targets: &HashSet<ClientId>,
    ) -> Vec<(ClientId, PollChannel)> {
        let mut inner = self.inner.write().await;
        let Some(slots) = inner.ajax.get_mut(uid) else {
            return Vec::new();
        };
        let mut claimed = Vec::new();
        for client_id in targets {
            if let Some(slot) = slots.get_mut(client_id) {
                if let Some(chan) = slot.chan.take() {
                    claimed.push((client_id.clone(), chan));
                }
            }
        }
        claimed
    }

    /// Channels for a `[chsk/close]` push: every WebSocket plus every
    /// currently-held long-poll (claimed out of its slot).
    pub(crate) async fn take_all_for_close(&self, uid: &Uid) -> (Vec<WsChannel>, Vec<PollChannel>) {
        let mut inner = self.inner.write().await;
        let ws = inner
            .ws
            .get(uid)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default();
        let polls = inner
            .ajax
            .get_mut(uid)
            .map(|slots| slots.values_mut().filter_map(|s| s.chan.take()).collect())
            .unwrap_or_default();
        (ws, polls)
    }
}
