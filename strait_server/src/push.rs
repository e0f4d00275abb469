//! Per-user push with coalescing and transport fan-out.
//!
//! A push appends the event to both per-transport send buffers for the
//! uid and schedules one deferred flush per transport. Buffering happens
//! synchronously in call order, so the batch concatenation preserves
//! send order; only the flush timers run deferred. Each flush is keyed
//! by the id that scheduled it and proceeds only while that id is still
//! buffered, so rapid pushes collapse into a single delivery: the first
//! timer to fire drains the whole buffer and the rest become no-ops.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use strait_core::{pack, Event, Uid};

use crate::{PushOptions, ServerInner};

/// Which transport a buffer or flush belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    Ws,
    Ajax,
}

#[derive(Default)]
struct Buffer {
    events: Vec<Event>,
    flush_ids: HashSet<u64>,
}

pub(crate) struct SendBuffers {
    ws: Mutex<HashMap<Uid, Buffer>>,
    ajax: Mutex<HashMap<Uid, Buffer>>,
}

impl SendBuffers {
    pub(crate) fn new() -> Self {
        Self {
            ws: Mutex::new(HashMap::new()),
            ajax: Mutex::new(HashMap::new()),
        }
    }

    fn lane(&self, lane: Lane) -> std::sync::MutexGuard<'_, HashMap<Uid, Buffer>> {
        match lane {
            Lane::Ws => &self.ws,
            Lane::Ajax => &self.ajax,
        }
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, lane: Lane, uid: &Uid, event: Event, flush_id: u64) {
        let mut buffers = self.lane(lane);
        let buffer = buffers.entry(uid.clone()).or_default();
        buffer.events.push(event);
        buffer.flush_ids.insert(flush_id);
    }

    /// Drain the buffer iff `flush_id` is still in it; a buffer already
    /// drained by an earlier flush returns `None`.
    fn claim(&self, lane: Lane, uid: &Uid, flush_id: u64) -> Option<Vec<Event>> {
        let mut buffers = self.lane(lane);
        if !buffers
            .get(uid)
            .is_some_and(|b| b.flush_ids.contains(&flush_id))
        {
            return None;
        }
        buffers.remove(uid).map(|b| b.events)
    }

    /// Drain the buffer unconditionally (used by `[chsk/close]`).
    fn claim_all(&self, lane: Lane, uid: &Uid) -> Option<Vec<Event>> {
        self.lane(lane).remove(uid).map(|b| b.events)
    }
}

impl ServerInner {
    /// Buffer one push. Runs synchronously in the caller so concurrent
    /// pushes land in the buffer in call order; only the flush timers
    /// (and the `[chsk/close]` teardown) are spawned.
    pub(crate) fn buffer_push(inner: &Arc<Self>, uid: &Uid, event: Event, opts: PushOptions) {
        if event.id == "chsk/close" {
            let inner = inner.clone();
            let uid = uid.clone();
            tokio::spawn(async move {
                inner.close_uid(&uid, opts.flush_now).await;
            });
            return;
        }

        let flush_id = inner.flush_seq.fetch_add(1, Ordering::Relaxed);
        inner.buffers.append(Lane::Ws, uid, event.clone(), flush_id);
        inner.buffers.append(Lane::Ajax, uid, event, flush_id);

        if opts.flush_now {
            let inner = inner.clone();
            let uid = uid.clone();
            tokio::spawn(async move {
                inner.flush(Lane::Ws, &uid, flush_id).await;
                inner.flush(Lane::Ajax, &uid, flush_id).await;
            });
            return;
        }

        for (lane, delay) in [
            (Lane::Ws, inner.opts.send_buf_ws),
            (Lane::Ajax, inner.opts.send_buf_ajax),
        ] {
            let inner = inner.clone();
            let uid = uid.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.flush(lane, &uid, flush_id).await;
            });
        }
    }

    async fn flush(&self, lane: Lane, uid: &Uid, flush_id: u64) {
        let Some(events) = self.buffers.claim(lane, uid, flush_id) else {
            return;
        };
        self.fan_out(lane, uid, &events).await;
    }

    async fn fan_out(&self, lane: Lane, uid: &Uid, events: &[Event]) {
        let batch = serde_json::Value::Array(events.iter().map(Event::to_value).collect());
        let frame = match pack(&*self.packer, &batch, None) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(%uid, error = %e, "failed to pack push batch");
                return;
            }
        };

        match lane {
            Lane::Ws => self.fan_out_ws(uid, frame).await,
            Lane::Ajax => self.fan_out_ajax(uid, frame).await,
        }
    }

    /// One frame to every open WebSocket; connections stay open.
    async fn fan_out_ws(&self, uid: &Uid, frame: String) {
        for chan in self.registry.ws_channels(uid).await {
            if !chan.send(frame.clone()) {
                tracing::debug!(%uid, conn = chan.conn_id(), "websocket gone during fan-out");
            }
        }
    }

    /// Deliver to every long-poll client of the uid, retrying for clients
    /// that were between polls. Each delivered response closes; clients
    /// that never repoll inside the retry window miss the batch.
    async fn fan_out_ajax(&self, uid: &Uid, frame: String) {
        let mut remaining = self.registry.ajax_client_ids(uid).await;
        if remaining.is_empty() {
            return;
        }

        for attempt in 0..self.opts.lp_max_attempts {
            for (client_id, poll) in self.registry.claim_polls(uid, &remaining).await {
                if poll.fulfill(frame.clone()) {
                    remaining.remove(&client_id);
                } else {
                    tracing::debug!(%uid, %client_id, "held poll aborted before delivery");
                }
            }
            if remaining.is_empty() {
                return;
            }
            if attempt + 1 < self.opts.lp_max_attempts {
                let jitter_ms = self.opts.lp_retry_jitter.as_millis() as u64;
                let jitter = if jitter_ms == 0 {
                    0
                } else {
                    rand::rng().random_range(0..jitter_ms)
                };
                tokio::time::sleep(
                    self.opts.lp_retry_base + std::time::Duration::from_millis(jitter),
                )
                .await;
            }
        }

        tracing::debug!(
            %uid,
            unsatisfied = remaining.len(),
            "long-poll fan-out gave up; batch dropped for absent clients"
        );
    }

    /// `[chsk/close]`: bypasses buffering and terminates every connection
    /// of the uid, optionally flushing buffered events first.
    async fn close_uid(&self, uid: &Uid, flush_first: bool) {
        for lane in [Lane::Ws, Lane::Ajax] {
            let drained = self.buffers.claim_all(lane, uid);
            if flush_first {
                if let Some(events) = drained {
                    if !events.is_empty() {
                        self.fan_out(lane, uid, &events).await;
                    }
                }
            }
        }

        let (ws_chans, polls) = self.registry.take_all_for_close(uid).await;
        tracing::debug!(%uid, ws = ws_chans.len(), polls = polls.len(), "closing all connections");
        for chan in ws_chans {
            chan.close();
        }
        // Dropping the claimed channels completes the held GETs empty.
        drop(polls);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strait_core::EventId;

    fn ev(id: &str, n: u64) -> Event {
        Event::new(EventId::new(id).expect("valid id"), Some(json!(n)))
    }

    #[test]
    fn first_flush_claims_the_whole_buffer() {
        let buffers = SendBuffers::new();
        let uid = Uid::new("u");

        buffers.append(Lane::Ws, &uid, ev("a/x", 1), 10);
        buffers.append(Lane::Ws, &uid, ev("a/y", 2), 11);
        buffers.append(Lane::Ws, &uid, ev("a/z", 3), 12);

        let drained = buffers
            .claim(Lane::Ws, &uid, 10)
            .expect("first flush wins");
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].id, "a/x");
        assert_eq!(drained[2].id, "a/z");

        // The other scheduled flushes find their ids gone.
        assert!(buffers.claim(Lane::Ws, &uid, 11).is_none());
        assert!(buffers.claim(Lane::Ws, &uid, 12).is_none());
    }

    #[test]
    fn lanes_are_independent() {
        let buffers = SendBuffers::new();
        let uid = Uid::new("u");

        buffers.append(Lane::Ws, &uid, ev("a/x", 1), 5);
        buffers.append(Lane::Ajax, &uid, ev("a/x", 1), 5);

        assert!(buffers.claim(Lane::Ws, &uid, 5).is_some());
        assert!(buffers.claim(Lane::Ajax, &uid, 5).is_some());
    }

    #[test]
    fn unknown_flush_id_is_a_noop() {
        let buffers = SendBuffers::new();
        let uid = Uid::new("u");
        buffers.append(Lane::Ws, &uid, ev("a/x", 1), 7);
        assert!(buffers.claim(Lane::Ws, &uid, 99).is_none());
        // The buffer is untouched.
        assert!(buffers.claim(Lane::Ws, &uid, 7).is_some());
    }
}
