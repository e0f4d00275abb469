//! The HTTP endpoint: one path, two methods, two transports.
//!
//! `GET` either upgrades to a WebSocket (ongoing bidirectional channel)
//! or becomes an Ajax long-poll (one handshake-or-batch response per
//! request). `POST` carries a single one-shot client event. Both
//! transports are normalized into [`ServerEventMsg`]s on the shared
//! receive queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use strait_core::{
    now_ms, pack, sys, unpack, ClientId, Correlation, Event, PackError, Uid, DUMMY_CB_REPLY,
};
use tokio::sync::oneshot;

use crate::channel::{PollChannel, WsChannel, WsOut};
use crate::event_msg::{ReplySink, ServerEventMsg};
use crate::{ChannelServer, RequestCtx, ServerInner};

/// GET handler: WebSocket handshake or Ajax long-poll.
pub(crate) async fn handshake_or_poll(
    State(srv): State<ChannelServer>,
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let Some(client_id) = query.get("client-id").and_then(|s| ClientId::new(s)) else {
        return (
            StatusCode::BAD_REQUEST,
            "channel GET without a non-empty `client-id` query parameter; \
             is the client configured against the right path?",
        )
            .into_response();
    };

    let ctx = RequestCtx {
        headers,
        query: query.clone(),
        client_id: client_id.clone(),
    };
    let identity = srv.inner.identify(&ctx);

    match ws {
        Some(upgrade) => upgrade
            .on_upgrade(move |socket| run_ws_session(srv, socket, client_id, identity))
            .into_response(),
        None => long_poll(&srv, client_id, identity, &query).await,
    }
}

/// What the identity hooks said about one request.
pub(crate) struct Identity {
    uid: Uid,
    csrf_token: Option<String>,
    handshake_data: Option<Value>,
}

impl ServerInner {
    fn identify(&self, ctx: &RequestCtx) -> Identity {
        let uid = (self.opts.user_id_fn)(ctx).unwrap_or_else(Uid::nil);
        let csrf_token = (self.opts.csrf_token_fn)(ctx);
        if csrf_token.is_none() {
            tracing::warn!(
                client_id = %ctx.client_id,
                "no CSRF token for channel request; handshake will carry none"
            );
        }
        let handshake_data = (self.opts.handshake_data_fn)(ctx);
        Identity {
            uid,
            csrf_token,
            handshake_data,
        }
    }

    /// `[chsk/handshake, [uid, csrf, handshake-data, first?]]` as a pstr.
    fn handshake_frame(&self, identity: &Identity, first: bool) -> Result<String, PackError> {
        let payload = json!([
            identity.uid.as_str(),
            identity.csrf_token,
            identity.handshake_data,
            first,
        ]);
        let event = Event::new(sys::handshake(), Some(payload));
        pack(&*self.packer, &event.to_value(), None)
    }

    /// Unpack one inbound frame into a queued event message.
    ///
    /// Decode failures become `chsk/bad-package`, shape failures
    /// `chsk/bad-event`; neither is fatal to the connection.
    fn enqueue_frame(
        &self,
        uid: &Uid,
        client_id: &ClientId,
        pstr: &str,
        make_reply: impl FnOnce(Correlation) -> Option<ReplySink>,
    ) {
        let (event, reply) = match unpack(&*self.packer, pstr) {
            Ok((value, corr)) => (
                Event::from_value_or_bad(value),
                corr.and_then(make_reply),
            ),
            Err(e) => {
                tracing::warn!(%client_id, error = %e, "undecodable frame");
                (
                    Event::new(sys::bad_package(), Some(Value::String(pstr.to_owned()))),
                    None,
                )
            }
        };
        self.enqueue(ServerEventMsg {
            event,
            uid: uid.clone(),
            client_id: Some(client_id.clone()),
            reply,
        });
    }
}

// ════════════════════════════════════════════════════════════════════
// WebSocket lifecycle
// ════════════════════════════════════════════════════════════════════

async fn run_ws_session(
    srv: ChannelServer,
    socket: WebSocket,
    client_id: ClientId,
    identity: Identity,
) {
    let inner = srv.inner;
    let uid = identity.uid.clone();

    let (chan, mut out_rx) = WsChannel::new();
    let conn_id = chan.conn_id();
    let last_activity = Arc::new(AtomicU64::new(now_ms()));

    let first = inner.registry.open_ws(&uid, &client_id, chan.clone()).await;
    if first {
        inner.enqueue_internal(sys::uidport_open(), &uid);
    }
    tracing::debug!(%uid, %client_id, conn = conn_id, first, "websocket open");

    match inner.handshake_frame(&identity, first) {
        Ok(frame) => {
            chan.send(frame);
        }
        Err(e) => tracing::error!(%uid, error = %e, "failed to pack handshake"),
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                WsOut::Frame(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                WsOut::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let watchdog = tokio::spawn(ws_watchdog(
        chan.clone(),
        last_activity.clone(),
        inner.opts.ws_conn_gc,
    ));

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                last_activity.store(now_ms(), Ordering::Relaxed);
                let chan = chan.clone();
                let packer = inner.packer.clone();
                inner.enqueue_frame(&uid, &client_id, &text, move |corr| match corr {
                    Correlation::Callback(cb) => Some(ReplySink::ws(chan, cb, packer)),
                    Correlation::AjaxOneShot => None,
                });
            }
            Ok(Message::Binary(bytes)) => {
                last_activity.store(now_ms(), Ordering::Relaxed);
                let text = String::from_utf8_lossy(&bytes).into_owned();
                let chan = chan.clone();
                let packer = inner.packer.clone();
                inner.enqueue_frame(&uid, &client_id, &text, move |corr| match corr {
                    Correlation::Callback(cb) => Some(ReplySink::ws(chan, cb, packer)),
                    Correlation::AjaxOneShot => None,
                });
            }
            Ok(Message::Close(_)) | Err(_) => break,
            // Ping/pong frames are answered by axum; they still count as
            // liveness.
            Ok(_) => {
                last_activity.store(now_ms(), Ordering::Relaxed);
            }
        }
    }

    watchdog.abort();
    send_task.abort();
    inner.registry.close_ws(&uid, &client_id, conn_id).await;
    tracing::debug!(%uid, %client_id, conn = conn_id, "websocket closed");

    let grace = inner.opts.disconnect_grace;
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if inner.registry.close_edge(&uid).await {
            inner.enqueue_internal(sys::uidport_close(), &uid);
        }
    });
}

/// Close the socket when the client stops producing frames for a whole
/// GC interval. The client keep-alive ping is shorter than the interval,
/// so a live client always advances the timestamp in time.
async fn ws_watchdog(
    chan: WsChannel,
    last_activity: Arc<AtomicU64>,
    interval: std::time::Duration,
) {
    let mut seen = last_activity.load(Ordering::Relaxed);
    loop {
        tokio::time::sleep(interval).await;
        if chan.is_closed() {
            break;
        }
        let now = last_activity.load(Ordering::Relaxed);
        if now == seen {
            tracing::info!(conn = chan.conn_id(), "websocket unresponsive; closing");
            chan.close();
            break;
        }
        seen = now;
    }
}

// ════════════════════════════════════════════════════════════════════
// Ajax long-poll lifecycle
// ════════════════════════════════════════════════════════════════════

async fn long_poll(
    srv: &ChannelServer,
    client_id: ClientId,
    identity: Identity,
    query: &HashMap<String, String>,
) -> Response {
    let inner = &srv.inner;
    let uid = identity.uid.clone();
    let want_handshake = query
        .get("handshake")
        .is_some_and(|v| v == "true" || v == "1");

    let (chan, body_rx) = PollChannel::new();
    let opened = inner
        .registry
        .open_poll(&uid, &client_id, chan, want_handshake)
        .await;
    if opened.first_for_uid {
        inner.enqueue_internal(sys::uidport_open(), &uid);
    }

    // Runs when the response completes *or* the client aborts mid-poll.
    let _guard = PollGuard {
        inner: inner.clone(),
        uid: uid.clone(),
        client_id: client_id.clone(),
    };

    if opened.respond_handshake {
        tracing::debug!(%uid, %client_id, "long-poll handshake");
        return match inner.handshake_frame(&identity, opened.first_for_uid) {
            Ok(frame) => (StatusCode::OK, frame).into_response(),
            Err(e) => {
                tracing::error!(%uid, error = %e, "failed to pack handshake");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        };
    }

    match body_rx.await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        // Claimed-and-dropped (server-initiated close): finish empty, the
        // client repolls or gives up on its own schedule.
        Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

struct PollGuard {
    inner: Arc<ServerInner>,
    uid: Uid,
    client_id: ClientId,
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        let inner = self.inner.clone();
        let uid = self.uid.clone();
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            inner.registry.detach_poll(&uid, &client_id).await;
            let disconnected_at = Instant::now();
            tokio::time::sleep(inner.opts.disconnect_grace).await;
            if inner
                .registry
                .reap_ajax(&uid, &client_id, disconnected_at)
                .await
            {
                tracing::debug!(%uid, %client_id, "long-poll client gone");
                if inner.registry.close_edge(&uid).await {
                    inner.enqueue_internal(sys::uidport_close(), &uid);
                }
            }
        });
    }
}

// ════════════════════════════════════════════════════════════════════
// Ajax POST
// ════════════════════════════════════════════════════════════════════

#[derive(Debug, serde::Deserialize)]
pub(crate) struct AjaxPostForm {
    #[serde(rename = "client-id")]
    client_id: String,
    ppstr: String,
    // Accepted for compatibility; verification belongs to the
    // surrounding middleware.
    #[serde(rename = "csrf-token")]
    #[allow(dead_code)]
    csrf_token: Option<String>,
}

/// POST handler: decode one event, dispatch it, reply once, close.
/// Never touches the registry.
pub(crate) async fn ajax_post(
    State(srv): State<ChannelServer>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Form(form): Form<AjaxPostForm>,
) -> Response {
    let inner = &srv.inner;
    let Some(client_id) = ClientId::new(&form.client_id) else {
        return (
            StatusCode::BAD_REQUEST,
            "channel POST without a non-empty `client-id` form field",
        )
            .into_response();
    };

    let ctx = RequestCtx {
        headers,
        query,
        client_id: client_id.clone(),
    };
    let uid = (inner.opts.user_id_fn)(&ctx).unwrap_or_else(Uid::nil);

    let mut reply_rx: Option<oneshot::Receiver<Value>> = None;
    inner.enqueue_frame(&uid, &client_id, &form.ppstr, |corr| match corr {
        // Any correlation on a POST means "reply on this response".
        Correlation::AjaxOneShot | Correlation::Callback(_) => {
            let (tx, rx) = oneshot::channel();
            reply_rx = Some(rx);
            Some(ReplySink::ajax(tx))
        }
    });

    let Some(rx) = reply_rx else {
        return dummy_response(inner);
    };

    match rx.await {
        Ok(value) => match pack(&*inner.packer, &value, None) {
            Ok(body) => (StatusCode::OK, body).into_response(),
            Err(e) => {
                tracing::error!(%client_id, error = %e, "failed to pack POST reply");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        // The application dropped the sink without replying.
        Err(_) => dummy_response(inner),
    }
}

fn dummy_response(inner: &ServerInner) -> Response {
    match pack(
        &*inner.packer,
        &Value::String(DUMMY_CB_REPLY.to_owned()),
        None,
    ) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to pack dummy reply");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
