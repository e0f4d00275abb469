//! The WebSocket transport.
//!
//! One background task owns the connection lifecycle: connect, drive the
//! read loop (with a write loop and keep-alive ticker alongside), and on
//! failure reconnect with backoff. Everything is keyed to the shared
//! connection generation, so a later disconnect or explicit reconnect
//! silently retires the loops of an earlier connection.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use strait_core::{now_ms, pack, sys, CbId, Correlation, Event};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{CallError, SendError};
use crate::shared::Shared;

#[derive(Debug)]
enum WsFrame {
    Text(String),
    Close,
}

pub(crate) struct WsTransport {
    shared: Arc<Shared>,
    write_tx: StdMutex<Option<mpsc::UnboundedSender<WsFrame>>>,
    retry_count: AtomicU32,
    last_write: AtomicU64,
    /// Armed by the Auto transport: fired on the first failure before any
    /// completed handshake, instead of reconnecting.
    downgrade: StdMutex<Option<oneshot::Sender<()>>>,
}

impl WsTransport {
    pub(crate) fn new(shared: Arc<Shared>, downgrade: Option<oneshot::Sender<()>>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            write_tx: StdMutex::new(None),
            retry_count: AtomicU32::new(0),
            last_write: AtomicU64::new(0),
            downgrade: StdMutex::new(downgrade),
        })
    }

    /// Spawn the connection loop for the current generation.
    pub(crate) fn connect(self: Arc<Self>) {
        let generation = self.shared.generation();
        tokio::spawn(async move {
            self.run(generation).await;
        });
    }

    /// Invalidate the current connection and close the socket.
    pub(crate) fn disconnect(&self) {
        self.shared.supersede();
        if let Ok(guard) = self.write_tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(WsFrame::Close);
            }
        }
        self.shared.set_closed();
    }

    /// Disconnect, then connect fresh. Supersedes any pending reconnect
    /// timer.
    pub(crate) fn reconnect(self: Arc<Self>) {
        self.disconnect();
        self.shared
            .update_state(|state| state.reconnect_pending = true);
        self.retry_count.store(0, Ordering::Relaxed);
        self.connect();
    }

    async fn run(self: Arc<Self>, generation: u64) {
        loop {
            if !self.shared.is_current(generation) {
                return;
            }

            let url = self.shared.ws_url();
            tracing::debug!(%url, "connecting websocket");
            match connect_async(url.as_str()).await {
                Err(e) => {
                    tracing::warn!(error = %e, "websocket connect failed");
                    if self.after_failure(generation).await {
                        return;
                    }
                }
                Ok((stream, _resp)) => {
                    let clean = self.clone().drive(stream, generation).await;
                    if clean {
                        tracing::debug!("websocket closed cleanly; staying disconnected");
                        self.shared.set_closed();
                        return;
                    }
                    if self.after_failure(generation).await {
                        return;
                    }
                }
            }
        }
    }

    /// Run one established connection to completion. Returns `true` for a
    /// clean close (normal close frame).
    async fn drive(
        self: Arc<Self>,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        generation: u64,
    ) -> bool {
        let (mut sink, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsFrame>();
        let my_tx = tx.clone();
        if let Ok(mut guard) = self.write_tx.lock() {
            *guard = Some(tx.clone());
        }
        self.last_write.store(now_ms(), Ordering::Relaxed);

        let write_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    WsFrame::Text(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    WsFrame::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let keepalive_task = tokio::spawn(self.clone().keepalive(tx, generation));

        let mut clean = false;
        while let Some(item) = read.next().await {
            if !self.shared.is_current(generation) {
                break;
            }
            match item {
                Ok(Message::Text(text)) => {
                    if let Err(e) = self.shared.dispatch_inbound(&text).await {
                        // A malformed push is a protocol violation by the
                        // server; drop the connection.
                        tracing::error!(error = %e, "malformed server frame");
                        self.emit_ws_error(e.to_string());
                        break;
                    }
                    if self.shared.is_open() {
                        self.retry_count.store(0, Ordering::Relaxed);
                    }
                }
                Ok(Message::Close(frame)) => {
                    clean = frame.is_some_and(|f| f.code == CloseCode::Normal);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "websocket read error");
                    self.emit_ws_error(e.to_string());
                    break;
                }
            }
        }

        keepalive_task.abort();
        write_task.abort();
        // A fast reconnect may already have installed its own sender.
        if let Ok(mut guard) = self.write_tx.lock() {
            if guard.as_ref().is_some_and(|cur| cur.same_channel(&my_tx)) {
                *guard = None;
            }
        }
        clean
    }

    /// Mark closed and decide what happens next. Returns `true` when the
    /// run loop should stop (superseded, downgraded, or clean shutdown).
    async fn after_failure(&self, generation: u64) -> bool {
        if !self.shared.is_current(generation) {
            return true;
        }
        self.shared.set_closed();

        if !self.shared.ever_opened() {
            let armed = self
                .downgrade
                .lock()
                .ok()
                .and_then(|mut guard| guard.take());
            if let Some(tx) = armed {
                tracing::info!("websocket failed before first handshake; downgrading");
                let _ = tx.send(());
                return true;
            }
        }

        let attempt = self.retry_count.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = (self.shared.opts.backoff)(attempt);
        tracing::debug!(attempt, ?delay, "scheduling websocket reconnect");
        tokio::time::sleep(delay).await;
        // A disconnect or explicit reconnect during the sleep wins.
        !self.shared.is_current(generation)
    }

    /// Send `[chsk/ws-ping]` whenever a whole keep-alive interval passes
    /// without an outgoing frame.
    async fn keepalive(self: Arc<Self>, tx: mpsc::UnboundedSender<WsFrame>, generation: u64) {
        let interval = self.shared.opts.ws_kalive;
        loop {
            tokio::time::sleep(interval).await;
            if !self.shared.is_current(generation) || tx.is_closed() {
                break;
            }
            let idle = now_ms().saturating_sub(self.last_write.load(Ordering::Relaxed));
            if idle >= interval.as_millis() as u64 {
                let ping = Event::new(sys::ws_ping(), None);
                match pack(self.shared.packer(), &ping.to_value(), None) {
                    Ok(frame) => {
                        self.last_write.store(now_ms(), Ordering::Relaxed);
                        if tx.send(WsFrame::Text(frame)).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to pack keep-alive"),
                }
            }
        }
    }

    fn emit_ws_error(&self, reason: String) {
        self.shared.emit(Event::new(
            sys::ws_error(),
            Some(Value::String(reason)),
        ));
    }

    fn write_frame(&self, frame: String) -> Result<(), SendError> {
        let Ok(guard) = self.write_tx.lock() else {
            return Err(SendError::Closed);
        };
        match guard.as_ref() {
            Some(tx) => {
                tx.send(WsFrame::Text(frame))
                    .map_err(|_| SendError::WriteFailed)?;
                self.last_write.store(now_ms(), Ordering::Relaxed);
                Ok(())
            }
            None => Err(SendError::Closed),
        }
    }

    pub(crate) fn send(&self, event: &Event) -> Result<(), SendError> {
        if !self.shared.is_open() {
            return Err(SendError::Closed);
        }
        let frame = pack(self.shared.packer(), &event.to_value(), None)?;
        self.write_frame(frame)
    }

    pub(crate) async fn call(&self, event: &Event, timeout: Duration) -> Result<Value, CallError> {
        if !self.shared.is_open() {
            return Err(CallError::Closed);
        }

        let cb = CbId::random();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(cb.clone(), tx);

        let frame = pack(
            self.shared.packer(),
            &event.to_value(),
            Some(&Correlation::Callback(cb.clone())),
        )?;
        if let Err(e) = self.write_frame(frame) {
            self.shared.pending.lock().await.remove(&cb);
            return Err(match e {
                SendError::Closed => CallError::Closed,
                _ => CallError::WriteFailed,
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            // The sender can only disappear if the client is torn down.
            Ok(Err(_)) => Err(CallError::Closed),
            Err(_) => {
                // First resolution wins: remove the waiter so a late
                // server reply is dropped.
                self.shared.pending.lock().await.remove(&cb);
                Err(CallError::Timeout)
            }
        }
    }
}
