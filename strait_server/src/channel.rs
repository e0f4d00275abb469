//! Concrete server-side response channels, one per transport.
//!
//! These are the two implementations of the async-response seam: a
//! [`WsChannel`] stays open and accepts any number of frames; a
//! [`PollChannel`] delivers exactly one body and terminates the response
//! that owns it.

use tokio::sync::{mpsc, oneshot};

/// What the per-connection WebSocket send loop should do next.
#[derive(Debug)]
pub(crate) enum WsOut {
    /// Write a text frame.
    Frame(String),
    /// Write a close frame and stop.
    Close,
}

/// Handle to one open WebSocket connection.
///
/// Cloning is cheap; all clones feed the same send loop.
#[derive(Debug, Clone)]
pub struct WsChannel {
    conn_id: u64,
    tx: mpsc::UnboundedSender<WsOut>,
}

impl WsChannel {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<WsOut>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: rand::random::<u64>(),
                tx,
            },
            rx,
        )
    }

    /// Queue a frame for the send loop. Returns `false` once the
    /// connection is gone.
    pub fn send(&self, frame: String) -> bool {
        self.tx.send(WsOut::Frame(frame)).is_ok()
    }

    /// Ask the send loop to close the socket.
    pub fn close(&self) {
        let _ = self.tx.send(WsOut::Close);
    }

    /// Whether the send loop has terminated.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Identity of this connection, distinguishing it from a successor
    /// that reused the same client id.
    #[must_use]
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }
}

/// Handle to one held long-poll GET.
///
/// A long-poll response delivers exactly one body; fulfilling the channel
/// consumes it and completes the response, prompting the client to
/// repoll. Dropping it unfulfilled completes the response empty.
#[derive(Debug)]
pub struct PollChannel {
    tx: oneshot::Sender<String>,
}

impl PollChannel {
    pub(crate) fn new() -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Deliver the response body. Returns `false` if the request is no
    /// longer waiting.
    pub fn fulfill(self, body: String) -> bool {
        self.tx.send(body).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ws_channel_reports_closed() {
        let (chan, rx) = WsChannel::new();
        assert!(!chan.is_closed());
        assert!(chan.send("-[]".to_owned()));
        drop(rx);
        assert!(chan.is_closed());
        assert!(!chan.send("-[]".to_owned()));
    }

    #[tokio::test]
    async fn poll_channel_delivers_once() {
        let (chan, rx) = PollChannel::new();
        assert!(chan.fulfill("-[]".to_owned()));
        assert_eq!(rx.await.expect("body"), "-[]");
    }

    #[tokio::test]
    async fn poll_channel_fulfill_fails_after_receiver_drops() {
        let (chan, rx) = PollChannel::new();
        drop(rx);
        assert!(!chan.fulfill("-[]".to_owned()));
    }
}
