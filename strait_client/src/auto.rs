//! Transport selection, including the WebSocket→Ajax auto-downgrade.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::oneshot;

use crate::ajax::AjaxTransport;
use crate::error::ConnectError;
use crate::shared::Shared;
use crate::state::TransportKind;
use crate::ws::WsTransport;

/// The transport currently backing a client.
#[derive(Clone)]
pub(crate) enum ActiveTransport {
    Ws(Arc<WsTransport>),
    Ajax(Arc<AjaxTransport>),
}

/// Start the configured transport.
///
/// Under [`TransportKind::Auto`] this starts WebSocket with a downgrade
/// hook armed: the first WebSocket failure before a completed handshake
/// permanently replaces the transport with Ajax over the same shared
/// state cell. Once downgraded, no further WebSocket attempts occur for
/// the life of the client.
pub(crate) fn start(
    shared: &Arc<Shared>,
) -> Result<Arc<StdMutex<ActiveTransport>>, ConnectError> {
    match shared.opts.kind {
        TransportKind::Ws => {
            let ws = WsTransport::new(shared.clone(), None);
            ws.clone().connect();
            Ok(Arc::new(StdMutex::new(ActiveTransport::Ws(ws))))
        }
        TransportKind::Ajax => {
            let ajax = AjaxTransport::new(shared.clone())?;
            ajax.clone().connect();
            Ok(Arc::new(StdMutex::new(ActiveTransport::Ajax(ajax))))
        }
        TransportKind::Auto => {
            let (downgrade_tx, downgrade_rx) = oneshot::channel();
            let ws = WsTransport::new(shared.clone(), Some(downgrade_tx));
            ws.clone().connect();
            let slot = Arc::new(StdMutex::new(ActiveTransport::Ws(ws)));

            let watcher_slot = slot.clone();
            let watcher_shared = shared.clone();
            tokio::spawn(async move {
                if downgrade_rx.await.is_err() {
                    // Transport torn down without ever failing.
                    return;
                }
                tracing::info!("downgrading to ajax long-polling");
                watcher_shared.update_state(|state| state.kind = TransportKind::Ajax);
                match AjaxTransport::new(watcher_shared.clone()) {
                    Ok(ajax) => {
                        if let Ok(mut guard) = watcher_slot.lock() {
                            *guard = ActiveTransport::Ajax(ajax.clone());
                        }
                        ajax.connect();
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to build ajax transport");
                    }
                }
            });

            Ok(slot)
        }
    }
}
