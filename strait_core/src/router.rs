//! Sequential receive-queue consumer with error isolation.
//!
//! [`start_router`] drains a channel one message at a time and hands each
//! to the application handler. A handler that fails, by returning an
//! error or by panicking, is reported to the error handler and the loop
//! continues; handlers that need parallelism spawn their own workers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Boxed error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Why a single dispatch failed.
#[derive(Debug)]
pub enum RouterError {
    /// The handler returned an error.
    Handler(HandlerError),

    /// The handler panicked; carries the panic message when it was a
    /// string.
    Panicked(String),
}

impl core::fmt::Display for RouterError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Handler(e) => write!(f, "handler error: {e}"),
            Self::Panicked(msg) => write!(f, "handler panicked: {msg}"),
        }
    }
}

/// Callback invoked when a dispatch fails. Receives the failure and a
/// debug rendering of the message that caused it.
pub type ErrorHandler = Arc<dyn Fn(RouterError, &str) + Send + Sync>;

/// A running router loop.
///
/// Dropping the handle does *not* stop the loop; call [`Router::stop`].
#[derive(Debug)]
pub struct Router {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Router {
    /// Signal the loop to exit at the next opportunity.
    ///
    /// The in-flight handler, if any, runs to completion first.
    pub fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Whether the loop has exited (queue closed or stopped).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Start a router over `rx`, dispatching each message to `handler`.
///
/// Dispatch is sequential: the next message is not taken until the
/// current handler future completes. The loop exits when the queue closes
/// or [`Router::stop`] is called.
pub fn start_router<T, H, F>(
    rx: async_channel::Receiver<T>,
    handler: H,
    error_handler: Option<ErrorHandler>,
) -> Router
where
    T: core::fmt::Debug + Send + 'static,
    H: Fn(T) -> F + Send + Sync + 'static,
    F: core::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = &mut stop_rx => break,
                msg = rx.recv() => match msg {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
            };

            let rendered = format!("{msg:?}");
            let outcome = AssertUnwindSafe(handler(msg)).catch_unwind().await;

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(RouterError::Handler(e)),
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_owned())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_owned());
                    Some(RouterError::Panicked(msg))
                }
            };

            if let Some(failure) = failure {
                match &error_handler {
                    Some(eh) => eh(failure, &rendered),
                    None => tracing::error!(event = %rendered, "router dispatch failed: {failure}"),
                }
            }
        }
        tracing::debug!("router loop exited");
    });

    Router {
        stop_tx: Some(stop_tx),
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn dispatches_in_order() {
        let (tx, rx) = async_channel::unbounded::<u32>();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let seen_in = seen.clone();
        let router = start_router(
            rx,
            move |n| {
                let seen = seen_in.clone();
                async move {
                    seen.lock().expect("lock").push(n);
                    Ok(())
                }
            },
            None,
        );

        for n in 0..5 {
            tx.send(n).await.expect("send");
        }
        tx.close();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(router.is_finished());
        assert_eq!(*seen.lock().expect("lock"), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_loop() {
        let (tx, rx) = async_channel::unbounded::<u32>();
        let handled = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let handled_in = handled.clone();
        let errors_in = errors.clone();
        let _router = start_router(
            rx,
            move |n| {
                let handled = handled_in.clone();
                async move {
                    if n == 1 {
                        panic!("boom");
                    }
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Some(Arc::new(move |failure, _msg| {
                assert!(matches!(failure, RouterError::Panicked(_)));
                errors_in.fetch_add(1, Ordering::SeqCst);
            })),
        );

        for n in 0..3 {
            tx.send(n).await.expect("send");
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handled.load(Ordering::SeqCst), 2);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn erroring_handler_reports_and_continues() {
        let (tx, rx) = async_channel::unbounded::<u32>();
        let errors = Arc::new(AtomicUsize::new(0));

        let errors_in = errors.clone();
        let _router = start_router(
            rx,
            |n| async move {
                if n % 2 == 0 {
                    Err("even numbers are rude".into())
                } else {
                    Ok(())
                }
            },
            Some(Arc::new(move |failure, _msg| {
                assert!(matches!(failure, RouterError::Handler(_)));
                errors_in.fetch_add(1, Ordering::SeqCst);
            })),
        );

        for n in 0..4 {
            tx.send(n).await.expect("send");
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_exits_the_loop() {
        let (tx, rx) = async_channel::unbounded::<u32>();
        let router = start_router(rx, |_| async { Ok(()) }, None);

        tx.send(1).await.expect("send");
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.stop();
        // keep the sender alive so only stop() can end the loop
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(tx);
    }
}
