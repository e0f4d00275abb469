//! The Ajax long-poll transport.
//!
//! Two concurrent request slots: a GET held open by the server until it
//! has something to deliver (the poll loop), and ad-hoc POSTs carrying
//! outbound events. A poll timeout is normal operation (repoll
//! immediately); any other failure marks the channel closed and repolls
//! after backoff.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use strait_core::{pack, unpack, Correlation, Event, DUMMY_CB_REPLY};

use crate::error::{CallError, SendError};
use crate::shared::Shared;

/// Slack added to the client-side request timeout so the server's poll
/// hold always wins the race.
const POLL_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

pub(crate) struct AjaxTransport {
    shared: Arc<Shared>,
    http: reqwest::Client,
}

impl AjaxTransport {
    pub(crate) fn new(shared: Arc<Shared>) -> Result<Arc<Self>, reqwest::Error> {
        let http = match &shared.opts.http_client {
            Some(client) => client.clone(),
            None => reqwest::Client::builder().build()?,
        };
        Ok(Arc::new(Self { shared, http }))
    }

    /// Spawn the poll loop for the current generation.
    pub(crate) fn connect(self: Arc<Self>) {
        let generation = self.shared.generation();
        tokio::spawn(async move {
            self.poll_loop(generation).await;
        });
    }

    pub(crate) fn disconnect(&self) {
        self.shared.supersede();
        self.shared.set_closed();
    }

    pub(crate) fn reconnect(self: Arc<Self>) {
        self.disconnect();
        self.shared
            .update_state(|state| state.reconnect_pending = true);
        self.connect();
    }

    async fn poll_loop(self: Arc<Self>, generation: u64) {
        tracing::debug!(client_id = %self.shared.client_id, "starting poll loop");
        let mut generation_changes = self.shared.generation_changes();
        let mut attempt: u32 = 0;

        loop {
            if !self.shared.is_current(generation) {
                tracing::debug!("poll loop superseded; exiting");
                return;
            }

            let mut extra = vec![("_", rand::random::<u64>().to_string())];
            if !self.shared.is_open() {
                extra.push(("handshake", "true".to_owned()));
            }
            let url = self.shared.http_url(&extra);

            let request = self
                .http
                .get(url)
                .timeout(self.shared.opts.lp_timeout + POLL_TIMEOUT_SLACK)
                .send();
            let result = tokio::select! {
                // A disconnect mid-poll drops the held GET immediately.
                _ = generation_changes.changed() => continue,
                result = request => result,
            };

            match result {
                // A poll timeout is not a failure; go straight back in.
                Err(e) if e.is_timeout() => {
                    attempt = 0;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "poll error");
                    self.shared.set_closed();
                    attempt += 1;
                    tokio::time::sleep((self.shared.opts.backoff)(attempt)).await;
                }
                Ok(resp) if resp.status().as_u16() == 204 => {
                    attempt = 0;
                }
                Ok(resp) if !resp.status().is_success() => {
                    tracing::warn!(status = %resp.status(), "poll returned error status");
                    self.shared.set_closed();
                    attempt += 1;
                    tokio::time::sleep((self.shared.opts.backoff)(attempt)).await;
                }
                Ok(resp) => {
                    let body = match resp.text().await {
                        Ok(body) => body,
                        Err(e) => {
                            tracing::warn!(error = %e, "poll body error");
                            self.shared.set_closed();
                            attempt += 1;
                            tokio::time::sleep((self.shared.opts.backoff)(attempt)).await;
                            continue;
                        }
                    };
                    if body.is_empty() {
                        attempt = 0;
                        continue;
                    }
                    match self.shared.dispatch_inbound(&body).await {
                        Ok(()) => attempt = 0,
                        Err(e) => {
                            // Malformed server frame: protocol violation.
                            tracing::error!(error = %e, "malformed server frame");
                            self.shared.set_closed();
                            attempt += 1;
                            tokio::time::sleep((self.shared.opts.backoff)(attempt)).await;
                        }
                    }
                }
            }
        }
    }

    async fn post(&self, ppstr: String, timeout: Option<Duration>) -> Result<String, SendError> {
        let url = self.shared.http_url(&[("_", rand::random::<u64>().to_string())]);
        let csrf = self.shared.csrf_token().unwrap_or_default();

        let mut req = self
            .http
            .post(url)
            .header("X-CSRF-Token", &csrf)
            .form(&[
                ("client-id", self.shared.client_id.as_str()),
                ("ppstr", ppstr.as_str()),
                ("csrf-token", csrf.as_str()),
            ]);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send().await?.error_for_status()?;
        Ok(resp.text().await?)
    }

    pub(crate) async fn send(&self, event: &Event) -> Result<(), SendError> {
        if !self.shared.is_open() {
            return Err(SendError::Closed);
        }
        let ppstr = pack(self.shared.packer(), &event.to_value(), None)?;
        // The body is the dummy-cb sentinel; nothing to do with it.
        self.post(ppstr, None).await?;
        Ok(())
    }

    pub(crate) async fn call(&self, event: &Event, timeout: Duration) -> Result<Value, CallError> {
        if !self.shared.is_open() {
            return Err(CallError::Closed);
        }
        let ppstr = pack(
            self.shared.packer(),
            &event.to_value(),
            Some(&Correlation::AjaxOneShot),
        )?;

        let body = match self.post(ppstr, Some(timeout)).await {
            Ok(body) => body,
            Err(SendError::Http(e)) if e.is_timeout() => return Err(CallError::Timeout),
            Err(SendError::Http(e)) => return Err(CallError::Http(e)),
            Err(SendError::Pack(e)) => return Err(CallError::Pack(e)),
            Err(SendError::Closed) => return Err(CallError::Closed),
            Err(SendError::WriteFailed) => return Err(CallError::WriteFailed),
        };

        let (value, _) = unpack(self.shared.packer(), &body)?;
        if value == Value::String(DUMMY_CB_REPLY.to_owned()) {
            return Err(CallError::Dropped);
        }
        Ok(value)
    }
}
