//! Error types for the client transports.

use strait_core::PackError;
use thiserror::Error;

/// Problem while creating a client.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The endpoint URL did not parse.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The endpoint URL scheme is not `http`/`https` (or `ws`/`wss`).
    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),

    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Problem while sending a fire-and-forget event.
#[derive(Debug, Error)]
pub enum SendError {
    /// The channel is not open (no completed handshake right now).
    #[error("channel not open")]
    Closed,

    /// The frame could not be written to the socket.
    #[error("write failed")]
    WriteFailed,

    /// HTTP request failed.
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// The event could not be packed.
    #[error("pack error: {0}")]
    Pack(#[from] PackError),
}

/// Problem while making a call that expects a reply.
#[derive(Debug, Error)]
pub enum CallError {
    /// The channel is not open (no completed handshake right now).
    #[error("channel not open")]
    Closed,

    /// No reply arrived inside the caller's timeout.
    #[error("timed out waiting for reply")]
    Timeout,

    /// The request frame could not be written to the socket.
    #[error("write failed")]
    WriteFailed,

    /// HTTP request failed.
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// The event or the reply could not be packed/unpacked.
    #[error("pack error: {0}")]
    Pack(#[from] PackError),

    /// The server accepted the request but the application never replied.
    #[error("request accepted but never answered")]
    Dropped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_displays() {
        assert_eq!(format!("{}", CallError::Timeout), "timed out waiting for reply");
        assert_eq!(format!("{}", CallError::Closed), "channel not open");
    }

    #[test]
    fn send_error_displays() {
        assert_eq!(format!("{}", SendError::Closed), "channel not open");
    }
}
