//! Error types for the event hub pipeline.

use thiserror::Error;

use crate::transport::DeliverStatus;

/// Errors raised by a deliver transport (opening or reading a session).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The target peer did not accept the session.
    #[error("Peer unavailable: {target}")]
    Unavailable { target: String },

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The remote side sent something that is not a deliver frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Low-level I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if reconnecting to the same target may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::WebSocket(_) | Self::Io(_))
    }
}

/// Errors produced while turning a raw block message into a [`DecodedBlock`].
///
/// [`DecodedBlock`]: crate::types::DecodedBlock
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed block: {0}")]
    Malformed(String),

    #[error("Invalid payload in transaction '{tx_id}': {reason}")]
    InvalidPayload { tx_id: String, reason: String },
}

/// Normal-termination conditions that are reported through the error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The session was opened with `endBlock = newest` and the newest block
    /// known at connect time has been delivered.
    NewestBlockReceived,
}

/// Errors surfaced by [`ChannelEventHub`] operations and delivered to
/// listeners' error callbacks.
///
/// Every variant is `Clone` so one sweep error can be handed to any number of
/// listeners.
///
/// [`ChannelEventHub`]: crate::hub::ChannelEventHub
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventHubError {
    /// Invalid or conflicting options, missing identity, bad pattern.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Opening the session failed or the transport broke mid-stream.
    #[error("Connection error: {0}")]
    Connection(#[from] TransportError),

    /// A block could not be decoded; the session is closed.
    #[error("Block decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The hub was disconnected while the listener was still registered.
    #[error("ChannelEventHub has been shutdown")]
    Shutdown,

    /// The replay reached the newest block known at connect time.
    ///
    /// This is a normal completion delivered as an error; use
    /// [`EventHubError::completion`] to tell it apart from failures.
    #[error("Newest block received")]
    NewestBlockReceived { block_number: Option<u64> },

    /// The deliver service ended the stream with a non-success status.
    #[error("Event stream has received an unexpected status message: {0}")]
    UnexpectedStatus(DeliverStatus),

    /// The remote side ended the stream without a status.
    #[error("Event stream closed by the remote peer")]
    StreamClosed,
}

impl EventHubError {
    /// Returns the completion reason if this "error" is a normal end of replay.
    pub fn completion(&self) -> Option<Completion> {
        match self {
            Self::NewestBlockReceived { .. } => Some(Completion::NewestBlockReceived),
            _ => None,
        }
    }

    /// Returns `true` for the `Shutdown` sweep raised by `disconnect`.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Returns `true` if the error was raised synchronously by a bad call.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_block_text_is_recognisable() {
        let err = EventHubError::NewestBlockReceived { block_number: Some(7) };
        assert!(err.to_string().contains("Newest block received"));
        assert_eq!(err.completion(), Some(Completion::NewestBlockReceived));
        assert_eq!(EventHubError::Shutdown.completion(), None);
    }

    #[test]
    fn transport_errors_convert() {
        let err: EventHubError = TransportError::Unavailable { target: "localhost:1111".into() }.into();
        assert!(matches!(err, EventHubError::Connection(ref e) if e.is_retryable()));
        assert!(!TransportError::Protocol("bad frame".into()).is_retryable());
    }
}
