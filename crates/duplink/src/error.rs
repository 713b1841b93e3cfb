//! Error types for link operations.

use duplink_common::{CloseCode, Tid, WireError};
use thiserror::Error;

/// Errors raised by the link engine and its endpoints.
#[derive(Debug, Error)]
pub enum LinkError {
    /// A connection could not be established or upgraded.
    #[error("invalid connection: {0}")]
    InvalidConnection(String),
    /// A frame could not be parsed or a field failed to decode.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// A well-formed message violated the expected conversation.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The peer's schema or version does not match ours.
    #[error("incompatible link: {reason}")]
    IncompatibleLink {
        /// Close code identifying which handshake check failed.
        code: CloseCode,
        /// Human-readable mismatch description.
        reason: String,
    },
    /// A response referenced a transaction that is not active (or is of
    /// the wrong kind). Non-fatal: late responses for already-completed
    /// transactions land here and are dropped.
    #[error("no active transaction with id {0}")]
    InvalidTransaction(Tid),
    /// A transaction id was issued twice. Library bug.
    #[error("transaction with id {0} already exists")]
    DuplicateTransaction(Tid),
    /// An event or function name outside the defined schema was used.
    #[error("'{0}' is not defined in the link schema")]
    InvalidIdentifier(String),
    /// `emit` was called for an event not defined as outgoing.
    #[error("event '{0}' is not defined as outgoing")]
    InvalidOutgoingEvent(String),
    /// The remote function handler reported a failure.
    #[error("remote function error: {0}")]
    RemoteFunction(String),
    /// The connection closed while an operation was pending.
    #[error("connection closed")]
    ConnectionClosed,
    /// The peer stopped answering keepalive pings.
    #[error("connection timed out")]
    TimedOut,
    /// WebSocket transport failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// A user payload failed to encode or decode.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<WireError> for LinkError {
    fn from(err: WireError) -> Self {
        match err {
            // An unknown type name is a conversation-level violation, not
            // a broken frame.
            WireError::UnknownType(name) => {
                Self::Protocol(format!("unknown message type '{name}'"))
            }
            other => Self::MalformedMessage(other.to_string()),
        }
    }
}

impl LinkError {
    /// The close code a supervisor should use when this error tears the
    /// connection down, or `None` for the kinds that must not close it:
    /// stray responses are logged and dropped, and the programmer-error
    /// kinds propagate to the caller that triggered them.
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::InvalidTransaction(_)
            | Self::DuplicateTransaction(_)
            | Self::InvalidIdentifier(_)
            | Self::InvalidOutgoingEvent(_) => None,
            Self::MalformedMessage(_) => Some(CloseCode::MalformedMessage),
            Self::Protocol(_) => Some(CloseCode::ProtocolError),
            Self::IncompatibleLink { code, .. } => Some(*code),
            _ => Some(CloseCode::UndefinedLinkError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_follow_the_translation_table() {
        assert_eq!(
            LinkError::MalformedMessage("x".into()).close_code(),
            Some(CloseCode::MalformedMessage)
        );
        assert_eq!(
            LinkError::Protocol("x".into()).close_code(),
            Some(CloseCode::ProtocolError)
        );
        assert_eq!(
            LinkError::IncompatibleLink {
                code: CloseCode::LinkVersionMismatch,
                reason: "x".into()
            }
            .close_code(),
            Some(CloseCode::LinkVersionMismatch)
        );
        assert_eq!(
            LinkError::TimedOut.close_code(),
            Some(CloseCode::UndefinedLinkError)
        );
    }

    #[test]
    fn stray_and_programmer_errors_never_close_the_connection() {
        assert_eq!(LinkError::InvalidTransaction(42).close_code(), None);
        assert_eq!(LinkError::DuplicateTransaction(3).close_code(), None);
        assert_eq!(LinkError::InvalidIdentifier("Temp".into()).close_code(), None);
        assert_eq!(
            LinkError::InvalidOutgoingEvent("Temp".into()).close_code(),
            None
        );
    }

    #[test]
    fn unknown_wire_type_maps_to_protocol_error() {
        let err: LinkError = WireError::UnknownType("frob".into()).into();
        assert!(matches!(err, LinkError::Protocol(_)));
        let err: LinkError = WireError::MissingType.into();
        assert!(matches!(err, LinkError::MalformedMessage(_)));
    }
}
