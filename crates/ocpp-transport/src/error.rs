//! Transport layer error types

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No connection has been opened yet
    #[error("Not connected")]
    NotConnected,

    /// Connection exists but is not open (handshaking or closing)
    #[error("Connection not ready, current state: {state:?}")]
    NotReady { state: crate::ConnectionState },

    /// The socket could not be opened or failed underneath
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    /// The peer broke the WebSocket framing rules
    #[error("WebSocket protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("No answer to the upgrade request within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// The central system refused the upgrade (wrong id, bad password, ...)
    #[error("Upgrade rejected: {message}")]
    HandshakeError { message: String },
}

impl TransportError {
    /// Errors that mean "back off and try later" rather than "this connection is gone".
    pub fn is_not_ready(&self) -> bool {
        matches!(self, TransportError::NotReady { .. })
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::ConnectionError {
            message: err.to_string(),
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::ConnectionClosed {
                    reason: err.to_string(),
                }
            }
            tungstenite::Error::Protocol(msg) => TransportError::ProtocolError {
                message: msg.to_string(),
            },
            tungstenite::Error::Capacity(msg) => TransportError::ProtocolError {
                message: msg.to_string(),
            },
            tungstenite::Error::Http(response) => TransportError::HandshakeError {
                message: format!("server answered with HTTP {}", response.status()),
            },
            other => TransportError::ConnectionError {
                message: other.to_string(),
            },
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectionState;

    #[test]
    fn test_not_ready() {
        let not_ready = TransportError::NotReady {
            state: ConnectionState::Connecting,
        };
        assert!(not_ready.to_string().contains("Connecting"));
        assert!(not_ready.is_not_ready());
        assert!(!TransportError::NotConnected.is_not_ready());
    }

    #[test]
    fn test_refused_socket_is_connection_error() {
        let io_error =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "Connection refused");

        match TransportError::from(io_error) {
            TransportError::ConnectionError { message } => {
                assert!(message.contains("Connection refused"));
            }
            other => panic!("Expected ConnectionError, got {:?}", other),
        }
    }

    #[test]
    fn test_closed_socket() {
        let closed = TransportError::from(tungstenite::Error::AlreadyClosed);
        assert!(matches!(closed, TransportError::ConnectionClosed { .. }));
    }
}
