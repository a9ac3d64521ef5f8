//! # OCPP Types
//!
//! Frame model, shared enums and the error taxonomy used by the virtual charge point
//! crates. Only OCPP 1.6J is modelled.

pub mod common;
pub mod error;
pub mod message;
pub mod v16j;

pub use error::*;
pub use message::*;

pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;

/// OCPP protocol version spoken by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OcppVersion {
    #[default]
    #[serde(rename = "ocpp1.6", alias = "1.6")]
    V16J,
}

impl OcppVersion {
    /// WebSocket subprotocol negotiated for this version.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            OcppVersion::V16J => "ocpp1.6",
        }
    }
}

impl std::fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OcppVersion::V16J => write!(f, "1.6"),
        }
    }
}

/// Leading element of an OCPP-J frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl TryFrom<u64> for MessageType {
    type Error = OcppError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::CallResult),
            4 => Ok(MessageType::CallError),
            other => Err(OcppError::protocol_violation(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(msg_type: MessageType) -> Self {
        msg_type as u8
    }
}

/// Identifier presented for authorization.
pub type IdToken = String;
