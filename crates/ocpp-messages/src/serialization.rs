//! Frame encoding with size limits, and compact frame summaries for logs.

use crate::{Direction, SchemaValidator};
use ocpp_types::{Message, OcppError, OcppResult, OcppVersion};

/// Default upper bound on an encoded frame.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65536;

/// Encodes and decodes OCPP-J frames for one protocol version.
#[derive(Debug, Clone)]
pub struct MessageSerializer {
    version: OcppVersion,
    max_message_size: usize,
}

impl MessageSerializer {
    pub fn new(version: OcppVersion) -> Self {
        Self {
            version,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn version(&self) -> OcppVersion {
        self.version
    }

    /// Encodes a frame, rejecting anything larger than the configured limit.
    pub fn serialize_message(&self, message: &Message) -> OcppResult<String> {
        let text = message.encode()?;
        if text.len() > self.max_message_size {
            return Err(OcppError::protocol_violation(format!(
                "message size {} exceeds limit {}",
                text.len(),
                self.max_message_size
            )));
        }
        Ok(text)
    }

    pub fn deserialize_message(&self, text: &str) -> OcppResult<Message> {
        if text.len() > self.max_message_size {
            return Err(OcppError::protocol_violation(format!(
                "message size {} exceeds limit {}",
                text.len(),
                self.max_message_size
            )));
        }
        Message::decode(text)
    }

    /// Validates a payload against this serializer's protocol version.
    pub fn validate_payload(
        &self,
        action: &str,
        direction: Direction,
        payload: &serde_json::Value,
    ) -> OcppResult<()> {
        SchemaValidator::validate(self.version, action, direction, payload)
    }
}

impl Default for MessageSerializer {
    fn default() -> Self {
        Self::new(OcppVersion::V16J)
    }
}

/// One-line description of a frame.
pub fn format_message_summary(message: &Message) -> String {
    match message {
        Message::Call(call) => format!("Call[{}] {}", call.unique_id, call.action),
        Message::CallResult(result) => format!("CallResult[{}]", result.unique_id),
        Message::CallError(error) => format!(
            "CallError[{}] {}: {}",
            error.unique_id, error.error_code, error.error_description
        ),
    }
}
