//! OCPP-J frames: `[2, id, action, payload]`, `[3, id, payload]`,
//! `[4, id, errorCode, errorDescription, errorDetails]`.

use crate::{CallErrorCode, MessageType, OcppError, OcppResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A decoded OCPP-J frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call(CallMessage),
    CallResult(CallResultMessage),
    CallError(CallErrorMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Call(_) => MessageType::Call,
            Message::CallResult(_) => MessageType::CallResult,
            Message::CallError(_) => MessageType::CallError,
        }
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Message::Call(msg) => &msg.unique_id,
            Message::CallResult(msg) => &msg.unique_id,
            Message::CallError(msg) => &msg.unique_id,
        }
    }

    /// Serializes the frame as a JSON array.
    pub fn encode(&self) -> OcppResult<String> {
        Ok(serde_json::to_string(&RawMessage::from(self.clone()))?)
    }

    /// Parses a JSON array into a frame.
    ///
    /// A leading element other than 2, 3 or 4, or an array of the wrong shape for
    /// its type, is a [`OcppError::ProtocolViolation`].
    pub fn decode(text: &str) -> OcppResult<Message> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Array(mut frame) = value else {
            return Err(OcppError::protocol_violation("frame is not a JSON array"));
        };

        let type_id = frame
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| OcppError::protocol_violation("frame has no numeric message type"))?;
        let message_type = MessageType::try_from(type_id)?;

        match (message_type, frame.as_mut_slice()) {
            (
                MessageType::Call,
                [_, Value::String(unique_id), Value::String(action), payload],
            ) => Ok(Message::Call(CallMessage {
                unique_id: std::mem::take(unique_id),
                action: std::mem::take(action),
                payload: payload.take(),
            })),
            (MessageType::CallResult, [_, Value::String(unique_id), payload]) => {
                Ok(Message::CallResult(CallResultMessage {
                    unique_id: std::mem::take(unique_id),
                    payload: payload.take(),
                }))
            }
            (
                MessageType::CallError,
                [_, Value::String(unique_id), Value::String(code), Value::String(description), rest @ ..],
            ) if rest.len() <= 1 => Ok(Message::CallError(CallErrorMessage {
                unique_id: std::mem::take(unique_id),
                error_code: CallErrorCode::from_wire(code),
                error_description: std::mem::take(description),
                error_details: rest
                    .first_mut()
                    .map(Value::take)
                    .unwrap_or_else(|| Value::Object(Default::default())),
            })),
            (message_type, elements) => Err(OcppError::protocol_violation(format!(
                "malformed {:?} frame with {} elements",
                message_type,
                elements.len()
            ))),
        }
    }
}

/// A request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMessage {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
}

impl CallMessage {
    /// Builds a call with a freshly generated message id.
    pub fn new<T>(action: impl Into<String>, payload: T) -> OcppResult<Self>
    where
        T: Serialize,
    {
        Ok(CallMessage {
            unique_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn payload_as<T>(&self) -> OcppResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// A successful response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResultMessage {
    pub unique_id: String,
    pub payload: Value,
}

impl CallResultMessage {
    pub fn new<T>(unique_id: impl Into<String>, payload: T) -> OcppResult<Self>
    where
        T: Serialize,
    {
        Ok(CallResultMessage {
            unique_id: unique_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn payload_as<T>(&self) -> OcppResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// An error response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallErrorMessage {
    pub unique_id: String,
    pub error_code: CallErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallErrorMessage {
    pub fn new(
        unique_id: impl Into<String>,
        error_code: CallErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        CallErrorMessage {
            unique_id: unique_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Default::default()),
        }
    }
}

/// Wire shape of a frame, serialized as a bare JSON array.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawMessage {
    Call(u8, String, String, Value),
    CallResult(u8, String, Value),
    CallError(u8, String, String, String, Value),
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> Self {
        match message {
            Message::Call(msg) => RawMessage::Call(
                MessageType::Call.into(),
                msg.unique_id,
                msg.action,
                msg.payload,
            ),
            Message::CallResult(msg) => {
                RawMessage::CallResult(MessageType::CallResult.into(), msg.unique_id, msg.payload)
            }
            Message::CallError(msg) => RawMessage::CallError(
                MessageType::CallError.into(),
                msg.unique_id,
                msg.error_code.as_str().to_string(),
                msg.error_description,
                msg.error_details,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_round_trip() {
        let call = CallMessage::new("Authorize", json!({"idTag": "12345"})).unwrap();
        let text = Message::Call(call.clone()).encode().unwrap();

        assert!(text.starts_with("[2,"));
        match Message::decode(&text).unwrap() {
            Message::Call(decoded) => assert_eq!(decoded, call),
            other => panic!("Expected Call, got {other:?}"),
        }
    }

    #[test]
    fn test_call_result_round_trip() {
        let result = CallResultMessage::new("abc", json!({"status": "Accepted"})).unwrap();
        let text = Message::CallResult(result.clone()).encode().unwrap();

        assert_eq!(text, r#"[3,"abc",{"status":"Accepted"}]"#);
        assert_eq!(Message::decode(&text).unwrap(), Message::CallResult(result));
    }

    #[test]
    fn test_call_error_encoding() {
        let error = CallErrorMessage::new("id-1", CallErrorCode::NotImplemented, "no handler");
        let text = Message::CallError(error).encode().unwrap();
        assert_eq!(text, r#"[4,"id-1","NotImplemented","no handler",{}]"#);
    }

    #[test]
    fn test_call_error_without_details() {
        let decoded = Message::decode(r#"[4,"id-2","GenericError","oops"]"#).unwrap();
        match decoded {
            Message::CallError(error) => {
                assert_eq!(error.error_code, CallErrorCode::GenericError);
                assert_eq!(error.error_details, json!({}));
            }
            other => panic!("Expected CallError, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_message_type_is_protocol_violation() {
        let result = Message::decode(r#"[5,"id","Heartbeat",{}]"#);
        assert!(matches!(result, Err(OcppError::ProtocolViolation { .. })));
    }

    #[test]
    fn test_wrong_shape_is_protocol_violation() {
        assert!(matches!(
            Message::decode(r#"[3,"id"]"#),
            Err(OcppError::ProtocolViolation { .. })
        ));
        assert!(matches!(
            Message::decode(r#"{"not":"an array"}"#),
            Err(OcppError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_invalid_json_is_json_error() {
        assert!(matches!(
            Message::decode("[2,"),
            Err(OcppError::Json { .. })
        ));
    }

    #[test]
    fn test_payload_extraction() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct TestPayload {
            #[serde(rename = "idTag")]
            id_tag: String,
        }

        let payload = TestPayload {
            id_tag: "TEST123".to_string(),
        };
        let msg = CallMessage::new("Authorize", &payload).unwrap();
        let extracted: TestPayload = msg.payload_as().unwrap();
        assert_eq!(extracted, payload);
    }
}
