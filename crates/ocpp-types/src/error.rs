//! Error types for OCPP framing and payload handling

use thiserror::Error;

/// Errors raised while decoding, validating or dispatching OCPP frames.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OcppError {
    /// Frame does not start with 2, 3 or 4, or the array shape is wrong.
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// Payload does not conform to the action's schema.
    #[error("Schema violation for {action}: {message}")]
    SchemaViolation { action: String, message: String },

    /// No handler is registered for the action.
    #[error("Unimplemented action: {action}")]
    UnimplementedAction { action: String },

    #[error("JSON error: {message}")]
    Json { message: String },

    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl OcppError {
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        OcppError::ProtocolViolation {
            message: message.into(),
        }
    }

    pub fn schema_violation(action: impl Into<String>, message: impl Into<String>) -> Self {
        OcppError::SchemaViolation {
            action: action.into(),
            message: message.into(),
        }
    }

    pub fn unimplemented(action: impl Into<String>) -> Self {
        OcppError::UnimplementedAction {
            action: action.into(),
        }
    }

    /// The CallError code used when this error answers an inbound Call.
    pub fn call_error_code(&self) -> CallErrorCode {
        match self {
            OcppError::UnimplementedAction { .. } => CallErrorCode::NotImplemented,
            OcppError::SchemaViolation { .. } | OcppError::Json { .. } => {
                CallErrorCode::FormationViolation
            }
            OcppError::ProtocolViolation { .. } => CallErrorCode::ProtocolError,
            _ => CallErrorCode::InternalError,
        }
    }
}

impl From<serde_json::Error> for OcppError {
    fn from(err: serde_json::Error) -> Self {
        OcppError::Json {
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for OcppError {
    fn from(err: anyhow::Error) -> Self {
        OcppError::Internal {
            message: err.to_string(),
        }
    }
}

/// CallError codes defined by OCPP-J.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CallErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl CallErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallErrorCode::NotImplemented => "NotImplemented",
            CallErrorCode::NotSupported => "NotSupported",
            CallErrorCode::InternalError => "InternalError",
            CallErrorCode::ProtocolError => "ProtocolError",
            CallErrorCode::SecurityError => "SecurityError",
            CallErrorCode::FormationViolation => "FormationViolation",
            CallErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            CallErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            CallErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            CallErrorCode::GenericError => "GenericError",
        }
    }

    /// Parses a wire error code. Codes outside OCPP-J map to `GenericError`.
    pub fn from_wire(code: &str) -> Self {
        match code {
            "NotImplemented" => CallErrorCode::NotImplemented,
            "NotSupported" => CallErrorCode::NotSupported,
            "InternalError" => CallErrorCode::InternalError,
            "ProtocolError" => CallErrorCode::ProtocolError,
            "SecurityError" => CallErrorCode::SecurityError,
            "FormationViolation" => CallErrorCode::FormationViolation,
            "PropertyConstraintViolation" => CallErrorCode::PropertyConstraintViolation,
            "OccurrenceConstraintViolation" => CallErrorCode::OccurrenceConstraintViolation,
            "TypeConstraintViolation" => CallErrorCode::TypeConstraintViolation,
            _ => CallErrorCode::GenericError,
        }
    }
}

impl std::fmt::Display for CallErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type OcppResult<T> = Result<T, OcppError>;
