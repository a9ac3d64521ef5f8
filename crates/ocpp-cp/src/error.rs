//! # Charge Point Error Handling
//!
//! Error taxonomy of a simulated charge point session.

use ocpp_transport::TransportError;
use ocpp_types::{CallErrorCode, OcppError};
use thiserror::Error;

/// Charge point error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChargePointError {
    /// Not connected, socket not open, or the socket failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Unknown frame type or a result/error with no matching pending call
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Payload failed validation
    #[error("Schema violation for {action}: {message}")]
    SchemaViolation { action: String, message: String },

    /// No handler for an inbound action, or for the action a result answers
    #[error("Unimplemented action: {action}")]
    UnimplementedAction { action: String },

    /// A bounded wait expired
    #[error("Timeout: {operation} after {duration_ms}ms")]
    SimulationTimeout { operation: String, duration_ms: u64 },

    /// Central system answered a call with a CallError
    #[error("{action} rejected by central system: {code} {description}")]
    CallError {
        action: String,
        code: CallErrorCode,
        description: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChargePointError {
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn schema_violation(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            action: action.into(),
            message: message.into(),
        }
    }

    pub fn unimplemented(action: impl Into<String>) -> Self {
        Self::UnimplementedAction {
            action: action.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::SimulationTimeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether trying the same operation later can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(TransportError::NotReady { .. }) => true,
            Self::Transport(TransportError::Timeout { .. }) => true,
            Self::SimulationTimeout { .. } => true,
            Self::CallError { .. } => true,
            Self::Transport(_) => false,
            Self::ProtocolViolation(_) => false,
            Self::SchemaViolation { .. } => false,
            Self::UnimplementedAction { .. } => false,
            Self::Configuration(_) => false,
            Self::Internal(_) => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) => ErrorCategory::Transport,
            Self::ProtocolViolation(_) | Self::SchemaViolation { .. } => ErrorCategory::Protocol,
            Self::UnimplementedAction { .. } | Self::CallError { .. } => ErrorCategory::Dispatch,
            Self::SimulationTimeout { .. } => ErrorCategory::Simulation,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// CallError code used when this error answers an inbound Call.
    pub fn call_error_code(&self) -> CallErrorCode {
        match self {
            Self::UnimplementedAction { .. } => CallErrorCode::NotImplemented,
            Self::SchemaViolation { .. } => CallErrorCode::FormationViolation,
            Self::ProtocolViolation(_) => CallErrorCode::ProtocolError,
            _ => CallErrorCode::InternalError,
        }
    }
}

/// Error categories for grouping in logs and status output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Dispatch,
    Simulation,
    Configuration,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Dispatch => write!(f, "dispatch"),
            ErrorCategory::Simulation => write!(f, "simulation"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

impl From<OcppError> for ChargePointError {
    fn from(err: OcppError) -> Self {
        match err {
            OcppError::ProtocolViolation { message } => Self::ProtocolViolation(message),
            OcppError::SchemaViolation { action, message } => {
                Self::SchemaViolation { action, message }
            }
            OcppError::UnimplementedAction { action } => Self::UnimplementedAction { action },
            OcppError::Json { message } => Self::SchemaViolation {
                action: "unknown".to_string(),
                message,
            },
            OcppError::Timeout { operation } => Self::SimulationTimeout {
                operation,
                duration_ms: 0,
            },
            OcppError::Configuration { message } => Self::Configuration(message),
            OcppError::Internal { message } => Self::Internal(message),
        }
    }
}

impl From<serde_json::Error> for ChargePointError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

pub type ChargePointResult<T> = Result<T, ChargePointError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ocpp_transport::ConnectionState;

    #[test]
    fn test_error_creation() {
        let error = ChargePointError::timeout("StatusNotification on connector 1", 5000);
        assert_eq!(
            error.to_string(),
            "Timeout: StatusNotification on connector 1 after 5000ms"
        );
        assert_eq!(error.category(), ErrorCategory::Simulation);
    }

    #[test]
    fn test_error_properties() {
        let not_ready = ChargePointError::from(TransportError::NotReady {
            state: ConnectionState::Connecting,
        });
        assert!(not_ready.is_recoverable());
        assert_eq!(not_ready.category(), ErrorCategory::Transport);

        let not_connected = ChargePointError::from(TransportError::NotConnected);
        assert!(!not_connected.is_recoverable());

        let unimplemented = ChargePointError::unimplemented("UpdateFirmware");
        assert!(!unimplemented.is_recoverable());
        assert_eq!(unimplemented.call_error_code(), CallErrorCode::NotImplemented);
    }

    #[test]
    fn test_conversion_from_ocpp_error() {
        let error: ChargePointError =
            OcppError::schema_violation("StartTransaction", "missing idTag").into();
        assert_eq!(
            error,
            ChargePointError::schema_violation("StartTransaction", "missing idTag")
        );
        assert_eq!(error.call_error_code(), CallErrorCode::FormationViolation);

        let error: ChargePointError = OcppError::protocol_violation("bad frame").into();
        assert!(matches!(error, ChargePointError::ProtocolViolation(_)));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Dispatch.to_string(), "dispatch");
        assert_eq!(ErrorCategory::Transport.to_string(), "transport");
    }
}
