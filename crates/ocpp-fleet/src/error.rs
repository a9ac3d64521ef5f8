//! # Fleet Error Handling
//!
//! Errors surfaced by the fleet orchestrator and the charge cycle simulator.

use ocpp_cp::ChargePointError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FleetError {
    /// Invalid or unreadable fleet configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A member session failed
    #[error("Session {charge_point_id}: {source}")]
    Session {
        charge_point_id: String,
        #[source]
        source: ChargePointError,
    },

    /// No member with the given id
    #[error("Session not found: {0}")]
    NotFound(String),

    /// A member with the given id is already registered
    #[error("Session already registered: {0}")]
    Duplicate(String),

    /// A charge cycle could not continue
    #[error("Simulation error on {charge_point_id} connector {connector_id}: {message}")]
    Simulation {
        charge_point_id: String,
        connector_id: u32,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(String),
}

impl FleetError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn session(charge_point_id: impl Into<String>, source: ChargePointError) -> Self {
        Self::Session {
            charge_point_id: charge_point_id.into(),
            source,
        }
    }

    pub fn simulation(
        charge_point_id: impl Into<String>,
        connector_id: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::Simulation {
            charge_point_id: charge_point_id.into(),
            connector_id,
            message: message.into(),
        }
    }

    /// Whether retrying later can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Session { source, .. } => source.is_recoverable(),
            Self::Simulation { .. } => true,
            _ => false,
        }
    }
}

impl From<ChargePointError> for FleetError {
    fn from(err: ChargePointError) -> Self {
        match err {
            ChargePointError::Configuration(message) => Self::Configuration(message),
            other => Self::Session {
                charge_point_id: "unknown".to_string(),
                source: other,
            },
        }
    }
}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(format!("invalid TOML: {}", err))
    }
}

impl From<toml::ser::Error> for FleetError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Configuration(format!("cannot render TOML: {}", err))
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Configuration(format!("invalid JSON: {}", err))
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
