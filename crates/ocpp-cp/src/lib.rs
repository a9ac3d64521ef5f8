//! # OCPP Charge Point Session
//!
//! A simulated OCPP 1.6J charge point:
//! - connection lifecycle over any [`ocpp_transport::Connector`]
//! - strict call turn-taking through the [`outbox::Outbox`]
//! - dispatch of inbound Calls and CallResults
//! - transaction tracking with simulated meter and SoC readings
//! - vendor-specific configuration tables

pub mod error;
pub mod message_handler;
pub mod outbox;
pub mod session;
pub mod status;
pub mod transaction;
pub mod vendor;

pub use error::{ChargePointError, ChargePointResult, ErrorCategory};
pub use session::{Session, SessionSnapshot};
pub use status::SessionStatus;
pub use transaction::{MeterValuesSink, TransactionManager};
pub use vendor::{ConfigurationStore, Vendor, VendorProfile};

use ocpp_types::v16j::{RegistrationStatus, ResetType};
use ocpp_types::OcppVersion;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Charge point identifier, appended to the endpoint
    pub charge_point_id: String,
    /// Central system WebSocket URL
    pub endpoint: String,
    pub ocpp_version: OcppVersion,
    /// Password for HTTP basic authentication on the upgrade request
    pub basic_auth_password: Option<String>,
    /// Model name; selects the vendor profile
    pub model: String,
    /// Rated power in kW
    pub power_kw: f64,
    /// Adds the aggregate connector 0 next to connectors 1 and 2
    pub twin_gun: bool,
    /// Explicit connector ids, overriding `twin_gun`
    pub connector_ids: Option<Vec<u32>>,
    /// Energy register before the first transaction, in Wh
    pub initial_meter_reading: i64,
    /// How long a call waits for its CallResult
    pub call_timeout_secs: u64,
    /// MeterValues period of an active transaction
    pub meter_values_interval_secs: u64,
    /// Local admin WebSocket port
    pub admin_port: Option<u16>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            charge_point_id: "VCP_1".to_string(),
            endpoint: "ws://127.0.0.1:9000".to_string(),
            ocpp_version: OcppVersion::V16J,
            basic_auth_password: None,
            model: "EVC01".to_string(),
            power_kw: 7.0,
            twin_gun: false,
            connector_ids: None,
            initial_meter_reading: 0,
            call_timeout_secs: 30,
            meter_values_interval_secs: 30,
            admin_port: None,
        }
    }
}

impl SessionConfig {
    /// The explicit list if given, else `[0, 1, 2]` for twin-gun, else `[1]`.
    pub fn connector_ids(&self) -> Vec<u32> {
        match &self.connector_ids {
            Some(ids) if !ids.is_empty() => ids.clone(),
            _ if self.twin_gun => vec![0, 1, 2],
            _ => vec![1],
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn meter_values_interval(&self) -> Duration {
        Duration::from_secs(self.meter_values_interval_secs)
    }

    pub fn validate(&self) -> ChargePointResult<()> {
        if self.charge_point_id.trim().is_empty() {
            return Err(ChargePointError::configuration(
                "charge_point_id must not be empty",
            ));
        }
        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(ChargePointError::configuration(format!(
                "endpoint must be a ws:// or wss:// URL, got {}",
                self.endpoint
            )));
        }
        if !(self.power_kw > 0.0) {
            return Err(ChargePointError::configuration("power_kw must be positive"));
        }
        if self.call_timeout_secs == 0 {
            return Err(ChargePointError::configuration(
                "call_timeout_secs must be positive",
            ));
        }
        if self.meter_values_interval_secs == 0 {
            return Err(ChargePointError::configuration(
                "meter_values_interval_secs must be positive",
            ));
        }
        Ok(())
    }
}

/// Lifecycle events published by a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Transport open
    Connected { charge_point_id: String },
    /// BootNotification answered
    Booted {
        charge_point_id: String,
        status: RegistrationStatus,
        interval: i32,
    },
    /// Transport closed; `unsolicited` when the session did not initiate it
    Closed {
        charge_point_id: String,
        code: u16,
        reason: String,
        unsolicited: bool,
    },
    /// The central system asked for a reset; the session closes right after
    ResetRequested {
        charge_point_id: String,
        reset_type: ResetType,
    },
}

impl SessionEvent {
    pub fn charge_point_id(&self) -> &str {
        match self {
            SessionEvent::Connected { charge_point_id }
            | SessionEvent::Booted {
                charge_point_id, ..
            }
            | SessionEvent::Closed {
                charge_point_id, ..
            }
            | SessionEvent::ResetRequested {
                charge_point_id, ..
            } => charge_point_id,
        }
    }
}
