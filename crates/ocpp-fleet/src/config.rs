//! # Fleet Configuration
//!
//! Settings for a fleet of simulated charge points, loaded from TOML or JSON. Every field
//! has a default, so a file only needs the values it changes.

use crate::error::{FleetError, FleetResult};
use ocpp_cp::SessionConfig;
use ocpp_types::OcppVersion;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Central system WebSocket URL
    pub endpoint: String,
    pub ocpp_version: OcppVersion,
    /// Password for HTTP basic authentication
    pub basic_auth_password: Option<String>,
    /// Member `i` is named `<id_prefix><i>`
    pub id_prefix: String,
    /// Number of sessions
    pub count: u32,
    /// Delay between consecutive session starts
    pub stagger_ms: u64,
    /// Pause before each connector's Preparing notification during boot
    pub boot_status_gap_ms: u64,
    pub model: String,
    /// Rated power in kW
    pub power_kw: f64,
    pub twin_gun: bool,
    pub connector_ids: Option<Vec<u32>>,
    /// Energy register before the first transaction, in Wh
    pub initial_meter_reading: i64,
    pub call_timeout_secs: u64,
    /// Bounded wait for each boot StatusNotification
    pub boot_status_timeout_secs: u64,
    pub meter_values_interval_secs: u64,
    pub charge: ChargeConfig,
    /// Admin channel port of the first member
    pub admin_port: Option<u16>,
    /// Give every member its own admin port, counting up from `admin_port`
    pub admin_port_increment: bool,
    pub logging: LoggingConfig,
}

/// Test charge settings, applied after the whole fleet has booted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargeConfig {
    pub enabled: bool,
    /// Percent chance, per member, of running the test charge
    pub start_chance: u8,
    pub duration_minutes: u64,
    /// Sequential charge cycles per connector
    pub session_count: u32,
    /// Honor the vendor's random start delay
    pub random_delay: bool,
    pub id_tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` wins when set
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9000".to_string(),
            ocpp_version: OcppVersion::V16J,
            basic_auth_password: None,
            id_prefix: "VCP_".to_string(),
            count: 1,
            stagger_ms: 500,
            boot_status_gap_ms: 100,
            model: "EVC01".to_string(),
            power_kw: 7.0,
            twin_gun: false,
            connector_ids: None,
            initial_meter_reading: 0,
            call_timeout_secs: 30,
            boot_status_timeout_secs: 5,
            meter_values_interval_secs: 30,
            charge: ChargeConfig::default(),
            admin_port: None,
            admin_port_increment: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ChargeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_chance: 100,
            duration_minutes: 1,
            session_count: 1,
            random_delay: false,
            id_tag: "freevenIdTag".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl FleetConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> FleetResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| FleetError::Io(format!("{}: {}", path.display(), e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => Err(FleetError::configuration(format!(
                "unsupported configuration format for {}, use .toml or .json",
                path.display()
            ))),
        }
    }

    pub fn to_toml(&self) -> FleetResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> FleetResult<()> {
        if self.count == 0 {
            return Err(FleetError::configuration("count must be greater than 0"));
        }
        if self.id_prefix.trim().is_empty() {
            return Err(FleetError::configuration("id_prefix must not be empty"));
        }
        if self.charge.start_chance > 100 {
            return Err(FleetError::configuration(
                "charge.start_chance is a percentage (0-100)",
            ));
        }
        if self.charge.enabled && self.charge.session_count == 0 {
            return Err(FleetError::configuration(
                "charge.session_count must be greater than 0",
            ));
        }
        if self.boot_status_timeout_secs == 0 {
            return Err(FleetError::configuration(
                "boot_status_timeout_secs must be greater than 0",
            ));
        }
        if let Some(port) = self.admin_port {
            let last = u32::from(port) + self.count - 1;
            if self.admin_port_increment && last > u32::from(u16::MAX) {
                return Err(FleetError::configuration(format!(
                    "admin ports {}..={} exceed the port range",
                    port, last
                )));
            }
        }
        // per-session settings share their checks with the session itself
        self.session_config(1).validate()?;
        Ok(())
    }

    /// Id of fleet member `index`, counting from 1.
    pub fn charge_point_id(&self, index: u32) -> String {
        format!("{}{}", self.id_prefix, index)
    }

    /// Admin port of member `index`: the base port for the first member, the base plus
    /// `index - 1` for every member when incrementing, otherwise none.
    pub fn admin_port_for(&self, index: u32) -> Option<u16> {
        let base = self.admin_port?;
        if index == 1 {
            Some(base)
        } else if self.admin_port_increment {
            u16::try_from(u32::from(base) + index - 1).ok()
        } else {
            None
        }
    }

    /// Session settings of member `index`.
    pub fn session_config(&self, index: u32) -> SessionConfig {
        self.session_config_for(self.charge_point_id(index), self.admin_port_for(index))
    }

    pub fn session_config_for(
        &self,
        charge_point_id: impl Into<String>,
        admin_port: Option<u16>,
    ) -> SessionConfig {
        SessionConfig {
            charge_point_id: charge_point_id.into(),
            endpoint: self.endpoint.clone(),
            ocpp_version: self.ocpp_version,
            basic_auth_password: self.basic_auth_password.clone(),
            model: self.model.clone(),
            power_kw: self.power_kw,
            twin_gun: self.twin_gun,
            connector_ids: self.connector_ids.clone(),
            initial_meter_reading: self.initial_meter_reading,
            call_timeout_secs: self.call_timeout_secs,
            meter_values_interval_secs: self.meter_values_interval_secs,
            admin_port,
        }
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn boot_status_gap(&self) -> Duration {
        Duration::from_millis(self.boot_status_gap_ms)
    }

    pub fn boot_status_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_status_timeout_secs)
    }
}
