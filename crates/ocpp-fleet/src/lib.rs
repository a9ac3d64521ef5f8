//! # OCPP Fleet
//!
//! Runs many simulated charge points against one central system:
//!
//! - staggered start, boot and status reporting of every member
//! - optional test charge cycles once the whole fleet is up
//! - stop by id, by id prefix, or all at once
//! - lifecycle events of every member on one channel

pub mod config;
pub mod error;
pub mod events;
pub mod fleet;
pub mod simulator;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ChargeConfig, FleetConfig, LogFormat, LoggingConfig};
pub use error::{FleetError, FleetResult};
pub use events::{EventBus, FleetEvent, FleetNotice};
pub use fleet::{FleetMember, FleetRegistry, MemberStatus, StartReport};
pub use simulator::{boot_sequence, fault_restart, simulate_charge, BootOptions, ChargePlan};
