//! # Charge Session Simulator
//!
//! Scripted charge point behavior on top of a connected [`Session`]: the boot sequence,
//! repeated test charge cycles per connector, and recovery from a fault mid-session.

use crate::error::{FleetError, FleetResult};
use chrono::Utc;
use ocpp_cp::transaction::wire_meter_value;
use ocpp_cp::{ChargePointError, Session};
use ocpp_messages::v16j::{
    AuthorizeRequest, BootNotificationRequest, StartTransactionRequest, StatusNotificationRequest,
    StopTransactionRequest,
};
use ocpp_types::common::Reason;
use ocpp_types::v16j::{ChargePointErrorCode, ChargePointStatus};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Pause before a connector's first cycle.
const CONNECTOR_WARMUP: Duration = Duration::from_millis(500);
/// Pause before StartTransaction when no random delay applies.
const PRE_START_PAUSE: Duration = Duration::from_millis(500);
/// Pause between StartTransaction and the Charging notification.
const CHARGING_NOTIFICATION_DELAY: Duration = Duration::from_secs(1);
/// Pause between StopTransaction and the Finishing notification.
const FINISHING_NOTIFICATION_DELAY: Duration = Duration::from_millis(500);
/// Upper bound of `chargePointSerialNumber` in BootNotification.
const SERIAL_NUMBER_MAX_LEN: usize = 25;

#[derive(Debug, Clone, PartialEq)]
pub struct BootOptions {
    /// Sleep before each connector's Preparing notification
    pub status_gap: Duration,
    /// Bound on each Preparing notification
    pub status_timeout: Duration,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            status_gap: Duration::from_millis(100),
            status_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargePlan {
    pub duration: Duration,
    /// Sequential cycles per connector
    pub session_count: u32,
    pub random_delay: bool,
    pub id_tag: String,
}

impl ChargePlan {
    pub fn new(duration_minutes: u64, session_count: u32, random_delay: bool) -> Self {
        Self {
            duration: Duration::from_secs(duration_minutes * 60),
            session_count,
            random_delay,
            id_tag: "freevenIdTag".to_string(),
        }
    }

    pub fn with_id_tag(mut self, id_tag: impl Into<String>) -> Self {
        self.id_tag = id_tag.into();
        self
    }
}

/// BootNotification, then a Preparing StatusNotification for every connector.
///
/// A connector whose notification is not answered within `status_timeout` is logged and
/// skipped; the remaining connectors still get theirs.
pub async fn boot_sequence(session: &Session, options: &BootOptions) -> FleetResult<()> {
    let charge_point_id = session.charge_point_id().to_string();
    let profile = session.profile();

    let mut boot = BootNotificationRequest::new(profile.vendor.name(), profile.model.clone());
    boot.charge_point_serial_number = Some(serial_number(&charge_point_id));
    boot.firmware_version = Some(profile.firmware_version.clone());

    let response = session
        .call_action(boot)
        .await
        .map_err(|e| FleetError::session(&charge_point_id, e))?;
    info!(
        charge_point_id = %charge_point_id,
        "Boot {:?} with {} {}", response.status, profile.vendor, profile.model
    );

    for connector_id in session.connector_ids() {
        tokio::time::sleep(options.status_gap).await;
        let preparing = StatusNotificationRequest::new(*connector_id, ChargePointStatus::Preparing);
        match session
            .call_action_within(preparing, options.status_timeout)
            .await
        {
            Ok(_) => debug!(charge_point_id = %charge_point_id, "Connector {} Preparing", connector_id),
            Err(ChargePointError::SimulationTimeout { .. }) => warn!(
                charge_point_id = %charge_point_id,
                "Connector {} Preparing not acknowledged within {:?}, skipping",
                connector_id,
                options.status_timeout
            ),
            Err(e) => return Err(FleetError::session(&charge_point_id, e)),
        }
    }
    Ok(())
}

/// Serial number reported at boot: the charge point id, cut to the field's limit.
fn serial_number(charge_point_id: &str) -> String {
    charge_point_id.chars().take(SERIAL_NUMBER_MAX_LEN).collect()
}

/// Runs `plan.session_count` charge cycles on every physical connector, connectors in
/// parallel. A failing connector does not stop the others; the first failure is returned
/// once all of them are done.
pub async fn simulate_charge(session: &Arc<Session>, plan: &ChargePlan) -> FleetResult<()> {
    let connectors = session.physical_connector_ids();
    info!(
        charge_point_id = %session.charge_point_id(),
        "Test charge on connectors {:?}: {} cycle(s) of {:?}",
        connectors,
        plan.session_count,
        plan.duration
    );

    let mut cycles = JoinSet::new();
    for connector_id in connectors {
        let session = Arc::clone(session);
        let plan = plan.clone();
        cycles.spawn(async move { charge_connector(&session, connector_id, &plan).await });
    }

    let mut first_error = None;
    while let Some(joined) = cycles.join_next().await {
        let outcome = joined.unwrap_or_else(|e| {
            Err(FleetError::simulation(
                session.charge_point_id(),
                0,
                format!("charge task aborted: {}", e),
            ))
        });
        if let Err(e) = outcome {
            warn!(charge_point_id = %session.charge_point_id(), "{}", e);
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

async fn charge_connector(session: &Session, connector_id: u32, plan: &ChargePlan) -> FleetResult<()> {
    let charge_point_id = session.charge_point_id();
    let fail = |e: ChargePointError| FleetError::session(charge_point_id, e);

    tokio::time::sleep(CONNECTOR_WARMUP).await;

    for cycle in 1..=plan.session_count {
        debug!(charge_point_id, "Connector {} cycle {}", connector_id, cycle);
        pre_start_delay(session, connector_id, plan.random_delay).await?;

        let meter_start = session.transactions().start_meter_value(connector_id);
        session
            .call_action(StartTransactionRequest {
                connector_id,
                id_tag: plan.id_tag.clone(),
                meter_start: wire_meter_value(meter_start),
                reservation_id: None,
                timestamp: Utc::now(),
            })
            .await
            .map_err(fail)?;

        tokio::time::sleep(CHARGING_NOTIFICATION_DELAY).await;
        session
            .call_action(StatusNotificationRequest::new(
                connector_id,
                ChargePointStatus::Charging,
            ))
            .await
            .map_err(fail)?;

        tokio::time::sleep(plan.duration).await;

        let transaction_id = session
            .transactions()
            .get_transaction_id_by_connector(connector_id)
            .ok_or_else(|| {
                FleetError::simulation(charge_point_id, connector_id, "no transaction to stop")
            })?;
        stop_transaction(session, transaction_id, Reason::Local).await?;

        tokio::time::sleep(FINISHING_NOTIFICATION_DELAY).await;
        session
            .call_action(StatusNotificationRequest::new(
                connector_id,
                ChargePointStatus::Finishing,
            ))
            .await
            .map_err(fail)?;
    }
    Ok(())
}

/// Sits out the vendor's random start delay, announcing it with the vendor's waiting
/// notification, or a short fixed pause when no delay applies.
async fn pre_start_delay(session: &Session, connector_id: u32, random_delay: bool) -> FleetResult<()> {
    let max_secs = if random_delay {
        session.random_delay_max().await
    } else {
        0
    };
    if max_secs == 0 {
        tokio::time::sleep(PRE_START_PAUSE).await;
        return Ok(());
    }

    let delay_ms = rand::thread_rng().gen_range(0..=max_secs * 1000);
    info!(
        charge_point_id = %session.charge_point_id(),
        "Connector {} waits {}ms (random delay up to {}s)", connector_id, delay_ms, max_secs
    );
    if let Some(waiting) = session
        .profile()
        .waiting_notification(connector_id, delay_ms / 1000)
    {
        session
            .call_action(waiting)
            .await
            .map_err(|e| FleetError::session(session.charge_point_id(), e))?;
    }
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    Ok(())
}

async fn stop_transaction(session: &Session, transaction_id: i32, reason: Reason) -> FleetResult<()> {
    let meter_stop = session.transactions().get_meter_value(transaction_id);
    session
        .call_action(StopTransactionRequest {
            id_tag: None,
            meter_stop: wire_meter_value(meter_stop),
            timestamp: Utc::now(),
            transaction_id,
            reason: Some(reason),
            transaction_data: None,
        })
        .await
        .map_err(|e| FleetError::session(session.charge_point_id(), e))?;
    Ok(())
}

/// Faulted, StopTransaction for the connector's last transaction, Authorize, a fresh
/// StartTransaction and Charging again.
pub async fn fault_restart(
    session: &Session,
    connector_id: u32,
    error_code: ChargePointErrorCode,
    id_tag: &str,
) -> FleetResult<()> {
    let charge_point_id = session.charge_point_id();
    let fail = |e: ChargePointError| FleetError::session(charge_point_id, e);
    warn!(charge_point_id, "Connector {} faulted: {}", connector_id, error_code);

    session
        .call_action(
            StatusNotificationRequest::new(connector_id, ChargePointStatus::Faulted)
                .with_error_code(error_code),
        )
        .await
        .map_err(fail)?;

    match session.transactions().get_transaction_id_by_connector(connector_id) {
        Some(transaction_id) => stop_transaction(session, transaction_id, Reason::Other).await?,
        None => debug!(charge_point_id, "Connector {} had no transaction", connector_id),
    }

    session
        .call_action(AuthorizeRequest {
            id_tag: id_tag.to_string(),
        })
        .await
        .map_err(fail)?;

    let meter_start = session.transactions().start_meter_value(connector_id);
    session
        .call_action(StartTransactionRequest {
            connector_id,
            id_tag: id_tag.to_string(),
            meter_start: wire_meter_value(meter_start),
            reservation_id: None,
            timestamp: Utc::now(),
        })
        .await
        .map_err(fail)?;

    session
        .call_action(StatusNotificationRequest::new(
            connector_id,
            ChargePointStatus::Charging,
        ))
        .await
        .map_err(fail)?;
    info!(charge_point_id, "Connector {} recovered", connector_id);
    Ok(())
}
