//! # Transaction Management
//!
//! Tracks the transactions of one session, simulates their meter and state-of-charge
//! readings from elapsed time, and drives the periodic MeterValues emission.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ocpp_messages::v16j::MeterValuesRequest;
use ocpp_types::common::{
    Location, Measurand, MeterValue, Phase, ReadingContext, SampledValue, UnitOfMeasure,
};
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Simulated charging current.
pub const SIMULATED_CURRENT_A: &str = "28.67";
/// Simulated phase voltage.
pub const SIMULATED_VOLTAGE_V: &str = "247";
/// State of charge a transaction starts from.
pub const INITIAL_SOC: u8 = 10;

/// Wh reading as carried in `meterStart`/`meterStop`.
pub fn wire_meter_value(wh: i64) -> i32 {
    i32::try_from(wh.max(0)).unwrap_or(i32::MAX)
}

/// Receives the periodic MeterValues trigger of an active transaction.
#[async_trait::async_trait]
pub trait MeterValuesSink: Send + Sync {
    async fn send_meter_values(&self, transaction_id: i32);
}

#[derive(Debug)]
pub struct Transaction {
    pub transaction_id: i32,
    pub connector_id: u32,
    pub started_at: DateTime<Utc>,
    pub baseline_wh: i64,
    pub last_meter_value: i64,
    pub soc: u8,
    pub power_kw: f64,
    started: Instant,
    timer: Option<JoinHandle<()>>,
}

impl Transaction {
    pub fn is_active(&self) -> bool {
        self.timer.is_some()
    }

    /// Energy delivered so far: baseline plus rated power times elapsed time, in Wh.
    fn meter_value_at(&self, now: Instant) -> i64 {
        let hours = now.saturating_duration_since(self.started).as_secs_f64() / 3600.0;
        (self.baseline_wh as f64 + self.power_kw * 1000.0 * hours).floor() as i64
    }
}

/// Per-session transaction index.
pub struct TransactionManager {
    charge_point_id: String,
    power_kw: f64,
    initial_meter_reading: i64,
    interval: Duration,
    transactions: DashMap<i32, Transaction>,
    by_connector: DashMap<u32, i32>,
}

impl TransactionManager {
    pub fn new(
        charge_point_id: impl Into<String>,
        power_kw: f64,
        initial_meter_reading: i64,
        interval: Duration,
    ) -> Self {
        Self {
            charge_point_id: charge_point_id.into(),
            power_kw,
            initial_meter_reading,
            interval,
            transactions: DashMap::new(),
            by_connector: DashMap::new(),
        }
    }

    /// Meter reading a new transaction on `connector_id` starts from: the last value of the
    /// previous transaction there, else the configured initial reading.
    pub fn start_meter_value(&self, connector_id: u32) -> i64 {
        self.get_transaction_id_by_connector(connector_id)
            .and_then(|id| self.transactions.get(&id).map(|t| t.last_meter_value))
            .unwrap_or(self.initial_meter_reading)
    }

    /// Begins tracking `transaction_id` and starts its MeterValues timer.
    pub fn start_transaction(
        &self,
        transaction_id: i32,
        connector_id: u32,
        sink: Weak<dyn MeterValuesSink>,
    ) {
        let baseline_wh = self.start_meter_value(connector_id);

        if let Some(previous) = self.by_connector.get(&connector_id).map(|id| *id) {
            if previous != transaction_id && self.is_active(previous) {
                warn!(
                    charge_point_id = %self.charge_point_id,
                    "Connector {} still had transaction {} running, stopping it",
                    connector_id, previous
                );
                self.stop_transaction(previous);
            }
        }

        let timer = self.spawn_timer(transaction_id, sink);
        let transaction = Transaction {
            transaction_id,
            connector_id,
            started_at: Utc::now(),
            baseline_wh,
            last_meter_value: baseline_wh,
            soc: INITIAL_SOC,
            power_kw: self.power_kw,
            started: Instant::now(),
            timer: Some(timer),
        };
        if let Some(replaced) = self.transactions.insert(transaction_id, transaction) {
            if let Some(timer) = replaced.timer {
                timer.abort();
            }
        }
        self.by_connector.insert(connector_id, transaction_id);

        info!(
            charge_point_id = %self.charge_point_id,
            "Transaction {} started on connector {} (meter start {} Wh)",
            transaction_id, connector_id, baseline_wh
        );
    }

    fn spawn_timer(&self, transaction_id: i32, sink: Weak<dyn MeterValuesSink>) -> JoinHandle<()> {
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(sink) = sink.upgrade() else {
                    break;
                };
                sink.send_meter_values(transaction_id).await;
            }
        })
    }

    /// Cancels the MeterValues timer. The record stays so later queries still resolve.
    pub fn stop_transaction(&self, transaction_id: i32) -> bool {
        let Some(mut transaction) = self.transactions.get_mut(&transaction_id) else {
            debug!(
                charge_point_id = %self.charge_point_id,
                "Stop for unknown transaction {}", transaction_id
            );
            return false;
        };
        match transaction.timer.take() {
            Some(timer) => {
                timer.abort();
                // freeze the reading at the moment of stopping
                let value = transaction.meter_value_at(Instant::now());
                transaction.last_meter_value = transaction.last_meter_value.max(value);
                info!(
                    charge_point_id = %self.charge_point_id,
                    "Transaction {} stopped at {} Wh",
                    transaction_id, transaction.last_meter_value
                );
                true
            }
            None => false,
        }
    }

    /// Simulated cumulative energy in Wh. Unknown ids read 0; stopped transactions keep
    /// their final value.
    pub fn get_meter_value(&self, transaction_id: i32) -> i64 {
        let Some(mut transaction) = self.transactions.get_mut(&transaction_id) else {
            return 0;
        };
        if transaction.is_active() {
            let value = transaction.meter_value_at(Instant::now());
            transaction.last_meter_value = transaction.last_meter_value.max(value);
        }
        transaction.last_meter_value
    }

    /// Advances and returns the state of charge. Unknown ids read the initial value.
    pub fn get_soc_value(&self, transaction_id: i32) -> u8 {
        let Some(mut transaction) = self.transactions.get_mut(&transaction_id) else {
            return INITIAL_SOC;
        };
        transaction.soc = transaction.soc.saturating_add(1).min(100);
        transaction.soc
    }

    /// Transaction most recently started on `connector_id`.
    pub fn get_transaction_id_by_connector(&self, connector_id: u32) -> Option<i32> {
        self.by_connector.get(&connector_id).map(|id| *id)
    }

    pub fn connector_of(&self, transaction_id: i32) -> Option<u32> {
        self.transactions.get(&transaction_id).map(|t| t.connector_id)
    }

    pub fn contains(&self, transaction_id: i32) -> bool {
        self.transactions.contains_key(&transaction_id)
    }

    pub fn is_active(&self, transaction_id: i32) -> bool {
        self.transactions
            .get(&transaction_id)
            .map(|t| t.is_active())
            .unwrap_or(false)
    }

    /// Active transaction on `connector_id`, if any.
    pub fn active_on_connector(&self, connector_id: u32) -> Option<i32> {
        self.get_transaction_id_by_connector(connector_id)
            .filter(|id| self.is_active(*id))
    }

    /// Stops every running timer.
    pub fn stop_all(&self) {
        let active: Vec<i32> = self
            .transactions
            .iter()
            .filter(|t| t.is_active())
            .map(|t| t.transaction_id)
            .collect();
        for id in active {
            self.stop_transaction(id);
        }
    }

    /// Builds the periodic MeterValues payload for an active transaction.
    pub fn meter_values_request(&self, transaction_id: i32) -> Option<MeterValuesRequest> {
        let connector_id = self.connector_of(transaction_id)?;
        let energy = self.get_meter_value(transaction_id);
        let soc = self.get_soc_value(transaction_id);

        let meter_value = MeterValue::new(Utc::now())
            .with_sample(SampledValue::new(
                energy.to_string(),
                Measurand::EnergyActiveImportRegister,
                UnitOfMeasure::Wh,
            ))
            .with_sample(SampledValue::new(
                SIMULATED_CURRENT_A,
                Measurand::CurrentImport,
                UnitOfMeasure::A,
            ))
            .with_sample(
                SampledValue::new(soc.to_string(), Measurand::SoC, UnitOfMeasure::Percent)
                    .with_context(ReadingContext::SamplePeriodic),
            )
            .with_sample(
                SampledValue::new(SIMULATED_VOLTAGE_V, Measurand::Voltage, UnitOfMeasure::V)
                    .with_phase(Phase::L1)
                    .with_context(ReadingContext::SamplePeriodic)
                    .with_location(Location::Outlet),
            );

        Some(MeterValuesRequest {
            connector_id,
            transaction_id: Some(transaction_id),
            meter_value: vec![meter_value],
        })
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        for mut entry in self.transactions.iter_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }
}
