//! # Fleet Orchestrator
//!
//! [`FleetRegistry`] owns the fleet's sessions. Members are started with a stagger, booted,
//! and only once every member has finished booting does the optional test charge begin.
//! The member list is copy-on-write: a broadcast such as `stop_all` iterates a snapshot
//! while other members are added or removed.

use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, FleetEvent, FleetNotice};
use crate::simulator::{self, BootOptions, ChargePlan};
use ocpp_cp::{Session, SessionSnapshot, SessionStatus};
use ocpp_transport::{ConnectionState, Connector};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// One registered session.
pub struct FleetMember {
    pub session: Arc<Session>,
    start_error: RwLock<Option<String>>,
}

impl FleetMember {
    pub fn charge_point_id(&self) -> &str {
        self.session.charge_point_id()
    }

    pub async fn start_error(&self) -> Option<String> {
        self.start_error.read().await.clone()
    }
}

/// Per-member entry of [`FleetRegistry::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberStatus {
    pub charge_point_id: String,
    pub status: SessionStatus,
    pub connection_state: ConnectionState,
    pub connector_ids: Vec<u32>,
    pub connector_status: BTreeMap<u32, SessionStatus>,
    pub last_action: Option<String>,
    pub finishing: bool,
    pub waiting: bool,
    pub last_close_reason: Option<String>,
    pub active_transactions: Vec<i32>,
    /// Why the member failed to start
    pub error: Option<String>,
}

impl MemberStatus {
    fn new(snapshot: SessionSnapshot, error: Option<String>) -> Self {
        Self {
            charge_point_id: snapshot.charge_point_id,
            status: snapshot.status,
            connection_state: snapshot.connection_state,
            connector_ids: snapshot.connector_ids,
            connector_status: snapshot.connector_status,
            last_action: snapshot.last_action,
            finishing: snapshot.finishing,
            waiting: snapshot.waiting,
            last_close_reason: snapshot.last_close_reason,
            active_transactions: snapshot.active_transactions,
            error,
        }
    }
}

/// Outcome of [`FleetRegistry::start`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StartReport {
    pub started: Vec<String>,
    pub failed: Vec<String>,
    /// Members that rolled into the test charge
    pub charging: Vec<String>,
}

pub struct FleetRegistry {
    config: FleetConfig,
    connector: Arc<dyn Connector>,
    members: RwLock<Arc<Vec<Arc<FleetMember>>>>,
    events: EventBus,
    /// Running test charges, one per member
    charges: Mutex<BTreeMap<String, JoinHandle<()>>>,
}

impl FleetRegistry {
    pub fn new(config: FleetConfig, connector: Arc<dyn Connector>) -> FleetResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connector,
            members: RwLock::new(Arc::new(Vec::new())),
            events: EventBus::new(),
            charges: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Current member list. Later additions or removals do not affect the snapshot.
    pub async fn members(&self) -> Arc<Vec<Arc<FleetMember>>> {
        Arc::clone(&*self.members.read().await)
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, charge_point_id: &str) -> Option<Arc<Session>> {
        self.members
            .read()
            .await
            .iter()
            .find(|member| member.charge_point_id() == charge_point_id)
            .map(|member| Arc::clone(&member.session))
    }

    fn boot_options(&self) -> BootOptions {
        BootOptions {
            status_gap: self.config.boot_status_gap(),
            status_timeout: self.config.boot_status_timeout(),
        }
    }

    fn charge_plan(&self) -> ChargePlan {
        let charge = &self.config.charge;
        ChargePlan::new(charge.duration_minutes, charge.session_count, charge.random_delay)
            .with_id_tag(charge.id_tag.clone())
    }

    async fn register(&self, session: Arc<Session>) -> FleetResult<Arc<FleetMember>> {
        let charge_point_id = session.charge_point_id().to_string();
        self.register_all(vec![session])
            .await?
            .pop()
            .ok_or(FleetError::NotFound(charge_point_id))
    }

    /// Adds all sessions or none: one duplicate id rejects the whole batch.
    async fn register_all(&self, sessions: Vec<Arc<Session>>) -> FleetResult<Vec<Arc<FleetMember>>> {
        let mut members = self.members.write().await;
        for (index, session) in sessions.iter().enumerate() {
            let charge_point_id = session.charge_point_id();
            let taken = members
                .iter()
                .any(|member| member.charge_point_id() == charge_point_id)
                || sessions[..index]
                    .iter()
                    .any(|earlier| earlier.charge_point_id() == charge_point_id);
            if taken {
                return Err(FleetError::Duplicate(charge_point_id.to_string()));
            }
        }

        let added: Vec<Arc<FleetMember>> = sessions
            .into_iter()
            .map(|session| {
                // ends on its own once the session is dropped
                self.events.forward(&session);
                Arc::new(FleetMember {
                    session,
                    start_error: RwLock::new(None),
                })
            })
            .collect();
        let mut next = Vec::with_capacity(members.len() + added.len());
        next.extend(members.iter().cloned());
        next.extend(added.iter().cloned());
        *members = Arc::new(next);
        Ok(added)
    }

    async fn unregister<F>(&self, mut matches: F) -> Vec<Arc<FleetMember>>
    where
        F: FnMut(&FleetMember) -> bool,
    {
        let mut members = self.members.write().await;
        let (removed, kept): (Vec<_>, Vec<_>) =
            members.iter().cloned().partition(|member| {
                let member: &FleetMember = member;
                matches(member)
            });
        *members = Arc::new(kept);
        removed
    }

    /// Starts `config.count` members named `<id_prefix><i>`, staggered by `stagger_ms`,
    /// and waits until every one of them has connected and booted (or failed to). With the
    /// test charge enabled, each booted member then rolls `start_chance` to decide whether
    /// it charges; charging runs in the background.
    pub async fn start(&self) -> FleetResult<StartReport> {
        let mut sessions = Vec::with_capacity(self.config.count as usize);
        for index in 1..=self.config.count {
            let session = Session::new(self.config.session_config(index), Arc::clone(&self.connector))
                .map_err(|e| FleetError::session(self.config.charge_point_id(index), e))?;
            sessions.push(session);
        }
        let members = self.register_all(sessions).await?;
        info!(
            "Starting {} charge points against {}",
            members.len(),
            self.config.endpoint
        );

        let stagger = self.config.stagger();
        let options = self.boot_options();
        let mut startups = JoinSet::new();
        for (offset, member) in members.iter().enumerate() {
            let member = Arc::clone(member);
            let options = options.clone();
            let delay = stagger * offset as u32;
            startups.spawn(async move {
                tokio::time::sleep(delay).await;
                let outcome = start_member(&member.session, &options).await;
                (member, outcome)
            });
        }

        let mut report = StartReport::default();
        while let Some(joined) = startups.join_next().await {
            let (member, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Start task failed: {}", e);
                    continue;
                }
            };
            match outcome {
                Ok(()) => report.started.push(member.charge_point_id().to_string()),
                Err(e) => {
                    self.record_start_failure(&member, &e).await;
                    report.failed.push(member.charge_point_id().to_string());
                }
            }
        }
        report.started.sort();
        report.failed.sort();

        info!(
            "{} charge points loaded, {} failed",
            report.started.len(),
            report.failed.len()
        );
        self.events
            .publish(FleetNotice::FleetReady {
                started: report.started.len(),
                failed: report.failed.len(),
            })
            .await;

        if self.config.charge.enabled {
            report.charging = self.begin_test_charge(&members, &report.started).await;
        }
        Ok(report)
    }

    async fn record_start_failure(&self, member: &FleetMember, error: &FleetError) {
        warn!(charge_point_id = %member.charge_point_id(), "Start failed: {}", error);
        *member.start_error.write().await = Some(error.to_string());
        self.events
            .publish(FleetNotice::StartFailed {
                charge_point_id: member.charge_point_id().to_string(),
                error: error.to_string(),
            })
            .await;
    }

    async fn begin_test_charge(&self, members: &[Arc<FleetMember>], started: &[String]) -> Vec<String> {
        let plan = self.charge_plan();
        let start_chance = u32::from(self.config.charge.start_chance);
        let mut charging = Vec::new();

        for member in members {
            if !started.iter().any(|id| id == member.charge_point_id()) {
                continue;
            }
            let roll: u32 = rand::thread_rng().gen_range(0..100);
            debug!(charge_point_id = %member.charge_point_id(), "Start chance roll {}", roll);
            if roll >= start_chance {
                continue;
            }

            charging.push(member.charge_point_id().to_string());
            self.spawn_charge(Arc::clone(&member.session), plan.clone()).await;
        }
        charging
    }

    /// Runs `plan` on `session` in the background. A charge already running on the same
    /// member is cancelled first; finished charges are dropped from the table.
    async fn spawn_charge(&self, session: Arc<Session>, plan: ChargePlan) {
        let charge_point_id = session.charge_point_id().to_string();
        let task = tokio::spawn(async move {
            if let Err(e) = simulator::simulate_charge(&session, &plan).await {
                warn!(charge_point_id = %session.charge_point_id(), "Test charge ended: {}", e);
            }
        });

        let mut charges = self.charges.lock().await;
        charges.retain(|_, task| !task.is_finished());
        if let Some(previous) = charges.insert(charge_point_id, task) {
            previous.abort();
        }
    }

    async fn cancel_charges(&self, removed: &[Arc<FleetMember>]) {
        let mut charges = self.charges.lock().await;
        for member in removed {
            if let Some(task) = charges.remove(member.charge_point_id()) {
                task.abort();
            }
        }
    }

    /// Number of test charges still running.
    pub async fn running_charges(&self) -> usize {
        let mut charges = self.charges.lock().await;
        charges.retain(|_, task| !task.is_finished());
        charges.len()
    }

    /// Connects and boots one extra member with an explicit id.
    pub async fn start_one(&self, charge_point_id: &str, admin_port: Option<u16>) -> FleetResult<Arc<Session>> {
        let session = Session::new(
            self.config.session_config_for(charge_point_id, admin_port),
            Arc::clone(&self.connector),
        )
        .map_err(|e| FleetError::session(charge_point_id, e))?;
        let member = self.register(session).await?;

        if let Err(e) = start_member(&member.session, &self.boot_options()).await {
            self.record_start_failure(&member, &e).await;
            return Err(e);
        }
        Ok(Arc::clone(&member.session))
    }

    /// Runs the configured test charge on one member, in the background.
    pub async fn charge(&self, charge_point_id: &str) -> FleetResult<()> {
        let session = self
            .get(charge_point_id)
            .await
            .ok_or_else(|| FleetError::NotFound(charge_point_id.to_string()))?;
        self.spawn_charge(session, self.charge_plan()).await;
        Ok(())
    }

    /// Stops and removes one member.
    pub async fn stop(&self, charge_point_id: &str) -> FleetResult<()> {
        let removed = self
            .unregister(|member| member.charge_point_id() == charge_point_id)
            .await;
        if removed.is_empty() {
            return Err(FleetError::NotFound(charge_point_id.to_string()));
        }
        self.cancel_charges(&removed).await;
        self.disconnect_all(removed).await;
        Ok(())
    }

    /// Stops and removes every member whose id starts with `prefix`.
    pub async fn stop_prefix(&self, prefix: &str) -> usize {
        let removed = self
            .unregister(|member| member.charge_point_id().starts_with(prefix))
            .await;
        self.cancel_charges(&removed).await;
        self.disconnect_all(removed).await
    }

    /// Stops and removes every member, and cancels running test charges.
    pub async fn stop_all(&self) -> usize {
        for (_, task) in std::mem::take(&mut *self.charges.lock().await) {
            task.abort();
        }
        let removed = self.unregister(|_| true).await;
        let count = self.disconnect_all(removed).await;
        info!("Fleet stopped, {} charge points disconnected", count);
        count
    }

    async fn disconnect_all(&self, removed: Vec<Arc<FleetMember>>) -> usize {
        let count = removed.len();
        let mut closing = JoinSet::new();
        for member in removed {
            closing.spawn(async move {
                let session = Arc::clone(&member.session);
                if let Err(e) = session.disconnect().await {
                    // never connected, or already gone
                    debug!(charge_point_id = %session.charge_point_id(), "Disconnect: {}", e);
                }
                session.charge_point_id().to_string()
            });
        }
        while let Some(joined) = closing.join_next().await {
            if let Ok(charge_point_id) = joined {
                self.events
                    .publish(FleetNotice::Stopped { charge_point_id })
                    .await;
            }
        }
        count
    }

    /// Status of every member, in registration order.
    pub async fn status(&self) -> Vec<MemberStatus> {
        let members = self.members().await;
        let mut entries = Vec::with_capacity(members.len());
        for member in members.iter() {
            entries.push(MemberStatus::new(
                member.session.snapshot().await,
                member.start_error().await,
            ));
        }
        entries
    }

    /// Injects an arbitrary call into one member's send path.
    pub async fn send_action(&self, charge_point_id: &str, action: &str, payload: Value) -> FleetResult<()> {
        let session = self
            .get(charge_point_id)
            .await
            .ok_or_else(|| FleetError::NotFound(charge_point_id.to_string()))?;
        session
            .send(action, payload)
            .await
            .map_err(|e| FleetError::session(charge_point_id, e))
    }
}

async fn start_member(session: &Arc<Session>, options: &BootOptions) -> FleetResult<()> {
    session
        .connect()
        .await
        .map_err(|e| FleetError::session(session.charge_point_id(), e))?;
    simulator::boot_sequence(session, options).await
}
