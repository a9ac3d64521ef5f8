//! # Session
//!
//! One simulated charge point. A session owns its transport, its outbox, its transaction
//! manager and its vendor configuration; nothing is shared between sessions.
//!
//! Outbound calls are strictly serialized: [`Session::call`] and [`Session::send`] take the
//! session's turn before transmitting and the turn is held by the pending outbox entry until
//! the matching CallResult or CallError arrives, the call times out, or the connection
//! closes. Responses to inbound Calls do not take the turn.

use crate::error::{ChargePointError, ChargePointResult};
use crate::message_handler;
use crate::outbox::{CallResponse, Outbox, PendingCall};
use crate::status::SessionStatus;
use crate::transaction::{MeterValuesSink, TransactionManager};
use crate::vendor::{ConfigurationStore, VendorProfile};
use crate::{SessionConfig, SessionEvent};
use ocpp_messages::serialization::format_message_summary;
use ocpp_messages::v16j::{GetConfigurationResponse, HeartbeatRequest, StatusNotificationRequest};
use ocpp_messages::{
    CallErrorMessage, CallMessage, CallResultMessage, Direction, Message, MessageSerializer,
    OcppAction,
};
use ocpp_transport::{
    AdminListener, ConnectRequest, ConnectionState, Connector, Transport, TransportConfig,
    TransportError, TransportEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Heartbeat period used when the central system returns a non-positive interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 300;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct SessionState {
    status: SessionStatus,
    connector_status: BTreeMap<u32, SessionStatus>,
    last_action: Option<String>,
    finishing: bool,
    last_close_reason: Option<String>,
}

/// Point-in-time view of a session, as reported by fleet status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub charge_point_id: String,
    pub vendor: String,
    pub model: String,
    pub firmware_version: String,
    pub status: SessionStatus,
    pub connection_state: ConnectionState,
    pub connector_ids: Vec<u32>,
    pub connector_status: BTreeMap<u32, SessionStatus>,
    pub last_action: Option<String>,
    pub finishing: bool,
    /// A call is awaiting its result
    pub waiting: bool,
    pub last_close_reason: Option<String>,
    pub active_transactions: Vec<i32>,
}

/// A frame received on the admin channel.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminCommand {
    action: String,
    #[serde(default = "empty_object")]
    payload: Value,
    message_id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

struct AdminChannel {
    listener: AdminListener,
    task: JoinHandle<()>,
}

impl Drop for AdminChannel {
    fn drop(&mut self) {
        self.task.abort();
        self.listener.shutdown();
    }
}

pub struct Session {
    config: SessionConfig,
    profile: VendorProfile,
    connector_ids: Vec<u32>,
    serializer: MessageSerializer,
    connector: Arc<dyn Connector>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    state: RwLock<SessionState>,
    configuration: RwLock<ConfigurationStore>,
    transactions: TransactionManager,
    outbox: Arc<Outbox>,
    turn: Arc<Mutex<()>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    admin: Mutex<Option<AdminChannel>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    /// Creates a disconnected session. The vendor profile and its configuration table are
    /// selected from the model.
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> ChargePointResult<Arc<Self>> {
        config.validate()?;

        let profile = VendorProfile::for_model(config.model.clone());
        let configuration = profile.seed_configuration()?;
        let connector_ids = config.connector_ids();
        let transactions = TransactionManager::new(
            config.charge_point_id.clone(),
            config.power_kw,
            config.initial_meter_reading,
            config.meter_values_interval(),
        );
        let state = SessionState {
            connector_status: connector_ids
                .iter()
                .map(|id| (*id, SessionStatus::default()))
                .collect(),
            ..Default::default()
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            charge_point_id = %config.charge_point_id,
            "Session created: {} {} ({} keys), connectors {:?}",
            profile.vendor.name(),
            profile.model,
            configuration.len(),
            connector_ids
        );

        Ok(Arc::new(Self {
            serializer: MessageSerializer::new(config.ocpp_version),
            config,
            profile,
            connector_ids,
            connector,
            transport: RwLock::new(None),
            state: RwLock::new(state),
            configuration: RwLock::new(configuration),
            transactions,
            outbox: Arc::new(Outbox::new()),
            turn: Arc::new(Mutex::new(())),
            heartbeat: Mutex::new(None),
            reader: Mutex::new(None),
            admin: Mutex::new(None),
            events,
        }))
    }

    pub fn charge_point_id(&self) -> &str {
        &self.config.charge_point_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn profile(&self) -> &VendorProfile {
        &self.profile
    }

    pub fn connector_ids(&self) -> &[u32] {
        &self.connector_ids
    }

    /// Connector ids without the twin-gun aggregate connector 0.
    pub fn physical_connector_ids(&self) -> Vec<u32> {
        self.connector_ids.iter().copied().filter(|id| *id != 0).collect()
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn meter_values_sink(self: &Arc<Self>) -> Weak<dyn MeterValuesSink> {
        let weak: Weak<Session> = Arc::downgrade(self);
        weak
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Opens the connection to `<endpoint>/<chargePointId>` and starts dispatching inbound
    /// frames. Completes once the socket is open.
    pub async fn connect(self: &Arc<Self>) -> ChargePointResult<()> {
        if self.connection_state().await == ConnectionState::Connected {
            debug!(charge_point_id = %self.config.charge_point_id, "Already connected");
            return Ok(());
        }

        let mut request = ConnectRequest::new(
            &self.config.endpoint,
            &self.config.charge_point_id,
            self.config.ocpp_version.subprotocol(),
        );
        if let Some(password) = &self.config.basic_auth_password {
            request = request.with_basic_auth(password.clone());
        }

        info!(charge_point_id = %self.config.charge_point_id, "Connecting to {}", request.url());
        let connection = self.connector.connect(&request).await?;

        self.state.write().await.finishing = false;
        *self.transport.write().await = Some(connection.transport);

        let reader = self.spawn_reader(connection.events);
        if let Some(previous) = self.reader.lock().await.replace(reader) {
            previous.abort();
        }

        if let Some(port) = self.config.admin_port {
            if let Err(e) = self.start_admin(port).await {
                warn!(
                    charge_point_id = %self.config.charge_point_id,
                    "Admin channel on port {} unavailable: {}", port, e
                );
            }
        }

        info!(charge_point_id = %self.config.charge_point_id, "Connected");
        self.emit(SessionEvent::Connected {
            charge_point_id: self.config.charge_point_id.clone(),
        });
        Ok(())
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                match event {
                    TransportEvent::MessageReceived { text } => {
                        if let Err(e) = session.handle_incoming(&text).await {
                            warn!(
                                charge_point_id = %session.config.charge_point_id,
                                "Dropped inbound frame ({}): {}", e.category(), e
                            );
                        }
                    }
                    TransportEvent::Disconnected { code, reason } => {
                        session.on_close(code, &reason).await;
                        break;
                    }
                    TransportEvent::Error { error } => {
                        error!(
                            charge_point_id = %session.config.charge_point_id,
                            "Transport error: {}", error
                        );
                    }
                }
            }
        })
    }

    /// Orderly removal: stops the active transaction on every connector, then closes.
    pub async fn disconnect(&self) -> ChargePointResult<()> {
        for connector_id in &self.connector_ids {
            if let Some(transaction_id) = self.transactions.active_on_connector(*connector_id) {
                self.transactions.stop_transaction(transaction_id);
            }
        }
        self.shutdown(1000, "Disconnect").await
    }

    /// Terminates the connection in reaction to a Reset.
    pub async fn close(&self, reason: &str) -> ChargePointResult<()> {
        self.transactions.stop_all();
        self.shutdown(1000, reason).await
    }

    async fn shutdown(&self, code: u16, reason: &str) -> ChargePointResult<()> {
        self.state.write().await.finishing = true;
        self.stop_heartbeat().await;
        self.stop_admin().await;

        let transport = self.current_transport().await?;
        info!(charge_point_id = %self.config.charge_point_id, "Closing connection: {}", reason);
        transport.close(code, reason).await?;
        Ok(())
    }

    /// Reacts to the transport closing, whoever closed it. No reconnection is attempted.
    async fn on_close(&self, code: u16, reason: &str) {
        self.stop_heartbeat().await;
        self.transactions.stop_all();
        self.outbox.fail_all(ChargePointError::Transport(
            TransportError::ConnectionClosed {
                reason: format!("{} {}", code, reason),
            },
        ));

        let unsolicited = {
            let mut state = self.state.write().await;
            if state.finishing {
                false
            } else {
                let reason = if reason.is_empty() {
                    "No reason provided"
                } else {
                    reason
                };
                state.last_close_reason = Some(format!("{}={}", code, reason));
                state
                    .status
                    .transition(&self.config.charge_point_id, SessionStatus::Offline);
                true
            }
        };

        if unsolicited {
            warn!(
                charge_point_id = %self.config.charge_point_id,
                "Connection closed by peer: code={}, reason={}", code, reason
            );
        } else {
            info!(charge_point_id = %self.config.charge_point_id, "Connection closed");
        }

        self.emit(SessionEvent::Closed {
            charge_point_id: self.config.charge_point_id.clone(),
            code,
            reason: reason.to_string(),
            unsolicited,
        });
    }

    async fn current_transport(&self) -> ChargePointResult<Arc<dyn Transport>> {
        self.transport
            .read()
            .await
            .clone()
            .ok_or(ChargePointError::Transport(TransportError::NotConnected))
    }

    /// Transport that is open right now; `NotConnected` before the first connect and
    /// `NotReady` while handshaking or closing.
    async fn open_transport(&self) -> ChargePointResult<Arc<dyn Transport>> {
        let transport = self.current_transport().await?;
        match transport.state() {
            ConnectionState::Connected => Ok(transport),
            state => Err(TransportError::NotReady { state }.into()),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.transport
            .read()
            .await
            .as_ref()
            .map(|t| t.state())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Sends a call and waits for its result payload.
    pub async fn call(&self, action: &str, payload: Value) -> ChargePointResult<Value> {
        let (_, response) = self.send_call(action, payload, None).await?;
        response
            .await
            .map_err(|_| ChargePointError::internal(format!("{} was dropped unanswered", action)))?
    }

    /// Like [`Session::call`], but gives up after `wait` instead of the session's call
    /// timeout. Giving up releases the turn.
    pub async fn call_within(
        &self,
        action: &str,
        payload: Value,
        wait: Duration,
    ) -> ChargePointResult<Value> {
        let (message_id, response) = self.send_call(action, payload, None).await?;
        match tokio::time::timeout(wait, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChargePointError::internal(format!(
                "{} was dropped unanswered",
                action
            ))),
            Err(_) => {
                let error = ChargePointError::timeout(
                    format!("{} [{}]", action, message_id),
                    wait.as_millis() as u64,
                );
                if let Some(call) = self.outbox.take(&message_id) {
                    call.complete(Err(error.clone()));
                }
                Err(error)
            }
        }
    }

    /// Sends a call without waiting for its result. The result is still dispatched when it
    /// arrives, and the next call waits for it.
    pub async fn send(&self, action: &str, payload: Value) -> ChargePointResult<()> {
        self.send_call(action, payload, None).await.map(|_| ())
    }

    /// Like [`Session::send`], reusing `message_id` when one is given.
    pub async fn send_with_id(
        &self,
        action: &str,
        payload: Value,
        message_id: Option<String>,
    ) -> ChargePointResult<()> {
        self.send_call(action, payload, message_id).await.map(|_| ())
    }

    /// Typed [`Session::call`].
    pub async fn call_action<T: OcppAction>(&self, request: T) -> ChargePointResult<T::Response> {
        let payload = self.call(T::ACTION_NAME, serde_json::to_value(&request)?).await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Typed [`Session::call_within`].
    pub async fn call_action_within<T: OcppAction>(
        &self,
        request: T,
        wait: Duration,
    ) -> ChargePointResult<T::Response> {
        let payload = self
            .call_within(T::ACTION_NAME, serde_json::to_value(&request)?, wait)
            .await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Typed [`Session::send`].
    pub async fn send_action<T: OcppAction>(&self, request: T) -> ChargePointResult<()> {
        self.send(T::ACTION_NAME, serde_json::to_value(&request)?).await
    }

    async fn send_call(
        &self,
        action: &str,
        payload: Value,
        message_id: Option<String>,
    ) -> ChargePointResult<(String, oneshot::Receiver<CallResponse>)> {
        self.serializer
            .validate_payload(action, Direction::Request, &payload)?;
        self.open_transport().await?;

        let turn = Arc::clone(&self.turn).lock_owned().await;
        // the connection may have gone away while waiting for the turn
        let transport = self.open_transport().await?;

        let mut call = CallMessage::new(action, payload)?;
        if let Some(message_id) = message_id {
            call.unique_id = message_id;
        }
        let message_id = call.unique_id.clone();
        let recorded = call.payload.clone();
        let text = self.serializer.serialize_message(&Message::Call(call.clone()))?;

        let (responder, response) = oneshot::channel();
        self.outbox.enqueue(PendingCall::new(
            message_id.clone(),
            action,
            call.payload,
            responder,
            turn,
        ))?;

        if let Err(e) = transport.send_text(text).await {
            self.outbox.take(&message_id);
            return Err(e.into());
        }

        if action == HeartbeatRequest::ACTION_NAME {
            trace!(charge_point_id = %self.config.charge_point_id, "Heartbeat [{}]", message_id);
        } else {
            info!(
                charge_point_id = %self.config.charge_point_id,
                "Sent {} [{}] {}", action, message_id, recorded
            );
        }
        self.record_sent(action, &recorded).await;
        self.spawn_call_timeout(message_id.clone());

        Ok((message_id, response))
    }

    fn spawn_call_timeout(&self, message_id: String) {
        let outbox = Arc::clone(&self.outbox);
        let timeout = self.config.call_timeout();
        let charge_point_id = self.config.charge_point_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(call) = outbox.take(&message_id) {
                warn!(
                    charge_point_id = %charge_point_id,
                    "{} [{}] unanswered after {:?}", call.action, message_id, timeout
                );
                let error = ChargePointError::timeout(
                    format!("{} [{}]", call.action, message_id),
                    timeout.as_millis() as u64,
                );
                call.complete(Err(error));
            }
        });
    }

    async fn record_sent(&self, action: &str, payload: &Value) {
        let mut state = self.state.write().await;
        state.last_action = Some(action.to_string());

        if action != StatusNotificationRequest::ACTION_NAME {
            return;
        }
        match StatusNotificationRequest::deserialize(payload) {
            Ok(notification) => {
                let next = SessionStatus::from(notification.status);
                state
                    .connector_status
                    .entry(notification.connector_id)
                    .or_default()
                    .transition(&self.config.charge_point_id, next);
                state.status = next;
            }
            Err(e) => debug!("Unreadable StatusNotification payload: {}", e),
        }
    }

    /// Sends a CallResult or CallError frame. Does not take the turn.
    pub async fn respond(&self, message: Message) -> ChargePointResult<()> {
        let transport = self.open_transport().await?;
        let text = self.serializer.serialize_message(&message)?;
        debug!(
            charge_point_id = %self.config.charge_point_id,
            "Responding {}", format_message_summary(&message)
        );
        transport.send_text(text).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Decodes and dispatches one inbound frame.
    pub async fn handle_incoming(self: &Arc<Self>, text: &str) -> ChargePointResult<()> {
        let message = self.serializer.deserialize_message(text)?;
        match message {
            Message::Call(call) => self.handle_inbound_call(call).await,
            Message::CallResult(result) => {
                let pending = self.outbox.resolve(&result.unique_id)?;
                if pending.action != HeartbeatRequest::ACTION_NAME {
                    info!(
                        charge_point_id = %self.config.charge_point_id,
                        "Received {} result [{}] {}", pending.action, result.unique_id, result.payload
                    );
                }

                let outcome = match self.serializer.validate_payload(
                    &pending.action,
                    Direction::Response,
                    &result.payload,
                ) {
                    Ok(()) => message_handler::handle_call_result(
                        self,
                        &pending.action,
                        &pending.payload,
                        &result.payload,
                    )
                    .await
                    .map(|_| result.payload),
                    Err(e) => Err(e.into()),
                };
                let status = outcome.as_ref().map(|_| ()).map_err(Clone::clone);
                pending.complete(outcome);
                status
            }
            Message::CallError(error) => {
                let pending = self.outbox.resolve(&error.unique_id)?;
                message_handler::handle_call_error(self, &pending.action, &error);
                let action = pending.action.clone();
                pending.complete(Err(ChargePointError::CallError {
                    action,
                    code: error.error_code,
                    description: error.error_description,
                }));
                Ok(())
            }
        }
    }

    async fn handle_inbound_call(self: &Arc<Self>, call: CallMessage) -> ChargePointResult<()> {
        info!(
            charge_point_id = %self.config.charge_point_id,
            "Received {} [{}] {}", call.action, call.unique_id, call.payload
        );

        let reply = match self
            .serializer
            .validate_payload(&call.action, Direction::Request, &call.payload)
        {
            Ok(()) => message_handler::handle_call(self, &call).await,
            Err(e) => Err(e.into()),
        };
        let reply = reply.and_then(|reply| {
            self.serializer
                .validate_payload(&call.action, Direction::Response, &reply.payload)?;
            Ok(reply)
        });

        match reply {
            Ok(reply) => {
                let result = CallResultMessage::new(call.unique_id, reply.payload)?;
                self.respond(Message::CallResult(result)).await?;
                if let Some(follow_up) = reply.follow_up {
                    message_handler::spawn_follow_up(self, follow_up);
                }
                Ok(())
            }
            Err(e) => {
                let error =
                    CallErrorMessage::new(call.unique_id, e.call_error_code(), e.to_string());
                self.respond(Message::CallError(error)).await?;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    /// (Re)starts the periodic Heartbeat.
    pub async fn start_heartbeat(self: &Arc<Self>, interval_secs: i32) {
        let secs = u64::try_from(interval_secs)
            .ok()
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS);
        let period = Duration::from_secs(secs);
        let weak = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                // skip ticks while the socket is not open
                if session.connection_state().await != ConnectionState::Connected {
                    continue;
                }
                if let Err(e) = session.send_action(HeartbeatRequest {}).await {
                    debug!(
                        charge_point_id = %session.config.charge_point_id,
                        "Heartbeat skipped: {}", e
                    );
                }
            }
        });

        debug!(charge_point_id = %self.config.charge_point_id, "Heartbeat every {}s", secs);
        if let Some(previous) = self.heartbeat.lock().await.replace(task) {
            previous.abort();
        }
    }

    pub async fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().await.take() {
            task.abort();
        }
    }

    pub async fn heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .await
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Admin channel
    // ------------------------------------------------------------------

    async fn start_admin(self: &Arc<Self>, port: u16) -> ChargePointResult<()> {
        let mut admin = self.admin.lock().await;
        if admin.is_some() {
            return Ok(());
        }

        let (listener, mut frames) = AdminListener::bind(port, TransportConfig::default()).await?;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(text) = frames.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                let command: AdminCommand = match serde_json::from_str(&text) {
                    Ok(command) => command,
                    Err(e) => {
                        warn!(
                            charge_point_id = %session.config.charge_point_id,
                            "Ignoring admin frame: {}", e
                        );
                        continue;
                    }
                };
                info!(
                    charge_point_id = %session.config.charge_point_id,
                    "Admin injects {}", command.action
                );
                if let Err(e) = session
                    .send_with_id(&command.action, command.payload, command.message_id)
                    .await
                {
                    warn!(
                        charge_point_id = %session.config.charge_point_id,
                        "Admin {} failed: {}", command.action, e
                    );
                }
            }
        });

        *admin = Some(AdminChannel { listener, task });
        Ok(())
    }

    async fn stop_admin(&self) {
        self.admin.lock().await.take();
    }

    pub async fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin
            .lock()
            .await
            .as_ref()
            .map(|admin| admin.listener.local_addr())
    }

    // ------------------------------------------------------------------
    // Configuration and status
    // ------------------------------------------------------------------

    /// Unknown or readonly keys are rejected.
    pub async fn update_configuration(&self, key: &str, value: &str) -> bool {
        self.configuration.write().await.update(key, value)
    }

    pub async fn configuration(&self, keys: Option<&[String]>) -> GetConfigurationResponse {
        let keys = keys.filter(|keys| !keys.is_empty());
        let (configuration_key, unknown_key) = self.configuration.read().await.configuration(keys);
        GetConfigurationResponse {
            configuration_key,
            unknown_key,
        }
    }

    /// Upper bound of the vendor's random start delay in seconds, 0 when unset.
    pub async fn random_delay_max(&self) -> u64 {
        let Some(key) = self.profile.random_delay_key() else {
            return 0;
        };
        self.configuration
            .read()
            .await
            .value(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.read().await.status
    }

    pub async fn connector_status(&self, connector_id: u32) -> Option<SessionStatus> {
        self.state
            .read()
            .await
            .connector_status
            .get(&connector_id)
            .copied()
    }

    pub async fn last_action(&self) -> Option<String> {
        self.state.read().await.last_action.clone()
    }

    pub async fn last_close_reason(&self) -> Option<String> {
        self.state.read().await.last_close_reason.clone()
    }

    pub async fn is_finishing(&self) -> bool {
        self.state.read().await.finishing
    }

    /// Whether a call is awaiting its result.
    pub fn is_waiting(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let connection_state = self.connection_state().await;
        let state = self.state.read().await;
        let active_transactions = self
            .connector_ids
            .iter()
            .filter_map(|id| self.transactions.active_on_connector(*id))
            .collect();

        SessionSnapshot {
            charge_point_id: self.config.charge_point_id.clone(),
            vendor: self.profile.vendor.name().to_string(),
            model: self.profile.model.clone(),
            firmware_version: self.profile.firmware_version.clone(),
            status: state.status,
            connection_state,
            connector_ids: self.connector_ids.clone(),
            connector_status: state.connector_status.clone(),
            last_action: state.last_action.clone(),
            finishing: state.finishing,
            waiting: self.is_waiting(),
            last_close_reason: state.last_close_reason.clone(),
            active_transactions,
        }
    }
}

#[async_trait::async_trait]
impl MeterValuesSink for Session {
    async fn send_meter_values(&self, transaction_id: i32) {
        let Some(request) = self.transactions.meter_values_request(transaction_id) else {
            return;
        };
        if let Err(e) = self.send_action(request).await {
            warn!(
                charge_point_id = %self.config.charge_point_id,
                "MeterValues for transaction {} not sent: {}", transaction_id, e
            );
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.reader.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocpp_transport::{LoopbackConnector, LoopbackPeer};
    use ocpp_types::CallErrorCode;
    use serde_json::json;

    struct CentralSystem {
        peer: LoopbackPeer,
    }

    impl CentralSystem {
        /// Next Call written by the session.
        async fn next_call(&mut self) -> CallMessage {
            let text = self.peer.recv().await.expect("session closed");
            match Message::decode(&text).unwrap() {
                Message::Call(call) => call,
                other => panic!("Expected a Call, got {:?}", other),
            }
        }

        async fn next_frame(&mut self) -> Message {
            let text = self.peer.recv().await.expect("session closed");
            Message::decode(&text).unwrap()
        }

        fn reply(&self, call: &CallMessage, payload: Value) {
            assert!(self.peer.inject(json!([3, call.unique_id, payload]).to_string()));
        }

        fn request(&self, id: &str, action: &str, payload: Value) {
            assert!(self.peer.inject(json!([2, id, action, payload]).to_string()));
        }
    }

    async fn connected(config: SessionConfig) -> (Arc<Session>, CentralSystem) {
        let (connector, mut peers) = LoopbackConnector::new();
        let session = Session::new(config, Arc::new(connector)).unwrap();
        session.connect().await.unwrap();
        let (request, peer) = peers.recv().await.unwrap();
        assert_eq!(request.url(), format!("ws://127.0.0.1:9000/{}", session.charge_point_id()));
        assert_eq!(request.subprotocol, "ocpp1.6");
        (session, CentralSystem { peer })
    }

    fn boot_request() -> Value {
        json!({"chargePointVendor": "Vestel", "chargePointModel": "EVC01"})
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let (connector, _peers) = LoopbackConnector::new();
        let session = Session::new(SessionConfig::default(), Arc::new(connector)).unwrap();

        let result = session.send("Heartbeat", json!({})).await;
        assert_eq!(
            result,
            Err(ChargePointError::Transport(TransportError::NotConnected))
        );
        assert_eq!(session.status().await, SessionStatus::Unavailable);
        assert_eq!(session.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_when_not_open() {
        let (session, cs) = connected(SessionConfig::default()).await;
        cs.peer.set_state(ConnectionState::Connecting);

        let result = session.send("Heartbeat", json!({})).await;
        assert!(matches!(
            result,
            Err(ChargePointError::Transport(TransportError::NotReady { .. }))
        ));
        assert!(!session.is_waiting());
    }

    #[tokio::test]
    async fn test_outbound_schema_violation() {
        let (session, _cs) = connected(SessionConfig::default()).await;
        let result = session
            .send("StatusNotification", json!({"connectorId": 1}))
            .await;
        assert!(matches!(
            result,
            Err(ChargePointError::SchemaViolation { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_starts_heartbeat() {
        let (session, mut cs) = connected(SessionConfig::default()).await;
        let mut events = session.subscribe();

        let boot = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call("BootNotification", boot_request()).await })
        };
        let call = cs.next_call().await;
        assert_eq!(call.action, "BootNotification");
        cs.reply(
            &call,
            json!({"currentTime": "2024-01-01T00:00:00Z", "interval": 60, "status": "Accepted"}),
        );

        let result = boot.await.unwrap().unwrap();
        assert_eq!(result["interval"], 60);
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Booted { interval: 60, .. }));

        // nothing before the interval elapses
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(cs.peer.try_recv().is_none());

        let heartbeat = cs.next_call().await;
        assert_eq!(heartbeat.action, "Heartbeat");
        cs.reply(&heartbeat, json!({"currentTime": "2024-01-01T00:01:00Z"}));

        let heartbeat = cs.next_call().await;
        assert_eq!(heartbeat.action, "Heartbeat");
    }

    #[tokio::test]
    async fn test_turn_taking() {
        let (session, mut cs) = connected(SessionConfig::default()).await;

        let first = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call("Heartbeat", json!({})).await })
        };
        let second = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call("Heartbeat", json!({})).await })
        };

        let call = cs.next_call().await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // the second call is held back until the first is answered
        assert!(cs.peer.try_recv().is_none());
        assert!(session.is_waiting());

        cs.reply(&call, json!({"currentTime": "2024-01-01T00:00:00Z"}));
        let call = cs.next_call().await;
        cs.reply(&call, json!({"currentTime": "2024-01-01T00:00:01Z"}));

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert!(!session.is_waiting());
    }

    #[tokio::test]
    async fn test_unknown_result_id() {
        let (session, _cs) = connected(SessionConfig::default()).await;
        let result = session
            .handle_incoming(r#"[3,"nobody-asked",{}]"#)
            .await;
        assert!(matches!(result, Err(ChargePointError::ProtocolViolation(_))));

        let result = session.handle_incoming(r#"[5,"x",{}]"#).await;
        assert!(matches!(result, Err(ChargePointError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_call_error_reaches_caller() {
        let (session, mut cs) = connected(SessionConfig::default()).await;
        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call("Authorize", json!({"idTag": "TAG"})).await })
        };
        let call = cs.next_call().await;
        cs.peer.inject(
            json!([4, call.unique_id, "SecurityError", "not allowed", {}]).to_string(),
        );

        match pending.await.unwrap() {
            Err(ChargePointError::CallError { action, code, .. }) => {
                assert_eq!(action, "Authorize");
                assert_eq!(code, CallErrorCode::SecurityError);
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_releases_turn() {
        let (session, mut cs) = connected(SessionConfig::default()).await;

        let result = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call("Heartbeat", json!({})).await })
        };
        let _unanswered = cs.next_call().await;

        match result.await.unwrap() {
            Err(ChargePointError::SimulationTimeout { duration_ms, .. }) => {
                assert_eq!(duration_ms, 30_000)
            }
            other => panic!("Expected timeout, got {:?}", other),
        }

        session.send("Heartbeat", json!({})).await.unwrap();
        assert_eq!(cs.next_call().await.action, "Heartbeat");
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_within_gives_up_early() {
        let (session, mut cs) = connected(SessionConfig::default()).await;

        let result = session
            .call_within("Heartbeat", json!({}), Duration::from_secs(5))
            .await;
        assert!(matches!(
            result,
            Err(ChargePointError::SimulationTimeout { duration_ms: 5000, .. })
        ));
        assert!(!session.is_waiting());

        let _ignored = cs.next_call().await;
        session.send("Heartbeat", json!({})).await.unwrap();
        assert_eq!(cs.next_call().await.action, "Heartbeat");
    }

    #[tokio::test]
    async fn test_status_notification_updates_status() {
        let (session, mut cs) = connected(SessionConfig::default()).await;
        session
            .send_action(StatusNotificationRequest::new(
                1,
                ocpp_types::v16j::ChargePointStatus::Preparing,
            ))
            .await
            .unwrap();
        let call = cs.next_call().await;
        assert_eq!(call.payload["status"], "Preparing");

        assert_eq!(session.status().await, SessionStatus::Preparing);
        assert_eq!(session.connector_status(1).await, Some(SessionStatus::Preparing));
        assert_eq!(session.last_action().await.as_deref(), Some("StatusNotification"));
    }

    #[tokio::test]
    async fn test_remote_start_emits_start_and_charging() {
        let (session, mut cs) = connected(SessionConfig::default()).await;

        cs.request("cs-1", "RemoteStartTransaction", json!({"connectorId": 1, "idTag": "TAG"}));

        match cs.next_frame().await {
            Message::CallResult(result) => {
                assert_eq!(result.unique_id, "cs-1");
                assert_eq!(result.payload, json!({"status": "Accepted"}));
            }
            other => panic!("Expected CallResult, got {:?}", other),
        }

        let start = cs.next_call().await;
        assert_eq!(start.action, "StartTransaction");
        assert_eq!(start.payload["connectorId"], 1);
        assert_eq!(start.payload["idTag"], "TAG");
        assert_eq!(start.payload["meterStart"], 0);
        cs.reply(&start, json!({"idTagInfo": {"status": "Accepted"}, "transactionId": 99}));

        let status = cs.next_call().await;
        assert_eq!(status.action, "StatusNotification");
        assert_eq!(status.payload["status"], "Charging");
        assert!(session.transactions().is_active(99));
        cs.reply(&status, json!({}));

        // remote stop of the running transaction
        cs.request("cs-2", "RemoteStopTransaction", json!({"transactionId": 99}));
        assert!(matches!(cs.next_frame().await, Message::CallResult(_)));
        let stop = cs.next_call().await;
        assert_eq!(stop.action, "StopTransaction");
        assert_eq!(stop.payload["transactionId"], 99);
        cs.reply(&stop, json!({}));
        let finishing = cs.next_call().await;
        assert_eq!(finishing.payload["status"], "Finishing");
        assert_eq!(finishing.payload["connectorId"], 1);
        assert!(!session.transactions().is_active(99));
    }

    #[tokio::test]
    async fn test_inbound_call_errors() {
        let (_session, mut cs) = connected(SessionConfig::default()).await;

        cs.request("cs-1", "UpdateFirmware", json!({}));
        match cs.next_frame().await {
            Message::CallError(error) => {
                assert_eq!(error.unique_id, "cs-1");
                assert_eq!(error.error_code, CallErrorCode::NotImplemented);
            }
            other => panic!("Expected CallError, got {:?}", other),
        }

        cs.request("cs-2", "ChangeConfiguration", json!({"key": 5}));
        match cs.next_frame().await {
            Message::CallError(error) => {
                assert_eq!(error.error_code, CallErrorCode::FormationViolation);
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_configuration_round_trip() {
        let (_session, mut cs) = connected(SessionConfig::default()).await;

        cs.request(
            "cs-1",
            "ChangeConfiguration",
            json!({"key": "NumberOfConnectors", "value": "2"}),
        );
        match cs.next_frame().await {
            Message::CallResult(result) => assert_eq!(result.payload["status"], "Rejected"),
            other => panic!("Expected CallResult, got {:?}", other),
        }

        cs.request(
            "cs-2",
            "ChangeConfiguration",
            json!({"key": "HeartbeatInterval", "value": "120"}),
        );
        match cs.next_frame().await {
            Message::CallResult(result) => assert_eq!(result.payload["status"], "Accepted"),
            other => panic!("Expected CallResult, got {:?}", other),
        }

        cs.request("cs-3", "GetConfiguration", json!({"key": ["HeartbeatInterval"]}));
        match cs.next_frame().await {
            Message::CallResult(result) => {
                assert_eq!(result.payload["configurationKey"][0]["value"], "120");
            }
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsolicited_close() {
        let (session, mut cs) = connected(SessionConfig::default()).await;
        let mut events = session.subscribe();

        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call("Heartbeat", json!({})).await })
        };
        let _ = cs.next_call().await;
        cs.peer.close(1006, "");

        assert!(matches!(
            pending.await.unwrap(),
            Err(ChargePointError::Transport(TransportError::ConnectionClosed { .. }))
        ));
        match events.recv().await.unwrap() {
            SessionEvent::Closed { code, unsolicited, .. } => {
                assert_eq!(code, 1006);
                assert!(unsolicited);
            }
            other => panic!("Expected Closed, got {:?}", other),
        }
        assert_eq!(session.status().await, SessionStatus::Offline);
        assert_eq!(
            session.last_close_reason().await.as_deref(),
            Some("1006=No reason provided")
        );
        assert!(!session.heartbeat_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_transactions() {
        let config = SessionConfig {
            twin_gun: true,
            ..Default::default()
        };
        let (session, mut cs) = connected(config).await;
        assert_eq!(session.physical_connector_ids(), vec![1, 2]);
        let mut events = session.subscribe();

        let sink = session.meter_values_sink();
        session.transactions().start_transaction(1, 1, sink.clone());
        session.transactions().start_transaction(2, 2, sink);

        session.disconnect().await.unwrap();
        assert!(!session.transactions().is_active(1));
        assert!(!session.transactions().is_active(2));

        match events.recv().await.unwrap() {
            SessionEvent::Closed { unsolicited, .. } => assert!(!unsolicited),
            other => panic!("Expected Closed, got {:?}", other),
        }
        assert!(session.is_finishing().await);
        assert_ne!(session.status().await, SessionStatus::Offline);

        // no MeterValues leak out after the transport is gone
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(cs.peer.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_diagnostics_upload_reported() {
        let (_session, mut cs) = connected(SessionConfig::default()).await;

        cs.request("cs-1", "GetDiagnostics", json!({"location": "ftp://example.com/"}));
        match cs.next_frame().await {
            Message::CallResult(result) => {
                assert_eq!(result.unique_id, "cs-1");
                assert_eq!(result.payload["fileName"], "file.tar.gz");
            }
            other => panic!("Expected CallResult, got {:?}", other),
        }

        let uploading = cs.next_call().await;
        assert_eq!(uploading.action, "DiagnosticsStatusNotification");
        assert_eq!(uploading.payload["status"], "Uploading");
        cs.reply(&uploading, json!({}));

        let early = tokio::time::timeout(
            message_handler::DIAGNOSTICS_UPLOAD_DELAY - Duration::from_millis(100),
            cs.next_call(),
        )
        .await;
        assert!(early.is_err(), "Uploaded sent before the upload delay");

        let uploaded = cs.next_call().await;
        assert_eq!(uploaded.action, "DiagnosticsStatusNotification");
        assert_eq!(uploaded.payload["status"], "Uploaded");
        cs.reply(&uploaded, json!({}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_after_grace() {
        let (session, mut cs) = connected(SessionConfig::default()).await;
        let mut events = session.subscribe();

        cs.request("cs-1", "Reset", json!({"type": "Hard"}));
        assert!(matches!(cs.next_frame().await, Message::CallResult(_)));
        assert_eq!(session.connection_state().await, ConnectionState::Connected);

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::ResetRequested { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Closed { unsolicited: false, .. }
        ));
        assert_eq!(session.connection_state().await, ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_meter_values_emitted() {
        let (session, mut cs) = connected(SessionConfig::default()).await;
        session
            .transactions()
            .start_transaction(5, 1, session.meter_values_sink());

        let call = cs.next_call().await;
        assert_eq!(call.action, "MeterValues");
        assert_eq!(call.payload["transactionId"], 5);
        assert_eq!(call.payload["connectorId"], 1);
    }

    #[tokio::test]
    async fn test_random_delay_max() {
        let (connector, _peers) = LoopbackConnector::new();
        let connector: Arc<dyn Connector> = Arc::new(connector);

        let vestel = Session::new(SessionConfig::default(), Arc::clone(&connector)).unwrap();
        assert_eq!(vestel.random_delay_max().await, 600);
        assert!(vestel.update_configuration("RandomisedDelayMaxSeconds", "abc").await);
        assert_eq!(vestel.random_delay_max().await, 0);

        let unknown = Session::new(
            SessionConfig {
                model: "Mystery".to_string(),
                ..Default::default()
            },
            connector,
        )
        .unwrap();
        assert_eq!(unknown.random_delay_max().await, 0);
        assert!(unknown.configuration(None).await.configuration_key.is_empty());
    }

    #[tokio::test]
    async fn test_admin_channel_injects_calls() {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let config = SessionConfig {
            admin_port: Some(0),
            ..Default::default()
        };
        let (session, mut cs) = connected(config).await;
        let addr = session.admin_addr().await.unwrap();

        let (mut admin, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        admin
            .send(WsMessage::Text(
                json!({
                    "action": "StatusNotification",
                    "messageId": "admin-1",
                    "payload": {"connectorId": 1, "errorCode": "GroundFailure", "status": "Faulted"}
                })
                .to_string(),
            ))
            .await
            .unwrap();

        let call = cs.next_call().await;
        assert_eq!(call.unique_id, "admin-1");
        assert_eq!(call.payload["status"], "Faulted");
        // the admin task records the status once the frame is written
        for _ in 0..50 {
            if session.status().await == SessionStatus::Faulted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.status().await, SessionStatus::Faulted);
    }
}
