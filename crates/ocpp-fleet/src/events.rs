//! # Fleet Events
//!
//! Lifecycle events of every member session, plus the orchestrator's own, published on one
//! broadcast channel with a bounded history.

use chrono::{DateTime, Utc};
use ocpp_cp::{Session, SessionEvent};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MAX_EVENT_HISTORY: usize = 1000;
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FleetEvent {
    Session(SessionEvent),
    Fleet(FleetNotice),
}

/// Events raised by the orchestrator itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetNotice {
    /// Connect or boot of one member failed
    StartFailed {
        charge_point_id: String,
        error: String,
    },
    /// Every member finished its start sequence
    FleetReady { started: usize, failed: usize },
    /// A member was removed and disconnected
    Stopped { charge_point_id: String },
}

impl FleetEvent {
    pub fn charge_point_id(&self) -> Option<&str> {
        match self {
            FleetEvent::Session(event) => Some(event.charge_point_id()),
            FleetEvent::Fleet(FleetNotice::StartFailed {
                charge_point_id, ..
            })
            | FleetEvent::Fleet(FleetNotice::Stopped { charge_point_id }) => Some(charge_point_id),
            FleetEvent::Fleet(FleetNotice::FleetReady { .. }) => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, FleetEvent::Session(SessionEvent::Closed { .. }))
    }
}

impl From<SessionEvent> for FleetEvent {
    fn from(event: SessionEvent) -> Self {
        FleetEvent::Session(event)
    }
}

impl From<FleetNotice> for FleetEvent {
    fn from(notice: FleetNotice) -> Self {
        FleetEvent::Fleet(notice)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: FleetEvent,
}

/// Broadcast channel plus recent history.
#[derive(Debug, Clone)]
pub struct EventBus {
    history: Arc<RwLock<VecDeque<EventRecord>>>,
    broadcaster: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (broadcaster, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            history: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_EVENT_HISTORY))),
            broadcaster,
        }
    }

    pub async fn publish(&self, event: impl Into<FleetEvent>) {
        let event = event.into();
        debug!("Fleet event: {:?}", event);
        {
            let mut history = self.history.write().await;
            if history.len() >= MAX_EVENT_HISTORY {
                history.pop_front();
            }
            history.push_back(EventRecord {
                timestamp: Utc::now(),
                event: event.clone(),
            });
        }
        // nobody listening is fine
        let _ = self.broadcaster.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.broadcaster.subscribe()
    }

    /// Last `count` events, oldest first.
    pub async fn recent(&self, count: usize) -> Vec<EventRecord> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(count);
        history.iter().skip(skip).cloned().collect()
    }

    /// Republishes a session's events until the session goes away.
    pub fn forward(&self, session: &Session) -> JoinHandle<()> {
        let mut events = session.subscribe();
        let bus = self.clone();
        let charge_point_id = session.charge_point_id().to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => bus.publish(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(
                            charge_point_id = %charge_point_id,
                            "Event forwarder lagged, {} events lost", missed
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
