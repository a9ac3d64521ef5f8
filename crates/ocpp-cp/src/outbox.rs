//! Pending outbound calls, keyed by message id.
//!
//! Each entry owns the session's turn permit, so a second call cannot be transmitted until
//! the first one is resolved, fails or times out.

use crate::error::{ChargePointError, ChargePointResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{oneshot, OwnedMutexGuard};
use tracing::debug;

/// Answer delivered to whoever is waiting on a call.
pub type CallResponse = ChargePointResult<Value>;

pub struct PendingCall {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    responder: Option<oneshot::Sender<CallResponse>>,
    _turn: OwnedMutexGuard<()>,
}

impl PendingCall {
    pub fn new(
        message_id: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
        responder: oneshot::Sender<CallResponse>,
        turn: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            action: action.into(),
            payload,
            created_at: Utc::now(),
            responder: Some(responder),
            _turn: turn,
        }
    }

    /// Delivers the answer and releases the turn.
    pub fn complete(mut self, response: CallResponse) {
        if let Some(responder) = self.responder.take() {
            // The caller may have stopped waiting; that is fine.
            let _ = responder.send(response);
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("message_id", &self.message_id)
            .field("action", &self.action)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Outbox {
    pending: DashMap<String, PendingCall>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call before it is transmitted.
    pub fn enqueue(&self, call: PendingCall) -> ChargePointResult<()> {
        if self.pending.contains_key(&call.message_id) {
            return Err(ChargePointError::protocol_violation(format!(
                "message id {} is already outstanding",
                call.message_id
            )));
        }
        debug!("Outbox enqueue {} {}", call.action, call.message_id);
        self.pending.insert(call.message_id.clone(), call);
        Ok(())
    }

    /// Removes the call a CallResult/CallError answers.
    pub fn resolve(&self, message_id: &str) -> ChargePointResult<PendingCall> {
        self.pending
            .remove(message_id)
            .map(|(_, call)| call)
            .ok_or_else(|| {
                ChargePointError::protocol_violation(format!(
                    "no pending call with message id {}",
                    message_id
                ))
            })
    }

    /// Removes a call without treating absence as an error.
    pub fn take(&self, message_id: &str) -> Option<PendingCall> {
        self.pending.remove(message_id).map(|(_, call)| call)
    }

    /// Fails every outstanding call, e.g. when the connection drops.
    pub fn fail_all(&self, error: ChargePointError) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some(call) = self.take(&id) {
                call.complete(Err(error.clone()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
