//! Scripted and automatic central systems for tests.

use ocpp_cp::{Session, SessionConfig};
use ocpp_messages::{CallMessage, Message};
use ocpp_transport::{ConnectRequest, LoopbackConnector, LoopbackPeer};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub async fn connected_session(config: SessionConfig) -> (Arc<Session>, CentralSystem) {
    let (connector, mut peers) = LoopbackConnector::new();
    let session = Session::new(config, Arc::new(connector)).unwrap();
    session.connect().await.unwrap();
    let (_, peer) = peers.recv().await.unwrap();
    (session, CentralSystem { peer })
}

/// A central system driven step by step by the test.
pub struct CentralSystem {
    pub peer: LoopbackPeer,
}

impl CentralSystem {
    pub async fn next_call(&mut self) -> CallMessage {
        let text = self.peer.recv().await.expect("session closed");
        match Message::decode(&text).unwrap() {
            Message::Call(call) => call,
            other => panic!("Expected a Call, got {:?}", other),
        }
    }

    pub fn reply(&self, call: &CallMessage, payload: Value) {
        assert!(self.peer.inject(json!([3, call.unique_id, payload]).to_string()));
    }

    pub fn accept_boot(&self, call: &CallMessage, interval: i32) {
        self.reply(
            call,
            json!({"currentTime": "2024-01-01T00:00:00Z", "interval": interval, "status": "Accepted"}),
        );
    }

    /// Answers every call until a StatusNotification with `status` went by. StartTransaction
    /// gets `transaction_id`. Returns the actions seen, StatusNotifications as
    /// `StatusNotification:<status>`.
    pub async fn answer_until(&mut self, status: &str, transaction_id: i32) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            let call = self.next_call().await;
            let done = call.action == "StatusNotification" && call.payload["status"] == status;
            seen.push(label(&call));
            self.reply(&call, answer(&call, transaction_id));
            if done {
                return seen;
            }
        }
    }
}

fn label(call: &CallMessage) -> String {
    match call.payload["status"].as_str() {
        Some(status) if call.action == "StatusNotification" => {
            format!("StatusNotification:{}", status)
        }
        _ => call.action.clone(),
    }
}

fn answer(call: &CallMessage, transaction_id: i32) -> Value {
    match call.action.as_str() {
        "BootNotification" => {
            json!({"currentTime": "2024-01-01T00:00:00Z", "interval": 300, "status": "Accepted"})
        }
        "Heartbeat" => json!({"currentTime": "2024-01-01T00:00:00Z"}),
        "StartTransaction" => {
            json!({"idTagInfo": {"status": "Accepted"}, "transactionId": transaction_id})
        }
        "Authorize" => json!({"idTagInfo": {"status": "Accepted"}}),
        "DataTransfer" => json!({"status": "Accepted"}),
        _ => json!({}),
    }
}

/// One call as observed by [`AutoCentralSystem`].
#[derive(Debug, Clone)]
pub struct ObservedCall {
    pub charge_point_id: String,
    pub action: String,
    pub status: Option<String>,
}

/// Accepts every connection and answers every call, recording what it saw in arrival
/// order.
pub struct AutoCentralSystem {
    log: Arc<Mutex<Vec<ObservedCall>>>,
}

impl AutoCentralSystem {
    pub fn spawn(mut peers: mpsc::UnboundedReceiver<(ConnectRequest, LoopbackPeer)>) -> Self {
        let log = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::clone(&log);
        tokio::spawn(async move {
            let mut next_transaction_id = 1;
            while let Some((request, peer)) = peers.recv().await {
                tokio::spawn(serve(request.charge_point_id, peer, next_transaction_id, Arc::clone(&accepted)));
                next_transaction_id += 10_000;
            }
        });
        Self { log }
    }

    pub fn log(&self) -> Vec<ObservedCall> {
        self.log.lock().unwrap().clone()
    }

    /// Polls the log until `done` holds.
    pub async fn wait_for<F>(&self, done: F) -> Vec<ObservedCall>
    where
        F: Fn(&[ObservedCall]) -> bool,
    {
        loop {
            let log = self.log();
            if done(&log) {
                return log;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn serve(
    charge_point_id: String,
    mut peer: LoopbackPeer,
    first_transaction_id: i32,
    log: Arc<Mutex<Vec<ObservedCall>>>,
) {
    let mut transaction_id = first_transaction_id;
    while let Some(text) = peer.recv().await {
        let Ok(Message::Call(call)) = Message::decode(&text) else {
            continue;
        };
        log.lock().unwrap().push(ObservedCall {
            charge_point_id: charge_point_id.clone(),
            action: call.action.clone(),
            status: call.payload["status"].as_str().map(str::to_string),
        });
        let payload = answer(&call, transaction_id);
        if call.action == "StartTransaction" {
            transaction_id += 1;
        }
        peer.inject(json!([3, call.unique_id, payload]).to_string());
    }
}
