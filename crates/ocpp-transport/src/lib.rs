//! # OCPP Transport
//!
//! Connection transport for simulated charge points: a WebSocket client speaking the OCPP-J
//! subprotocol, an in-memory loopback used by tests, and the local admin listener used for
//! manual message injection.

pub mod error;
pub mod loopback;
pub mod server;
pub mod websocket;

pub use error::*;
pub use loopback::{LoopbackConnector, LoopbackPeer, LoopbackTransport};
pub use server::AdminListener;
pub use websocket::{WebSocketClient, WebSocketConnector};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum message size in bytes
    pub max_message_size: usize,
    /// Connection timeout
    pub connection_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: 65536, // 64KB
            connection_timeout: Duration::from_secs(30),
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Closing,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Closing => 3,
            ConnectionState::Closed => 4,
        }
    }
}

/// Connection state shared between a transport handle and its I/O tasks.
#[derive(Debug, Clone, Default)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub fn new(state: ConnectionState) -> Self {
        Self(Arc::new(AtomicU8::new(state.as_u8())))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// Transport event
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Text frame received
    MessageReceived { text: String },
    /// Connection closed, by either side
    Disconnected { code: u16, reason: String },
    /// Error occurred
    Error { error: TransportError },
}

/// Outbound half of an open connection.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send a text frame. Fails with `NotReady` unless the connection is open.
    async fn send_text(&self, text: String) -> TransportResult<()>;

    /// Start the closing handshake. A `Disconnected` event follows once it completes.
    async fn close(&self, code: u16, reason: &str) -> TransportResult<()>;

    fn state(&self) -> ConnectionState;

    fn connection_id(&self) -> Uuid;
}

/// Where and how a charge point connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub endpoint: String,
    pub charge_point_id: String,
    pub subprotocol: String,
    pub basic_auth_password: Option<String>,
}

impl ConnectRequest {
    pub fn new(
        endpoint: impl Into<String>,
        charge_point_id: impl Into<String>,
        subprotocol: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            charge_point_id: charge_point_id.into(),
            subprotocol: subprotocol.into(),
            basic_auth_password: None,
        }
    }

    pub fn with_basic_auth(mut self, password: impl Into<String>) -> Self {
        self.basic_auth_password = Some(password.into());
        self
    }

    pub fn url(&self) -> String {
        utils::charge_point_url(&self.endpoint, &self.charge_point_id)
    }
}

/// An open connection: the send handle plus its inbound event stream.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens connections on behalf of sessions.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> TransportResult<Connection>;
}

/// Utility functions
pub mod utils {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    /// Validate WebSocket subprotocol
    pub fn validate_subprotocol(protocol: &str) -> bool {
        protocol == "ocpp1.6"
    }

    /// Create WebSocket URL for charge point: `<endpoint>/<chargePointId>`
    pub fn charge_point_url(endpoint: &str, charge_point_id: &str) -> String {
        format!("{}/{}", endpoint.trim_end_matches('/'), charge_point_id)
    }

    /// `Authorization` header value for HTTP basic authentication.
    pub fn basic_auth_header(charge_point_id: &str, password: &str) -> String {
        format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", charge_point_id, password))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.max_message_size, 65536);
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_shared_state() {
        let state = SharedState::new(ConnectionState::Connecting);
        let other = state.clone();
        assert_eq!(other.get(), ConnectionState::Connecting);

        state.set(ConnectionState::Connected);
        assert_eq!(other.get(), ConnectionState::Connected);

        state.set(ConnectionState::Closed);
        assert_eq!(other.get(), ConnectionState::Closed);
    }

    #[test]
    fn test_connect_request() {
        let request = ConnectRequest::new("ws://localhost:9000/", "VCP_1", "ocpp1.6")
            .with_basic_auth("secret");
        assert_eq!(request.url(), "ws://localhost:9000/VCP_1");
        assert_eq!(request.basic_auth_password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_utils() {
        assert!(utils::validate_subprotocol("ocpp1.6"));
        assert!(!utils::validate_subprotocol("ocpp2.0.1"));

        assert_eq!(
            utils::charge_point_url("ws://localhost:9000/ocpp", "CP001"),
            "ws://localhost:9000/ocpp/CP001"
        );
        // "CP001:secret"
        assert_eq!(
            utils::basic_auth_header("CP001", "secret"),
            "Basic Q1AwMDE6c2VjcmV0"
        );
    }
}
