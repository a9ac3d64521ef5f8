//! In-memory transport. The charge point side gets a [`LoopbackTransport`]; the other side
//! gets a [`LoopbackPeer`] that plays the central system.

use crate::{
    error::{TransportError, TransportResult},
    ConnectRequest, Connection, ConnectionState, Connector, SharedState, Transport,
    TransportConfig, TransportEvent,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub struct LoopbackTransport {
    connection_id: Uuid,
    state: SharedState,
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    max_message_size: usize,
}

/// Central-system end of a loopback connection.
pub struct LoopbackPeer {
    state: SharedState,
    outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl LoopbackTransport {
    /// Creates an open connection pair.
    pub fn pair(
        config: &TransportConfig,
    ) -> (Self, LoopbackPeer, mpsc::UnboundedReceiver<TransportEvent>) {
        let state = SharedState::new(ConnectionState::Connected);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let transport = Self {
            connection_id: Uuid::new_v4(),
            state: state.clone(),
            outbound: outbound_tx,
            events: event_tx.clone(),
            max_message_size: config.max_message_size,
        };
        let peer = LoopbackPeer {
            state,
            outbound: outbound_rx,
            events: event_tx,
        };
        (transport, peer, event_rx)
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn send_text(&self, text: String) -> TransportResult<()> {
        let state = self.state.get();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotReady { state });
        }
        if text.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: text.len(),
                limit: self.max_message_size,
            });
        }
        self.outbound
            .send(text)
            .map_err(|_| TransportError::ConnectionClosed {
                reason: "peer dropped".to_string(),
            })
    }

    async fn close(&self, code: u16, reason: &str) -> TransportResult<()> {
        match self.state.get() {
            ConnectionState::Closing | ConnectionState::Closed => return Ok(()),
            _ => {}
        }
        self.state.set(ConnectionState::Closed);
        let _ = self.events.send(TransportEvent::Disconnected {
            code,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn connection_id(&self) -> Uuid {
        self.connection_id
    }
}

impl LoopbackPeer {
    /// Next frame written by the charge point, or `None` once the transport is dropped.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    /// Delivers a frame to the charge point.
    pub fn inject(&self, text: impl Into<String>) -> bool {
        self.events
            .send(TransportEvent::MessageReceived { text: text.into() })
            .is_ok()
    }

    /// Closes from the central-system side.
    pub fn close(&self, code: u16, reason: &str) {
        self.state.set(ConnectionState::Closed);
        let _ = self.events.send(TransportEvent::Disconnected {
            code,
            reason: reason.to_string(),
        });
    }

    /// Forces the charge point side into `state`, e.g. to simulate a half-open socket.
    pub fn set_state(&self, state: ConnectionState) {
        self.state.set(state);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

/// Hands out loopback connections, reporting each new peer on a channel.
pub struct LoopbackConnector {
    config: TransportConfig,
    peers: mpsc::UnboundedSender<(ConnectRequest, LoopbackPeer)>,
    refused: HashSet<String>,
}

impl LoopbackConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(ConnectRequest, LoopbackPeer)>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        (
            Self {
                config: TransportConfig::default(),
                peers,
                refused: HashSet::new(),
            },
            peer_rx,
        )
    }

    /// Connections for `charge_point_id` fail with a connection error.
    pub fn refuse(mut self, charge_point_id: impl Into<String>) -> Self {
        self.refused.insert(charge_point_id.into());
        self
    }
}

#[async_trait::async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, request: &ConnectRequest) -> TransportResult<Connection> {
        if self.refused.contains(&request.charge_point_id) {
            return Err(TransportError::ConnectionError {
                message: format!("connection to {} refused", request.url()),
            });
        }
        debug!("Opening loopback connection for {}", request.charge_point_id);
        let (transport, peer, events) = LoopbackTransport::pair(&self.config);
        self.peers
            .send((request.clone(), peer))
            .map_err(|_| TransportError::ConnectionError {
                message: "loopback acceptor dropped".to_string(),
            })?;
        Ok(Connection {
            transport: Arc::new(transport),
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_round_trip() {
        let (transport, mut peer, mut events) = LoopbackTransport::pair(&TransportConfig::default());

        transport.send_text("hello".to_string()).await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("hello"));

        assert!(peer.inject("world"));
        match events.recv().await.unwrap() {
            TransportEvent::MessageReceived { text } => assert_eq!(text, "world"),
            other => panic!("Expected MessageReceived, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_ready_while_handshaking() {
        let (transport, peer, _events) = LoopbackTransport::pair(&TransportConfig::default());
        peer.set_state(ConnectionState::Connecting);

        let err = transport.send_text("x".to_string()).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::NotReady {
                state: ConnectionState::Connecting
            }
        );
    }

    #[tokio::test]
    async fn test_peer_close() {
        let (transport, peer, mut events) = LoopbackTransport::pair(&TransportConfig::default());
        peer.close(1001, "going away");

        assert_eq!(transport.state(), ConnectionState::Closed);
        match events.recv().await.unwrap() {
            TransportEvent::Disconnected { code, reason } => {
                assert_eq!(code, 1001);
                assert_eq!(reason, "going away");
            }
            other => panic!("Expected Disconnected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connector_refuses() {
        let (connector, mut peers) = LoopbackConnector::new();
        let connector = connector.refuse("VCP_2");

        let ok = ConnectRequest::new("ws://cs", "VCP_1", "ocpp1.6");
        assert!(connector.connect(&ok).await.is_ok());
        let (request, _peer) = peers.recv().await.unwrap();
        assert_eq!(request.charge_point_id, "VCP_1");

        let refused = ConnectRequest::new("ws://cs", "VCP_2", "ocpp1.6");
        assert!(matches!(
            connector.connect(&refused).await,
            Err(TransportError::ConnectionError { .. })
        ));
    }
}
