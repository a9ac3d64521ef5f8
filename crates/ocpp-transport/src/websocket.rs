//! WebSocket client for OCPP charge points.

use crate::{
    error::{TransportError, TransportResult},
    utils, ConnectRequest, Connection, ConnectionState, Connector, SharedState, Transport,
    TransportConfig, TransportEvent,
};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::HeaderValue,
    protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
    Message,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Close code reported when the stream ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

pub(crate) fn websocket_config(config: &TransportConfig) -> WebSocketConfig {
    WebSocketConfig {
        write_buffer_size: config.max_message_size,
        max_write_buffer_size: config.max_message_size * 2,
        max_message_size: Some(config.max_message_size),
        max_frame_size: Some(config.max_message_size),
        accept_unmasked_frames: false,
        ..Default::default()
    }
}

/// An open WebSocket connection to the central system.
///
/// Frames are written by a dedicated writer task fed through a channel, and a reader task
/// forwards inbound text frames and the final close as [`TransportEvent`]s.
pub struct WebSocketClient {
    connection_id: Uuid,
    url: String,
    state: SharedState,
    outbound: mpsc::UnboundedSender<Message>,
    max_message_size: usize,
}

impl WebSocketClient {
    /// Opens `<endpoint>/<chargePointId>` with the requested subprotocol and completes once
    /// the socket is open.
    pub async fn connect(
        request: &ConnectRequest,
        config: &TransportConfig,
    ) -> TransportResult<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let url = request.url();
        info!("Connecting to WebSocket server: {}", url);

        let parsed = Url::parse(&url).map_err(|e| TransportError::ConnectionError {
            message: format!("Invalid URL: {}", e),
        })?;

        let mut ws_request = parsed.as_str().into_client_request()?;
        let headers = ws_request.headers_mut();
        headers.insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(&request.subprotocol).map_err(|e| {
                TransportError::HandshakeError {
                    message: format!("Invalid subprotocol header: {}", e),
                }
            })?,
        );
        if let Some(password) = &request.basic_auth_password {
            let value = utils::basic_auth_header(&request.charge_point_id, password);
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&value).map_err(|e| TransportError::HandshakeError {
                    message: format!("Invalid authorization header: {}", e),
                })?,
            );
        }

        let state = SharedState::new(ConnectionState::Connecting);
        let (ws_stream, response) = timeout(
            config.connection_timeout,
            tokio_tungstenite::connect_async_with_config(
                ws_request,
                Some(websocket_config(config)),
                false,
            ),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            timeout_secs: config.connection_timeout.as_secs(),
        })??;

        let negotiated = response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|h| h.to_str().ok());
        if negotiated != Some(request.subprotocol.as_str()) {
            warn!(
                "Server negotiated subprotocol {:?}, requested {}",
                negotiated, request.subprotocol
            );
        }

        info!("WebSocket connection established: {}", url);
        state.set(ConnectionState::Connected);

        let (mut sink, mut source) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if let Err(e) = sink.send(frame).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_state = state.clone();
        let pong_tx = outbound_tx.clone();
        let reader_url = url.clone();
        tokio::spawn(async move {
            let (code, reason) = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received WebSocket text message: {} bytes", text.len());
                        if event_tx
                            .send(TransportEvent::MessageReceived { text })
                            .is_err()
                        {
                            break (ABNORMAL_CLOSURE, "event receiver dropped".to_string());
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        debug!("Received ping, sending pong");
                        let _ = pong_tx.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received unexpected binary message: {} bytes", data.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("Received close frame: {:?}", frame);
                        break frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let reason = e.to_string();
                        let _ = event_tx.send(TransportEvent::Error {
                            error: TransportError::from(e),
                        });
                        break (ABNORMAL_CLOSURE, reason);
                    }
                    None => break (ABNORMAL_CLOSURE, "stream ended".to_string()),
                }
            };
            reader_state.set(ConnectionState::Closed);
            debug!("WebSocket reader for {} finished ({})", reader_url, code);
            let _ = event_tx.send(TransportEvent::Disconnected { code, reason });
        });

        Ok((
            Self {
                connection_id: Uuid::new_v4(),
                url,
                state,
                outbound: outbound_tx,
                max_message_size: config.max_message_size,
            },
            event_rx,
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketClient {
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
        debug!("Sending WebSocket message: {} bytes", text.len());
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| TransportError::ConnectionClosed {
                reason: "writer stopped".to_string(),
            })
    }

    async fn close(&self, code: u16, reason: &str) -> TransportResult<()> {
        match self.state.get() {
            ConnectionState::Closing | ConnectionState::Closed => return Ok(()),
            _ => {}
        }
        info!("Closing WebSocket connection {} ({})", self.url, reason);
        self.state.set(ConnectionState::Closing);
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        self.outbound
            .send(Message::Close(Some(frame)))
            .map_err(|_| TransportError::ConnectionClosed {
                reason: "writer stopped".to_string(),
            })
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn connection_id(&self) -> Uuid {
        self.connection_id
    }
}

/// Opens real WebSocket connections.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: TransportConfig,
}

impl WebSocketConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, request: &ConnectRequest) -> TransportResult<Connection> {
        let (client, events) = WebSocketClient::connect(request, &self.config).await?;
        Ok(Connection {
            transport: Arc::new(client),
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn test_websocket_config() {
        let config = TransportConfig {
            max_message_size: 1024,
            ..Default::default()
        };
        let ws_config = websocket_config(&config);
        assert_eq!(ws_config.max_message_size, Some(1024));
        assert_eq!(ws_config.max_write_buffer_size, 2048);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let request = ConnectRequest::new(format!("ws://{}", addr), "VCP_1", "ocpp1.6");
        let result = WebSocketClient::connect(&request, &TransportConfig::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_send_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = |request: &Request,
                            mut response: Response|
             -> Result<Response, ErrorResponse> {
                assert_eq!(request.uri().path(), "/VCP_1");
                let auth = request.headers().get("authorization").cloned();
                assert_eq!(
                    auth.unwrap().to_str().unwrap(),
                    utils::basic_auth_header("VCP_1", "pw")
                );
                response
                    .headers_mut()
                    .insert("sec-websocket-protocol", HeaderValue::from_static("ocpp1.6"));
                Ok(response)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            let frame = ws.next().await.unwrap().unwrap();
            ws.send(frame).await.unwrap();
            // Let the client's close handshake finish.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let request =
            ConnectRequest::new(format!("ws://{}", addr), "VCP_1", "ocpp1.6").with_basic_auth("pw");
        let (client, mut events) = WebSocketClient::connect(&request, &TransportConfig::default())
            .await
            .unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        client.send_text("[2,\"1\",\"Heartbeat\",{}]".to_string()).await.unwrap();
        match events.recv().await.unwrap() {
            TransportEvent::MessageReceived { text } => {
                assert_eq!(text, "[2,\"1\",\"Heartbeat\",{}]")
            }
            other => panic!("Expected echoed message, got {:?}", other),
        }

        client.close(1000, "bye").await.unwrap();
        assert!(client.send_text("x".to_string()).await.unwrap_err().is_not_ready());
        match events.recv().await.unwrap() {
            TransportEvent::Disconnected { code, reason } => {
                assert_eq!(code, 1000);
                assert_eq!(reason, "bye");
            }
            other => panic!("Expected Disconnected, got {:?}", other),
        }
        server.await.unwrap();
    }
}
