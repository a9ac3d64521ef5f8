//! Local WebSocket listener used to inject raw frames into a running session.

use crate::{
    error::{TransportError, TransportResult},
    websocket::websocket_config,
    TransportConfig,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Accepts WebSocket clients on `127.0.0.1:<port>` and forwards every text frame they send.
pub struct AdminListener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl AdminListener {
    /// Binds the listener. Port 0 picks a free port.
    pub async fn bind(
        port: u16,
        config: TransportConfig,
    ) -> TransportResult<(Self, mpsc::UnboundedReceiver<String>)> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Admin listener bound on {}", local_addr);

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Admin connection from {}", peer);
                        let frame_tx = frame_tx.clone();
                        let config = config.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, &config, frame_tx).await {
                                warn!("Admin connection from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Admin accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok((Self { local_addr, task }, frame_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for AdminListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    config: &TransportConfig,
    frame_tx: mpsc::UnboundedSender<String>,
) -> TransportResult<()> {
    let mut ws = timeout(
        config.connection_timeout,
        tokio_tungstenite::accept_async_with_config(stream, Some(websocket_config(config))),
    )
    .await
    .map_err(|_| TransportError::Timeout {
        timeout_secs: config.connection_timeout.as_secs(),
    })??;

    while let Some(frame) = ws.next().await {
        match frame? {
            Message::Text(text) => {
                if frame_tx.send(text).is_err() {
                    break;
                }
            }
            Message::Ping(data) => ws.send(Message::Pong(data)).await?,
            Message::Close(_) => break,
            Message::Binary(data) => {
                warn!("Ignoring binary admin frame of {} bytes", data.len())
            }
            _ => {}
        }
    }
    Ok(())
}
