//! WebSocket-backed signaling channel
//!
//! Reference implementation of [`SignalingChannel`] over a WebSocket relay.
//! Envelopes are JSON-encoded; inbound envelopes addressed to this peer are
//! forwarded to the receiver handed to the world connection. Malformed
//! payloads are logged and dropped, never propagated.

use super::protocol::SignalEnvelope;
use super::SignalingChannel;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket signaling client
pub struct WsSignalingClient {
    url: String,
    tx: mpsc::UnboundedSender<Message>,
}

impl WsSignalingClient {
    /// Connect to a signaling relay
    ///
    /// Returns the client (outbound half) and a receiver of inbound
    /// envelopes, suitable for handing to
    /// [`WorldConnection::join`](crate::world::WorldConnection::join).
    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<SignalEnvelope>)> {
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling URL must start with ws:// or wss://, got {url}"
            )));
        }

        info!(url, "Connecting to signaling relay");

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::signaling(format!("Failed to connect: {e}")))?;

        let (write, read) = ws_stream.split();
        let (tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::sender_task(write, outbound_rx));
        tokio::spawn(Self::receiver_task(read, inbound_tx));

        Ok((
            Self {
                url: url.to_string(),
                tx,
            },
            inbound_rx,
        ))
    }

    /// URL this client was connected to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sender task: drains the outbound channel into the WebSocket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                error!("Failed to send signaling message: {e}");
                break;
            }
        }

        debug!("Signaling sender task terminated");
    }

    /// Receiver task: parses inbound frames into envelopes
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        inbound_tx: mpsc::UnboundedSender<SignalEnvelope>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<SignalEnvelope>(&text) {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Dropping malformed signaling payload: {e}");
                    }
                },
                Ok(Message::Close(_)) => {
                    info!("Signaling connection closed");
                    break;
                }
                Err(e) => {
                    error!("Signaling socket error: {e}");
                    break;
                }
                _ => {}
            }
        }

        debug!("Signaling receiver task terminated");
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingClient {
    async fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        let json = serde_json::to_string(&envelope)?;
        debug!(
            to = %envelope.to,
            kind = envelope.signal.kind(),
            "Sending signal"
        );

        self.tx
            .send(Message::Text(json))
            .map_err(|e| Error::signaling(format!("Signaling channel closed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_ws_url() {
        let result = WsSignalingClient::connect("http://localhost:8080").await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
