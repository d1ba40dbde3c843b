//! # Live Transport
//!
//! `LiveConnector` is the seam between a consultation session and the remote
//! streaming service. A connector performs the socket handshake, sends the
//! `setup` message and hands back a [`LiveLink`]: a pair of channels the
//! session uses without knowing anything about WebSockets.
//!
//! ## Link lifecycle:
//! - Dropping `LiveLink::outbound` makes the writer task close the socket.
//! - The inbound channel ends when the socket closes. An abnormal close or a
//!   transport error is delivered as a final `Err(Connection)` first.
//! - Outbound sends never block; frames queue in the unbounded channel and
//!   the transport drains them at network speed.

use crate::error::ConsultationError;
use crate::live::protocol::{ClientMessage, ServerMessage, Setup};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Inbound messages buffered between the socket reader and the session.
const INBOUND_BUFFER: usize = 256;

/// Channels connecting one session to one open endpoint connection.
#[derive(Debug)]
pub struct LiveLink {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::Receiver<Result<ServerMessage, ConsultationError>>,
}

impl LiveLink {
    /// Build a link from raw channel ends. Used by connectors and by tests.
    pub fn new(
        outbound: mpsc::UnboundedSender<ClientMessage>,
        inbound: mpsc::Receiver<Result<ServerMessage, ConsultationError>>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Open a connection and send `setup`. Returns once the socket is open;
    /// waiting for `setupComplete` is the session's job.
    async fn connect(&self, setup: Setup) -> Result<LiveLink, ConsultationError>;
}

/// Connects to the Gemini Live WebSocket endpoint.
pub struct GeminiLiveConnector {
    endpoint: String,
    api_key: String,
}

impl GeminiLiveConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self) -> String {
        if self.api_key.is_empty() {
            return self.endpoint.clone();
        }
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, separator, self.api_key)
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(&self, setup: Setup) -> Result<LiveLink, ConsultationError> {
        if self.api_key.is_empty() {
            warn!("No API key configured for the live endpoint");
        }

        let model = setup.model.clone();
        let (socket, _response) = tokio_tungstenite::connect_async(self.url())
            .await
            .map_err(|e| ConsultationError::Connection(format!("handshake failed: {}", e)))?;

        info!(endpoint = %self.endpoint, model = %model, "Connected to live endpoint");

        let (mut sink, mut stream) = socket.split();

        let setup_text = serde_json::to_string(&ClientMessage::Setup(setup))
            .map_err(|e| ConsultationError::Connection(format!("setup not serializable: {}", e)))?;
        sink.send(Message::Text(setup_text))
            .await
            .map_err(|e| ConsultationError::Connection(format!("failed to send setup: {}", e)))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

        // Writer: drains the session's outbound queue onto the socket.
        tokio::spawn(async move {
            let mut outgoing = UnboundedReceiverStream::new(outbound_rx);
            while let Some(message) = outgoing.next().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(kind = message.kind(), error = %e, "Dropping unserializable message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(error = %e, "Live socket write failed, stopping writer");
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("Live socket writer finished");
        });

        // Reader: parses frames and forwards them in arrival order.
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let parsed = match frame {
                    Ok(Message::Text(text)) => ServerMessage::from_slice(text.as_bytes()),
                    Ok(Message::Binary(bytes)) => ServerMessage::from_slice(&bytes),
                    Ok(Message::Close(close)) => {
                        if let Some(close) = close {
                            if close.code != CloseCode::Normal {
                                let _ = inbound_tx
                                    .send(Err(ConsultationError::Connection(format!(
                                        "closed by server ({}): {}",
                                        close.code, close.reason
                                    ))))
                                    .await;
                            }
                        }
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = inbound_tx
                            .send(Err(ConsultationError::Connection(e.to_string())))
                            .await;
                        break;
                    }
                };

                match parsed {
                    Ok(message) => {
                        if inbound_tx.send(Ok(message)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let anomaly = ConsultationError::ProtocolAnomaly(format!(
                            "unparseable server message: {}",
                            e
                        ));
                        warn!(error = %anomaly, "Skipping server message");
                    }
                }
            }
            debug!("Live socket reader finished");
        });

        Ok(LiveLink::new(outbound_tx, inbound_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_appends_key() {
        let connector = GeminiLiveConnector::new("wss://example.test/live", "secret");
        assert_eq!(connector.url(), "wss://example.test/live?key=secret");

        let connector = GeminiLiveConnector::new("wss://example.test/live?alt=json", "secret");
        assert_eq!(connector.url(), "wss://example.test/live?alt=json&key=secret");

        let connector = GeminiLiveConnector::new("ws://localhost:9000", "");
        assert_eq!(connector.url(), "ws://localhost:9000");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_a_connection_error() {
        let connector = GeminiLiveConnector::new("ws://127.0.0.1:1", "k");
        let setup = Setup::new("models/test", "Puck", "", serde_json::json!([]));
        let result = connector.connect(setup).await;
        assert!(matches!(result, Err(ConsultationError::Connection(_))));
    }
}
