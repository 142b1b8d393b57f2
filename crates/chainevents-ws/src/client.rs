//! WebSocket deliver transport.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::time;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};

use chainevents_core::error::TransportError;
use chainevents_core::transport::{DeliverRequest, DeliverResponse, DeliverStream, DeliverTransport};
use chainevents_core::types::PeerTarget;

use crate::wire::{DeliverFrame, SeekFrame};

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsDeliverConfig {
    /// Upper bound on TCP connect + WebSocket handshake.
    pub handshake_timeout: Duration,
    /// Largest block frame accepted from the gateway.
    pub max_message_bytes: usize,
}

impl Default for WsDeliverConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_message_bytes: 64 << 20,
        }
    }
}

/// Deliver transport speaking JSON frames to a WebSocket gateway.
///
/// One WebSocket connection per session; dropping the returned stream closes
/// it.
#[derive(Debug, Clone, Default)]
pub struct WsDeliverTransport {
    config: WsDeliverConfig,
}

impl WsDeliverTransport {
    pub fn new(config: WsDeliverConfig) -> Self {
        Self { config }
    }
}

/// WebSocket URL for a peer: `grpc`/`grpcs` endpoints map to `ws`/`wss`.
pub fn gateway_url(target: &PeerTarget) -> Result<String, TransportError> {
    let parsed = url::Url::parse(target.url())
        .map_err(|e| TransportError::Other(format!("invalid peer url '{}': {e}", target.url())))?;
    let scheme = match parsed.scheme() {
        "grpc" | "http" | "ws" => "ws",
        "grpcs" | "https" | "wss" => "wss",
        other => {
            return Err(TransportError::Other(format!(
                "unsupported scheme '{other}' for a WebSocket gateway"
            )))
        }
    };
    let rest = &target.url()[parsed.scheme().len()..];
    url::Url::parse(&format!("{scheme}{rest}"))
        .map(|u| u.to_string())
        .map_err(|e| TransportError::Other(e.to_string()))
}

fn handshake_error(addr: &str, e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::Io(_) => TransportError::Unavailable {
            target: addr.to_string(),
        },
        other => TransportError::WebSocket(other.to_string()),
    }
}

#[async_trait]
impl DeliverTransport for WsDeliverTransport {
    async fn open(&self, request: DeliverRequest) -> Result<DeliverStream, TransportError> {
        let addr = request.target.addr().to_string();
        let url = gateway_url(&request.target)?;
        let frame = SeekFrame::signed(&request)?;
        let text = serde_json::to_string(&frame)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_bytes);
        ws_config.max_frame_size = Some(self.config.max_message_bytes);

        tracing::info!(
            url = %url,
            channel = %request.channel_id,
            "opening deliver session via WebSocket"
        );
        let (ws_stream, _) = time::timeout(
            self.config.handshake_timeout,
            tokio_tungstenite::connect_async_with_config(url.as_str(), Some(ws_config), false),
        )
        .await
        .map_err(|_| TransportError::Unavailable { target: addr.clone() })?
        .map_err(|e| handshake_error(&addr, e))?;

        let (mut sink, stream) = ws_stream.split();
        sink.send(Message::Text(text))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        // The sink rides along so the connection stays open until the stream
        // is dropped or a terminal frame arrives.
        let responses = futures::stream::unfold(Some((stream, sink)), |state| async move {
            let Some((mut stream, sink)) = state else {
                return None;
            };
            loop {
                match stream.next().await {
                    None | Some(Ok(Message::Close(_))) => return None,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WS receive error");
                        return Some((Err(TransportError::WebSocket(e.to_string())), None));
                    }
                    Some(Ok(Message::Text(text))) => {
                        let item = DeliverFrame::parse(&text).and_then(DeliverFrame::into_response);
                        return match item {
                            Ok(DeliverResponse::Status(status)) => {
                                Some((Ok(DeliverResponse::Status(status)), None))
                            }
                            Ok(block) => Some((Ok(block), Some((stream, sink)))),
                            Err(e) => Some((Err(e.into()), None)),
                        };
                    }
                    Some(Ok(_)) => continue,
                }
            }
        });
        Ok(Box::pin(responses))
    }

    fn kind(&self) -> &str {
        "websocket"
    }
}
