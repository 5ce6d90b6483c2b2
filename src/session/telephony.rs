//! Carrier media-stream boundary
//!
//! The carrier holds a websocket to us per call: control events and
//! base64 companded audio inbound, audio and flush commands outbound.
//! [`pump_socket`] adapts the socket to a channel pair so the session
//! coordinator never touches the transport directly.

use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Deserialize)]
pub struct StreamStart {
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    #[serde(rename = "callSid")]
    pub call_sid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaFrame {
    /// Base64 8kHz mono companded audio.
    pub payload: String,
}

impl MediaFrame {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.payload)
    }
}

/// Control events the carrier sends over the stream socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyInbound {
    Connected,
    Start { start: StreamStart },
    Media { media: MediaFrame },
    Stop,
    Mark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

/// Messages we send back over the stream socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyOutbound {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    /// Flush queued playback immediately (barge-in). Cancels queued audio
    /// only; the connection stays up.
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

impl TelephonyOutbound {
    pub fn media(stream_sid: &str, audio: &[u8]) -> Self {
        TelephonyOutbound::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia {
                payload: BASE64.encode(audio),
            },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        TelephonyOutbound::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }
}

/// Bridge a carrier socket to the coordinator's channels: one task per
/// direction, both ending when the socket closes. Unknown or unparseable
/// events are logged and skipped, never fatal.
pub async fn pump_socket(
    socket: WebSocket,
    inbound_tx: mpsc::Sender<TelephonyInbound>,
    mut outbound_rx: mpsc::Receiver<TelephonyOutbound>,
) {
    let (mut sink, mut stream) = socket.split();

    let reader = async move {
        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    tracing::info!(error = %e, "carrier socket read failed");
                    break;
                }
            };
            match message {
                Message::Text(text) => match serde_json::from_str::<TelephonyInbound>(&text) {
                    Ok(frame) => {
                        if inbound_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "ignoring unrecognized carrier event");
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    let writer = async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode carrier frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::info!(error = %e, "carrier socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    };

    tokio::join!(reader, writer);
}
