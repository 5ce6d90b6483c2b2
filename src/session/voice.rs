//! Voice-agent session boundary
//!
//! The voice vendor speaks a tagged-JSON protocol over a websocket: a
//! `Settings` handshake selects codecs, providers, prompts, and the
//! callable-function manifest; afterwards events flow in (function calls,
//! conversation text, barge-in, errors) and commands and raw audio flow
//! out. The connector/sink/stream traits are the seam the coordinator and
//! the tests share.

use crate::context::Language;
use crate::directory::AgentPersona;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("voice session connect failed: {0}")]
    Connect(String),
    #[error("voice session send failed: {0}")]
    Send(String),
    #[error("voice session receive failed: {0}")]
    Receive(String),
    #[error("voice session encoding failed: {0}")]
    Encode(String),
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioConfig {
    pub input: AudioFormat,
    pub output: AudioFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct Provider {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keyterms: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenConfig {
    pub provider: Provider,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThinkConfig {
    pub provider: Provider,
    pub prompt: String,
    pub functions: Vec<FunctionSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeakConfig {
    pub provider: Provider,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentConfig {
    pub language: String,
    pub listen: ListenConfig,
    pub think: ThinkConfig,
    pub speak: SpeakConfig,
    pub greeting: String,
}

/// The handshake message opening every voice session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSettings {
    pub audio: AudioConfig,
    pub agent: AgentConfig,
}

/// A function the voice agent may call. The vendor validates these schemas,
/// so the manifest shape is part of the external contract.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Commands we send into a live voice session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum AgentCommand {
    Settings(SessionSettings),
    FunctionCallResponse {
        id: String,
        name: String,
        content: String,
    },
    UpdatePrompt {
        prompt: String,
    },
    InjectAgentMessage {
        content: String,
    },
    KeepAlive,
}

/// Events the voice session sends us.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    Welcome,
    SettingsApplied,
    FunctionCall {
        name: String,
        id: String,
        /// JSON-encoded argument object.
        #[serde(default)]
        arguments: String,
    },
    ConversationText {
        role: String,
        content: String,
    },
    UserStartedSpeaking,
    AgentAudioDone,
    Error {
        #[serde(default)]
        code: String,
        #[serde(default)]
        description: String,
    },
}

/// One frame off the voice session: a typed event or synthesized audio.
#[derive(Debug, Clone)]
pub enum VoiceFrame {
    Event(AgentEvent),
    Audio(Vec<u8>),
}

// ============================================================================
// Settings construction
// ============================================================================

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub endpoint: String,
    pub api_key: String,
    pub listen_model: String,
    pub think_model: String,
}

impl VoiceConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("VOICE_AGENT_URL")
                .unwrap_or_else(|_| "wss://agent.deepgram.com/v1/agent/converse".to_string()),
            api_key: std::env::var("VOICE_AGENT_API_KEY").unwrap_or_default(),
            listen_model: std::env::var("VOICE_LISTEN_MODEL")
                .unwrap_or_else(|_| "nova-3".to_string()),
            think_model: std::env::var("VOICE_THINK_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        }
    }
}

/// The five functions the agent can call. Names and schemas must match the
/// serverside dispatch exactly.
pub fn function_manifest() -> Vec<FunctionSpec> {
    vec![
        FunctionSpec {
            name: "switch_language".to_string(),
            description: "Switch conversation language when the user requests Spanish or English"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "language": {
                        "type": "string",
                        "enum": ["en", "es"],
                        "description": "Target language: 'en' for English, 'es' for Spanish"
                    }
                },
                "required": ["language"]
            }),
        },
        FunctionSpec {
            name: "verify_dob".to_string(),
            description: "Verify the customer's date of birth. Parse the spoken date to MM/DD/YYYY format."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "parsed_dob": {
                        "type": "string",
                        "description": "Customer's spoken date of birth parsed to MM/DD/YYYY format"
                    }
                },
                "required": ["parsed_dob"]
            }),
        },
        FunctionSpec {
            name: "process_input".to_string(),
            description: "Process the customer's response to determine the next action. Call this after each substantive customer response."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "user_input": {
                        "type": "string",
                        "description": "The customer's spoken response"
                    },
                    "current_topic": {
                        "type": "string",
                        "description": "What you're currently discussing (payment, verification, etc.)"
                    }
                },
                "required": ["user_input"]
            }),
        },
        FunctionSpec {
            name: "transfer_to_level_2".to_string(),
            description: "Transfer the call to a human agent when the customer requests it or the issue is complex"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Reason for transfer"
                    }
                },
                "required": ["reason"]
            }),
        },
        FunctionSpec {
            name: "end_call".to_string(),
            description: "End the call gracefully after business is complete".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Reason for ending: completed, customer_request, no_answer"
                    }
                },
                "required": ["reason"]
            }),
        },
    ]
}

const KEYTERMS: &[&str] = &[
    "hello", "goodbye", "hola", "adiós", "español", "spanish", "english", "inglés", "yes", "no",
    "sí",
];

/// Build the handshake for a call: 8kHz companded audio both ways, the
/// per-language voice model, and the rendered prompts.
pub fn build_settings(
    config: &VoiceConfig,
    persona: &AgentPersona,
    language: Language,
    system_prompt: &str,
    greeting: &str,
) -> SessionSettings {
    SessionSettings {
        audio: AudioConfig {
            input: AudioFormat {
                encoding: "mulaw".to_string(),
                sample_rate: 8000,
                container: None,
            },
            output: AudioFormat {
                encoding: "mulaw".to_string(),
                sample_rate: 8000,
                container: Some("none".to_string()),
            },
        },
        agent: AgentConfig {
            language: language.as_str().to_string(),
            listen: ListenConfig {
                provider: Provider {
                    kind: "deepgram".to_string(),
                    model: config.listen_model.clone(),
                    temperature: None,
                    keyterms: KEYTERMS.iter().map(|s| (*s).to_string()).collect(),
                },
            },
            think: ThinkConfig {
                provider: Provider {
                    kind: "open_ai".to_string(),
                    model: config.think_model.clone(),
                    temperature: Some(0.7),
                    keyterms: Vec::new(),
                },
                prompt: system_prompt.to_string(),
                functions: function_manifest(),
            },
            speak: SpeakConfig {
                provider: Provider {
                    kind: "deepgram".to_string(),
                    model: persona.voice(language).to_string(),
                    temperature: None,
                    keyterms: Vec::new(),
                },
            },
            greeting: greeting.to_string(),
        },
    }
}

// ============================================================================
// Connection seam
// ============================================================================

#[async_trait]
pub trait VoiceSink: Send {
    async fn send_command(&mut self, command: &AgentCommand) -> Result<(), VoiceError>;
    async fn send_audio(&mut self, audio: &[u8]) -> Result<(), VoiceError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait VoiceStream: Send {
    /// Next frame; `None` means the session is gone.
    async fn next_frame(&mut self) -> Option<Result<VoiceFrame, VoiceError>>;
}

#[async_trait]
pub trait VoiceConnector: Send + Sync {
    /// Open a session and perform the `Settings` handshake.
    async fn open(
        &self,
        settings: SessionSettings,
    ) -> Result<(Box<dyn VoiceSink>, Box<dyn VoiceStream>), VoiceError>;
}

// ============================================================================
// Tungstenite implementation
// ============================================================================

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub struct TungsteniteConnector {
    config: VoiceConfig,
}

impl TungsteniteConnector {
    pub fn new(config: VoiceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl VoiceConnector for TungsteniteConnector {
    async fn open(
        &self,
        settings: SessionSettings,
    ) -> Result<(Box<dyn VoiceSink>, Box<dyn VoiceStream>), VoiceError> {
        let mut request = self
            .config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Connect(e.to_string()))?;
        // Token-subprotocol authentication.
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            format!("token, {}", self.config.api_key)
                .parse()
                .map_err(|_| VoiceError::Connect("api key not header-safe".to_string()))?,
        );

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| VoiceError::Connect(e.to_string()))?;
        tracing::info!(endpoint = %self.config.endpoint, "voice session connected");

        let (sink, stream) = socket.split();
        let mut sink = TungsteniteSink { sink };
        sink.send_command(&AgentCommand::Settings(settings)).await?;

        Ok((Box::new(sink), Box::new(TungsteniteStream { stream })))
    }
}

struct TungsteniteSink {
    sink: WsSink,
}

#[async_trait]
impl VoiceSink for TungsteniteSink {
    async fn send_command(&mut self, command: &AgentCommand) -> Result<(), VoiceError> {
        let text = serde_json::to_string(command).map_err(|e| VoiceError::Encode(e.to_string()))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| VoiceError::Send(e.to_string()))
    }

    async fn send_audio(&mut self, audio: &[u8]) -> Result<(), VoiceError> {
        self.sink
            .send(Message::Binary(audio.to_vec()))
            .await
            .map_err(|e| VoiceError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

struct TungsteniteStream {
    stream: WsStream,
}

#[async_trait]
impl VoiceStream for TungsteniteStream {
    async fn next_frame(&mut self) -> Option<Result<VoiceFrame, VoiceError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(m) => m,
                Err(e) => return Some(Err(VoiceError::Receive(e.to_string()))),
            };
            match message {
                Message::Text(text) => match serde_json::from_str::<AgentEvent>(&text) {
                    Ok(event) => return Some(Ok(VoiceFrame::Event(event))),
                    Err(e) => {
                        // Vendors add event types; skipping is the safe move.
                        tracing::debug!(error = %e, "ignoring unrecognized voice event");
                    }
                },
                Message::Binary(audio) => return Some(Ok(VoiceFrame::Audio(audio))),
                Message::Close(_) => return None,
                _ => {}
            }
        }
    }
}
