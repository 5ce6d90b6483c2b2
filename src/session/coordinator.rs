//! Session coordinator
//!
//! Drives one call end to end. Three relay loops run concurrently:
//! - inbound relay: carrier audio -> voice session, gated during reconnect
//! - heartbeat: periodic keep-alive into the voice session
//! - the main loop here: voice events -> orchestrator turns, function-call
//!   dispatch, barge-in flush, synthesized audio -> carrier
//!
//! The loops share nothing but channels. A language switch closes the gate,
//! swaps the voice connection under the writer task, and reopens the gate;
//! audio arriving during the window is dropped, never buffered, so no stale
//! audio reaches a fresh session.

use super::telephony::{TelephonyInbound, TelephonyOutbound};
use super::voice::{
    build_settings, AgentCommand, AgentEvent, VoiceConfig, VoiceConnector, VoiceFrame, VoiceSink,
    VoiceStream,
};
use super::{CallRegistry, SessionPhase};
use crate::context::{CallContext, ContextUpdate, Language, TranscriptRole};
use crate::dialer::Dialer;
use crate::directory::AgentPersona;
use crate::orchestrator::{normalize_date_digits, NodeOrchestrator};
use crate::report::{build_report, ReportSink};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const AUDIO_CHANNEL_DEPTH: usize = 64;

/// Shared collaborators, owned by the process entry point.
#[derive(Clone)]
pub struct SessionDeps {
    pub orchestrator: Arc<NodeOrchestrator>,
    pub connector: Arc<dyn VoiceConnector>,
    pub dialer: Arc<dyn Dialer>,
    pub reports: Arc<dyn ReportSink>,
    pub registry: Arc<CallRegistry>,
}

/// Per-call configuration resolved before the stream opens.
#[derive(Clone)]
pub struct CallSettings {
    pub persona: AgentPersona,
    pub seed: Map<String, Value>,
    pub voice: VoiceConfig,
    pub transfer_number: String,
    pub public_url: String,
}

/// Messages into the voice writer task.
enum VoiceOutbound {
    Audio(Vec<u8>),
    Command(AgentCommand),
    /// Close the current connection and continue on a new one.
    Swap(Box<dyn VoiceSink>),
    Shutdown,
}

/// Control messages from the inbound relay to the main loop.
#[derive(Debug)]
enum SessionControl {
    Started { stream_sid: String, call_sid: String },
    Stopped,
}

enum Flow {
    Continue,
    End(&'static str),
}

pub struct CallSession {
    deps: SessionDeps,
    settings: CallSettings,
    phase: SessionPhase,
    language: Language,
    stream_sid: Option<String>,
    call_sid: Option<String>,
}

impl CallSession {
    pub fn new(deps: SessionDeps, settings: CallSettings) -> Self {
        Self {
            deps,
            settings,
            phase: SessionPhase::Init,
            language: Language::En,
            stream_sid: None,
            call_sid: None,
        }
    }

    /// Bridge the call until either side ends it, then clean up.
    pub async fn run(
        mut self,
        inbound: mpsc::Receiver<TelephonyInbound>,
        outbound: mpsc::Sender<TelephonyOutbound>,
    ) {
        // Render the handshake prompts against a provisional context; the
        // store entry exists only once the carrier reports start.
        let provisional = self.provisional_context();
        let system_prompt = self.deps.orchestrator.system_prompt(&provisional);
        let greeting = self
            .deps
            .orchestrator
            .greeting_prompt(&provisional)
            .unwrap_or_default();

        let handshake = build_settings(
            &self.settings.voice,
            &self.settings.persona,
            self.language,
            &system_prompt,
            &greeting,
        );
        let (sink, mut stream) = match self.deps.connector.open(handshake).await {
            Ok(halves) => halves,
            Err(e) => {
                tracing::error!(error = %e, "could not open voice session, abandoning call");
                return;
            }
        };

        let (voice_tx, voice_rx) = mpsc::channel::<VoiceOutbound>(AUDIO_CHANNEL_DEPTH);
        let (gate_tx, gate_rx) = watch::channel(true);
        let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<SessionControl>(8);

        tokio::spawn(writer_loop(sink, voice_rx));
        tokio::spawn(inbound_relay(
            inbound,
            voice_tx.clone(),
            gate_rx.clone(),
            ctrl_tx,
        ));
        tokio::spawn(heartbeat_loop(voice_tx.clone(), gate_rx));

        let end_reason;
        loop {
            tokio::select! {
                control = ctrl_rx.recv() => match control {
                    Some(SessionControl::Started { stream_sid, call_sid }) => {
                        self.on_stream_started(stream_sid, call_sid).await;
                    }
                    Some(SessionControl::Stopped) | None => {
                        end_reason = "carrier stream ended";
                        break;
                    }
                },
                frame = stream.next_frame() => match frame {
                    Some(Ok(VoiceFrame::Audio(audio))) => {
                        self.forward_audio(&outbound, &audio).await;
                    }
                    Some(Ok(VoiceFrame::Event(event))) => {
                        match self.handle_event(event, &voice_tx, &outbound, &gate_tx, &mut stream).await {
                            Flow::Continue => {}
                            Flow::End(reason) => {
                                end_reason = reason;
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "voice session error");
                        end_reason = "voice session error";
                        break;
                    }
                    None => {
                        end_reason = "voice session closed";
                        break;
                    }
                },
            }
        }

        self.shutdown(end_reason, &voice_tx, &gate_tx).await;
    }

    fn provisional_context(&self) -> CallContext {
        CallContext::new(
            "pending",
            self.settings.seed.clone(),
            self.deps.orchestrator.catalog().greeting_node().clone(),
            self.language,
        )
    }

    async fn on_stream_started(&mut self, stream_sid: String, call_sid: String) {
        tracing::info!(stream_sid = %stream_sid, call_sid = %call_sid, "carrier stream started");
        self.deps
            .orchestrator
            .initialize_call(&call_sid, self.settings.seed.clone())
            .await;
        self.deps.registry.insert(&stream_sid, &call_sid);
        self.stream_sid = Some(stream_sid);
        self.call_sid = Some(call_sid);
        self.phase = SessionPhase::Streaming;
    }

    /// Synthesized audio -> carrier. Dropped until the stream id is known.
    async fn forward_audio(&self, outbound: &mpsc::Sender<TelephonyOutbound>, audio: &[u8]) {
        let Some(stream_sid) = &self.stream_sid else {
            return;
        };
        if self.phase != SessionPhase::Streaming {
            return;
        }
        let _ = outbound
            .send(TelephonyOutbound::media(stream_sid, audio))
            .await;
    }

    async fn handle_event(
        &mut self,
        event: AgentEvent,
        voice_tx: &mpsc::Sender<VoiceOutbound>,
        outbound: &mpsc::Sender<TelephonyOutbound>,
        gate_tx: &watch::Sender<bool>,
        stream: &mut Box<dyn VoiceStream>,
    ) -> Flow {
        match event {
            AgentEvent::ConversationText { role, content } => {
                self.on_conversation_text(&role, &content, voice_tx).await;
                Flow::Continue
            }
            AgentEvent::FunctionCall { name, id, arguments } => {
                self.on_function_call(&name, &id, &arguments, voice_tx, gate_tx, stream)
                    .await
            }
            AgentEvent::UserStartedSpeaking => {
                // Barge-in: flush queued playback, leave the connections up.
                if let Some(stream_sid) = &self.stream_sid {
                    tracing::info!(stream_sid = %stream_sid, "barge-in, flushing playback");
                    let _ = outbound.send(TelephonyOutbound::clear(stream_sid)).await;
                }
                Flow::Continue
            }
            AgentEvent::Error { code, description } => {
                tracing::error!(code = %code, description = %description, "voice session reported error");
                Flow::Continue
            }
            AgentEvent::Welcome | AgentEvent::SettingsApplied | AgentEvent::AgentAudioDone => {
                Flow::Continue
            }
        }
    }

    async fn on_conversation_text(
        &mut self,
        role: &str,
        content: &str,
        voice_tx: &mpsc::Sender<VoiceOutbound>,
    ) {
        let Some(call_sid) = self.call_sid.clone() else {
            tracing::debug!("conversation text before stream start, skipping");
            return;
        };

        let transcript_role = match role {
            "user" => TranscriptRole::User,
            _ => TranscriptRole::Assistant,
        };
        self.deps
            .orchestrator
            .contexts()
            .append_transcript(&call_sid, transcript_role, content)
            .await;

        // Every user utterance drives a turn.
        if transcript_role == TranscriptRole::User {
            self.run_turn(&call_sid, content, voice_tx).await;
        }
    }

    /// One orchestrator turn; pushes the refreshed prompt into the live
    /// session when the node changed.
    async fn run_turn(
        &mut self,
        call_sid: &str,
        user_input: &str,
        voice_tx: &mpsc::Sender<VoiceOutbound>,
    ) -> bool {
        let contexts = self.deps.orchestrator.contexts();
        let Some(ctx) = contexts.get(call_sid).await else {
            tracing::warn!(call_id = %call_sid, "no context for turn");
            return false;
        };
        let node = contexts.current_node(call_sid).await;

        let bundle = self
            .deps
            .orchestrator
            .process(call_sid, &node, user_input, &ctx)
            .await;

        if bundle.refresh_agent {
            if let Some(prompt) = &bundle.prompt {
                let _ = voice_tx
                    .send(VoiceOutbound::Command(AgentCommand::UpdatePrompt {
                        prompt: prompt.clone(),
                    }))
                    .await;
                let _ = voice_tx
                    .send(VoiceOutbound::Command(AgentCommand::InjectAgentMessage {
                        content: "Continue with your current task.".to_string(),
                    }))
                    .await;
            }
        }
        bundle.next_node.is_end()
    }

    #[allow(clippy::too_many_lines)] // one arm per callable function
    async fn on_function_call(
        &mut self,
        name: &str,
        id: &str,
        arguments: &str,
        voice_tx: &mpsc::Sender<VoiceOutbound>,
        gate_tx: &watch::Sender<bool>,
        stream: &mut Box<dyn VoiceStream>,
    ) -> Flow {
        let args: Value = serde_json::from_str(arguments).unwrap_or(Value::Null);
        tracing::info!(function = %name, args = %args, "function call");
        let contexts = self.deps.orchestrator.contexts();

        let mut flow = Flow::Continue;
        let content = match name {
            "switch_language" => {
                let target = args
                    .get("language")
                    .and_then(Value::as_str)
                    .and_then(Language::parse)
                    .unwrap_or(self.language);
                if target == self.language {
                    "Already speaking in the requested language.".to_string()
                } else {
                    match self.reconnect_for_language(target, voice_tx, gate_tx, stream).await {
                        Ok(()) => match target {
                            Language::Es => "Ahora hablaré en español.".to_string(),
                            Language::En => "I'll now speak in English.".to_string(),
                        },
                        Err(()) => return Flow::End("language reconnect failed"),
                    }
                }
            }
            "verify_dob" => {
                let spoken = args
                    .get("parsed_dob")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.verify_dob(spoken, voice_tx).await
            }
            "process_input" => {
                let input = args
                    .get("user_input")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let ended = match self.call_sid.clone() {
                    Some(call_sid) => self.run_turn(&call_sid, input, voice_tx).await,
                    None => false,
                };
                if ended {
                    "Thank you for calling. Have a great day!".to_string()
                } else {
                    "I understand.".to_string()
                }
            }
            "transfer_to_level_2" => {
                let reason = args
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("customer_request")
                    .to_string();
                if let Some(call_sid) = self.call_sid.clone() {
                    contexts
                        .update(
                            &call_sid,
                            ContextUpdate::new()
                                .var("transfer_requested", true)
                                .var("transfer_reason", reason.clone()),
                        )
                        .await;
                    self.start_transfer(&call_sid);
                }
                "I'll transfer you to a specialist who can better assist you. Please hold."
                    .to_string()
            }
            "end_call" => {
                let reason = args
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("completed")
                    .to_string();
                if let Some(call_sid) = self.call_sid.clone() {
                    contexts
                        .update(
                            &call_sid,
                            ContextUpdate::new()
                                .var("call_ended", true)
                                .var("end_reason", reason),
                        )
                        .await;
                }
                flow = Flow::End("agent ended call");
                "Thank you for calling. Goodbye!".to_string()
            }
            other => {
                tracing::warn!(function = %other, "unknown function call");
                format!("Function {other} is not available.")
            }
        };

        let _ = voice_tx
            .send(VoiceOutbound::Command(AgentCommand::FunctionCallResponse {
                id: id.to_string(),
                name: name.to_string(),
                content,
            }))
            .await;
        flow
    }

    async fn verify_dob(&mut self, spoken: &str, voice_tx: &mpsc::Sender<VoiceOutbound>) -> String {
        let Some(call_sid) = self.call_sid.clone() else {
            return "I'm sorry, I can't verify that right now.".to_string();
        };
        let contexts = self.deps.orchestrator.contexts();

        let on_file = contexts
            .get(&call_sid)
            .await
            .and_then(|ctx| ctx.lookup_str("DOB"))
            .unwrap_or_default();
        let matched = !on_file.is_empty()
            && normalize_date_digits(spoken) == normalize_date_digits(&on_file);
        let attempts = contexts.increment_counter(&call_sid, "dob_attempts").await;

        if matched {
            contexts
                .update(
                    &call_sid,
                    ContextUpdate::new()
                        .var("dob_verified", true)
                        .var("dob_correct", true),
                )
                .await;
            // Advance the flow off the verification node.
            let input = format!("Verified date of birth: {spoken}");
            self.run_turn(&call_sid, &input, voice_tx).await;
            "Thank you for verifying your date of birth. I also need to share an important disclosure with you."
                .to_string()
        } else {
            contexts
                .update(&call_sid, ContextUpdate::new().var("dob_mismatch", true))
                .await;
            if attempts >= 2 {
                "I'm sorry, but I wasn't able to verify your identity. For security purposes, I'll need to transfer you to a specialist."
                    .to_string()
            } else {
                "I'm sorry, that doesn't match our records. Could you please repeat your date of birth?"
                    .to_string()
            }
        }
    }

    /// Live language switch: gate the relays, close the old session, render
    /// the prompts in the target language, open a new session, reopen the
    /// gate. A brief audio gap is accepted; duplication is not.
    async fn reconnect_for_language(
        &mut self,
        target: Language,
        voice_tx: &mpsc::Sender<VoiceOutbound>,
        gate_tx: &watch::Sender<bool>,
        stream: &mut Box<dyn VoiceStream>,
    ) -> Result<(), ()> {
        tracing::info!(from = %self.language, to = %target, "language switch");
        self.phase = SessionPhase::LanguageReconnect;
        let _ = gate_tx.send(false);

        self.language = target;
        let contexts = self.deps.orchestrator.contexts();
        let ctx = match self.call_sid.as_deref() {
            Some(call_sid) => {
                contexts
                    .update(call_sid, ContextUpdate::new().language(target))
                    .await
            }
            None => None,
        };
        let ctx = match ctx {
            Some(ctx) => ctx,
            None => {
                let mut provisional = self.provisional_context();
                provisional.language = target;
                provisional
            }
        };

        let system_prompt = self.deps.orchestrator.system_prompt(&ctx);
        // Mid-call, the current node's prompt doubles as the continuation
        // greeting for the fresh session.
        let continuation = self
            .deps
            .orchestrator
            .node_prompt(&ctx.current_node, &ctx)
            .unwrap_or_default();
        let handshake = build_settings(
            &self.settings.voice,
            &self.settings.persona,
            target,
            &system_prompt,
            &continuation,
        );

        match self.deps.connector.open(handshake).await {
            Ok((sink, new_stream)) => {
                let _ = voice_tx.send(VoiceOutbound::Swap(sink)).await;
                *stream = new_stream;
                let _ = gate_tx.send(true);
                self.phase = SessionPhase::Streaming;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "reconnect failed");
                Err(())
            }
        }
    }

    /// Kick off the carrier-side redirect to a human agent. Best-effort and
    /// detached: the voice conversation continues until the carrier moves
    /// the call.
    fn start_transfer(&self, call_sid: &str) {
        let dialer = self.deps.dialer.clone();
        let call_sid = call_sid.to_string();
        let document_url = format!(
            "{}/outbound/transfer-document?phone={}",
            self.settings.public_url, self.settings.transfer_number
        );
        tokio::spawn(async move {
            if let Err(e) = dialer.redirect(&call_sid, &document_url).await {
                tracing::error!(call_id = %call_sid, error = %e, "transfer redirect failed");
            }
        });
    }

    /// Best-effort cleanup; every step is isolated so one failure never
    /// stops the rest.
    async fn shutdown(
        &mut self,
        reason: &str,
        voice_tx: &mpsc::Sender<VoiceOutbound>,
        gate_tx: &watch::Sender<bool>,
    ) {
        tracing::info!(reason = %reason, call_id = ?self.call_sid, "terminating call session");
        self.phase = SessionPhase::Terminating;
        let _ = gate_tx.send(false);
        let _ = voice_tx.send(VoiceOutbound::Shutdown).await;

        if let Some(call_sid) = self.call_sid.clone() {
            match self.deps.orchestrator.end_call(&call_sid).await {
                Some(final_context) => {
                    let report = build_report(&final_context);
                    if let Err(e) = self.deps.reports.post(&report).await {
                        tracing::error!(call_id = %call_sid, error = %e, "report post failed");
                    }
                }
                None => {
                    tracing::debug!(call_id = %call_sid, "no context at shutdown");
                }
            }
        }

        if let Some(stream_sid) = &self.stream_sid {
            if let Some(active) = self.deps.registry.remove(stream_sid) {
                let duration = chrono::Utc::now() - active.started_at;
                tracing::info!(
                    call_id = %active.call_id,
                    duration_s = duration.num_seconds(),
                    "call removed from registry"
                );
            }
        }
        self.phase = SessionPhase::Closed;
    }
}

// ============================================================================
// Relay loops
// ============================================================================

/// Owns the voice sink. Network send failures are logged and the loop keeps
/// going; only channel closure or an explicit shutdown ends it.
async fn writer_loop(mut sink: Box<dyn VoiceSink>, mut rx: mpsc::Receiver<VoiceOutbound>) {
    while let Some(message) = rx.recv().await {
        match message {
            VoiceOutbound::Audio(audio) => {
                if let Err(e) = sink.send_audio(&audio).await {
                    tracing::debug!(error = %e, "voice audio send failed");
                }
            }
            VoiceOutbound::Command(command) => {
                if let Err(e) = sink.send_command(&command).await {
                    tracing::warn!(error = %e, "voice command send failed");
                }
            }
            VoiceOutbound::Swap(new_sink) => {
                sink.close().await;
                sink = new_sink;
            }
            VoiceOutbound::Shutdown => break,
        }
    }
    sink.close().await;
}

/// Carrier frames -> voice session. Audio is forwarded only while the gate
/// is open; during a reconnect it is dropped, never buffered, so a stale
/// session cannot receive it late.
async fn inbound_relay(
    mut inbound: mpsc::Receiver<TelephonyInbound>,
    voice_tx: mpsc::Sender<VoiceOutbound>,
    gate: watch::Receiver<bool>,
    ctrl_tx: mpsc::Sender<SessionControl>,
) {
    while let Some(frame) = inbound.recv().await {
        match frame {
            TelephonyInbound::Start { start } => {
                let started = SessionControl::Started {
                    stream_sid: start.stream_sid,
                    call_sid: start.call_sid,
                };
                if ctrl_tx.send(started).await.is_err() {
                    return;
                }
            }
            TelephonyInbound::Media { media } => {
                if !*gate.borrow() {
                    continue;
                }
                match media.decode() {
                    Ok(audio) => {
                        if voice_tx.send(VoiceOutbound::Audio(audio)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "undecodable media frame");
                    }
                }
            }
            TelephonyInbound::Stop => break,
            TelephonyInbound::Connected | TelephonyInbound::Mark => {}
        }
    }
    let _ = ctrl_tx.send(SessionControl::Stopped).await;
}

/// Periodic keep-alive. A closed channel means the session is gone; while
/// the gate is shut (reconnect in progress) ticks are skipped.
async fn heartbeat_loop(voice_tx: mpsc::Sender<VoiceOutbound>, gate: watch::Receiver<bool>) {
    loop {
        tokio::time::sleep(KEEPALIVE_INTERVAL).await;
        if !*gate.borrow() {
            continue;
        }
        if voice_tx
            .send(VoiceOutbound::Command(AgentCommand::KeepAlive))
            .await
            .is_err()
        {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{MockConnector, MockDialer, MockReportSink, ScriptItem, SinkRecord};
    use super::super::telephony::{MediaFrame, StreamStart};
    use super::*;
    use crate::catalog::NodeCatalog;
    use crate::context::ContextStore;
    use crate::extraction::{ExtractionError, VariableExtractor};
    use crate::flow::{ExtractedVars, RuleTable};
    use crate::template::Conditionals;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::timeout;

    struct EmptyExtractor;

    #[async_trait]
    impl VariableExtractor for EmptyExtractor {
        async fn extract(
            &self,
            _specs: &[crate::catalog::VariableSpec],
            _transcript: &str,
            _customer_name: &str,
        ) -> Result<ExtractedVars, ExtractionError> {
            Ok(ExtractedVars::new())
        }
    }

    const CATALOG: &str = r#"{
        "system_prompt": "You are {{AgentName}}.{%es%} Habla español.{%endes%}",
        "greeting_node": "n61",
        "nodes": {
            "n61": {"prompt": "{%en%}Hello {{FirstName}}.{%enden%}{%es%}Hola {{FirstName}}.{%endes%}"},
            "n25": {"prompt": "Goodbye."}
        }
    }"#;

    fn orchestrator() -> Arc<NodeOrchestrator> {
        let catalog = Arc::new(NodeCatalog::from_json(CATALOG).unwrap());
        let contexts = Arc::new(ContextStore::new(
            catalog.greeting_node().clone(),
            Language::En,
        ));
        Arc::new(NodeOrchestrator::new(
            catalog,
            contexts,
            RuleTable::standard(),
            Conditionals::standard(),
            Arc::new(EmptyExtractor),
        ))
    }

    struct Harness {
        connector: Arc<MockConnector>,
        reports: Arc<MockReportSink>,
        registry: Arc<CallRegistry>,
        orchestrator: Arc<NodeOrchestrator>,
        inbound_tx: mpsc::Sender<TelephonyInbound>,
        outbound_rx: mpsc::Receiver<TelephonyOutbound>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start_session(scripts: Vec<Vec<ScriptItem>>) -> Harness {
        let connector = Arc::new(MockConnector::new(scripts));
        let reports = Arc::new(MockReportSink::default());
        let registry = Arc::new(CallRegistry::new());
        let orchestrator = orchestrator();

        let deps = SessionDeps {
            orchestrator: orchestrator.clone(),
            connector: connector.clone(),
            dialer: Arc::new(MockDialer::default()),
            reports: reports.clone(),
            registry: registry.clone(),
        };
        let mut seed = Map::new();
        seed.insert("FirstName".into(), Value::String("John".into()));
        seed.insert("AgentName".into(), Value::String("Sarah".into()));
        seed.insert("DOB".into(), Value::String("1985-06-15".into()));
        let settings = CallSettings {
            persona: AgentPersona {
                name: "Sarah".into(),
                voices: HashMap::from([
                    (Language::En, "voice-en".into()),
                    (Language::Es, "voice-es".into()),
                ]),
            },
            seed,
            voice: VoiceConfig {
                endpoint: "wss://voice.test".into(),
                api_key: "k".into(),
                listen_model: "nova-3".into(),
                think_model: "gpt-4o-mini".into(),
            },
            transfer_number: "+15550009999".into(),
            public_url: "https://bridge.test".into(),
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(32);
        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let session = CallSession::new(deps, settings);
        let task = tokio::spawn(session.run(inbound_rx, outbound_tx));

        Harness {
            connector,
            reports,
            registry,
            orchestrator,
            inbound_tx,
            outbound_rx,
            task,
        }
    }

    async fn send_start(h: &Harness) {
        h.inbound_tx
            .send(TelephonyInbound::Start {
                start: StreamStart {
                    stream_sid: "MZ1".into(),
                    call_sid: "CA1".into(),
                },
            })
            .await
            .unwrap();
    }

    async fn recv_outbound(h: &mut Harness) -> TelephonyOutbound {
        timeout(Duration::from_secs(2), h.outbound_rx.recv())
            .await
            .expect("timed out waiting for carrier frame")
            .expect("outbound channel closed")
    }

    async fn finish(h: Harness) {
        drop(h.inbound_tx);
        timeout(Duration::from_secs(2), h.task)
            .await
            .expect("session did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn handshake_uses_rendered_prompts() {
        let h = start_session(vec![vec![]]);
        send_start(&h).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let opened = h.connector.opened();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].agent.language, "en");
        assert_eq!(opened[0].agent.greeting, "Hello John.");
        assert_eq!(opened[0].agent.think.prompt, "You are Sarah.");
        finish(h).await;
    }

    #[tokio::test]
    async fn barge_in_flushes_carrier_playback() {
        let h = start_session(vec![vec![
            ScriptItem::Wait(Duration::from_millis(50)),
            ScriptItem::Event(AgentEvent::UserStartedSpeaking),
        ]]);
        let mut h = h;
        send_start(&h).await;

        let frame = recv_outbound(&mut h).await;
        assert_eq!(frame, TelephonyOutbound::clear("MZ1"));
        finish(h).await;
    }

    #[tokio::test]
    async fn synthesized_audio_reaches_carrier_encoded() {
        let h = start_session(vec![vec![
            ScriptItem::Wait(Duration::from_millis(50)),
            ScriptItem::Audio(vec![9, 8, 7]),
        ]]);
        let mut h = h;
        send_start(&h).await;

        match recv_outbound(&mut h).await {
            TelephonyOutbound::Media { stream_sid, media } => {
                assert_eq!(stream_sid, "MZ1");
                assert_eq!(media.payload, BASE64.encode([9, 8, 7]));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        finish(h).await;
    }

    #[tokio::test]
    async fn inbound_audio_reaches_voice_sink() {
        let h = start_session(vec![vec![]]);
        send_start(&h).await;
        h.inbound_tx
            .send(TelephonyInbound::Media {
                media: MediaFrame {
                    payload: BASE64.encode([1, 2, 3]),
                },
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let audio: Vec<Vec<u8>> = h
            .connector
            .records()
            .into_iter()
            .filter_map(|r| match r {
                SinkRecord::Audio(a) => Some(a),
                _ => None,
            })
            .collect();
        assert_eq!(audio, vec![vec![1, 2, 3]]);
        finish(h).await;
    }

    #[tokio::test]
    async fn language_switch_reopens_session_in_target_language() {
        let h = start_session(vec![
            vec![
                ScriptItem::Wait(Duration::from_millis(50)),
                ScriptItem::Event(AgentEvent::FunctionCall {
                    name: "switch_language".into(),
                    id: "fc_1".into(),
                    arguments: r#"{"language":"es"}"#.into(),
                }),
            ],
            vec![],
        ]);
        send_start(&h).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let opened = h.connector.opened();
        assert_eq!(opened.len(), 2, "one reconnect expected");
        assert_eq!(opened[1].agent.language, "es");
        assert_eq!(opened[1].agent.greeting, "Hola John.");
        assert_eq!(opened[1].agent.speak.provider.model, "voice-es");

        // The old connection was closed, and the function response went to
        // the replacement sink.
        let records = h.connector.records();
        let closed_before_response = records.iter().position(|r| matches!(r, SinkRecord::Closed));
        let response = records.iter().position(|r| {
            matches!(r, SinkRecord::Command(v) if v["type"] == "FunctionCallResponse")
        });
        assert!(closed_before_response.unwrap() < response.unwrap());

        let ctx = h.orchestrator.contexts().get("CA1").await.unwrap();
        assert_eq!(ctx.language, Language::Es);
        finish(h).await;
    }

    #[tokio::test]
    async fn end_call_function_terminates_and_reports() {
        let h = start_session(vec![vec![
            ScriptItem::Wait(Duration::from_millis(50)),
            ScriptItem::Event(AgentEvent::FunctionCall {
                name: "end_call".into(),
                id: "fc_9".into(),
                arguments: r#"{"reason":"completed"}"#.into(),
            }),
        ]]);
        send_start(&h).await;

        timeout(Duration::from_secs(2), h.task)
            .await
            .expect("session did not terminate")
            .unwrap();

        // Context deleted, report posted, registry cleaned.
        assert!(h.orchestrator.contexts().get("CA1").await.is_none());
        let posted = h.reports.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].call_id, "CA1");
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn stream_stop_cleans_up() {
        let h = start_session(vec![vec![]]);
        send_start(&h).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.inbound_tx.send(TelephonyInbound::Stop).await.unwrap();

        timeout(Duration::from_secs(2), h.task)
            .await
            .expect("session did not terminate")
            .unwrap();
        assert!(h.orchestrator.contexts().get("CA1").await.is_none());
        assert_eq!(h.reports.posted().len(), 1);
    }

    #[tokio::test]
    async fn gated_relay_drops_audio_instead_of_buffering() {
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (voice_tx, mut voice_rx) = mpsc::channel(8);
        let (gate_tx, gate_rx) = watch::channel(false);
        let (ctrl_tx, _ctrl_rx) = mpsc::channel(8);
        tokio::spawn(inbound_relay(inbound_rx, voice_tx, gate_rx, ctrl_tx));

        inbound_tx
            .send(TelephonyInbound::Media {
                media: MediaFrame {
                    payload: BASE64.encode([1]),
                },
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            voice_rx.try_recv().is_err(),
            "audio must be dropped while the gate is closed"
        );

        gate_tx.send(true).unwrap();
        inbound_tx
            .send(TelephonyInbound::Media {
                media: MediaFrame {
                    payload: BASE64.encode([2]),
                },
            })
            .await
            .unwrap();
        let forwarded = timeout(Duration::from_secs(1), voice_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(forwarded, VoiceOutbound::Audio(a) if a == vec![2]));
    }
}
