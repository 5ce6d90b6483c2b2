//! Mock implementations for session tests
//!
//! Scripted voice connections plus recording dialer/report sinks, so the
//! coordinator's relay loops can be exercised without any network.

use super::voice::{
    AgentCommand, AgentEvent, SessionSettings, VoiceConnector, VoiceError, VoiceFrame, VoiceSink,
    VoiceStream,
};
use crate::dialer::{Dialer, DialerError, PlacedCall};
use crate::report::{CallReport, ReportError, ReportSink};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One step of a scripted voice stream.
#[derive(Debug, Clone)]
pub enum ScriptItem {
    Event(AgentEvent),
    Audio(Vec<u8>),
    Wait(Duration),
}

/// Everything a mock sink saw, in order, shared across reconnects.
#[derive(Debug, Clone)]
pub enum SinkRecord {
    Command(Value),
    Audio(Vec<u8>),
    Closed,
}

/// Connector handing out scripted connections. Each `open` consumes the
/// next script; an exhausted connector serves empty (idle) streams.
pub struct MockConnector {
    scripts: Mutex<VecDeque<Vec<ScriptItem>>>,
    opened: Mutex<Vec<SessionSettings>>,
    records: Arc<Mutex<Vec<SinkRecord>>>,
}

impl MockConnector {
    pub fn new(scripts: Vec<Vec<ScriptItem>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            opened: Mutex::new(Vec::new()),
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Settings passed to each `open`, in order.
    pub fn opened(&self) -> Vec<SessionSettings> {
        self.opened.lock().unwrap().clone()
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoiceConnector for MockConnector {
    async fn open(
        &self,
        settings: SessionSettings,
    ) -> Result<(Box<dyn VoiceSink>, Box<dyn VoiceStream>), VoiceError> {
        self.opened.lock().unwrap().push(settings);
        let items = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let sink = MockSink {
            records: self.records.clone(),
        };
        let stream = MockStream {
            items: items.into(),
        };
        Ok((Box::new(sink), Box::new(stream)))
    }
}

struct MockSink {
    records: Arc<Mutex<Vec<SinkRecord>>>,
}

#[async_trait]
impl VoiceSink for MockSink {
    async fn send_command(&mut self, command: &AgentCommand) -> Result<(), VoiceError> {
        let value =
            serde_json::to_value(command).map_err(|e| VoiceError::Encode(e.to_string()))?;
        self.records.lock().unwrap().push(SinkRecord::Command(value));
        Ok(())
    }

    async fn send_audio(&mut self, audio: &[u8]) -> Result<(), VoiceError> {
        self.records
            .lock()
            .unwrap()
            .push(SinkRecord::Audio(audio.to_vec()));
        Ok(())
    }

    async fn close(&mut self) {
        self.records.lock().unwrap().push(SinkRecord::Closed);
    }
}

struct MockStream {
    items: VecDeque<ScriptItem>,
}

#[async_trait]
impl VoiceStream for MockStream {
    async fn next_frame(&mut self) -> Option<Result<VoiceFrame, VoiceError>> {
        loop {
            match self.items.pop_front() {
                Some(ScriptItem::Wait(duration)) => tokio::time::sleep(duration).await,
                Some(ScriptItem::Event(event)) => return Some(Ok(VoiceFrame::Event(event))),
                Some(ScriptItem::Audio(audio)) => return Some(Ok(VoiceFrame::Audio(audio))),
                // Script exhausted: stay open until the session is torn
                // down from the carrier side.
                None => std::future::pending::<()>().await,
            }
        }
    }
}

/// Dialer recording every redirect request.
#[derive(Default)]
pub struct MockDialer {
    pub redirects: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Dialer for MockDialer {
    async fn place_call(&self, _to: &str) -> Result<PlacedCall, DialerError> {
        Ok(PlacedCall {
            call_id: "CA-mock".to_string(),
        })
    }

    async fn redirect(&self, call_id: &str, document_url: &str) -> Result<(), DialerError> {
        self.redirects
            .lock()
            .unwrap()
            .push((call_id.to_string(), document_url.to_string()));
        Ok(())
    }
}

/// Report sink recording every posted memo.
#[derive(Default)]
pub struct MockReportSink {
    posted: Mutex<Vec<CallReport>>,
}

impl MockReportSink {
    pub fn posted(&self) -> Vec<CallReport> {
        self.posted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportSink for MockReportSink {
    async fn post(&self, report: &CallReport) -> Result<(), ReportError> {
        self.posted.lock().unwrap().push(report.clone());
        Ok(())
    }
}
