//! Outbound call control
//!
//! Places calls and redirects in-progress calls through the telephony
//! control API, and builds the connection documents the carrier fetches to
//! learn where to open the media stream. Plain HTTP against a configured
//! base URL; no carrier SDK.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DialerError {
    #[error("call control request failed: {0}")]
    Network(String),
    #[error("call control returned status {0}: {1}")]
    Status(u16, String),
    #[error("call control response malformed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlacedCall {
    pub call_id: String,
}

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Place an outbound call; the carrier will fetch the connection
    /// document and open a media stream back to us.
    async fn place_call(&self, to: &str) -> Result<PlacedCall, DialerError>;

    /// Redirect a live call to a new connection document (human handoff).
    async fn redirect(&self, call_id: &str, document_url: &str) -> Result<(), DialerError>;
}

#[derive(Debug, Clone)]
pub struct DialerConfig {
    pub base_url: String,
    pub api_key: String,
    pub from_number: String,
}

impl DialerConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("DIALER_URL").unwrap_or_default(),
            api_key: std::env::var("DIALER_API_KEY").unwrap_or_default(),
            from_number: std::env::var("DIALER_FROM_NUMBER").unwrap_or_default(),
        }
    }
}

pub struct HttpDialer {
    client: reqwest::Client,
    config: DialerConfig,
    /// Base URL of this service, for the connection-document callbacks.
    public_url: String,
}

impl HttpDialer {
    pub fn new(config: DialerConfig, public_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            client,
            config,
            public_url,
        }
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn place_call(&self, to: &str) -> Result<PlacedCall, DialerError> {
        let document_url = format!(
            "{}/outbound/connect?caller={}&callee={}",
            self.public_url, self.config.from_number, to
        );
        let response = self
            .client
            .post(format!("{}/calls", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({
                "to": to,
                "from": self.config.from_number,
                "url": document_url,
                "status_callback": format!("{}/outbound/status", self.public_url),
            }))
            .send()
            .await
            .map_err(|e| DialerError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DialerError::Status(status.as_u16(), text));
        }
        response
            .json()
            .await
            .map_err(|e| DialerError::Decode(e.to_string()))
    }

    async fn redirect(&self, call_id: &str, document_url: &str) -> Result<(), DialerError> {
        let response = self
            .client
            .post(format!("{}/calls/{call_id}", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({"url": document_url}))
            .send()
            .await
            .map_err(|e| DialerError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DialerError::Status(status.as_u16(), text));
        }
        Ok(())
    }
}

/// Dialer that records nothing and always succeeds; dev/test stand-in.
#[derive(Default)]
pub struct NoopDialer;

#[async_trait]
impl Dialer for NoopDialer {
    async fn place_call(&self, to: &str) -> Result<PlacedCall, DialerError> {
        tracing::info!(to = %to, "noop dialer: pretending to place call");
        Ok(PlacedCall {
            call_id: format!("noop-{}", uuid::Uuid::new_v4()),
        })
    }

    async fn redirect(&self, call_id: &str, document_url: &str) -> Result<(), DialerError> {
        tracing::info!(call_id = %call_id, url = %document_url, "noop dialer: pretending to redirect");
        Ok(())
    }
}

// ============================================================================
// Connection documents
// ============================================================================

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Document telling the carrier to open a media stream websocket to us.
pub fn stream_document(stream_url: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Response><Connect><Stream url=\"{}\"/></Connect></Response>",
        xml_escape(stream_url)
    )
}

/// Document that dials a human agent, used for mid-call handoff.
pub fn transfer_document(phone: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Response><Say>Please hold while I transfer you to a specialist.</Say>\
         <Dial>{}</Dial></Response>",
        xml_escape(phone)
    )
}
