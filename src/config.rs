//! Environment-driven configuration

use crate::dialer::DialerConfig;
use crate::directory::DirectoryConfig;
use crate::extraction::ExtractorConfig;
use crate::report::ReportConfig;
use crate::session::voice::VoiceConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Externally reachable base URL of this service (no trailing slash).
    pub public_url: String,
    pub catalog_path: String,
    /// Human agent line for level-2 handoffs.
    pub transfer_number: String,
    pub voice: VoiceConfig,
    pub extractor: ExtractorConfig,
    pub dialer: DialerConfig,
    /// Absent means the built-in static directory serves lookups.
    pub directory: Option<DirectoryConfig>,
    /// Absent means reports are logged, not posted.
    pub report: Option<ReportConfig>,
}

impl Config {
    pub fn from_env() -> Self {
        let port = std::env::var("CALLBRIDGE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);
        let public_url = std::env::var("CALLBRIDGE_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"));
        Self {
            port,
            public_url,
            catalog_path: std::env::var("CALLBRIDGE_CATALOG")
                .unwrap_or_else(|_| "outbound_catalog.json".to_string()),
            transfer_number: std::env::var("TRANSFER_PHONE_NUMBER")
                .unwrap_or_else(|_| "+18005550102".to_string()),
            voice: VoiceConfig::from_env(),
            extractor: ExtractorConfig::from_env(),
            dialer: DialerConfig::from_env(),
            directory: DirectoryConfig::from_env(),
            report: ReportConfig::from_env(),
        }
    }

    /// Websocket URL the carrier should open its media stream against.
    pub fn stream_url(&self, caller: &str, callee: &str) -> String {
        let base = self
            .public_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/outbound/stream/{caller}/{callee}")
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            public_url: "https://bridge.test".to_string(),
            catalog_path: "catalog.json".to_string(),
            transfer_number: "+15550009999".to_string(),
            voice: VoiceConfig {
                endpoint: "wss://voice.test".to_string(),
                api_key: "test-key".to_string(),
                listen_model: "nova-3".to_string(),
                think_model: "gpt-4o-mini".to_string(),
            },
            extractor: ExtractorConfig {
                endpoint: "https://extractor.test".to_string(),
                api_key: "test-key".to_string(),
                model: "test-model".to_string(),
            },
            dialer: DialerConfig {
                base_url: "https://carrier.test".to_string(),
                api_key: "test-key".to_string(),
                from_number: "+15550000001".to_string(),
            },
            directory: None,
            report: None,
        }
    }
}
