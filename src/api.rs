//! HTTP control surface and the carrier stream endpoint

mod handlers;

pub use handlers::create_router;

use crate::config::Config;
use crate::dialer::Dialer;
use crate::directory::Directory;
use crate::orchestrator::NodeOrchestrator;
use crate::report::ReportSink;
use crate::session::voice::VoiceConnector;
use crate::session::CallRegistry;
use std::sync::Arc;

/// Application state shared across handlers. Constructed once in `main`;
/// everything here is passed by reference, nothing is ambient.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<NodeOrchestrator>,
    pub registry: Arc<CallRegistry>,
    pub directory: Arc<dyn Directory>,
    pub dialer: Arc<dyn Dialer>,
    pub reports: Arc<dyn ReportSink>,
    pub connector: Arc<dyn VoiceConnector>,
    pub config: Arc<Config>,
}
