//! callbridge - automated outbound call bridge
//!
//! Bridges carrier media streams to real-time voice-agent sessions and
//! drives each conversation through a catalog of dialogue nodes.

mod api;
mod catalog;
mod config;
mod context;
mod dialer;
mod directory;
mod extraction;
mod flow;
mod orchestrator;
mod report;
mod session;
mod template;

use api::{create_router, AppState};
use catalog::NodeCatalog;
use config::Config;
use context::{ContextStore, Language};
use dialer::{Dialer, HttpDialer, NoopDialer};
use directory::{Directory, HttpDirectory, StaticDirectory};
use extraction::ChatExtractor;
use flow::RuleTable;
use orchestrator::NodeOrchestrator;
use report::{HttpReportSink, LogReportSink, ReportSink};
use session::voice::TungsteniteConnector;
use session::CallRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use template::Conditionals;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callbridge=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Arc::new(Config::from_env());

    tracing::info!(path = %config.catalog_path, "loading node catalog");
    let catalog = Arc::new(NodeCatalog::load(&config.catalog_path)?);

    let contexts = Arc::new(ContextStore::new(
        catalog.greeting_node().clone(),
        Language::En,
    ));
    let orchestrator = Arc::new(NodeOrchestrator::new(
        catalog,
        contexts,
        RuleTable::standard(),
        Conditionals::standard(),
        Arc::new(ChatExtractor::new(config.extractor.clone())),
    ));

    let directory: Arc<dyn Directory> = match &config.directory {
        Some(dir_config) => Arc::new(HttpDirectory::new(dir_config.clone())),
        None => {
            tracing::warn!("no directory endpoint configured, serving the static roster");
            Arc::new(StaticDirectory)
        }
    };
    let dialer: Arc<dyn Dialer> = if config.dialer.base_url.is_empty() {
        tracing::warn!("no dialer endpoint configured, call placement is a no-op");
        Arc::new(NoopDialer)
    } else {
        Arc::new(HttpDialer::new(
            config.dialer.clone(),
            config.public_url.clone(),
        ))
    };
    let reports: Arc<dyn ReportSink> = match &config.report {
        Some(report_config) => Arc::new(HttpReportSink::new(report_config.clone())),
        None => Arc::new(LogReportSink),
    };

    let state = AppState {
        orchestrator,
        registry: Arc::new(CallRegistry::new()),
        directory,
        dialer,
        reports,
        connector: Arc::new(TungsteniteConnector::new(config.voice.clone())),
        config: config.clone(),
    };

    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, public_url = %config.public_url, "callbridge listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
