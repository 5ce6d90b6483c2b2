//! Route handlers

use super::AppState;
use crate::dialer::{stream_document, transfer_document};
use crate::directory::AgentPersona;
use crate::session::telephony::pump_socket;
use crate::session::{CallSession, CallSettings, SessionDeps};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/outbound/calls", post(place_call))
        .route(
            "/outbound/connect",
            get(connect_document).post(connect_document),
        )
        .route("/outbound/transfer-document", get(transfer_doc))
        .route("/outbound/transfer", post(transfer_call))
        .route("/outbound/status", post(call_status))
        .route("/outbound/stream/:caller/:callee", get(stream_upgrade))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let active_contexts = state.orchestrator.contexts().active_calls().await;
    Json(json!({
        "status": "ok",
        "active_streams": state.registry.len(),
        "active_calls": active_contexts.len(),
    }))
}

#[derive(Deserialize)]
struct PlaceCallRequest {
    to: String,
}

async fn place_call(
    State(state): State<AppState>,
    Json(request): Json<PlaceCallRequest>,
) -> Response {
    if !request.to.starts_with('+') {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "phone number must start with '+' and country code"})),
        )
            .into_response();
    }
    match state.dialer.place_call(&request.to).await {
        Ok(placed) => Json(json!({
            "status": "queued",
            "call_id": placed.call_id,
            "to": request.to,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(to = %request.to, error = %e, "call placement failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct ConnectQuery {
    caller: String,
    callee: String,
}

/// The document the carrier fetches after the callee answers; it points the
/// media stream at our websocket endpoint.
async fn connect_document(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> Response {
    let url = state.config.stream_url(&query.caller, &query.callee);
    xml(stream_document(&url))
}

#[derive(Deserialize)]
struct TransferDocQuery {
    phone: String,
}

async fn transfer_doc(Query(query): Query<TransferDocQuery>) -> Response {
    xml(transfer_document(&query.phone))
}

#[derive(Deserialize)]
struct TransferRequest {
    call_id: String,
    phone: String,
}

async fn transfer_call(
    State(state): State<AppState>,
    Json(request): Json<TransferRequest>,
) -> Response {
    let document_url = format!(
        "{}/outbound/transfer-document?phone={}",
        state.config.public_url, request.phone
    );
    match state.dialer.redirect(&request.call_id, &document_url).await {
        Ok(()) => Json(json!({"status": "transferring", "to": request.phone})).into_response(),
        Err(e) => {
            tracing::error!(call_id = %request.call_id, error = %e, "transfer failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// Carrier status webhook. Logged only.
async fn call_status(body: String) -> StatusCode {
    tracing::info!(body = %body, "call status update");
    StatusCode::OK
}

fn xml(document: String) -> Response {
    ([(header::CONTENT_TYPE, "application/xml")], document).into_response()
}

// ============================================================================
// Stream endpoint
// ============================================================================

async fn stream_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((caller, callee)): Path<(String, String)>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        stream_connected(socket, state, caller, callee).await;
    })
}

async fn stream_connected(
    socket: axum::extract::ws::WebSocket,
    state: AppState,
    caller: String,
    callee: String,
) {
    tracing::info!(caller = %caller, callee = %callee, "carrier stream connected");

    let (seed, persona) = resolve_call_data(&state, &caller, &callee).await;

    let deps = SessionDeps {
        orchestrator: state.orchestrator.clone(),
        connector: state.connector.clone(),
        dialer: state.dialer.clone(),
        reports: state.reports.clone(),
        registry: state.registry.clone(),
    };
    let settings = CallSettings {
        persona,
        seed,
        voice: state.config.voice.clone(),
        transfer_number: state.config.transfer_number.clone(),
        public_url: state.config.public_url.clone(),
    };

    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let (outbound_tx, outbound_rx) = mpsc::channel(256);

    let session = CallSession::new(deps, settings);
    let runner = tokio::spawn(session.run(inbound_rx, outbound_tx));

    // Pump until the carrier socket closes; the dropped channel ends the
    // session, which runs its own cleanup.
    pump_socket(socket, inbound_tx, outbound_rx).await;
    if let Err(e) = runner.await {
        tracing::error!(error = %e, "call session task panicked");
    }
}

/// Look up the customer record, client, and agent roster for this call.
/// Lookups are fail-soft: the call proceeds with placeholder data rather
/// than refusing to answer.
async fn resolve_call_data(
    state: &AppState,
    caller: &str,
    callee: &str,
) -> (Map<String, Value>, AgentPersona) {
    let customer = match state.directory.customer_by_phone(callee).await {
        Ok(found) => found,
        Err(e) => {
            tracing::error!(callee = %callee, error = %e, "customer lookup failed");
            None
        }
    };

    let mut seed = match &customer {
        Some(record) => record.to_seed(),
        None => {
            tracing::warn!(callee = %callee, "no customer record, using placeholder");
            let mut m = Map::new();
            m.insert("FirstName".into(), Value::String("Customer".into()));
            m
        }
    };

    if let Some(record) = &customer {
        match state.directory.client_by_lender(&record.lender_id).await {
            Ok(Some(client)) => {
                seed.insert("CompanyName".into(), Value::String(client.company_name));
            }
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "client lookup failed"),
        }
    }

    let team_id = match state.directory.team_for(caller).await {
        Ok(Some(team)) => {
            tracing::debug!(team = %team.team_id, client = %team.client_name, "team resolved");
            team.team_id
        }
        _ => "team-collections".to_string(),
    };
    let personas = state
        .directory
        .agents_for(&team_id)
        .await
        .unwrap_or_default();
    let persona = personas
        .choose(&mut rand::thread_rng())
        .cloned()
        .unwrap_or_else(|| AgentPersona {
            name: "Sarah Mitchell".to_string(),
            voices: std::collections::HashMap::new(),
        });

    seed.insert("AgentName".into(), Value::String(persona.name.clone()));
    seed.insert(
        "AIAgentFullName".into(),
        Value::String(persona.name.clone()),
    );
    tracing::info!(agent = %persona.name, "agent persona selected");

    (seed, persona)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::NodeCatalog;
    use crate::config::Config;
    use crate::context::{ContextStore, Language};
    use crate::dialer::NoopDialer;
    use crate::directory::StaticDirectory;
    use crate::extraction::{ExtractionError, VariableExtractor};
    use crate::flow::{ExtractedVars, RuleTable};
    use crate::orchestrator::NodeOrchestrator;
    use crate::report::LogReportSink;
    use crate::session::testing::MockConnector;
    use crate::session::CallRegistry;
    use crate::template::Conditionals;
    use async_trait::async_trait;
    use std::sync::Arc;

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

    fn test_state() -> AppState {
        let catalog = Arc::new(
            NodeCatalog::from_json(
                r#"{"system_prompt": "sys", "greeting_node": "n61", "nodes": {"n61": {"prompt": "Hi"}}}"#,
            )
            .unwrap(),
        );
        let contexts = Arc::new(ContextStore::new(
            catalog.greeting_node().clone(),
            Language::En,
        ));
        let orchestrator = Arc::new(NodeOrchestrator::new(
            catalog,
            contexts,
            RuleTable::standard(),
            Conditionals::standard(),
            Arc::new(EmptyExtractor),
        ));
        AppState {
            orchestrator,
            registry: Arc::new(CallRegistry::new()),
            directory: Arc::new(StaticDirectory),
            dialer: Arc::new(NoopDialer),
            reports: Arc::new(LogReportSink),
            connector: Arc::new(MockConnector::new(vec![])),
            config: Arc::new(Config::for_tests()),
        }
    }

    #[tokio::test]
    async fn resolve_call_data_seeds_customer_and_agent() {
        let state = test_state();
        let (seed, persona) = resolve_call_data(&state, "+15550000000", "+15551112222").await;
        assert_eq!(seed["FirstName"], "John");
        assert_eq!(seed["CompanyName"], "Essex Mortgage");
        assert_eq!(seed["AgentName"], Value::String(persona.name.clone()));
    }

    #[tokio::test]
    async fn router_builds() {
        let _router = create_router(test_state());
    }
}
