//! Node API actions
//!
//! A node can declare external API calls that fire when the conversation
//! enters it. Request bodies and URLs get variable substitution against the
//! context; declared response paths map back into context keys. Failures
//! are recorded in the context, never raised; the rule table reacts to a
//! recorded failure on the following turn.

use crate::catalog::{ApiMethod, BodyField, NodeDefinition, NodeId, ResponseField};
use crate::context::{CallContext, ContextUpdate};
use crate::template;
use serde_json::{Map, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ActionRunner {
    client: reqwest::Client,
}

impl ActionRunner {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client }
    }

    /// Execute a node's declared actions in order and collect the resulting
    /// context update (status, mapped response values, or recorded error).
    pub async fn run(
        &self,
        node: &NodeId,
        definition: &NodeDefinition,
        ctx: &CallContext,
    ) -> ContextUpdate {
        let mut update = ContextUpdate::new();

        for api in &definition.apis {
            let url = template::substitute_variables(&api.url, ctx);
            let outcome = match api.method {
                ApiMethod::Post => {
                    let body = substitute_body(&api.body, ctx);
                    tracing::info!(call_id = %ctx.call_id, node = %node, url = %url, "node action POST");
                    self.client.post(&url).json(&body).send().await
                }
                ApiMethod::Get => {
                    tracing::info!(call_id = %ctx.call_id, node = %node, url = %url, "node action GET");
                    self.client.get(&url).send().await
                }
            };

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    update.api_status = Some(status.as_u16());
                    if status.is_success() {
                        match response.json::<Value>().await {
                            Ok(payload) => {
                                map_response(&mut update, &api.response_map, &payload);
                                if api.response_map.is_empty() {
                                    update.vars.insert("api_response".to_string(), payload);
                                }
                            }
                            Err(e) => {
                                tracing::warn!(call_id = %ctx.call_id, error = %e, "action response was not JSON");
                            }
                        }
                    } else {
                        let text = response.text().await.unwrap_or_default();
                        let error = format!("status {status}: {text}");
                        tracing::error!(call_id = %ctx.call_id, node = %node, error = %error, "node action failed");
                        update.api_error = Some(error);
                    }
                }
                Err(e) => {
                    tracing::error!(call_id = %ctx.call_id, node = %node, error = %e, "node action transport error");
                    update.api_error = Some(e.to_string());
                }
            }
        }

        update
    }
}

impl Default for ActionRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn map_response(update: &mut ContextUpdate, fields: &[ResponseField], payload: &Value) {
    for field in fields {
        if let Some(value) = json_path(payload, field.path()) {
            update.vars.insert(field.key.clone(), value.clone());
        }
    }
}

/// Walk a dot-separated path into a JSON value.
fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Substitute context values into a declared request body, coercing the
/// results to booleans and numbers where the text allows it.
pub fn substitute_body(fields: &[BodyField], ctx: &CallContext) -> Map<String, Value> {
    let mut body = Map::new();
    for field in fields {
        let raw = template::substitute_variables(&field.value, ctx);
        body.insert(field.key.clone(), coerce(&raw));
    }
    body
}

fn coerce(raw: &str) -> Value {
    match raw.to_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(f) {
            return Value::Number(number);
        }
    }
    Value::String(raw.to_string())
}
