//! Concurrent store of per-call contexts
//!
//! One lock per call id serializes every mutation of that call's context;
//! a short-lived registry lock guards only the id->context table itself, so
//! operations on distinct calls never block each other.

use super::call::{CallContext, ContextUpdate, Language, TranscriptEntry, TranscriptRole};
use crate::catalog::NodeId;
use serde_json::Map;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

type Handle = Arc<Mutex<CallContext>>;

pub struct ContextStore {
    registry: Mutex<HashMap<String, Handle>>,
    initial_node: NodeId,
    default_language: Language,
}

impl ContextStore {
    pub fn new(initial_node: NodeId, default_language: Language) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            initial_node,
            default_language,
        }
    }

    /// Create a context for a call, seeded with identity/loan/agent data.
    ///
    /// An existing context under the same id is silently replaced (logged;
    /// whether call-id reuse can actually happen is an open carrier
    /// question). Returns a snapshot of the new context.
    pub async fn create(&self, call_id: &str, seed: Map<String, serde_json::Value>) -> CallContext {
        let context = CallContext::new(
            call_id,
            seed,
            self.initial_node.clone(),
            self.default_language,
        );
        let snapshot = context.clone();
        let mut registry = self.registry.lock().await;
        if registry
            .insert(call_id.to_string(), Arc::new(Mutex::new(context)))
            .is_some()
        {
            tracing::warn!(call_id = %call_id, "replaced live context for reused call id");
        } else {
            tracing::info!(call_id = %call_id, "context created");
        }
        snapshot
    }

    async fn handle(&self, call_id: &str) -> Option<Handle> {
        self.registry.lock().await.get(call_id).cloned()
    }

    /// Snapshot of the context, or `None` for unknown calls.
    pub async fn get(&self, call_id: &str) -> Option<CallContext> {
        let handle = self.handle(call_id).await?;
        let context = handle.lock().await;
        Some(context.clone())
    }

    /// Merge a partial update; absent fields stay unchanged. Returns the
    /// updated snapshot, or `None` for unknown calls.
    pub async fn update(&self, call_id: &str, update: ContextUpdate) -> Option<CallContext> {
        let handle = self.handle(call_id).await?;
        let mut context = handle.lock().await;
        context.apply(update);
        Some(context.clone())
    }

    /// Append to the transcript. A miss is expected early in a call: the
    /// voice session can emit events before the carrier reports start.
    pub async fn append_transcript(&self, call_id: &str, role: TranscriptRole, content: &str) {
        let Some(handle) = self.handle(call_id).await else {
            tracing::debug!(call_id = %call_id, "transcript skipped, context not yet created");
            return;
        };
        let mut context = handle.lock().await;
        context.push_transcript(role, content);
    }

    /// Last `limit` transcript entries in append order.
    pub async fn transcript(&self, call_id: &str, limit: Option<usize>) -> Vec<TranscriptEntry> {
        let Some(handle) = self.handle(call_id).await else {
            return Vec::new();
        };
        let context = handle.lock().await;
        context.transcript_tail(limit).to_vec()
    }

    pub async fn set_current_node(&self, call_id: &str, node: NodeId) {
        let Some(handle) = self.handle(call_id).await else {
            return;
        };
        let mut context = handle.lock().await;
        tracing::info!(call_id = %call_id, from = %context.current_node, to = %node, "node changed");
        context.current_node = node;
    }

    /// Current node, or the configured greeting node for unknown calls.
    pub async fn current_node(&self, call_id: &str) -> NodeId {
        match self.handle(call_id).await {
            Some(handle) => handle.lock().await.current_node.clone(),
            None => self.initial_node.clone(),
        }
    }

    /// Increment a named counter and return the new value. Returns 0 for
    /// unknown calls.
    pub async fn increment_counter(&self, call_id: &str, name: &str) -> u32 {
        let Some(handle) = self.handle(call_id).await else {
            return 0;
        };
        let mut context = handle.lock().await;
        context.increment(name)
    }

    /// Remove the call's context, returning the final snapshot for the
    /// post-call report.
    pub async fn delete(&self, call_id: &str) -> Option<CallContext> {
        let handle = self.registry.lock().await.remove(call_id)?;
        let context = handle.lock().await;
        tracing::info!(call_id = %call_id, "context deleted");
        Some(context.clone())
    }

    pub async fn active_calls(&self) -> Vec<String> {
        self.registry.lock().await.keys().cloned().collect()
    }
}
