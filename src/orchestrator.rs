//! Per-turn decision pipeline
//!
//! One conversational turn: read the recent transcript, extract variables,
//! normalize them, merge into the context, run the transition engine, fire
//! the target node's API actions, and render the new prompt. The output is
//! a [`DecisionBundle`] the session coordinator applies to the live voice
//! session.

mod actions;

pub use actions::ActionRunner;

use crate::catalog::{NodeCatalog, NodeId};
use crate::context::{CallContext, ContextStore, ContextUpdate, TranscriptRole};
use crate::extraction::VariableExtractor;
use crate::flow::{next_node, ExtractedVars, RuleTable};
use crate::template::{self, Conditionals};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Transcript entries fed to the extraction collaborator.
const EXTRACTION_WINDOW: usize = 10;

/// Output of one orchestrator turn.
#[derive(Debug)]
pub struct DecisionBundle {
    pub next_node: NodeId,
    /// Rendered prompt for the new node; `None` when the node did not
    /// change or the call is ending.
    pub prompt: Option<String>,
    pub context: CallContext,
    /// True exactly when the node changed and the live agent prompt must
    /// be refreshed.
    pub refresh_agent: bool,
}

pub struct NodeOrchestrator {
    catalog: Arc<NodeCatalog>,
    contexts: Arc<ContextStore>,
    rules: RuleTable,
    conditionals: Conditionals,
    extractor: Arc<dyn VariableExtractor>,
    actions: ActionRunner,
}

impl NodeOrchestrator {
    pub fn new(
        catalog: Arc<NodeCatalog>,
        contexts: Arc<ContextStore>,
        rules: RuleTable,
        conditionals: Conditionals,
        extractor: Arc<dyn VariableExtractor>,
    ) -> Self {
        Self {
            catalog,
            contexts,
            rules,
            conditionals,
            extractor,
            actions: ActionRunner::new(),
        }
    }

    pub fn contexts(&self) -> &Arc<ContextStore> {
        &self.contexts
    }

    pub fn catalog(&self) -> &Arc<NodeCatalog> {
        &self.catalog
    }

    /// Create and seed the context for a new call.
    pub async fn initialize_call(&self, call_id: &str, seed: Map<String, Value>) -> CallContext {
        self.contexts.create(call_id, seed).await
    }

    /// Delete the call's context, returning the final snapshot.
    pub async fn end_call(&self, call_id: &str) -> Option<CallContext> {
        self.contexts.delete(call_id).await
    }

    /// Rendered system prompt for the voice session.
    pub fn system_prompt(&self, ctx: &CallContext) -> String {
        template::render(self.catalog.system_prompt(), ctx, &self.conditionals)
    }

    /// Rendered prompt for a node. Unknown ids and empty templates yield
    /// `None` with a warning; the call stays where it is.
    pub fn node_prompt(&self, node: &NodeId, ctx: &CallContext) -> Option<String> {
        let Some(definition) = self.catalog.node(node) else {
            tracing::warn!(call_id = %ctx.call_id, node = %node, "unknown node, no prompt");
            return None;
        };
        if definition.prompt.is_empty() {
            tracing::warn!(call_id = %ctx.call_id, node = %node, "node has no prompt template");
            return None;
        }
        Some(template::render(&definition.prompt, ctx, &self.conditionals))
    }

    /// Rendered greeting-node prompt, spoken first on every call.
    pub fn greeting_prompt(&self, ctx: &CallContext) -> Option<String> {
        let greeting = self.catalog.greeting_node().clone();
        self.node_prompt(&greeting, ctx)
    }

    /// Process one conversational turn.
    pub async fn process(
        &self,
        call_id: &str,
        node_id: &NodeId,
        user_input: &str,
        ctx: &CallContext,
    ) -> DecisionBundle {
        tracing::info!(call_id = %call_id, node = %node_id, input = %user_input, "processing turn");

        // Recent transcript for extraction context; the coordinator appends
        // the user utterance before calling us.
        let transcript = self.transcript_window(call_id).await;
        let transcript = if transcript.is_empty() {
            format!("user: {user_input}")
        } else {
            transcript
        };

        let specs = self.catalog.variable_specs(node_id);
        let customer_name = format!(
            "{} {}",
            ctx.lookup_str("FirstName").unwrap_or_default(),
            ctx.lookup_str("LastName").unwrap_or_default()
        );

        // Extraction is fail-open: any error becomes an empty result and
        // the turn proceeds.
        let mut extracted = match self.extractor.extract(specs, &transcript, &customer_name).await {
            Ok(vars) => vars,
            Err(e) => {
                tracing::error!(call_id = %call_id, error = %e, "extraction failed, continuing with empty result");
                ExtractedVars::new()
            }
        };

        self.normalize(&mut extracted, ctx);

        // Merge the turn's facts before running transitions.
        let updated = match self
            .contexts
            .update(
                call_id,
                ContextUpdate::new().vars(extracted.as_map().clone()),
            )
            .await
        {
            Some(updated) => updated,
            None => {
                tracing::warn!(call_id = %call_id, "context missing during turn, using snapshot");
                let mut fallback = ctx.clone();
                fallback.apply(ContextUpdate::new().vars(extracted.as_map().clone()));
                fallback
            }
        };

        let next = next_node(&self.rules, node_id, &extracted, &updated);

        if next.is_end() {
            return DecisionBundle {
                next_node: next,
                prompt: None,
                context: updated,
                refresh_agent: false,
            };
        }

        let changed = next != *node_id;
        let mut updated = updated;

        // Node API actions run once, on entry into the new node. Failures
        // are recorded in context for the rule table to react to next turn.
        if changed {
            if let Some(definition) = self.catalog.node(&next) {
                if !definition.apis.is_empty() {
                    let update = self.actions.run(&next, definition, &updated).await;
                    if let Some(after) = self.contexts.update(call_id, update).await {
                        updated = after;
                    }
                }
            }
        }

        let prompt = if changed {
            let prompt = self.node_prompt(&next, &updated);
            self.contexts.set_current_node(call_id, next.clone()).await;
            if prompt.is_some() {
                self.contexts
                    .append_transcript(call_id, TranscriptRole::Internal, &format!("[node: {next}]"))
                    .await;
            }
            prompt
        } else {
            None
        };

        DecisionBundle {
            next_node: next,
            prompt,
            context: updated,
            refresh_agent: changed,
        }
    }

    /// Node-specific reconciliation applied between extraction and merge.
    fn normalize(&self, extracted: &mut ExtractedVars, ctx: &CallContext) {
        // Verification: compare the spoken date of birth against the one on
        // file, both reduced to a digit-only canonical form.
        if let Some(spoken) = extracted.str_value("extracted_dob").map(str::to_string) {
            if let Some(on_file) = ctx.lookup_str("DOB") {
                let spoken_norm = normalize_date_digits(&spoken);
                let on_file_norm = normalize_date_digits(&on_file);
                if !spoken_norm.is_empty() && spoken_norm == on_file_norm {
                    extracted.insert("dob_verified", true);
                    extracted.insert("dob_correct", true);
                    tracing::info!(spoken = %spoken, "date of birth verified");
                } else {
                    extracted.insert("dob_mismatch", true);
                    extracted.insert("dob_incorrect", true);
                    tracing::info!(spoken = %spoken, "date of birth mismatch");
                }
            }
        }

        // Two accepted spellings of the promised payment date; templates
        // read the upd_ form.
        if extracted.present("user_provided_payment_date") {
            if let Some(date) = extracted.str_value("user_provided_payment_date") {
                let date = date.to_string();
                extracted.insert("upd_extracted_payment_date", date);
            }
        }
    }

    async fn transcript_window(&self, call_id: &str) -> String {
        let entries = self
            .contexts
            .transcript(call_id, Some(EXTRACTION_WINDOW))
            .await;
        let lines: Vec<String> = entries
            .iter()
            .filter(|e| e.role != TranscriptRole::Internal)
            .map(|e| {
                let role = match e.role {
                    TranscriptRole::User => "user",
                    TranscriptRole::Assistant => "assistant",
                    TranscriptRole::Internal => unreachable!(),
                };
                format!("{role}: {}", e.content)
            })
            .collect();
        lines.join("\n")
    }
}

/// Reduce a date-like string to a canonical digit form for comparison.
/// Recognized formats are rewritten to `YYYYMMDD`; anything else falls back
/// to its digits, or lowercased text if there are none.
pub fn normalize_date_digits(raw: &str) -> String {
    const FORMATS: &[&str] = &[
        "%m/%d/%Y", "%m-%d-%Y", "%Y-%m-%d", "%m/%d/%y", "%Y/%m/%d", "%B %d, %Y", "%B %d %Y",
    ];
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '/' || *c == '-' || *c == ' ' || c.is_alphabetic())
        .collect();
    let cleaned = cleaned.trim();

    for format in FORMATS {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(cleaned, format) {
            return date.format("%Y%m%d").to_string();
        }
    }

    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        raw.trim().to_lowercase()
    } else {
        digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Language;
    use crate::extraction::{ExtractionError, VariableExtractor};
    use crate::flow::RuleTable;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Extractor returning queued results, recording each request.
    struct MockExtractor {
        responses: Mutex<Vec<Result<ExtractedVars, ExtractionError>>>,
    }

    impl MockExtractor {
        fn returning(vars: &[(&str, Value)]) -> Self {
            let mut extracted = ExtractedVars::new();
            for (k, v) in vars {
                extracted.insert(*k, v.clone());
            }
            Self {
                responses: Mutex::new(vec![Ok(extracted)]),
            }
        }

        fn failing() -> Self {
            Self {
                responses: Mutex::new(vec![Err(ExtractionError::network("unreachable"))]),
            }
        }
    }

    #[async_trait]
    impl VariableExtractor for MockExtractor {
        async fn extract(
            &self,
            _specs: &[crate::catalog::VariableSpec],
            _transcript: &str,
            _customer_name: &str,
        ) -> Result<ExtractedVars, ExtractionError> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(ExtractedVars::new()))
        }
    }

    const CATALOG: &str = r#"{
        "system_prompt": "You are {{AgentName}} calling about loan {{LoanID}}.",
        "greeting_node": "n61",
        "nodes": {
            "n61": {"prompt": "Hello {{FirstName}}."},
            "n68": {
                "prompt": "Please verify your date of birth.",
                "variables": [{"name": "extracted_dob", "type": "date"}]
            },
            "n32": {"prompt": "That does not match our records."},
            "n41": {"prompt": "Here is the required disclosure."},
            "n25": {"prompt": "Goodbye."}
        }
    }"#;

    fn orchestrator(extractor: MockExtractor) -> NodeOrchestrator {
        let catalog = Arc::new(crate::catalog::NodeCatalog::from_json(CATALOG).unwrap());
        let contexts = Arc::new(ContextStore::new(
            catalog.greeting_node().clone(),
            Language::En,
        ));
        NodeOrchestrator::new(
            catalog,
            contexts,
            RuleTable::standard(),
            Conditionals::standard(),
            Arc::new(extractor),
        )
    }

    fn seed() -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("FirstName".into(), json!("John"));
        m.insert("LastName".into(), json!("Smith"));
        m.insert("DOB".into(), json!("1985-06-15"));
        m
    }

    #[tokio::test]
    async fn empty_extraction_self_loops_without_prompt() {
        let orch = orchestrator(MockExtractor::returning(&[]));
        let ctx = orch.initialize_call("CA1", seed()).await;

        let bundle = orch.process("CA1", &NodeId::from("n61"), "hmm", &ctx).await;
        assert_eq!(bundle.next_node, NodeId::from("n61"));
        assert!(bundle.prompt.is_none());
        assert!(!bundle.refresh_agent);
    }

    #[tokio::test]
    async fn extraction_failure_is_fail_open() {
        let orch = orchestrator(MockExtractor::failing());
        let ctx = orch.initialize_call("CA1", seed()).await;

        let bundle = orch.process("CA1", &NodeId::from("n61"), "hello", &ctx).await;
        assert_eq!(bundle.next_node, NodeId::from("n61"));
        assert!(!bundle.refresh_agent);
    }

    #[tokio::test]
    async fn mismatch_goes_to_notice_node() {
        let orch = orchestrator(MockExtractor::returning(&[(
            "extracted_dob",
            json!("03/02/1990"),
        )]));
        let ctx = orch.initialize_call("CA1", seed()).await;
        orch.contexts().increment_counter("CA1", "dob_attempts").await;

        let bundle = orch
            .process("CA1", &NodeId::from("n68"), "march second", &ctx)
            .await;
        assert_eq!(bundle.next_node, NodeId::from("n32"));
        assert!(bundle.refresh_agent);
        assert_eq!(
            bundle.prompt.as_deref(),
            Some("That does not match our records.")
        );
        assert!(bundle.context.flag("dob_mismatch"));
        assert_eq!(
            orch.contexts().current_node("CA1").await,
            NodeId::from("n32")
        );
    }

    #[tokio::test]
    async fn matching_dob_verifies_and_advances() {
        let orch = orchestrator(MockExtractor::returning(&[(
            "extracted_dob",
            json!("06/15/1985"),
        )]));
        let ctx = orch.initialize_call("CA1", seed()).await;

        let bundle = orch
            .process("CA1", &NodeId::from("n68"), "june fifteenth", &ctx)
            .await;
        assert_eq!(bundle.next_node, NodeId::from("n41"));
        assert!(bundle.context.flag("dob_verified"));
    }

    #[tokio::test]
    async fn terminal_node_returns_without_side_effects() {
        let orch = orchestrator(MockExtractor::returning(&[("call_complete", json!(true))]));
        let ctx = orch.initialize_call("CA1", seed()).await;
        orch.contexts()
            .set_current_node("CA1", NodeId::from("n25"))
            .await;
        let before = orch.contexts().get("CA1").await.unwrap().transcript_len();

        let bundle = orch.process("CA1", &NodeId::from("n25"), "bye", &ctx).await;
        assert!(bundle.next_node.is_end());
        assert!(bundle.prompt.is_none());
        assert!(!bundle.refresh_agent);
        // No transition marker, no node change.
        let after = orch.contexts().get("CA1").await.unwrap();
        assert_eq!(after.transcript_len(), before);
        assert_eq!(after.current_node, NodeId::from("n25"));
    }

    #[tokio::test]
    async fn payment_date_is_mirrored() {
        let orch = orchestrator(MockExtractor::returning(&[(
            "user_provided_payment_date",
            json!("2026-08-10"),
        )]));
        let ctx = orch.initialize_call("CA1", seed()).await;

        let bundle = orch.process("CA1", &NodeId::from("n61"), "monday", &ctx).await;
        assert_eq!(
            bundle.context.lookup_str("upd_extracted_payment_date").as_deref(),
            Some("2026-08-10")
        );
    }

    #[test]
    fn date_normalization_accepts_common_formats() {
        assert_eq!(normalize_date_digits("06/15/1985"), "19850615");
        assert_eq!(normalize_date_digits("1985-06-15"), "19850615");
        assert_eq!(normalize_date_digits("June 15, 1985"), "19850615");
        assert_eq!(normalize_date_digits("06-15-1985"), "19850615");
        assert_eq!(
            normalize_date_digits("06/15/1985"),
            normalize_date_digits("1985-06-15")
        );
    }

    #[test]
    fn date_normalization_falls_back_to_digits() {
        assert_eq!(normalize_date_digits("born 6151985!"), "6151985");
        assert_eq!(normalize_date_digits("no digits here"), "no digits here");
    }
}
