//! Call context data model

use crate::catalog::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Spoken language of the call. Drives voice-model selection and the
/// language-conditional blocks in prompt templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Es,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Es => "es",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "en" => Some(Language::En),
            "es" => Some(Language::Es),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
    /// Machine-generated markers (node transitions); excluded from
    /// extraction windows.
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Python-style truthiness over JSON values, used by flag lookups and
/// transition conditions.
pub fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f.abs() > f64::EPSILON),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Values treated as "nothing was provided" when checking presence.
pub(crate) const SENTINELS: &[&str] = &["", "NA", "N/A", "null", "None"];

pub(crate) fn is_sentinel(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => SENTINELS.contains(&s.as_str()),
        _ => false,
    }
}

/// The mutable fact base for one call.
///
/// Known fields have a fixed schema; node-declared ad hoc variables live in
/// the `vars` extension map. Seed data (identity/loan records) is written
/// once at creation and only shadowed, never rewritten, by later turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallContext {
    pub call_id: String,
    pub created_at: DateTime<Utc>,
    pub current_node: NodeId,
    pub language: Language,
    /// Identity/loan/agent data seeded at creation.
    seed: Map<String, Value>,
    /// Extraction-populated flags, strings, and API response values.
    vars: Map<String, Value>,
    counters: HashMap<String, u32>,
    transcript: Vec<TranscriptEntry>,
    /// Status of the most recent node API action, if any.
    pub api_status: Option<u16>,
    pub api_error: Option<String>,
}

impl CallContext {
    pub fn new(
        call_id: impl Into<String>,
        seed: Map<String, Value>,
        initial_node: NodeId,
        language: Language,
    ) -> Self {
        let created_at = Utc::now();
        let mut seed = seed;
        // Runtime date fields available to every template.
        seed.entry("current_date".to_string())
            .or_insert_with(|| Value::String(created_at.format("%Y-%m-%d").to_string()));
        seed.entry("current_day_of_week".to_string())
            .or_insert_with(|| Value::String(created_at.format("%A").to_string()));
        seed.entry("current_time".to_string())
            .or_insert_with(|| Value::String(created_at.format("%I:%M %p").to_string()));
        Self {
            call_id: call_id.into(),
            created_at,
            current_node: initial_node,
            language,
            seed,
            vars: Map::new(),
            counters: HashMap::new(),
            transcript: Vec::new(),
            api_status: None,
            api_error: None,
        }
    }

    /// Uniform lookup across built-ins, extracted variables, and seed data.
    /// Extracted variables shadow seed fields of the same name.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        match name {
            "call_id" => return Some(Value::String(self.call_id.clone())),
            "language" => return Some(Value::String(self.language.as_str().to_string())),
            "current_node" => return Some(Value::String(self.current_node.to_string())),
            "api_status_code" => return self.api_status.map(Value::from),
            "api_error" => return self.api_error.clone().map(Value::String),
            _ => {}
        }
        if let Some(v) = self.vars.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.seed.get(name) {
            return Some(v.clone());
        }
        self.counters.get(name).map(|&c| Value::from(c))
    }

    /// String form of a field for template substitution. Absent fields and
    /// JSON null yield `None`.
    pub fn lookup_str(&self, name: &str) -> Option<String> {
        match self.lookup(name)? {
            Value::Null => None,
            Value::String(s) => Some(s),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            other => Some(other.to_string()),
        }
    }

    /// Truthiness of a context field.
    pub fn flag(&self, name: &str) -> bool {
        self.lookup(name).as_ref().is_some_and(value_truthy)
    }

    pub fn counter(&self, name: &str) -> u32 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, name: &str) -> u32 {
        let slot = self.counters.entry(name.to_string()).or_insert(0);
        *slot += 1;
        *slot
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn push_transcript(&mut self, role: TranscriptRole, content: impl Into<String>) {
        self.transcript.push(TranscriptEntry {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    /// Last `limit` transcript entries in append order; all of them when
    /// `limit` is `None`.
    pub fn transcript_tail(&self, limit: Option<usize>) -> &[TranscriptEntry] {
        match limit {
            Some(n) if n < self.transcript.len() => {
                let start = self.transcript.len() - n;
                &self.transcript[start..]
            }
            _ => &self.transcript,
        }
    }

    pub fn transcript_len(&self) -> usize {
        self.transcript.len()
    }

    /// Merge a partial update. Absent fields and JSON-null variable values
    /// leave the stored state unchanged; it is not possible to clear a field
    /// back to empty through this call.
    pub fn apply(&mut self, update: ContextUpdate) {
        if let Some(language) = update.language {
            self.language = language;
        }
        if let Some(status) = update.api_status {
            self.api_status = Some(status);
        }
        if let Some(error) = update.api_error {
            self.api_error = Some(error);
        }
        for (key, value) in update.vars {
            if value.is_null() {
                continue;
            }
            self.vars.insert(key, value);
        }
    }
}

/// Partial update merged into a [`CallContext`].
///
/// "Absent means unchanged": an unset field, or a null value in `vars`,
/// never overwrites stored state. There is deliberately no way to clear a
/// field through an update (flagged for product sign-off, not corrected).
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    pub language: Option<Language>,
    pub api_status: Option<u16>,
    pub api_error: Option<String>,
    pub vars: Map<String, Value>,
}

impl ContextUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn vars(mut self, vars: Map<String, Value>) -> Self {
        self.vars.extend(vars);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CallContext {
        let mut seed = Map::new();
        seed.insert("FirstName".into(), Value::String("John".into()));
        seed.insert("DaysLate".into(), Value::from(45));
        CallContext::new("CA100", seed, NodeId::from("n61"), Language::En)
    }

    #[test]
    fn lookup_prefers_vars_over_seed() {
        let mut c = ctx();
        assert_eq!(c.lookup_str("FirstName").as_deref(), Some("John"));
        c.set_var("FirstName", Value::String("Johnny".into()));
        assert_eq!(c.lookup_str("FirstName").as_deref(), Some("Johnny"));
    }

    #[test]
    fn builtin_lookups() {
        let c = ctx();
        assert_eq!(c.lookup_str("language").as_deref(), Some("en"));
        assert_eq!(c.lookup_str("current_node").as_deref(), Some("n61"));
        assert!(c.lookup_str("current_date").is_some());
        assert!(c.lookup("api_status_code").is_none());
    }

    #[test]
    fn null_update_values_leave_fields_unchanged() {
        let mut c = ctx();
        c.set_var("dob_verified", Value::Bool(true));
        c.apply(ContextUpdate::new().var("dob_verified", Value::Null));
        assert!(c.flag("dob_verified"));

        c.apply(ContextUpdate::new().var("dob_verified", false));
        assert!(!c.flag("dob_verified"));
    }

    #[test]
    fn counters_start_at_zero() {
        let mut c = ctx();
        assert_eq!(c.counter("dob_attempts"), 0);
        assert_eq!(c.increment("dob_attempts"), 1);
        assert_eq!(c.increment("dob_attempts"), 2);
        assert_eq!(c.counter("dob_attempts"), 2);
    }

    #[test]
    fn transcript_tail_limits() {
        let mut c = ctx();
        for i in 0..5 {
            c.push_transcript(TranscriptRole::User, format!("turn {i}"));
        }
        assert_eq!(c.transcript_tail(Some(2)).len(), 2);
        assert_eq!(c.transcript_tail(Some(2))[0].content, "turn 3");
        assert_eq!(c.transcript_tail(None).len(), 5);
        assert_eq!(c.transcript_tail(Some(50)).len(), 5);
    }

    #[test]
    fn truthiness() {
        assert!(value_truthy(&Value::Bool(true)));
        assert!(value_truthy(&Value::String("yes".into())));
        assert!(!value_truthy(&Value::String(String::new())));
        assert!(!value_truthy(&Value::String("false".into())));
        assert!(!value_truthy(&Value::Null));
        assert!(!value_truthy(&Value::from(0)));
        assert!(value_truthy(&Value::from(3)));
    }
}
