//! Transition rules and their evaluation seam

use crate::catalog::NodeId;
use crate::context::{value_truthy, CallContext};
use serde_json::{Map, Value};

/// Variables extracted from the current conversational turn.
#[derive(Debug, Clone, Default)]
pub struct ExtractedVars(Map<String, Value>);

impl ExtractedVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Truthiness of an extracted variable; absent means false.
    pub fn flag(&self, name: &str) -> bool {
        self.0.get(name).is_some_and(value_truthy)
    }

    /// Whether the user actually provided a value: present and not one of
    /// the "nothing here" sentinels ("", "NA", "N/A", null, ...).
    pub fn present(&self, name: &str) -> bool {
        self.0
            .get(name)
            .is_some_and(|v| !crate::context::is_sentinel(v))
    }

    pub fn str_value(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// A single transition rule: when the condition holds, go to `target`.
#[derive(Debug, Clone)]
pub struct Rule {
    pub condition: Condition,
    pub target: NodeId,
    pub label: &'static str,
}

impl Rule {
    pub fn new(condition: Condition, target: &str, label: &'static str) -> Self {
        Self {
            condition,
            target: NodeId::from(target),
            label,
        }
    }
}

/// The one evaluation seam every rule goes through. Conditions are plain
/// data so the table stays declarative and swappable; `Custom` is the
/// escape hatch for the few predicates that do not fit the vocabulary.
#[derive(Debug, Clone)]
pub enum Condition {
    /// Always fires (unconditional hop).
    Always,
    /// Extracted variable is truthy.
    Flag(&'static str),
    /// Any of the extracted variables is truthy.
    AnyFlag(&'static [&'static str]),
    /// All of the extracted variables are truthy.
    AllFlags(&'static [&'static str]),
    /// Extracted variable carries a real (non-sentinel) value.
    Present(&'static str),
    /// All listed extracted variables carry real values.
    AllPresent(&'static [&'static str]),
    /// Context field is truthy.
    ContextFlag(&'static str),
    /// Context field equals the given string.
    ContextEquals(&'static str, &'static str),
    /// Named counter has reached the threshold.
    CounterAtLeast(&'static str, u32),
    /// Most recent node API action succeeded.
    ApiSucceeded,
    /// Most recent node API action failed (non-success status or error).
    ApiFailed,
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Custom(fn(&ExtractedVars, &CallContext) -> bool),
}

impl Condition {
    pub fn matches(&self, vars: &ExtractedVars, ctx: &CallContext) -> bool {
        match self {
            Condition::Always => true,
            Condition::Flag(name) => vars.flag(name),
            Condition::AnyFlag(names) => names.iter().any(|n| vars.flag(n)),
            Condition::AllFlags(names) => names.iter().all(|n| vars.flag(n)),
            Condition::Present(name) => vars.present(name),
            Condition::AllPresent(names) => names.iter().all(|n| vars.present(n)),
            Condition::ContextFlag(name) => ctx.flag(name),
            Condition::ContextEquals(name, expected) => {
                ctx.lookup_str(name).as_deref() == Some(*expected)
            }
            Condition::CounterAtLeast(name, threshold) => ctx.counter(name) >= *threshold,
            Condition::ApiSucceeded => ctx.api_status.is_some_and(|s| (200..300).contains(&s)),
            Condition::ApiFailed => {
                ctx.api_error.is_some() || ctx.api_status.is_some_and(|s| !(200..300).contains(&s))
            }
            Condition::Not(inner) => !inner.matches(vars, ctx),
            Condition::All(inner) => inner.iter().all(|c| c.matches(vars, ctx)),
            Condition::Any(inner) => inner.iter().any(|c| c.matches(vars, ctx)),
            Condition::Custom(f) => f(vars, ctx),
        }
    }
}
