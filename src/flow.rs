//! Dialogue transition engine
//!
//! A deterministic rule machine: global triggers are checked first for every
//! node, then the current node's own rules, all in declared order with
//! first-match-wins. When nothing fires the call stays on the current node.
//! The concrete rule table is business configuration ([`table::RuleTable`]);
//! the engine itself knows nothing about individual nodes.

mod engine;
mod rules;
mod table;

pub use engine::next_node;
pub use rules::{Condition, ExtractedVars, Rule};
pub use table::{RuleTable, VERIFY_ATTEMPT_CEILING};
