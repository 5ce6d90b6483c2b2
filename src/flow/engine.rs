//! Rule evaluation

use super::rules::ExtractedVars;
use super::table::RuleTable;
use crate::catalog::NodeId;
use crate::context::CallContext;

/// Pick the next dialogue node.
///
/// Global triggers are evaluated first, in declared order, and override any
/// node-specific logic. Then the current node's rules, also in declared
/// order. First match wins. If nothing matches the call self-loops on the
/// current node.
pub fn next_node(
    table: &RuleTable,
    current: &NodeId,
    vars: &ExtractedVars,
    ctx: &CallContext,
) -> NodeId {
    for rule in table.global() {
        if rule.condition.matches(vars, ctx) {
            tracing::info!(
                call_id = %ctx.call_id,
                from = %current,
                to = %rule.target,
                rule = rule.label,
                "global trigger fired"
            );
            return rule.target.clone();
        }
    }

    let rules = table.for_node(current);
    if rules.is_empty() {
        tracing::warn!(call_id = %ctx.call_id, node = %current, "no transition rules for node");
        return current.clone();
    }

    for rule in rules {
        if rule.condition.matches(vars, ctx) {
            tracing::info!(
                call_id = %ctx.call_id,
                from = %current,
                to = %rule.target,
                rule = rule.label,
                "transition matched"
            );
            return rule.target.clone();
        }
    }

    tracing::debug!(call_id = %ctx.call_id, node = %current, "no rule matched, staying");
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Language;
    use crate::flow::{Condition, Rule, VERIFY_ATTEMPT_CEILING};
    use serde_json::{json, Map};

    fn ctx() -> CallContext {
        CallContext::new("CA1", Map::new(), NodeId::from("verify-1"), Language::En)
    }

    fn vars(entries: &[(&str, serde_json::Value)]) -> ExtractedVars {
        let mut v = ExtractedVars::new();
        for (k, val) in entries {
            v.insert(*k, val.clone());
        }
        v
    }

    /// A small fixture table: a verification node that routes on verified /
    /// mismatch flags with an attempt ceiling, plus one global trigger.
    fn fixture_table() -> RuleTable {
        let mut table = RuleTable::new();
        table.add_global(Rule::new(
            Condition::Flag("user_requests_transfer"),
            "escalate",
            "transfer requested",
        ));
        table.add_node(
            "verify-1",
            vec![
                Rule::new(
                    Condition::CounterAtLeast("verify_attempts", VERIFY_ATTEMPT_CEILING),
                    "escalate",
                    "too many attempts",
                ),
                Rule::new(Condition::Flag("verified"), "disclosure", "identity verified"),
                Rule::new(Condition::Flag("mismatch"), "mismatch-notice", "details mismatch"),
            ],
        );
        table.add_node(
            "mismatch-notice",
            vec![Rule::new(Condition::Always, "verify-2", "second attempt")],
        );
        table
    }

    #[test]
    fn self_loop_when_nothing_matches() {
        let table = fixture_table();
        let current = NodeId::from("verify-1");
        let next = next_node(&table, &current, &ExtractedVars::new(), &ctx());
        assert_eq!(next, current);
    }

    #[test]
    fn self_loop_for_unknown_node() {
        let table = fixture_table();
        let current = NodeId::from("nowhere");
        let next = next_node(&table, &current, &ExtractedVars::new(), &ctx());
        assert_eq!(next, current);
    }

    #[test]
    fn global_trigger_overrides_node_rules() {
        let table = fixture_table();
        let v = vars(&[
            ("verified", json!(true)),
            ("user_requests_transfer", json!(true)),
        ]);
        let next = next_node(&table, &NodeId::from("verify-1"), &v, &ctx());
        assert_eq!(next, NodeId::from("escalate"));
    }

    #[test]
    fn first_matching_node_rule_wins() {
        let table = fixture_table();
        let v = vars(&[("verified", json!(true)), ("mismatch", json!(true))]);
        let next = next_node(&table, &NodeId::from("verify-1"), &v, &ctx());
        assert_eq!(next, NodeId::from("disclosure"));
    }

    #[test]
    fn mismatch_routes_to_notice_not_verified_path() {
        let table = fixture_table();
        let mut c = ctx();
        c.increment("verify_attempts");
        let v = vars(&[("mismatch", json!(true))]);
        let next = next_node(&table, &NodeId::from("verify-1"), &v, &c);
        assert_eq!(next, NodeId::from("mismatch-notice"));
    }

    #[test]
    fn attempt_ceiling_escalates_regardless_of_flags() {
        let table = fixture_table();
        let mut c = ctx();
        for _ in 0..VERIFY_ATTEMPT_CEILING {
            c.increment("verify_attempts");
        }
        let v = vars(&[("verified", json!(true))]);
        let next = next_node(&table, &NodeId::from("verify-1"), &v, &c);
        assert_eq!(next, NodeId::from("escalate"));
    }

    #[test]
    fn unconditional_hop() {
        let table = fixture_table();
        let next = next_node(
            &table,
            &NodeId::from("mismatch-notice"),
            &ExtractedVars::new(),
            &ctx(),
        );
        assert_eq!(next, NodeId::from("verify-2"));
    }
}
