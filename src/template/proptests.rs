//! Property-based tests for the renderer
//!
//! The invariants worth holding across arbitrary inputs: rendering is
//! idempotent, normalization output never carries long blank runs, and
//! resolved output never carries conditional markers.

use super::*;
use crate::catalog::NodeId;
use crate::context::{CallContext, Language};
use proptest::prelude::*;
use serde_json::{Map, Value};

fn test_context() -> CallContext {
    let mut seed = Map::new();
    seed.insert("FirstName".into(), Value::String("John".into()));
    seed.insert("Amount".into(), Value::String("125.50".into()));
    CallContext::new("CA1", seed, NodeId::from("n61"), Language::En)
}

fn test_conditionals() -> Conditionals {
    let mut c = Conditionals::new();
    c.register("yes", |_| true);
    c.register("no", |_| false);
    c
}

/// Text fragments without template syntax.
fn arb_plain() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 .,\n]{0,40}"
}

/// A balanced template: plain fragments interleaved with conditional blocks
/// and variable references.
fn arb_template() -> impl Strategy<Value = String> {
    let piece = prop_oneof![
        arb_plain(),
        arb_plain().prop_map(|inner| format!("{{%yes%}}{inner}{{%endyes%}}")),
        arb_plain().prop_map(|inner| format!("{{%no%}}{inner}{{%endno%}}")),
        Just("{{FirstName}}".to_string()),
        Just("{{Amount}}".to_string()),
        Just("{{NotSeeded}}".to_string()),
    ];
    prop::collection::vec(piece, 0..6).prop_map(|pieces| pieces.concat())
}

proptest! {
    #[test]
    fn render_is_idempotent(template in arb_template()) {
        let ctx = test_context();
        let conds = test_conditionals();
        let once = render(&template, &ctx, &conds);
        let twice = render(&once, &ctx, &conds);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn output_has_no_markers(template in arb_template()) {
        let ctx = test_context();
        let out = render(&template, &ctx, &test_conditionals());
        prop_assert!(!out.contains("{%"), "output still contains opening marker");
        prop_assert!(!out.contains("%}"), "output still contains closing marker");
    }

    #[test]
    fn normalization_bounds_blank_runs(text in "[a-z \n\t]{0,120}") {
        let out = normalize_whitespace(&text);
        prop_assert!(!out.contains("\n\n\n"));
        prop_assert!(!out.starts_with('\n'));
        prop_assert!(!out.ends_with('\n'));
    }

    #[test]
    fn normalization_is_idempotent(text in "[a-z \n\t]{0,120}") {
        let once = normalize_whitespace(&text);
        prop_assert_eq!(normalize_whitespace(&once), once);
    }

    #[test]
    fn false_blocks_never_leak_content(inner in "[xyz]{1,20}") {
        let ctx = test_context();
        let template = format!("start {{%no%}}{inner}{{%endno%}} end");
        let out = render(&template, &ctx, &test_conditionals());
        prop_assert!(!out.contains(&inner));
    }
}
