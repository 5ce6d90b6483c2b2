//! Prompt template renderer
//!
//! Pure three-stage pipeline: conditional blocks, then variable
//! substitution, then whitespace normalization. Rendering is deterministic
//! for a given context, and idempotent: the output carries no markers, so
//! rendering it again returns it unchanged.
//!
//! Syntax (as authored in the node catalog):
//! - `{% name %} ... {% endname %}` conditional block, resolved by the
//!   predicate registered under `name`
//! - `{{ variable }}` substitution from the call context

pub mod conditionals;

#[cfg(test)]
mod proptests;

pub use conditionals::Conditionals;

use crate::context::CallContext;
use regex::Regex;
use std::sync::OnceLock;

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{%\s*(\w+)\s*%\}").expect("valid marker regex"))
}

fn variable_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("valid variable regex"))
}

/// Render a template against a call context.
pub fn render(template: &str, context: &CallContext, conditionals: &Conditionals) -> String {
    if template.is_empty() {
        return String::new();
    }
    let resolved = resolve_conditionals(template, context, conditionals);
    let substituted = substitute_variables(&resolved, context);
    normalize_whitespace(&substituted)
}

/// Resolve every `{% name %} ... {% endname %}` block.
///
/// Each distinct marker name is evaluated once per pass; every occurrence of
/// the name resolves the same way. An unregistered name is fail-open: the
/// block content is kept, the markers are stripped, and a warning is logged.
pub fn resolve_conditionals(
    template: &str,
    context: &CallContext,
    conditionals: &Conditionals,
) -> String {
    let mut names: Vec<String> = Vec::new();
    for cap in marker_re().captures_iter(template) {
        let name = &cap[1];
        if name.starts_with("end") {
            continue;
        }
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }

    let mut result = template.to_string();
    for name in &names {
        let keep = match conditionals.evaluate(name, context) {
            Some(keep) => keep,
            None => {
                tracing::warn!(marker = %name, "unknown conditional marker, keeping content");
                true
            }
        };
        result = resolve_block(&result, name, keep);
    }

    // Anything still marker-shaped at this point is an unbalanced pair;
    // strip it so the output never carries markers.
    if marker_re().is_match(&result) {
        tracing::warn!("stripping unbalanced conditional markers");
        result = marker_re().replace_all(&result, "").into_owned();
    }
    result
}

fn resolve_block(template: &str, name: &str, keep: bool) -> String {
    let escaped = regex::escape(name);
    let pattern = format!(r"(?s)\{{%\s*{escaped}\s*%\}}(.*?)\{{%\s*end{escaped}\s*%\}}");
    let re = Regex::new(&pattern).expect("valid block regex");
    if keep {
        re.replace_all(template, "$1").into_owned()
    } else {
        re.replace_all(template, "").into_owned()
    }
}

/// Replace `{{ variable }}` placeholders with the string form of the
/// matching context field. Absent or null fields become the empty string.
pub fn substitute_variables(template: &str, context: &CallContext) -> String {
    variable_re()
        .replace_all(template, |cap: &regex::Captures<'_>| {
            let name = &cap[1];
            match context.lookup_str(name) {
                Some(value) => value,
                None => {
                    tracing::debug!(variable = %name, "variable not in context");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Collapse runs of three or more newlines to one blank line, strip trailing
/// whitespace from otherwise-blank lines, and trim leading/trailing blank
/// lines. Content-bearing lines are left intact.
pub fn normalize_whitespace(text: &str) -> String {
    static BLANK_RUN: OnceLock<Regex> = OnceLock::new();
    let blank_run = BLANK_RUN.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let collapsed = blank_run.replace_all(text, "\n\n");
    let mut lines: Vec<&str> = collapsed
        .split('\n')
        .map(|line| if line.trim().is_empty() { "" } else { line })
        .collect();

    while lines.first().is_some_and(|l| l.is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Variable names referenced by a template, in order of first appearance.
pub fn referenced_variables(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    for cap in variable_re().captures_iter(template) {
        let name = cap[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::NodeId;
    use crate::context::Language;
    use serde_json::{json, Map, Value};

    fn ctx_with(entries: &[(&str, Value)]) -> CallContext {
        let mut seed = Map::new();
        for (k, v) in entries {
            seed.insert((*k).to_string(), v.clone());
        }
        CallContext::new("CA1", seed, NodeId::from("n61"), Language::En)
    }

    #[test]
    fn substitutes_known_variables() {
        let ctx = ctx_with(&[("FirstName", json!("John")), ("DaysLate", json!(45))]);
        let out = substitute_variables("Hi {{FirstName}}, you are {{DaysLate}} days late.", &ctx);
        assert_eq!(out, "Hi John, you are 45 days late.");
    }

    #[test]
    fn absent_variables_become_empty() {
        let ctx = ctx_with(&[]);
        assert_eq!(
            substitute_variables("Hello {{ Missing }}!", &ctx),
            "Hello !"
        );
    }

    #[test]
    fn false_predicate_removes_block() {
        let mut conds = Conditionals::new();
        conds.register("x", |_| false);
        let ctx = ctx_with(&[]);
        assert_eq!(render("{%x%}A{%endx%}B", &ctx, &conds), "B");
    }

    #[test]
    fn true_predicate_keeps_content() {
        let mut conds = Conditionals::new();
        conds.register("x", |_| true);
        let ctx = ctx_with(&[]);
        assert_eq!(render("{%x%}A{%endx%}B", &ctx, &conds), "AB");
    }

    #[test]
    fn unknown_marker_is_fail_open() {
        let ctx = ctx_with(&[]);
        let out = render("{% mystery %}keep me{% endmystery %}", &ctx, &Conditionals::new());
        assert_eq!(out, "keep me");
    }

    #[test]
    fn every_occurrence_resolves_the_same_way() {
        let mut conds = Conditionals::new();
        conds.register("es", |_| false);
        let ctx = ctx_with(&[]);
        let out = render(
            "{%es%}hola{%endes%}hello{%es%}adios{%endes%}goodbye",
            &ctx,
            &conds,
        );
        assert_eq!(out, "hellogoodbye");
    }

    #[test]
    fn blocks_span_lines() {
        let mut conds = Conditionals::new();
        conds.register("x", |_| false);
        let ctx = ctx_with(&[]);
        let out = render("before\n{% x %}\nline one\nline two\n{% endx %}\nafter", &ctx, &conds);
        assert_eq!(out, "before\n\nafter");
    }

    #[test]
    fn whitespace_normalization() {
        assert_eq!(normalize_whitespace("a\n\n\n\n\nb"), "a\n\nb");
        assert_eq!(normalize_whitespace("\n\na\n\n"), "a");
        assert_eq!(normalize_whitespace("a  \t\nb"), "a  \t\nb");
        assert_eq!(normalize_whitespace("a\n   \t\nb"), "a\n\nb");
    }

    #[test]
    fn render_is_idempotent_on_examples() {
        let mut conds = Conditionals::new();
        conds.register("en", |c| c.language == Language::En);
        conds.register("es", |c| c.language == Language::Es);
        let ctx = ctx_with(&[("FirstName", json!("John"))]);

        for template in [
            "{%en%}Hello {{FirstName}}{%enden%}{%es%}Hola {{FirstName}}{%endes%}",
            "plain text\n\n\n\nwith gaps",
            "{{Missing}} and {% unknown %}body{% endunknown %}",
        ] {
            let once = render(template, &ctx, &conds);
            let twice = render(&once, &ctx, &conds);
            assert_eq!(once, twice, "template: {template}");
        }
    }

    #[test]
    fn referenced_variables_are_deduped_in_order() {
        let vars = referenced_variables("{{a}} {{b}} {{a}} {{c}}");
        assert_eq!(vars, vec!["a", "b", "c"]);
    }
}
