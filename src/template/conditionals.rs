//! Conditional marker predicates
//!
//! Each marker name used in a template resolves through a registered
//! predicate over the call context. The standard table mirrors the markers
//! the business prompt catalog uses; tests register their own.

use crate::context::{CallContext, Language};
use std::collections::HashMap;

pub type Predicate = fn(&CallContext) -> bool;

#[derive(Default)]
pub struct Conditionals {
    predicates: HashMap<&'static str, Predicate>,
}

impl Conditionals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, predicate: Predicate) {
        self.predicates.insert(name, predicate);
    }

    /// `None` means the marker name is unregistered (fail-open upstream).
    pub fn evaluate(&self, name: &str, context: &CallContext) -> Option<bool> {
        self.predicates.get(name).map(|p| p(context))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    /// The predicate table the production prompt catalog is written against.
    pub fn standard() -> Self {
        let mut c = Self::new();

        // Language blocks
        c.register("en", |ctx| ctx.language == Language::En);
        c.register("es", |ctx| ctx.language == Language::Es);
        c.register("english_examples", |ctx| ctx.language == Language::En);
        c.register("spanish_examples", |ctx| ctx.language == Language::Es);

        // Bank account on file
        c.register("loan_acct_available", |ctx| ctx.flag("AccountNumberLastFour"));
        c.register("loan_acct_unavailable", |ctx| !ctx.flag("AccountNumberLastFour"));
        c.register("has_existing_account", |ctx| ctx.flag("AccountNumberLastFour"));
        c.register("no_existing_account", |ctx| !ctx.flag("AccountNumberLastFour"));
        c.register("using_new_account", |ctx| ctx.flag("new_bank_account_confirmed"));
        c.register("using_existing_account", |ctx| {
            ctx.flag("existing_bank_account_confirmed")
        });

        // Payment dated today vs future
        c.register("upd_current_dated_payment", payment_is_today);
        c.register("upd_future_dated_payment", |ctx| !payment_is_today(ctx));

        // Certified-funds restriction
        c.register("RestrictAutoPayDraft", |ctx| {
            ctx.lookup_str("RestrictAutoPayDraft").as_deref() == Some("Y")
        });
        c.register("NoRestrictAutoPayDraft", |ctx| {
            ctx.lookup_str("RestrictAutoPayDraft").as_deref() != Some("Y")
        });

        // Days-late thresholds
        c.register("days_late_leq_15", |ctx| days_late(ctx) <= 15);
        c.register("days_late_gt_15", |ctx| days_late(ctx) > 15);
        c.register("days_late_gt_30", |ctx| days_late(ctx) > 30);
        c.register("days_late_gt_45", |ctx| days_late(ctx) > 45);
        c.register("days_late_leq_45", |ctx| days_late(ctx) <= 45);

        // Fees
        c.register("has_fees", |ctx| fees_balance(ctx) > 0.0);
        c.register("no_fees", |ctx| fees_balance(ctx) <= 0.0);

        // Verification attempt ordinal
        c.register("dob_attempt_1", |ctx| ctx.counter("dob_attempts") == 1);
        c.register("dob_attempt_2", |ctx| ctx.counter("dob_attempts") >= 2);

        // Name matching (co-borrower scenarios)
        c.register("name_match", |ctx| ctx.flag("name_match"));
        c.register("name_no_match", |ctx| !ctx.flag("name_match"));

        // Payment method
        c.register("payment_method_checking", |ctx| {
            ctx.lookup_str("new_account_payment_method").as_deref() == Some("checking")
        });
        c.register("payment_method_savings", |ctx| {
            ctx.lookup_str("new_account_payment_method").as_deref() == Some("savings")
        });

        // Disaster impact
        c.register("disaster_affected", |ctx| ctx.flag("affected_by_disaster"));
        c.register("not_disaster_affected", |ctx| !ctx.flag("affected_by_disaster"));

        // Appointment handling
        c.register("user_appt_conflict", |ctx| ctx.flag("appt_conflict"));
        c.register("no_appt_conflict", |ctx| !ctx.flag("appt_conflict"));

        // Transfer
        c.register("transfer_reason_provided", |ctx| ctx.flag("transfer_reason"));

        // Courtesy flags set by the record lookup
        c.register("is_birthday", |ctx| ctx.flag("is_birthday"));
        c.register("not_birthday", |ctx| !ctx.flag("is_birthday"));
        c.register("is_anniversary", |ctx| ctx.flag("is_anniversary"));
        c.register("not_anniversary", |ctx| !ctx.flag("is_anniversary"));
        c.register("is_veteran", |ctx| ctx.flag("is_veteran"));

        // First prompt vs reprompt
        c.register("firstprompt", |ctx| ctx.counter("prompt_count") == 0);
        c.register("reprompt", |ctx| ctx.counter("prompt_count") > 0);

        c
    }
}

fn days_late(ctx: &CallContext) -> i64 {
    ctx.lookup_str("DaysLate")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn fees_balance(ctx: &CallContext) -> f64 {
    ctx.lookup_str("FeesBalance")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

/// Whether the promised payment date is today. Accepts either of the two
/// field spellings and the colloquial "today" categories.
fn payment_is_today(ctx: &CallContext) -> bool {
    let date = ctx
        .lookup_str("upd_extracted_payment_date")
        .or_else(|| ctx.lookup_str("user_provided_payment_date"));
    let Some(date) = date else {
        return false;
    };

    const TODAY_CATEGORIES: &[&str] = &["today", "tonight", "end of day", "by the end of the day"];
    if TODAY_CATEGORIES.contains(&date.to_lowercase().as_str()) {
        return true;
    }

    ctx.lookup_str("current_date").as_deref() == Some(date.as_str())
}
