//! The production rule table
//!
//! Business configuration: global triggers plus one ordered rule list per
//! dialogue node. Node ids follow the catalog document. The engine never
//! inspects individual nodes; everything node-specific lives here.

use super::rules::{Condition, ExtractedVars, Rule};
use crate::catalog::NodeId;
use crate::context::CallContext;
use std::collections::HashMap;

/// Verification attempts allowed before the call escalates to a human.
pub const VERIFY_ATTEMPT_CEILING: u32 = 5;

pub struct RuleTable {
    global: Vec<Rule>,
    nodes: HashMap<NodeId, Vec<Rule>>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self {
            global: Vec::new(),
            nodes: HashMap::new(),
        }
    }

    pub fn add_global(&mut self, rule: Rule) {
        self.global.push(rule);
    }

    pub fn add_node(&mut self, node: &str, rules: Vec<Rule>) {
        self.nodes.insert(NodeId::from(node), rules);
    }

    pub fn global(&self) -> &[Rule] {
        &self.global
    }

    pub fn for_node(&self, node: &NodeId) -> &[Rule] {
        self.nodes.get(node).map_or(&[], Vec::as_slice)
    }

    /// Every target a node can reach, global triggers included. Used by
    /// catalog validation and tests.
    pub fn targets_from(&self, node: &NodeId) -> Vec<NodeId> {
        let mut targets: Vec<NodeId> = Vec::new();
        for rule in self.global.iter().chain(self.for_node(node)) {
            if !targets.contains(&rule.target) {
                targets.push(rule.target.clone());
            }
        }
        targets
    }

    /// The full production table for the outbound collections flow.
    #[allow(clippy::too_many_lines)] // this is the whole business table
    pub fn standard() -> Self {
        use Condition::{
            AllFlags, AllPresent, Always, AnyFlag, ApiFailed, ApiSucceeded, ContextEquals,
            ContextFlag, CounterAtLeast, Custom, Flag, Present,
        };

        let mut t = Self::new();

        // ---- Global triggers: checked for every node, every turn ----

        // Transfer requests
        t.add_global(Rule::new(
            AnyFlag(&[
                "user_requests_live_agent",
                "user_requests_supervisor",
                "user_requests_transfer",
            ]),
            "n34",
            "user requests transfer",
        ));
        // Legal / compliance
        t.add_global(Rule::new(
            AnyFlag(&["user_mentions_attorney", "user_represented_by_attorney"]),
            "n5",
            "attorney notification",
        ));
        t.add_global(Rule::new(
            AnyFlag(&[
                "user_requests_cease_communication",
                "user_requests_written_only",
            ]),
            "n11",
            "cease and desist",
        ));
        // Wrong number
        t.add_global(Rule::new(
            AnyFlag(&["user_says_wrong_number", "wrong_person"]),
            "n69",
            "wrong number",
        ));
        // Questions needing a human
        t.add_global(Rule::new(
            AnyFlag(&[
                "user_has_complex_question",
                "user_asks_about_nsf",
                "user_asks_about_escrow",
            ]),
            "n34",
            "complex question, transfer",
        ));

        // ---- Greeting & identity (n61) ----
        t.add_node(
            "n61",
            vec![
                Rule::new(
                    AnyFlag(&["is_borrower", "confirmed_identity", "speaking_to_borrower"]),
                    "n68",
                    "identity confirmed",
                ),
                Rule::new(Present("party_name"), "n68", "got party name"),
                Rule::new(
                    AnyFlag(&["user_not_available", "call_back_later"]),
                    "n8",
                    "borrower unavailable, offer callback",
                ),
            ],
        );

        // ---- Verification, first attempt (n68) ----
        // Ceiling first: reaching it escalates no matter what else matched.
        t.add_node(
            "n68",
            vec![
                Rule::new(
                    CounterAtLeast("dob_attempts", VERIFY_ATTEMPT_CEILING),
                    "n34",
                    "too many verification attempts",
                ),
                Rule::new(
                    AnyFlag(&["dob_verified", "dob_correct"]),
                    "n41",
                    "verified, go to disclosure",
                ),
                Rule::new(
                    AnyFlag(&["dob_mismatch", "dob_incorrect"]),
                    "n32",
                    "mismatch, notify",
                ),
            ],
        );

        // ---- Mismatch notification (n32) ----
        t.add_node(
            "n32",
            vec![Rule::new(Always, "n22", "always retry verification")],
        );

        // ---- Verification, second attempt (n22) ----
        t.add_node(
            "n22",
            vec![
                Rule::new(
                    CounterAtLeast("dob_attempts", VERIFY_ATTEMPT_CEILING),
                    "n34",
                    "too many verification attempts",
                ),
                Rule::new(
                    AnyFlag(&["dob_verified", "dob_reconfirmed", "dob_correct"]),
                    "n41",
                    "verified on retry",
                ),
                Rule::new(
                    AnyFlag(&["dob_still_wrong", "dob_mismatch"]),
                    "n26",
                    "still wrong, end call",
                ),
            ],
        );

        // ---- Verification failed (n26) ----
        t.add_node("n26", vec![Rule::new(Always, "END", "verification failed")]);

        // ---- Compliance disclosure (n41) ----
        t.add_node(
            "n41",
            vec![Rule::new(
                AnyFlag(&[
                    "mini_miranda_complete",
                    "user_acknowledges",
                    "proceed_to_business",
                ]),
                "n45",
                "disclosure acknowledged",
            )],
        );

        // ---- Occupancy verification (n45) ----
        t.add_node(
            "n45",
            vec![
                Rule::new(Present("occupancy"), "n20", "occupancy provided"),
                Rule::new(
                    AnyFlag(&["occupancy_verified", "occupancy_confirmed", "occupancy_status"]),
                    "n20",
                    "occupancy flagged",
                ),
            ],
        );

        // ---- Disaster impact check (n20) ----
        t.add_node(
            "n20",
            vec![
                Rule::new(
                    AnyFlag(&["affected_by_disaster", "disaster_impact"]),
                    "n37",
                    "disaster affected, loss mitigation",
                ),
                Rule::new(
                    Custom(|v: &ExtractedVars, _: &CallContext| {
                        v.get("affected_by_disaster") == Some(&serde_json::Value::Bool(false))
                    }),
                    "n28",
                    "explicitly not affected",
                ),
                Rule::new(
                    AnyFlag(&["not_affected_by_disaster", "no_disaster_impact"]),
                    "n28",
                    "not affected",
                ),
            ],
        );

        // ---- Continue to payment (n28) ----
        t.add_node("n28", vec![Rule::new(Always, "n49", "continue to payment")]);

        // ---- Loss mitigation (n37) ----
        t.add_node(
            "n37",
            vec![
                Rule::new(
                    AnyFlag(&["wants_appointment", "schedule_appointment"]),
                    "n56",
                    "wants appointment",
                ),
                Rule::new(Flag("wants_callback"), "n8", "wants callback"),
                Rule::new(Flag("user_wants_to_end_call"), "n25", "user ends call"),
            ],
        );

        // ---- Payment collection hub (n49) ----
        t.add_node(
            "n49",
            vec![
                Rule::new(
                    AnyFlag(&["user_claims_payment_made", "payment_already_sent"]),
                    "n51",
                    "claims already paid",
                ),
                Rule::new(
                    AnyFlag(&[
                        "user_wants_set_up_later",
                        "declined_bank_account_setup_today",
                        "will_pay_independently",
                    ]),
                    "n51",
                    "promise to pay",
                ),
                Rule::new(
                    AllFlags(&["payment_date_received", "payment_amount_received"]),
                    "n67",
                    "got date and amount",
                ),
                Rule::new(
                    AllPresent(&["user_provided_payment_amount", "upd_extracted_payment_date"]),
                    "n67",
                    "have amount and date",
                ),
                Rule::new(
                    AllFlags(&[
                        "payment_amount_received",
                        "collection_waterfall_completed",
                        "total_amount_due_informed",
                    ]),
                    "n67",
                    "amount confirmed, validate",
                ),
                Rule::new(
                    AllFlags(&["borrower_wants_options", "options_question_asked"]),
                    "n23",
                    "wants payment options",
                ),
                Rule::new(
                    Flag("borrower_requests_options_directly"),
                    "n23",
                    "asks for assistance programs",
                ),
                Rule::new(
                    AllFlags(&["needs_assistance", "options_question_asked"]),
                    "n23",
                    "needs assistance",
                ),
                Rule::new(
                    AllFlags(&["financial_hardship", "options_question_asked"]),
                    "n23",
                    "hardship, show options",
                ),
                Rule::new(
                    Flag("capture_delinquency_reason"),
                    "n19",
                    "capture delinquency reason",
                ),
            ],
        );

        // ---- Delinquency reason (n19) ----
        t.add_node(
            "n19",
            vec![Rule::new(
                AnyFlag(&["reason_captured", "delinquency_reason"]),
                "n49",
                "reason captured",
            )],
        );

        // ---- Payment validation (n67) ----
        t.add_node(
            "n67",
            vec![
                Rule::new(
                    Flag("borrower_requests_options_directly"),
                    "n23",
                    "asks about options",
                ),
                Rule::new(
                    AllPresent(&["user_provided_payment_amount", "user_provided_payment_date"]),
                    "n1",
                    "payment details confirmed",
                ),
                Rule::new(
                    AnyFlag(&["validation_confirmed", "user_confirms_amount", "details_confirmed"]),
                    "n1",
                    "confirmed, collect account",
                ),
                Rule::new(
                    AnyFlag(&["user_wants_to_change_amount", "user_wants_to_change_date"]),
                    "n49",
                    "change requested",
                ),
            ],
        );

        // ---- Account collection (n1) ----
        t.add_node(
            "n1",
            vec![
                Rule::new(
                    AnyFlag(&[
                        "declined_bank_account_setup_today",
                        "user_wants_set_up_later",
                        "will_pay_online",
                        "will_mail_check",
                    ]),
                    "n51",
                    "declined, promise to pay",
                ),
                Rule::new(
                    AnyFlag(&[
                        "existing_bank_account_confirmed",
                        "new_bank_account_confirmed",
                        "account_ready",
                    ]),
                    "n42",
                    "account confirmed, authorization",
                ),
                Rule::new(
                    Flag("certified_funds_mail_date_confirmed"),
                    "n12",
                    "certified funds confirmed",
                ),
                Rule::new(
                    Condition::All(vec![
                        ContextEquals("RestrictAutoPayDraft", "Y"),
                        Flag("mail_date_confirmed"),
                    ]),
                    "n12",
                    "certified funds date confirmed",
                ),
            ],
        );

        // ---- Draft authorization disclosure (n42) ----
        t.add_node(
            "n42",
            vec![
                Rule::new(
                    AnyFlag(&["user_says_no", "user_declines_authorization"]),
                    "n49",
                    "declined authorization",
                ),
                Rule::new(
                    AnyFlag(&["user_wants_to_change_amtdate", "user_wants_different_amount"]),
                    "n49",
                    "change requested",
                ),
                Rule::new(
                    AnyFlag(&[
                        "nacha_permission_granted",
                        "user_authorizes_payment",
                        "user_confirms_authorization",
                    ]),
                    "n50",
                    "authorization granted",
                ),
            ],
        );

        // ---- Payment processing (n50) ----
        t.add_node(
            "n50",
            vec![
                Rule::new(Flag("payment_processed"), "n51", "payment processed"),
                Rule::new(ApiSucceeded, "n51", "processor accepted"),
                Rule::new(ContextFlag("confirmation_number"), "n51", "got confirmation"),
                Rule::new(ApiFailed, "n34", "processor failed, transfer"),
                Rule::new(Flag("payment_failed"), "n34", "payment failed, transfer"),
            ],
        );

        // ---- Confirmation / promise to pay (n51) ----
        t.add_node(
            "n51",
            vec![Rule::new(
                AnyFlag(&[
                    "call_complete",
                    "no_more_questions",
                    "user_satisfied",
                    "goodbye_said",
                ]),
                "n25",
                "wrap up",
            )],
        );

        // ---- Payment options (n23) ----
        t.add_node(
            "n23",
            vec![
                Rule::new(
                    AnyFlag(&["user_has_no_other_questions", "option_selected", "ready_to_pay"]),
                    "n49",
                    "back to payment",
                ),
                Rule::new(
                    AnyFlag(&["wants_appointment", "schedule_appointment"]),
                    "n56",
                    "schedule appointment",
                ),
                Rule::new(
                    AnyFlag(&["wants_callback", "needs_more_time"]),
                    "n8",
                    "offer callback",
                ),
            ],
        );

        // ---- Certified funds confirmation (n12) ----
        t.add_node(
            "n12",
            vec![Rule::new(
                AnyFlag(&["user_has_no_other_questions", "call_complete"]),
                "n25",
                "wrap up",
            )],
        );

        // ---- Transfer intake (n34) ----
        t.add_node(
            "n34",
            vec![
                Rule::new(Flag("transfer_intake_complete"), "n35", "intake complete"),
                Rule::new(
                    AllFlags(&["transfer_reason", "ready_to_transfer"]),
                    "n35",
                    "ready to transfer",
                ),
            ],
        );

        // ---- Transfer confirmation (n35) ----
        t.add_node(
            "n35",
            vec![
                Rule::new(
                    AnyFlag(&["user_confirms_transfer", "proceed_with_transfer"]),
                    "n36",
                    "transfer confirmed",
                ),
                Rule::new(Flag("user_cancels_transfer"), "n49", "transfer cancelled"),
            ],
        );

        // ---- Execute transfer (n36) ----
        t.add_node(
            "n36",
            vec![
                Rule::new(Flag("transfer_completed"), "n2", "transfer done"),
                Rule::new(ContextFlag("transfer_completed"), "n2", "transfer executed"),
            ],
        );

        // ---- Attorney notification (n5) ----
        t.add_node(
            "n5",
            vec![
                Rule::new(Flag("attorney_noted"), "n25", "attorney noted"),
                Rule::new(Always, "n25", "end after notification"),
            ],
        );

        // ---- Cease & desist (n11) ----
        t.add_node("n11", vec![Rule::new(Always, "n25", "cease communication")]);

        // ---- Callback offering (n8) ----
        t.add_node(
            "n8",
            vec![
                Rule::new(
                    AnyFlag(&["callback_time_confirmed", "callback_scheduled"]),
                    "n9",
                    "callback scheduled",
                ),
                Rule::new(
                    AnyFlag(&["user_declines_callback", "no_callback_needed"]),
                    "n25",
                    "no callback",
                ),
            ],
        );

        // ---- Callback confirmed (n9) ----
        t.add_node("n9", vec![Rule::new(Always, "n25", "callback confirmed")]);

        // ---- Appointment scheduling (n56) ----
        t.add_node(
            "n56",
            vec![Rule::new(
                AnyFlag(&["user_time_preference", "preferred_day", "preferred_time"]),
                "n6",
                "got preference, fetch slots",
            )],
        );

        // ---- Fetch available slots (n6) ----
        t.add_node(
            "n6",
            vec![
                Rule::new(ApiSucceeded, "n4", "slots received"),
                Rule::new(Flag("slots_available"), "n4", "slots available"),
                Rule::new(ApiFailed, "n34", "slot lookup failed"),
            ],
        );

        // ---- Offer time slots (n4) ----
        t.add_node(
            "n4",
            vec![
                Rule::new(
                    AnyFlag(&["specific_time_selected", "user_selected_slot"]),
                    "n3",
                    "slot selected",
                ),
                Rule::new(
                    AnyFlag(&["user_appt_conflict", "none_work"]),
                    "n56",
                    "none work, new preference",
                ),
            ],
        );

        // ---- Confirm appointment (n3) ----
        t.add_node(
            "n3",
            vec![
                Rule::new(
                    AnyFlag(&["appointment_confirmed", "appt_booked"]),
                    "n62",
                    "appointment booked",
                ),
                Rule::new(Flag("user_cancels"), "n56", "cancelled, reschedule"),
            ],
        );

        // ---- Appointment success (n62) ----
        t.add_node("n62", vec![Rule::new(Always, "n25", "appointment done")]);

        // ---- Wrong number (n69) ----
        t.add_node("n69", vec![Rule::new(Always, "END", "wrong number")]);

        // ---- Call endings ----
        t.add_node("n25", vec![Rule::new(Always, "END", "standard ending")]);
        t.add_node("n24", vec![Rule::new(Always, "END", "alternative ending")]);
        t.add_node("n2", vec![Rule::new(Always, "END", "transfer-complete ending")]);

        t
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Language;
    use crate::flow::next_node;
    use serde_json::{json, Map, Value};

    fn ctx_at(node: &str) -> CallContext {
        CallContext::new("CA1", Map::new(), NodeId::from(node), Language::En)
    }

    fn vars(entries: &[(&str, Value)]) -> ExtractedVars {
        let mut v = ExtractedVars::new();
        for (k, val) in entries {
            v.insert(*k, val.clone());
        }
        v
    }

    #[test]
    fn transfer_request_fires_from_any_node() {
        let t = RuleTable::standard();
        let v = vars(&[("user_requests_live_agent", json!(true))]);
        for node in ["n61", "n49", "n42", "n4"] {
            let next = next_node(&t, &NodeId::from(node), &v, &ctx_at(node));
            assert_eq!(next, NodeId::from("n34"), "from {node}");
        }
    }

    #[test]
    fn verification_mismatch_with_low_counter() {
        let t = RuleTable::standard();
        let mut c = ctx_at("n68");
        c.increment("dob_attempts");
        let v = vars(&[("dob_mismatch", json!(true))]);
        let next = next_node(&t, &NodeId::from("n68"), &v, &c);
        assert_eq!(next, NodeId::from("n32"));
    }

    #[test]
    fn verification_ceiling_beats_verified_flag() {
        let t = RuleTable::standard();
        let mut c = ctx_at("n68");
        for _ in 0..VERIFY_ATTEMPT_CEILING {
            c.increment("dob_attempts");
        }
        let v = vars(&[("dob_verified", json!(true))]);
        let next = next_node(&t, &NodeId::from("n68"), &v, &c);
        assert_eq!(next, NodeId::from("n34"));
    }

    #[test]
    fn payment_hub_needs_both_amount_and_date() {
        let t = RuleTable::standard();
        let v = vars(&[
            ("user_provided_payment_amount", json!("250")),
            ("upd_extracted_payment_date", json!("NA")),
        ]);
        let next = next_node(&t, &NodeId::from("n49"), &v, &ctx_at("n49"));
        assert_eq!(next, NodeId::from("n49"), "sentinel date must not count");

        let v = vars(&[
            ("user_provided_payment_amount", json!("250")),
            ("upd_extracted_payment_date", json!("2026-08-10")),
        ]);
        let next = next_node(&t, &NodeId::from("n49"), &v, &ctx_at("n49"));
        assert_eq!(next, NodeId::from("n67"));
    }

    #[test]
    fn options_need_the_question_asked_first() {
        let t = RuleTable::standard();
        let v = vars(&[("borrower_wants_options", json!(true))]);
        let next = next_node(&t, &NodeId::from("n49"), &v, &ctx_at("n49"));
        assert_eq!(next, NodeId::from("n49"), "no false trigger without the question");

        let v = vars(&[
            ("borrower_wants_options", json!(true)),
            ("options_question_asked", json!(true)),
        ]);
        let next = next_node(&t, &NodeId::from("n49"), &v, &ctx_at("n49"));
        assert_eq!(next, NodeId::from("n23"));
    }

    #[test]
    fn processing_routes_on_api_outcome() {
        let t = RuleTable::standard();
        let mut c = ctx_at("n50");
        c.api_status = Some(200);
        let next = next_node(&t, &NodeId::from("n50"), &ExtractedVars::new(), &c);
        assert_eq!(next, NodeId::from("n51"));

        let mut c = ctx_at("n50");
        c.api_status = Some(500);
        c.api_error = Some("processor unavailable".into());
        let next = next_node(&t, &NodeId::from("n50"), &ExtractedVars::new(), &c);
        assert_eq!(next, NodeId::from("n34"));
    }

    #[test]
    fn endings_reach_the_terminal_node() {
        let t = RuleTable::standard();
        for node in ["n25", "n24", "n2", "n69", "n26"] {
            let next = next_node(&t, &NodeId::from(node), &ExtractedVars::new(), &ctx_at(node));
            assert!(next.is_end(), "{node} should end the call");
        }
    }

    #[test]
    fn every_target_is_a_known_node_or_terminal() {
        let t = RuleTable::standard();
        let nodes: Vec<NodeId> = t.nodes.keys().cloned().collect();
        for node in &nodes {
            for target in t.targets_from(node) {
                assert!(
                    target.is_end() || t.nodes.contains_key(&target),
                    "{node} routes to undeclared node {target}"
                );
            }
        }
    }

    #[test]
    fn explicit_not_affected_continues_to_payment() {
        let t = RuleTable::standard();
        let v = vars(&[("affected_by_disaster", json!(false))]);
        let next = next_node(&t, &NodeId::from("n20"), &v, &ctx_at("n20"));
        assert_eq!(next, NodeId::from("n28"));
    }
}
