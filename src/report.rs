//! Post-call reporting
//!
//! When a call ends, the final context snapshot is classified into an
//! outcome and assembled into a structured memo for the servicing system.
//! Posting is best-effort: a sink failure is logged and never interferes
//! with the rest of cleanup.

use crate::context::{CallContext, TranscriptRole};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report post failed: {0}")]
    Network(String),
    #[error("report sink returned status {0}")]
    Status(u16),
}

/// How the call concluded, in priority order of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Transferred,
    CallbackScheduled,
    AppointmentScheduled,
    PaymentClaimed,
    PaymentCollected,
    PaymentScheduled,
    PromiseToPay,
    DisasterImpact,
    WrongNumber,
    ContactMade,
}

impl CallOutcome {
    pub fn subject(self) -> &'static str {
        match self {
            CallOutcome::Transferred => "Transferred to Level 2 - Collections Call",
            CallOutcome::CallbackScheduled => "Callback Scheduled",
            CallOutcome::AppointmentScheduled => "Appointment Scheduled - Loss Mitigation",
            CallOutcome::PaymentClaimed => "Payment Verification - Collections Call",
            CallOutcome::PaymentCollected => "Payment Collected - Collections Call",
            CallOutcome::PaymentScheduled => "Payment Scheduled - Collections Call",
            CallOutcome::PromiseToPay => "Promise to Pay Recorded",
            CallOutcome::DisasterImpact => "Disaster Impact Recorded",
            CallOutcome::WrongNumber => "Wrong Number - Outbound Collections",
            CallOutcome::ContactMade => "Customer Contact - Outbound Collections",
        }
    }

    pub fn disposition(self) -> &'static str {
        match self {
            CallOutcome::Transferred => "Transferred to Level 2",
            CallOutcome::CallbackScheduled => "Callback Scheduled",
            CallOutcome::AppointmentScheduled => "Appointment Scheduled",
            CallOutcome::PaymentClaimed => "Payment Verified",
            CallOutcome::PaymentCollected => "Payment Processed",
            CallOutcome::PaymentScheduled => "Payment Scheduled",
            CallOutcome::PromiseToPay => "Promise to Pay",
            CallOutcome::DisasterImpact => "Disaster Impact Noted",
            CallOutcome::WrongNumber => "Wrong Number",
            CallOutcome::ContactMade => "Contact Made",
        }
    }
}

/// Classify the final context. Order matters: a transfer outranks a
/// payment, a payment outranks a promise, and so on down to plain contact.
pub fn classify(ctx: &CallContext) -> CallOutcome {
    if ctx.flag("transfer_completed") || ctx.flag("transfer_requested") {
        return CallOutcome::Transferred;
    }
    if ctx.flag("callback_scheduled") || ctx.flag("callback_time_confirmed") {
        return CallOutcome::CallbackScheduled;
    }
    if ctx.flag("appt_scheduled_success") || ctx.flag("appointment_confirmed") {
        return CallOutcome::AppointmentScheduled;
    }
    if ctx.flag("user_claims_payment_made") {
        return CallOutcome::PaymentClaimed;
    }
    if ctx.flag("payment_processed") || ctx.flag("confirmation_number") {
        let payment_date = ctx.lookup_str("upd_extracted_payment_date");
        let today = ctx.lookup_str("current_date");
        if payment_date.is_some() && payment_date == today {
            return CallOutcome::PaymentCollected;
        }
        return CallOutcome::PaymentScheduled;
    }
    if ctx.flag("declined_bank_account_setup_today") || ctx.flag("user_wants_set_up_later") {
        return CallOutcome::PromiseToPay;
    }
    if ctx.flag("affected_by_disaster") {
        return CallOutcome::DisasterImpact;
    }
    if ctx.flag("wrong_person") || ctx.flag("user_says_wrong_number") {
        return CallOutcome::WrongNumber;
    }
    CallOutcome::ContactMade
}

/// The memo posted to the servicing system after every call.
#[derive(Debug, Clone, Serialize)]
pub struct CallReport {
    #[serde(rename = "Loan_ID")]
    pub loan_id: String,
    #[serde(rename = "Subject")]
    pub subject: String,
    #[serde(rename = "Date_Time")]
    pub occurred_at: String,
    #[serde(rename = "Category")]
    pub category: String,
    #[serde(rename = "Direction")]
    pub direction: String,
    #[serde(rename = "ConversationID")]
    pub call_id: String,
    #[serde(rename = "WhoYouSpokeTo")]
    pub contact_name: String,
    #[serde(rename = "Disposition")]
    pub disposition: String,
    #[serde(rename = "Notify_on_Date", skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<String>,
    #[serde(rename = "PaymentAmount", skip_serializing_if = "Option::is_none")]
    pub payment_amount: Option<String>,
    #[serde(rename = "PaymentDate", skip_serializing_if = "Option::is_none")]
    pub payment_date: Option<String>,
    #[serde(rename = "Confirmation", skip_serializing_if = "Option::is_none")]
    pub confirmation_number: Option<String>,
    #[serde(rename = "CallbackTime", skip_serializing_if = "Option::is_none")]
    pub callback_time: Option<String>,
    #[serde(rename = "TransferReason", skip_serializing_if = "Option::is_none")]
    pub transfer_reason: Option<String>,
    #[serde(rename = "Occupancy", skip_serializing_if = "Option::is_none")]
    pub occupancy: Option<String>,
    #[serde(rename = "ReasonForDlqTimeline", skip_serializing_if = "Option::is_none")]
    pub delinquency_reason: Option<String>,
    #[serde(rename = "CallSummary")]
    pub summary: String,
}

/// Assemble the memo from the final context snapshot.
pub fn build_report(ctx: &CallContext) -> CallReport {
    let outcome = classify(ctx);
    let contact_name = format!(
        "{} {}",
        ctx.lookup_str("FirstName").unwrap_or_default(),
        ctx.lookup_str("LastName").unwrap_or_default()
    )
    .trim()
    .to_string();

    let (payment_amount, payment_date) = match outcome {
        CallOutcome::PaymentCollected | CallOutcome::PaymentScheduled | CallOutcome::PromiseToPay => (
            ctx.lookup_str("user_provided_payment_amount"),
            ctx.lookup_str("upd_extracted_payment_date"),
        ),
        CallOutcome::PaymentClaimed => (
            ctx.lookup_str("claimed_payment_amount"),
            ctx.lookup_str("claimed_payment_date"),
        ),
        _ => (None, None),
    };

    CallReport {
        loan_id: ctx.lookup_str("LoanID").unwrap_or_default(),
        subject: outcome.subject().to_string(),
        occurred_at: Utc::now().to_rfc3339(),
        category: "Collections".to_string(),
        direction: "Outbound".to_string(),
        call_id: ctx.call_id.clone(),
        contact_name,
        disposition: outcome.disposition().to_string(),
        follow_up: follow_up_date(ctx, outcome),
        payment_amount,
        payment_date,
        confirmation_number: ctx.lookup_str("confirmation_number"),
        callback_time: ctx.lookup_str("callback_time"),
        transfer_reason: ctx.lookup_str("transfer_reason"),
        occupancy: ctx
            .lookup_str("occupancy_status")
            .or_else(|| ctx.lookup_str("occupancy")),
        delinquency_reason: ctx.lookup_str("delinquency_reason"),
        summary: fallback_summary(ctx, outcome),
    }
}

/// Scheduled payments and promises get a follow-up the day after the
/// promised date; callbacks get one tomorrow.
fn follow_up_date(ctx: &CallContext, outcome: CallOutcome) -> Option<String> {
    match outcome {
        CallOutcome::PaymentScheduled | CallOutcome::PromiseToPay => {
            let date = ctx.lookup_str("upd_extracted_payment_date")?;
            let parsed = chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d").ok()?;
            Some((parsed + ChronoDuration::days(1)).format("%Y-%m-%d").to_string())
        }
        CallOutcome::CallbackScheduled => Some(
            (Utc::now() + ChronoDuration::days(1))
                .format("%Y-%m-%d")
                .to_string(),
        ),
        _ => None,
    }
}

fn fallback_summary(ctx: &CallContext, outcome: CallOutcome) -> String {
    let turns = ctx
        .transcript_tail(None)
        .iter()
        .filter(|e| e.role != TranscriptRole::Internal)
        .count();
    format!(
        "{} after {} conversational turns.",
        outcome.disposition(),
        turns
    )
}

// ============================================================================
// Sink
// ============================================================================

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn post(&self, report: &CallReport) -> Result<(), ReportError>;
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub base_url: String,
    pub user_id: String,
    pub api_key: String,
}

impl ReportConfig {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("REPORT_URL").ok()?;
        Some(Self {
            base_url,
            user_id: std::env::var("REPORT_USER_ID").unwrap_or_default(),
            api_key: std::env::var("REPORT_API_KEY").unwrap_or_default(),
        })
    }
}

pub struct HttpReportSink {
    client: reqwest::Client,
    config: ReportConfig,
}

impl HttpReportSink {
    pub fn new(config: ReportConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client");
        Self { client, config }
    }
}

#[async_trait]
impl ReportSink for HttpReportSink {
    async fn post(&self, report: &CallReport) -> Result<(), ReportError> {
        let url = format!("{}/memos/{}", self.config.base_url, self.config.user_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(report)
            .send()
            .await
            .map_err(|e| ReportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReportError::Status(status.as_u16()));
        }
        tracing::info!(call_id = %report.call_id, disposition = %report.disposition, "report posted");
        Ok(())
    }
}

/// Sink that only logs; used when no reporting endpoint is configured.
#[derive(Default)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn post(&self, report: &CallReport) -> Result<(), ReportError> {
        tracing::info!(
            call_id = %report.call_id,
            disposition = %report.disposition,
            subject = %report.subject,
            "report (log only)"
        );
        Ok(())
    }
}
