//! Customer, team, and agent lookup
//!
//! Resolves the callee's phone number to a loan record, the calling team,
//! and the agent personas the team speaks with. HTTP-backed when an
//! endpoint is configured; otherwise the built-in roster serves development
//! and test traffic.

use crate::context::Language;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Network(String),
    #[error("directory returned status {0}")]
    Status(u16),
    #[error("directory response malformed: {0}")]
    Decode(String),
}

/// Loan/customer record as served by the servicing API. Field names match
/// the upstream payload and double as template variables, so the seed map
/// keeps them verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CustomerRecord {
    pub first_name: String,
    pub last_name: String,
    #[serde(rename = "LoanID")]
    pub loan_id: String,
    #[serde(rename = "DOB")]
    pub dob: String,
    pub account_number_last_four: String,
    pub total_amount_due: Value,
    pub monthly_payment: Value,
    pub property_address: String,
    pub restrict_auto_pay_draft: String,
    pub days_late: Value,
    pub fees_balance: Value,
    pub next_payment_due_date: String,
    pub escrow_balance: Value,
    pub principal_balance: Value,
    #[serde(rename = "LenderID")]
    pub lender_id: String,
}

impl CustomerRecord {
    /// Context seed entries, keyed the way templates reference them.
    pub fn to_seed(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientRecord {
    #[serde(rename = "CompanyName", default)]
    pub company_name: String,
    #[serde(rename = "LenderID", default)]
    pub lender_id: String,
}

#[derive(Debug, Clone)]
pub struct Team {
    pub team_id: String,
    pub client_name: String,
}

/// A voice persona the agent can speak as: display name plus per-language
/// synthesis voice models.
#[derive(Debug, Clone)]
pub struct AgentPersona {
    pub name: String,
    pub voices: HashMap<Language, String>,
}

impl AgentPersona {
    pub fn voice(&self, language: Language) -> &str {
        self.voices
            .get(&language)
            .map_or("aura-asteria-en", String::as_str)
    }
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn customer_by_phone(&self, phone: &str)
        -> Result<Option<CustomerRecord>, DirectoryError>;
    async fn client_by_lender(&self, lender_id: &str)
        -> Result<Option<ClientRecord>, DirectoryError>;
    async fn team_for(&self, agent_phone: &str) -> Result<Option<Team>, DirectoryError>;
    async fn agents_for(&self, team_id: &str) -> Result<Vec<AgentPersona>, DirectoryError>;
}

fn builtin_roster() -> Vec<AgentPersona> {
    vec![AgentPersona {
        name: "Sarah Mitchell".to_string(),
        voices: HashMap::from([
            (Language::En, "aura-asteria-en".to_string()),
            (Language::Es, "aura-stella-en".to_string()),
        ]),
    }]
}

// ============================================================================
// HTTP implementation
// ============================================================================

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_user: String,
}

impl DirectoryConfig {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("DIRECTORY_URL").ok()?;
        Some(Self {
            base_url,
            api_key: std::env::var("DIRECTORY_API_KEY").unwrap_or_default(),
            api_user: std::env::var("DIRECTORY_API_USER").unwrap_or_default(),
        })
    }
}

/// Servicing-API-backed directory. Teams and personas come from the
/// built-in roster; customer and client records come from the API.
pub struct HttpDirectory {
    client: reqwest::Client,
    config: DirectoryConfig,
}

impl HttpDirectory {
    pub fn new(config: DirectoryConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self { client, config }
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, DirectoryError> {
        let url = format!("{}/{}/{}", self.config.base_url, path, self.config.api_user);
        let response = self
            .client
            .get(&url)
            .query(query)
            .header("Authorization", &self.config.api_key)
            .send()
            .await
            .map_err(|e| DirectoryError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(DirectoryError::Status(status.as_u16()));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| DirectoryError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn customer_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<CustomerRecord>, DirectoryError> {
        self.fetch("customerdaily", &[("PhoneNumber", phone)]).await
    }

    async fn client_by_lender(
        &self,
        lender_id: &str,
    ) -> Result<Option<ClientRecord>, DirectoryError> {
        self.fetch("clientlookup", &[("LenderID", lender_id)]).await
    }

    async fn team_for(&self, _agent_phone: &str) -> Result<Option<Team>, DirectoryError> {
        Ok(Some(Team {
            team_id: "team-collections".to_string(),
            client_name: "Essex Mortgage".to_string(),
        }))
    }

    async fn agents_for(&self, _team_id: &str) -> Result<Vec<AgentPersona>, DirectoryError> {
        Ok(builtin_roster())
    }
}

// ============================================================================
// Static implementation (dev/test)
// ============================================================================

/// Fully static directory used when no endpoint is configured.
pub struct StaticDirectory;

#[async_trait]
impl Directory for StaticDirectory {
    async fn customer_by_phone(
        &self,
        _phone: &str,
    ) -> Result<Option<CustomerRecord>, DirectoryError> {
        let record: CustomerRecord = serde_json::from_value(serde_json::json!({
            "FirstName": "John",
            "LastName": "Smith",
            "LoanID": "LN123456",
            "DOB": "1985-06-15",
            "AccountNumberLastFour": "7890",
            "TotalAmountDue": 2500.00,
            "MonthlyPayment": 1200.00,
            "PropertyAddress": "123 Main St, Orlando, FL 32801",
            "RestrictAutoPayDraft": "N",
            "DaysLate": 45,
            "FeesBalance": 150.00,
            "NextPaymentDueDate": "2026-09-01",
            "EscrowBalance": 3500.00,
            "PrincipalBalance": 185000.00,
            "LenderID": "LENDER001"
        }))
        .map_err(|e| DirectoryError::Decode(e.to_string()))?;
        Ok(Some(record))
    }

    async fn client_by_lender(
        &self,
        lender_id: &str,
    ) -> Result<Option<ClientRecord>, DirectoryError> {
        Ok(Some(ClientRecord {
            company_name: "Essex Mortgage".to_string(),
            lender_id: lender_id.to_string(),
        }))
    }

    async fn team_for(&self, _agent_phone: &str) -> Result<Option<Team>, DirectoryError> {
        Ok(Some(Team {
            team_id: "team-collections".to_string(),
            client_name: "Essex Mortgage".to_string(),
        }))
    }

    async fn agents_for(&self, _team_id: &str) -> Result<Vec<AgentPersona>, DirectoryError> {
        Ok(builtin_roster())
    }
}
