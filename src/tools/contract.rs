//! Sales contract generation tool
//!
//! Validates the collected contract terms, looks the property up in the MLS
//! listings and reports where the contract would be written. No document is
//! rendered; the result carries the merged contract data instead.

use super::mls::{MlsListings, PropertyRecord};
use super::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

pub const CONTRACT_TOOL_NAME: &str = "generate_sales_contract";

const CONTRACT_TYPE_SALES: &str = "sales";

/// Contract terms collected from the buyer.
///
/// Models frequently quote numbers and booleans in tool arguments, so
/// amounts also accept numeric strings and flags accept the usual
/// true/false spellings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRequest {
    pub property_address: String,
    #[serde(deserialize_with = "lenient_amount")]
    pub offer_price: f64,
    #[serde(deserialize_with = "lenient_amount")]
    pub down_payment: f64,
    pub financing_type: String,
    #[serde(deserialize_with = "lenient_amount")]
    pub financing_amount: f64,
    #[serde(deserialize_with = "lenient_amount")]
    pub buyer_deposit: f64,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub seller_subsidy: bool,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub financing_contingency: bool,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub appraisal_contingency: bool,
}

fn lenient_amount<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| de::Error::custom(format!("amount out of range: {n}"))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| de::Error::custom(format!("invalid amount {s:?}, expected a number"))),
        other => Err(de::Error::custom(format!(
            "invalid amount {other}, expected a number"
        ))),
    }
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "on" | "1" => Some(true),
            "false" | "f" | "no" | "n" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    };
    parsed.ok_or_else(|| de::Error::custom(format!("invalid flag {value}, expected a boolean")))
}

impl ContractRequest {
    /// Parse and validate tool input.
    ///
    /// Accepts the fields either at the top level or wrapped in a
    /// `contract_info` object, which is how models often echo the parameter
    /// name.
    pub fn from_value(input: Value) -> Result<Self, ContractError> {
        let input = match input {
            Value::Object(mut map) if map.len() == 1 && map.contains_key("contract_info") => {
                map.remove("contract_info").unwrap_or(Value::Null)
            }
            other => other,
        };
        let request: Self = serde_json::from_value(input)
            .map_err(|e| ContractError::Validation(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ContractError> {
        if self.property_address.trim().is_empty() {
            return Err(ContractError::Validation(
                "property_address must not be empty".to_string(),
            ));
        }
        let amounts = [
            ("offer_price", self.offer_price),
            ("down_payment", self.down_payment),
            ("financing_amount", self.financing_amount),
            ("buyer_deposit", self.buyer_deposit),
        ];
        for (field, amount) in amounts {
            if !amount.is_finite() || amount < 0.0 {
                return Err(ContractError::Validation(format!(
                    "{field} must be a non-negative amount, got {amount}"
                )));
            }
        }
        Ok(())
    }
}

/// Why a contract could not be generated
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("Invalid contract information: {0}")]
    Validation(String),
    #[error("Property not found: {0}")]
    PropertyNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Success,
    Error,
}

/// Everything that would be filled into the contract template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDocument {
    #[serde(flatten)]
    pub terms: ContractRequest,
    #[serde(flatten)]
    pub property: PropertyRecord,
    pub generation_date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractMetadata {
    pub generation_time: String,
    pub contract_type: String,
    pub property_address: String,
    pub offer_amount: f64,
    pub contract: ContractDocument,
}

/// Outcome of one generation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractResult {
    pub status: ContractStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_path: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ContractMetadata>,
}

impl ContractResult {
    pub fn is_success(&self) -> bool {
        self.status == ContractStatus::Success
    }

    /// Error result for a request whose body could not be read as JSON
    pub fn invalid_body(reason: &str) -> Self {
        ContractError::Validation(reason.to_string()).into()
    }
}

impl From<ContractError> for ContractResult {
    fn from(error: ContractError) -> Self {
        Self {
            status: ContractStatus::Error,
            contract_path: None,
            message: error.to_string(),
            metadata: None,
        }
    }
}

/// The `generate_sales_contract` tool
#[derive(Debug, Clone)]
pub struct ContractTool {
    listings: Arc<MlsListings>,
    contracts_dir: String,
}

impl ContractTool {
    /// Tool backed by the mock listings, reporting paths under `contracts_dir`
    pub fn new(contracts_dir: impl Into<String>) -> Self {
        Self::with_listings(contracts_dir, MlsListings::mock())
    }

    pub fn with_listings(contracts_dir: impl Into<String>, listings: MlsListings) -> Self {
        let contracts_dir = contracts_dir.into();
        let contracts_dir = contracts_dir.trim_end_matches('/').to_string();
        Self {
            listings: Arc::new(listings),
            contracts_dir,
        }
    }

    /// Generate a contract stamped with the current local time
    pub fn generate(&self, input: Value) -> ContractResult {
        self.generate_at(input, Local::now().naive_local())
    }

    /// Generate a contract stamped with `now`
    pub fn generate_at(&self, input: Value, now: NaiveDateTime) -> ContractResult {
        match self.try_generate(input, now) {
            Ok(result) => {
                tracing::info!(
                    contract_path = result.contract_path.as_deref().unwrap_or_default(),
                    "Contract generated"
                );
                result
            }
            Err(e) => {
                tracing::warn!(error = %e, "Contract generation rejected");
                e.into()
            }
        }
    }

    fn try_generate(&self, input: Value, now: NaiveDateTime) -> Result<ContractResult, ContractError> {
        let terms = ContractRequest::from_value(input)?;
        let property = self
            .listings
            .get(&terms.property_address)
            .cloned()
            .ok_or_else(|| ContractError::PropertyNotFound(terms.property_address.clone()))?;

        let timestamp = now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        let contract_path = self.contract_path(&terms.property_address, now);

        Ok(ContractResult {
            status: ContractStatus::Success,
            contract_path: Some(contract_path),
            message: "Contract generated successfully".to_string(),
            metadata: Some(ContractMetadata {
                generation_time: timestamp.clone(),
                contract_type: CONTRACT_TYPE_SALES.to_string(),
                property_address: terms.property_address.clone(),
                offer_amount: terms.offer_price,
                contract: ContractDocument {
                    terms,
                    property,
                    generation_date: timestamp,
                },
            }),
        })
    }

    fn contract_path(&self, address: &str, now: NaiveDateTime) -> String {
        format!(
            "{}/{}_{}.pdf",
            self.contracts_dir,
            address.replace(' ', "_"),
            now.format("%Y%m%d_%H%M%S")
        )
    }
}

#[async_trait]
impl Tool for ContractTool {
    fn name(&self) -> &'static str {
        CONTRACT_TOOL_NAME
    }

    fn description(&self) -> String {
        "Generate a residential sales contract once every term has been collected from the user. Looks up the property's listing details and returns the path of the generated contract. Only call this when the address, offer price, down payment, financing type and amount, and buyer deposit are all known.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": [
                "property_address",
                "offer_price",
                "down_payment",
                "financing_type",
                "financing_amount",
                "buyer_deposit"
            ],
            "properties": {
                "property_address": {
                    "type": "string",
                    "description": "Street address of the property, e.g. \"123 Main St\""
                },
                "offer_price": {"type": "number", "description": "Offer price in dollars"},
                "down_payment": {"type": "number", "description": "Down payment in dollars"},
                "financing_type": {
                    "type": "string",
                    "description": "Financing type, e.g. conventional, FHA, VA, cash"
                },
                "financing_amount": {"type": "number", "description": "Amount financed in dollars"},
                "buyer_deposit": {"type": "number", "description": "Earnest money deposit in dollars"},
                "seller_subsidy": {"type": "boolean", "description": "Whether the seller contributes to closing costs"},
                "financing_contingency": {"type": "boolean", "description": "Whether the offer is contingent on financing"},
                "appraisal_contingency": {"type": "boolean", "description": "Whether the offer is contingent on appraisal"}
            }
        })
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> ToolOutput {
        let result = self.generate(input);
        let value = match serde_json::to_value(&result) {
            Ok(value) => value,
            Err(e) => return ToolOutput::error(format!("Failed to encode contract result: {e}")),
        };
        let output = if result.is_success() {
            ToolOutput::success(value.to_string())
        } else {
            ToolOutput::error(value.to_string())
        };
        output.with_display(value)
    }
}
