//! Mock MLS listing data
//!
//! Stands in for a multiple-listing-service lookup. Records are keyed by the
//! exact property address.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Listing details pulled into a contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub seller_email: String,
    pub seller_name: String,
    pub tax_id: String,
    pub legal_description: String,
    pub section: String,
    pub subdivision: String,
    pub parking: String,
    pub county: String,
    pub deed_book: String,
    pub page: String,
    pub unit: Option<String>,
    pub city: String,
    pub zip: String,
    pub utilities: Vec<String>,
    pub fixtures: Vec<String>,
}

/// Read-only address → listing table
#[derive(Debug, Clone, Default)]
pub struct MlsListings {
    records: HashMap<String, PropertyRecord>,
}

impl MlsListings {
    /// The single demo listing used by the prototype
    pub fn mock() -> Self {
        let strings = |items: &[&str]| -> Vec<String> {
            items.iter().map(|s| (*s).to_string()).collect()
        };
        Self::default().with_record(
            "123 Main St",
            PropertyRecord {
                seller_email: "agent@test.com".into(),
                seller_name: "John Doe".into(),
                tax_id: "12345".into(),
                legal_description: "Lot 1, Block A".into(),
                section: "Northwest".into(),
                subdivision: "Main Heights".into(),
                parking: "2 Car Garage".into(),
                county: "Example County".into(),
                deed_book: "1234".into(),
                page: "56".into(),
                unit: None,
                city: "Example City".into(),
                zip: "12345".into(),
                utilities: strings(&["Water", "Electric", "Gas"]),
                fixtures: strings(&["Dishwasher", "Range", "Refrigerator"]),
            },
        )
    }

    pub fn with_record(mut self, address: impl Into<String>, record: PropertyRecord) -> Self {
        self.records.insert(address.into(), record);
        self
    }

    pub fn get(&self, address: &str) -> Option<&PropertyRecord> {
        self.records.get(address)
    }
}
