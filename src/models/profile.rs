use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed address for a user
///
/// `address` is the identity of the record. The timestamps and enrichment
/// fields are refreshed in place when the same address is seen again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    pub address: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
}

impl AddressRecord {
    /// Create a record for an address seen for the first time at `now`
    pub fn new(address: impl Into<String>, now: DateTime<Utc>) -> Self {
        AddressRecord {
            address: address.into(),
            first_seen: now,
            last_seen: now,
            location: None,
            isp: None,
        }
    }
}

/// Everything known about one user: identity, latest sighting and history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    pub current_address: Option<String>,
    pub current_location: Option<String>,
    #[serde(rename = "currentISP")]
    pub current_isp: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Most recent first
    #[serde(default)]
    pub history: Vec<AddressRecord>,
}

impl UserProfile {
    /// Create an empty profile for a user that has never been stored
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        UserProfile {
            id: id.into(),
            display_name: display_name.into(),
            current_address: None,
            current_location: None,
            current_isp: None,
            last_seen: None,
            history: Vec::new(),
        }
    }

    /// Position of the record for `address`, matched exactly
    pub fn position_of(&self, address: &str) -> Option<usize> {
        self.history.iter().position(|r| r.address == address)
    }

    /// The record for `address`, if it is in the history
    pub fn find_record(&self, address: &str) -> Option<&AddressRecord> {
        self.history.iter().find(|r| r.address == address)
    }

    /// The most recently touched record
    pub fn last_record(&self) -> Option<&AddressRecord> {
        self.history.first()
    }

    /// Put the history in canonical order: `last_seen` descending.
    ///
    /// The sort is stable, so records sharing a timestamp keep their
    /// relative insertion order.
    pub fn sort_history(&mut self) {
        self.history.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
    }

    /// Drop the oldest records until at most `max` remain
    pub fn enforce_cap(&mut self, max: usize) {
        if self.history.len() > max {
            self.history.truncate(max);
        }
    }
}
