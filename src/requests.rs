//! Wire shapes consumed from the address-request service.
//!
//! These records arrive from the network collaborator and are treated as
//! untrusted input until they pass the integrity verifier.

use serde::{Serialize, Deserialize};

/// Server-side lifecycle of an address request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    New,
    Completed,
    Canceled,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAmount {
    /// Satoshis.
    pub btc: u64,
    /// US cents at the time the request was created.
    #[serde(default)]
    pub usd: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestParty {
    #[serde(rename = "type")]
    pub kind: String,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub amount: RequestAmount,
    #[serde(default)]
    pub sender: Option<RequestParty>,
    #[serde(default)]
    pub receiver: Option<RequestParty>,
}

fn default_address_type() -> String {
    "btc".to_string()
}

/// One fulfillment response for a previously submitted address request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRequestResponse {
    pub id: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub address_pubkey: Option<String>,
    #[serde(default = "default_address_type")]
    pub address_type: String,
    #[serde(default)]
    pub txid: Option<String>,
    pub status: RequestStatus,
    #[serde(default)]
    pub metadata: Option<RequestMetadata>,
}
