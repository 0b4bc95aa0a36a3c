//! Independent verification of server-reported addresses.
//!
//! The address-request service is untrusted: a buggy or malicious server
//! could substitute its own addresses into fulfillment responses. Before
//! any response updates local state, its address must match one this
//! wallet derived itself.

use crate::requests::AddressRequestResponse;
use std::collections::HashSet;

/// Filter-and-report verification: returns only the responses whose address
/// appears in the independently derived `known_valid` set, preserving input
/// order. Rejected entries are counted as a security anomaly rather than
/// failing the batch, so one bad record cannot block the rest.
///
/// Responses without an address (e.g. still-pending or canceled requests)
/// pass through untouched; there is nothing to verify on them.
pub fn verify(
    responses: Vec<AddressRequestResponse>,
    known_valid: &HashSet<String>,
) -> Vec<AddressRequestResponse> {
    let mut kept = Vec::with_capacity(responses.len());
    for response in responses {
        match response.address.as_deref() {
            Some(address) if !known_valid.contains(address) => {
                eprintln!(
                    "⚠️  Dropping address request {}: reported address does not match local derivation",
                    response.id
                );
                crate::metrics::ADDRESS_MISMATCHES.inc();
            }
            _ => kept.push(response),
        }
    }
    kept
}
