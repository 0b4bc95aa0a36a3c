//! Durable invitation lifecycle records.
//!
//! An invitation is an asynchronous promise to pay (or be paid by) a
//! contact who has not yet supplied an address. The store is the single
//! authority for which derivation indices are live: every status change
//! goes through the central transition table here, and disallowed
//! transitions fail loudly rather than silently mutating state.

use crate::storage::{Store, CF_INVITATION, CF_TRANSACTION};
use anyhow::{Result, Context};
use chrono::{DateTime, Utc};
use rand::RngCore;
use rocksdb::WriteBatch;
use serde::{Serialize, Deserialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvitationError {
    #[error("invalid status transition {from:?} -> {to:?} for invitation {id}")]
    InvalidTransition { id: String, from: InvitationStatus, to: InvitationStatus },
    #[error("invitation {0} not found")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    // Sender side
    NotSent,
    RequestSent,
    AddressSent,
    // Receiver side
    RequestReceived,
    AddressProvided,
    // Terminal
    Completed,
    Canceled,
    Expired,
}

impl InvitationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Expired)
    }

    /// Central transition table. `Canceled` and `Expired` are reachable from
    /// any non-terminal state; everything else follows the two lifecycles
    /// `NotSent → RequestSent → AddressSent → Completed` and
    /// `RequestReceived → AddressProvided → Completed`.
    pub fn can_transition_to(&self, to: InvitationStatus) -> bool {
        use InvitationStatus::*;
        if self.is_terminal() {
            return false;
        }
        match to {
            Canceled | Expired => true,
            RequestSent => matches!(self, NotSent),
            AddressSent => matches!(self, NotSent | RequestSent),
            AddressProvided => matches!(self, RequestReceived),
            Completed => matches!(self, AddressSent | AddressProvided),
            NotSent | RequestReceived => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: String,
    pub direction: Direction,
    pub status: InvitationStatus,
    /// Opaque contact identity (phone hash, handle) supplied by the caller.
    pub counterparty: String,
    /// Amount in satoshis; never a formatted currency value.
    pub btc_sats: u64,
    pub fee_sats: u64,
    pub address: Option<String>,
    pub address_pubkey: Option<String>,
    /// Derivation index reserved for this invitation, when locally assigned.
    pub address_index: Option<u32>,
    pub txid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Whether the server acknowledged the request this invitation created.
    pub acknowledged: bool,
}

fn new_invitation_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("inv-{}", hex::encode(bytes))
}

pub struct InvitationStore {
    store: Arc<Store>,
}

impl InvitationStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn save(&self, invitation: &Invitation) -> Result<()> {
        self.store
            .put(CF_INVITATION, invitation.id.as_bytes(), invitation)
            .with_context(|| format!("failed to persist invitation {}", invitation.id))
    }

    fn load(&self, id: &str) -> Result<Invitation> {
        self.store
            .get::<Invitation>(CF_INVITATION, id.as_bytes())?
            .ok_or_else(|| InvitationError::NotFound(id.to_string()).into())
    }

    /// Creates and persists a new invitation. Outbound invitations start at
    /// `NotSent`, inbound ones at `RequestReceived`.
    pub fn create(
        &self,
        direction: Direction,
        counterparty: &str,
        btc_sats: u64,
        fee_sats: u64,
    ) -> Result<Invitation> {
        let status = match direction {
            Direction::Sent => InvitationStatus::NotSent,
            Direction::Received => InvitationStatus::RequestReceived,
        };
        let invitation = Invitation {
            id: new_invitation_id(),
            direction,
            status,
            counterparty: counterparty.to_string(),
            btc_sats,
            fee_sats,
            address: None,
            address_pubkey: None,
            address_index: None,
            txid: None,
            created_at: Utc::now(),
            completed_at: None,
            acknowledged: false,
        };
        self.save(&invitation)?;
        Ok(invitation)
    }

    fn transition(&self, invitation: &mut Invitation, to: InvitationStatus) -> Result<()> {
        if !invitation.status.can_transition_to(to) {
            return Err(InvitationError::InvalidTransition {
                id: invitation.id.clone(),
                from: invitation.status,
                to,
            }
            .into());
        }
        invitation.status = to;
        Ok(())
    }

    /// Marks an outbound invitation as submitted to the server.
    pub fn mark_request_sent(&self, id: &str) -> Result<Invitation> {
        let mut invitation = self.load(id)?;
        self.transition(&mut invitation, InvitationStatus::RequestSent)?;
        self.save(&invitation)?;
        Ok(invitation)
    }

    /// Records the verified address for an invitation. Legal only before an
    /// address has been finalized: sender-side invitations move to
    /// `AddressSent`, receiver-side ones to `AddressProvided`.
    pub fn assign_address(
        &self,
        id: &str,
        address: &str,
        pubkey: Option<&str>,
        index: Option<u32>,
    ) -> Result<Invitation> {
        let mut invitation = self.load(id)?;
        let to = match invitation.direction {
            Direction::Sent => InvitationStatus::AddressSent,
            Direction::Received => InvitationStatus::AddressProvided,
        };
        self.transition(&mut invitation, to)?;
        invitation.address = Some(address.to_string());
        invitation.address_pubkey = pubkey.map(str::to_string);
        if index.is_some() {
            invitation.address_index = index;
        }
        self.save(&invitation)?;
        Ok(invitation)
    }

    /// Records the txid the server reported for this invitation before the
    /// transaction itself has been observed. Legal only once an address is
    /// assigned and the invitation is not terminal.
    pub fn set_expected_txid(&self, id: &str, txid: &str) -> Result<Invitation> {
        let mut invitation = self.load(id)?;
        if invitation.status.is_terminal() || invitation.address.is_none() {
            return Err(InvitationError::InvalidTransition {
                id: invitation.id.clone(),
                from: invitation.status,
                to: invitation.status,
            }
            .into());
        }
        invitation.txid = Some(txid.to_string());
        self.save(&invitation)?;
        Ok(invitation)
    }

    /// Correlates the invitation with the observed transaction that pays it
    /// and completes the lifecycle. Re-linking an already-completed
    /// invitation to the same txid is a no-op so reconciliation cycles can
    /// repeat safely.
    pub fn link_transaction(&self, id: &str, txid: &str) -> Result<Invitation> {
        self.link_transaction_atomic(id, txid, WriteBatch::default())
    }

    /// Like [`link_transaction`](Self::link_transaction), but commits the
    /// invitation update together with the writes already staged on `batch`
    /// in one atomic step, so related cleanup (dropping a placeholder
    /// transaction row) cannot be lost between the two.
    pub fn link_transaction_atomic(
        &self,
        id: &str,
        txid: &str,
        mut batch: WriteBatch,
    ) -> Result<Invitation> {
        let mut invitation = self.load(id)?;
        let already_linked = invitation.status == InvitationStatus::Completed
            && invitation.txid.as_deref() == Some(txid);
        if !already_linked {
            self.transition(&mut invitation, InvitationStatus::Completed)?;
            invitation.txid = Some(txid.to_string());
            invitation.completed_at = Some(Utc::now());
        }
        self.store
            .batch_put(&mut batch, CF_INVITATION, invitation.id.as_bytes(), &invitation)?;
        self.store
            .write_batch(batch)
            .with_context(|| format!("failed to persist linked invitation {}", invitation.id))?;
        Ok(invitation)
    }

    pub fn mark_acknowledged(&self, id: &str) -> Result<Invitation> {
        let mut invitation = self.load(id)?;
        invitation.acknowledged = true;
        self.save(&invitation)?;
        Ok(invitation)
    }

    /// Outbound invitations the server never acknowledged. Candidates for
    /// pruning once they exceed the acknowledgment window.
    pub fn find_unacknowledged(&self) -> Result<Vec<Invitation>> {
        let all: Vec<Invitation> = self.store.iterate(CF_INVITATION)?;
        Ok(all
            .into_iter()
            .filter(|i| {
                i.direction == Direction::Sent && !i.acknowledged && !i.status.is_terminal()
            })
            .collect())
    }

    fn terminate(&self, id: &str, to: InvitationStatus) -> Result<Option<u32>> {
        let mut invitation = self.load(id)?;
        // Idempotent: re-terminating in the same state frees nothing new.
        if invitation.status == to {
            return Ok(None);
        }
        self.transition(&mut invitation, to)?;
        self.save(&invitation)?;
        // Any placeholder transaction row kept for this invitation will
        // never link now.
        self.store.delete(CF_TRANSACTION, invitation.id.as_bytes())?;
        // The reserved index is only freed when no transaction ever paid
        // this invitation; a spent-to address must never be reissued.
        if invitation.txid.is_none() {
            Ok(invitation.address_index)
        } else {
            Ok(None)
        }
    }

    /// Cancels the invitation. Returns the derivation index to free, if an
    /// address had been reserved but no transaction was ever linked.
    pub fn cancel(&self, id: &str) -> Result<Option<u32>> {
        self.terminate(id, InvitationStatus::Canceled)
    }

    /// Expires the invitation; same freeing semantics as [`cancel`](Self::cancel).
    pub fn expire(&self, id: &str) -> Result<Option<u32>> {
        self.terminate(id, InvitationStatus::Expired)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.delete(CF_INVITATION, id.as_bytes())
    }

    pub fn get(&self, id: &str) -> Result<Option<Invitation>> {
        self.store.get(CF_INVITATION, id.as_bytes())
    }

    pub fn with_status(&self, status: InvitationStatus) -> Result<Vec<Invitation>> {
        let all: Vec<Invitation> = self.store.iterate(CF_INVITATION)?;
        Ok(all.into_iter().filter(|i| i.status == status).collect())
    }

    pub fn all(&self) -> Result<Vec<Invitation>> {
        self.store.iterate(CF_INVITATION)
    }

    /// Invitations holding an assigned address that still lack a linked
    /// transaction; the reconciliation worker scans the feed for these.
    pub fn pending_links(&self) -> Result<Vec<Invitation>> {
        let all: Vec<Invitation> = self.store.iterate(CF_INVITATION)?;
        Ok(all
            .into_iter()
            .filter(|i| {
                matches!(
                    i.status,
                    InvitationStatus::AddressSent | InvitationStatus::AddressProvided
                ) && i.address.is_some()
            })
            .collect())
    }
}
