//! Derivation-index allocation with BIP44-style gap reuse.
//!
//! Every index the wallet ever hands out flows through one [`Allocator`]
//! per (coin_type, account, change) bucket. The allocator guarantees that
//! no index is returned twice while still promised to a live invitation,
//! and that indices freed by canceled or expired invitations are reused
//! (smallest first) before the index space is extended.

use crate::derivation::{DerivationPath, DerivedAddress, KeySource, HARDENED_BOUND};
use crate::storage::{Store, CF_ALLOCATION};
use anyhow::{Result, Context, bail};
use serde::{Serialize, Deserialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocatorError {
    /// Reserving an index already promised to a different live invitation.
    /// Indicates a broken invariant upstream; never silently overwritten.
    #[error("index {index} is already reserved by invitation {holder}")]
    IndexConflict { index: u32, holder: String },
}

/// The persisted per-bucket allocation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationState {
    /// Highest index ever handed out; -1 before the first issue.
    pub last_issued_index: i64,
    /// Indices below `last_issued_index` that were issued but are free again.
    pub gap_indices: BTreeSet<u32>,
    /// Indices promised to invitations, keyed by index. An entry survives
    /// completion: a confirmed-on-chain index must never re-enter the gaps.
    pub reserved: BTreeMap<u32, String>,
}

impl Default for AllocationState {
    fn default() -> Self {
        Self { last_issued_index: -1, gap_indices: BTreeSet::new(), reserved: BTreeMap::new() }
    }
}

/// Diagnostics snapshot exposed to presentation-layer consumers.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationSummary {
    pub last_issued_index: i64,
    pub gap_count: usize,
    pub reserved_count: usize,
}

/// Identifies one allocation bucket. Receive and change chains of the same
/// account allocate independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub coin_type: u32,
    pub account: u32,
    pub change: u32,
}

impl Bucket {
    fn key_bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.coin_type.to_le_bytes());
        out[4..8].copy_from_slice(&self.account.to_le_bytes());
        out[8..12].copy_from_slice(&self.change.to_le_bytes());
        out
    }
}

pub struct Allocator {
    store: Arc<Store>,
    keys: KeySource,
    purpose: u32,
    bucket: Bucket,
    // Single-writer discipline: all index arithmetic happens under this lock,
    // and the state is persisted before the lock is released.
    state: Mutex<AllocationState>,
}

impl Allocator {
    /// Loads the persisted allocation state for `bucket`, or starts fresh.
    pub fn open(store: Arc<Store>, keys: KeySource, purpose: u32, bucket: Bucket) -> Result<Self> {
        let state = store
            .get::<AllocationState>(CF_ALLOCATION, &bucket.key_bytes())?
            .unwrap_or_default();
        Ok(Self { store, keys, purpose, bucket, state: Mutex::new(state) })
    }

    pub fn path_for(&self, index: u32) -> DerivationPath {
        DerivationPath::new(
            self.purpose,
            self.bucket.coin_type,
            self.bucket.account,
            self.bucket.change,
            index,
        )
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, AllocationState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("allocation state lock poisoned"))
    }

    fn persist(&self, state: &AllocationState) -> Result<()> {
        self.store
            .put(CF_ALLOCATION, &self.bucket.key_bytes(), state)
            .with_context(|| "failed to persist allocation state")
    }

    /// Picks the next eligible index on `state` and applies the choice:
    /// the smallest free gap first, otherwise the first extension index
    /// past `last_issued_index` that is not skipped or reserved.
    fn choose_and_apply(state: &mut AllocationState, skip: &HashSet<u32>) -> Result<u32> {
        if let Some(&idx) = state
            .gap_indices
            .iter()
            .find(|i| !skip.contains(i) && !state.reserved.contains_key(i))
        {
            state.gap_indices.remove(&idx);
            return Ok(idx);
        }

        let mut candidate: i64 = state.last_issued_index + 1;
        loop {
            if candidate >= HARDENED_BOUND as i64 {
                bail!("derivation index space exhausted for bucket");
            }
            let c = candidate as u32;
            if !skip.contains(&c) && !state.reserved.contains_key(&c) {
                state.last_issued_index = candidate;
                return Ok(c);
            }
            candidate += 1;
        }
    }

    /// Returns the next unique index, committing the updated state.
    /// Indices in `skip` are treated as unavailable for this call only.
    pub fn next_available_index(&self, skip: &HashSet<u32>) -> Result<u32> {
        let mut state = self.lock()?;
        let mut working = state.clone();
        let idx = Self::choose_and_apply(&mut working, skip)?;
        self.persist(&working)?;
        *state = working;
        Ok(idx)
    }

    /// Allocates `count` addresses in one atomic step. Each chosen index is
    /// implicitly reserved for the remainder of the batch, so a batch can
    /// never contain duplicates; the state is committed once at the end.
    pub fn next_available_addresses(
        &self,
        count: usize,
        skip: &HashSet<u32>,
    ) -> Result<Vec<DerivedAddress>> {
        let mut state = self.lock()?;
        let mut working = state.clone();
        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            let idx = Self::choose_and_apply(&mut working, skip)?;
            let derived = self.keys.derive_address(&self.path_for(idx))?;
            addresses.push(derived);
        }
        self.persist(&working)?;
        *state = working;
        Ok(addresses)
    }

    /// Marks `index` as promised to `invitation_id`, removing it from the
    /// gap set. Re-reserving to the same invitation is a no-op; reserving an
    /// index held by a different invitation fails with [`AllocatorError::IndexConflict`].
    pub fn reserve_index(&self, index: u32, invitation_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(holder) = state.reserved.get(&index) {
            if holder == invitation_id {
                return Ok(());
            }
            return Err(AllocatorError::IndexConflict { index, holder: holder.clone() }.into());
        }
        let mut working = state.clone();
        working.gap_indices.remove(&index);
        if (index as i64) > working.last_issued_index {
            // An out-of-order reservation (the server consumed a pool entry
            // above the lowest) jumps over unissued indices; record them as
            // gaps so they stay allocatable.
            for skipped in (working.last_issued_index + 1)..(index as i64) {
                working.gap_indices.insert(skipped as u32);
            }
            working.last_issued_index = index as i64;
        }
        working.reserved.insert(index, invitation_id.to_string());
        self.persist(&working)?;
        *state = working;
        Ok(())
    }

    /// Returns `index` to the gap set and clears its reservation. Idempotent:
    /// freeing an already-free index is a no-op. Callers only route indices
    /// here for terminal invitations that never saw a transaction.
    pub fn free_index(&self, index: u32) -> Result<()> {
        let mut state = self.lock()?;
        let mut working = state.clone();
        working.reserved.remove(&index);
        if (index as i64) <= working.last_issued_index {
            working.gap_indices.insert(index);
        }
        self.persist(&working)?;
        *state = working;
        Ok(())
    }

    /// Derives the address at `index` within this bucket.
    pub fn keys_derive(&self, index: u32) -> Result<DerivedAddress> {
        Ok(self.keys.derive_address(&self.path_for(index))?)
    }

    /// The indices the next `count` allocations would return, without
    /// committing anything. Used to pre-generate the server-side address
    /// pool: the preview stays stable until an entry is actually consumed.
    pub fn preview_next_indices(&self, count: usize) -> Result<Vec<u32>> {
        let state = self.lock()?;
        let mut working = state.clone();
        let skip = HashSet::new();
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(Self::choose_and_apply(&mut working, &skip)?);
        }
        Ok(out)
    }

    /// The index the next allocation would return, without committing.
    pub fn peek_next_index(&self) -> Result<u32> {
        let state = self.lock()?;
        let mut working = state.clone();
        Self::choose_and_apply(&mut working, &HashSet::new())
    }

    /// Derives the address the next allocation would hand out. Read-only;
    /// used by presentation-layer consumers for "current receive address".
    pub fn current_receive_address(&self) -> Result<DerivedAddress> {
        let idx = self.peek_next_index()?;
        Ok(self.keys.derive_address(&self.path_for(idx))?)
    }

    /// Independently derives every address this bucket has ever issued
    /// (indices 0..=last_issued_index). This is the trusted set the
    /// integrity verifier checks server-reported addresses against.
    pub fn known_addresses(&self) -> Result<HashSet<String>> {
        let last = { self.lock()?.last_issued_index };
        let mut known = HashSet::new();
        if last < 0 {
            return Ok(known);
        }
        for index in 0..=(last as u32) {
            let derived = self.keys.derive_address(&self.path_for(index))?;
            known.insert(derived.address);
        }
        Ok(known)
    }

    /// Which invitation currently holds `index`, if any.
    pub fn reservation_holder(&self, index: u32) -> Result<Option<String>> {
        Ok(self.lock()?.reserved.get(&index).cloned())
    }

    pub fn summary(&self) -> Result<AllocationSummary> {
        let state = self.lock()?;
        Ok(AllocationSummary {
            last_issued_index: state.last_issued_index,
            gap_count: state.gap_indices.len(),
            reserved_count: state.reserved.len(),
        })
    }

    /// Snapshot of the raw state, for diagnostics and tests.
    pub fn state_snapshot(&self) -> Result<AllocationState> {
        Ok(self.lock()?.clone())
    }
}
