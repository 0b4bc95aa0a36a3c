// Reconciliation tests: integrity filtering, verify-then-commit address
// assignment, idempotent transaction linking, pruning, and the full
// allocate/reserve/cancel/reallocate/confirm scenario.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use paylink::{
    allocator::{Allocator, Bucket},
    config,
    derivation::{DerivedAddress, KeySource, CHANGE_EXTERNAL},
    invitations::{Direction, InvitationStatus, InvitationStore},
    reconcile::{
        LedgerEntry, ReconciliationWorker, RequestClient, StoreFeed, TransactionFeed,
        TransactionRecord,
    },
    requests::{AddressRequestResponse, RequestStatus},
    storage::Store,
};

#[derive(Default)]
struct MockClient {
    sent: Mutex<Vec<AddressRequestResponse>>,
    received: Mutex<Vec<AddressRequestResponse>>,
    pool: Mutex<Vec<DerivedAddress>>,
}

impl MockClient {
    fn set_sent(&self, responses: Vec<AddressRequestResponse>) {
        *self.sent.lock().unwrap() = responses;
    }

    fn pool_snapshot(&self) -> Vec<DerivedAddress> {
        self.pool.lock().unwrap().clone()
    }
}

// Orphan rules forbid implementing the foreign `RequestClient` trait directly
// on `Arc<MockClient>`, so wrap the shared handle in a local newtype.
#[derive(Clone)]
struct MockHandle(Arc<MockClient>);

impl RequestClient for MockHandle {
    async fn fetch_sent_address_requests(&self) -> Result<Vec<AddressRequestResponse>> {
        Ok(self.0.sent.lock().unwrap().clone())
    }

    async fn fetch_received_address_requests(&self) -> Result<Vec<AddressRequestResponse>> {
        Ok(self.0.received.lock().unwrap().clone())
    }

    async fn submit_address_pool(&self, addresses: &[DerivedAddress]) -> Result<()> {
        *self.0.pool.lock().unwrap() = addresses.to_vec();
        Ok(())
    }
}

struct Harness {
    _tmp: TempDir,
    allocator: Arc<Allocator>,
    invitations: Arc<InvitationStore>,
    client: Arc<MockClient>,
    feed: StoreFeed,
    worker: ReconciliationWorker<MockHandle, StoreFeed>,
}

fn harness_with_ack_window(ack_window_secs: u64) -> Harness {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let db_path = tmp.path().join("reconcile_test_db");
    let store = Arc::new(Store::open(db_path.to_str().unwrap()).expect("Failed to open store"));

    let bucket = Bucket { coin_type: 0, account: 0, change: CHANGE_EXTERNAL };
    let allocator = Arc::new(
        Allocator::open(store.clone(), KeySource::new([9u8; 32]), 84, bucket)
            .expect("allocator should open"),
    );
    let invitations = Arc::new(InvitationStore::new(store.clone()));
    let client = Arc::new(MockClient::default());
    let feed = StoreFeed::new(store.clone());

    let wallet_cfg = config::Wallet { purpose: 84, coin_type: 0, account: 0, pool_target: 5 };
    let reconcile_cfg = config::Reconcile {
        interval_secs: 1,
        ack_window_secs,
        spool_dir: "unused".into(),
    };

    let worker = ReconciliationWorker::new(
        store,
        allocator.clone(),
        invitations.clone(),
        MockHandle(client.clone()),
        feed.clone(),
        &wallet_cfg,
        &reconcile_cfg,
    );

    Harness { _tmp: tmp, allocator, invitations, client, feed, worker }
}

fn harness() -> Harness {
    harness_with_ack_window(24 * 60 * 60)
}

fn completed_response(id: &str, address: Option<String>, txid: Option<&str>) -> AddressRequestResponse {
    AddressRequestResponse {
        id: id.to_string(),
        address,
        address_pubkey: None,
        address_type: "btc".to_string(),
        txid: txid.map(str::to_string),
        status: RequestStatus::Completed,
        metadata: None,
    }
}

#[test]
fn test_integrity_filter_soundness() {
    let h = harness();
    let no_skip = HashSet::new();
    let ours = h.allocator.next_available_addresses(3, &no_skip).unwrap();

    let responses = vec![
        completed_response("r1", Some(ours[0].address.clone()), None),
        completed_response("r2", Some("deadbeef".to_string()), None),
        completed_response("r3", Some(ours[1].address.clone()), None),
        completed_response("r4", Some("cafebabe".to_string()), None),
        completed_response("r5", Some(ours[2].address.clone()), None),
    ];

    let verified = h.worker.check_address_integrity(responses).unwrap();
    let ids: Vec<&str> = verified.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["r1", "r3", "r5"], "only verified entries survive, order preserved");
}

#[tokio::test]
async fn test_sync_assigns_verified_address_and_reserves_index() {
    let h = harness();
    let inv = h.invitations.create(Direction::Sent, "contact", 50_000, 300).unwrap();
    h.invitations.mark_request_sent(&inv.id).unwrap();

    // The server picked the first pool address for this invitation.
    let pool_address = h.allocator.keys_derive(0).unwrap();
    h.client.set_sent(vec![completed_response(&inv.id, Some(pool_address.address.clone()), None)]);

    h.worker.sync_fulfilled_address_requests().await.unwrap();

    let updated = h.invitations.get(&inv.id).unwrap().unwrap();
    assert_eq!(updated.status, InvitationStatus::AddressSent);
    assert_eq!(updated.address.as_deref(), Some(pool_address.address.as_str()));
    assert_eq!(updated.address_index, Some(0));
    assert!(updated.acknowledged, "a response naming the invitation proves acknowledgment");

    assert_eq!(h.allocator.reservation_holder(0).unwrap().as_deref(), Some(inv.id.as_str()));
    assert_eq!(h.allocator.summary().unwrap().last_issued_index, 0);
}

#[tokio::test]
async fn test_mismatched_address_never_reaches_assignment() {
    let h = harness();
    let inv = h.invitations.create(Direction::Sent, "contact", 10_000, 0).unwrap();
    h.invitations.mark_request_sent(&inv.id).unwrap();

    h.client.set_sent(vec![completed_response(&inv.id, Some("attacker-address".to_string()), None)]);
    h.worker.sync_fulfilled_address_requests().await.unwrap();

    let unchanged = h.invitations.get(&inv.id).unwrap().unwrap();
    assert_eq!(unchanged.status, InvitationStatus::RequestSent);
    assert!(unchanged.address.is_none(), "tampered address must never be assigned");
    assert_eq!(h.allocator.summary().unwrap().last_issued_index, -1);
}

#[tokio::test]
async fn test_txid_linking_is_deferred_until_transaction_observed_and_idempotent() {
    let h = harness();
    let inv = h.invitations.create(Direction::Sent, "contact", 25_000, 200).unwrap();
    h.invitations.mark_request_sent(&inv.id).unwrap();

    let pool_address = h.allocator.keys_derive(0).unwrap();
    h.client.set_sent(vec![completed_response(
        &inv.id,
        Some(pool_address.address.clone()),
        Some("tx-real"),
    )]);
    h.worker.sync_fulfilled_address_requests().await.unwrap();

    // Transaction not observed yet: expected txid recorded, placeholder kept.
    let pending = h.invitations.get(&inv.id).unwrap().unwrap();
    assert_eq!(pending.status, InvitationStatus::AddressSent);
    assert_eq!(pending.txid.as_deref(), Some("tx-real"));
    let placeholder = h.feed.find_transaction(&inv.id).unwrap().expect("placeholder row");
    assert_eq!(placeholder.placeholder_for.as_deref(), Some(inv.id.as_str()));
    assert_eq!(placeholder.txid, "tx-real", "placeholder carries the expected txid");

    assert_eq!(h.worker.link_fulfilled_requests_with_transactions().unwrap(), 0);

    // The chain watcher now observes the real transaction.
    h.feed
        .observe_transaction(&TransactionRecord {
            txid: "tx-real".to_string(),
            amount_sats: 25_000,
            placeholder_for: None,
        })
        .unwrap();

    assert_eq!(h.worker.link_fulfilled_requests_with_transactions().unwrap(), 1);
    let completed = h.invitations.get(&inv.id).unwrap().unwrap();
    assert_eq!(completed.status, InvitationStatus::Completed);
    assert!(h.feed.find_transaction(&inv.id).unwrap().is_none(), "placeholder deleted");

    // Second run on unchanged state applies nothing.
    assert_eq!(h.worker.link_fulfilled_requests_with_transactions().unwrap(), 0);
}

#[tokio::test]
async fn test_lightning_invitations_link_via_ledger_entries() {
    let h = harness();
    let inv = h.invitations.create(Direction::Sent, "contact", 5_000, 0).unwrap();
    h.invitations
        .assign_address(&inv.id, "lightning-invoice", None, None)
        .unwrap();
    h.invitations.set_expected_txid(&inv.id, "ledger-42").unwrap();

    assert_eq!(h.worker.link_fulfilled_requests_with_transactions().unwrap(), 0);

    h.feed
        .observe_ledger_entry(&LedgerEntry { id: "ledger-42".to_string(), amount_sats: 5_000 })
        .unwrap();

    assert_eq!(h.worker.link_fulfilled_requests_with_transactions().unwrap(), 1);
    let completed = h.invitations.get(&inv.id).unwrap().unwrap();
    assert_eq!(completed.status, InvitationStatus::Completed);
    assert_eq!(completed.txid.as_deref(), Some("ledger-42"));
}

#[tokio::test]
async fn test_out_of_order_pool_fulfillment_keeps_lower_indices_allocatable() {
    let h = harness();
    let inv = h.invitations.create(Direction::Sent, "contact", 30_000, 0).unwrap();
    h.invitations.mark_request_sent(&inv.id).unwrap();

    // The server consumed the third pool entry, not the first.
    let pool_address = h.allocator.keys_derive(2).unwrap();
    h.client.set_sent(vec![completed_response(&inv.id, Some(pool_address.address.clone()), None)]);
    h.worker.sync_fulfilled_address_requests().await.unwrap();

    let updated = h.invitations.get(&inv.id).unwrap().unwrap();
    assert_eq!(updated.address_index, Some(2));

    let snapshot = h.allocator.state_snapshot().unwrap();
    assert_eq!(
        snapshot.gap_indices.iter().copied().collect::<Vec<_>>(),
        vec![0, 1],
        "indices below the fulfilled one must remain allocatable"
    );
    let no_skip = HashSet::new();
    assert_eq!(h.allocator.next_available_index(&no_skip).unwrap(), 0);
}

#[tokio::test]
async fn test_cancellation_discards_the_placeholder_row() {
    let h = harness();
    let inv = h.invitations.create(Direction::Sent, "contact", 15_000, 0).unwrap();
    h.invitations.mark_request_sent(&inv.id).unwrap();

    let pool_address = h.allocator.keys_derive(0).unwrap();
    h.client.set_sent(vec![completed_response(
        &inv.id,
        Some(pool_address.address.clone()),
        Some("tx-late"),
    )]);
    h.worker.sync_fulfilled_address_requests().await.unwrap();
    assert!(h.feed.find_transaction(&inv.id).unwrap().is_some(), "placeholder created");

    let mut canceled = completed_response(&inv.id, None, None);
    canceled.status = RequestStatus::Canceled;
    h.client.set_sent(vec![canceled]);
    h.worker.sync_fulfilled_address_requests().await.unwrap();

    assert_eq!(h.invitations.get(&inv.id).unwrap().unwrap().status, InvitationStatus::Canceled);
    assert!(
        h.feed.find_transaction(&inv.id).unwrap().is_none(),
        "a canceled invitation leaves no placeholder behind"
    );
}

#[tokio::test]
async fn test_server_cancellation_frees_the_reserved_index() {
    let h = harness();
    let inv = h.invitations.create(Direction::Sent, "contact", 10_000, 0).unwrap();
    h.invitations.mark_request_sent(&inv.id).unwrap();

    let pool_address = h.allocator.keys_derive(0).unwrap();
    h.client.set_sent(vec![completed_response(&inv.id, Some(pool_address.address.clone()), None)]);
    h.worker.sync_fulfilled_address_requests().await.unwrap();

    let mut canceled = completed_response(&inv.id, None, None);
    canceled.status = RequestStatus::Canceled;
    h.client.set_sent(vec![canceled]);
    h.worker.sync_fulfilled_address_requests().await.unwrap();

    let updated = h.invitations.get(&inv.id).unwrap().unwrap();
    assert_eq!(updated.status, InvitationStatus::Canceled);

    let snapshot = h.allocator.state_snapshot().unwrap();
    assert!(snapshot.gap_indices.contains(&0), "canceled index returns to the gap set");
    assert!(snapshot.reserved.is_empty());

    // And the freed index is the next one allocated.
    let no_skip = HashSet::new();
    assert_eq!(h.allocator.next_available_index(&no_skip).unwrap(), 0);
}

#[tokio::test]
async fn test_prune_deletes_stale_unacknowledged_invitations() {
    let h = harness_with_ack_window(0);
    let inv = h.invitations.create(Direction::Sent, "contact", 10_000, 0).unwrap();
    h.invitations.mark_request_sent(&inv.id).unwrap();
    h.allocator.reserve_index(0, &inv.id).unwrap();
    h.invitations
        .assign_address(&inv.id, "addr-local", None, Some(0))
        .unwrap();

    let pruned = h.worker.prune_unacknowledged_invitations().unwrap();
    assert_eq!(pruned, 1);
    assert!(h.invitations.get(&inv.id).unwrap().is_none(), "invitation deleted");

    let snapshot = h.allocator.state_snapshot().unwrap();
    assert!(snapshot.gap_indices.contains(&0), "pruned index freed for reuse");
}

#[tokio::test]
async fn test_prune_spares_acknowledged_and_recent_invitations() {
    let h = harness_with_ack_window(0);
    let acked = h.invitations.create(Direction::Sent, "a", 1_000, 0).unwrap();
    h.invitations.mark_acknowledged(&acked.id).unwrap();

    let recent_h = harness_with_ack_window(3600);
    let recent = recent_h.invitations.create(Direction::Sent, "b", 2_000, 0).unwrap();

    assert_eq!(h.worker.prune_unacknowledged_invitations().unwrap(), 0);
    assert_eq!(recent_h.worker.prune_unacknowledged_invitations().unwrap(), 0);
    assert!(h.invitations.get(&acked.id).unwrap().is_some());
    assert!(recent_h.invitations.get(&recent.id).unwrap().is_some());
}

#[tokio::test]
async fn test_run_cycle_submits_pool_and_is_idempotent() {
    let h = harness();
    let inv = h.invitations.create(Direction::Sent, "contact", 40_000, 100).unwrap();
    h.invitations.mark_request_sent(&inv.id).unwrap();

    let pool_address = h.allocator.keys_derive(0).unwrap();
    h.client.set_sent(vec![completed_response(
        &inv.id,
        Some(pool_address.address.clone()),
        Some("tx-cycle"),
    )]);
    h.feed
        .observe_transaction(&TransactionRecord {
            txid: "tx-cycle".to_string(),
            amount_sats: 40_000,
            placeholder_for: None,
        })
        .unwrap();

    h.worker.run_cycle().await.unwrap();
    assert_eq!(h.client.pool_snapshot().len(), 5, "pool target submitted");

    let after_first = h.invitations.get(&inv.id).unwrap().unwrap();
    assert_eq!(after_first.status, InvitationStatus::Completed);
    let allocation_after_first = h.allocator.state_snapshot().unwrap();

    // A second cycle over unchanged inputs must not mutate anything.
    h.worker.run_cycle().await.unwrap();
    let after_second = h.invitations.get(&inv.id).unwrap().unwrap();
    assert_eq!(after_first, after_second);
    let allocation_after_second = h.allocator.state_snapshot().unwrap();
    assert_eq!(allocation_after_first.last_issued_index, allocation_after_second.last_issued_index);
    assert_eq!(allocation_after_first.gap_indices, allocation_after_second.gap_indices);
    assert_eq!(allocation_after_first.reserved, allocation_after_second.reserved);
}

#[tokio::test]
async fn test_end_to_end_allocate_cancel_reallocate_confirm() {
    let h = harness();
    let no_skip = HashSet::new();
    assert_eq!(h.allocator.summary().unwrap().last_issued_index, -1);

    // Allocate index 0 and promise it to I1.
    let idx = h.allocator.next_available_index(&no_skip).unwrap();
    assert_eq!(idx, 0);
    let derived = h.allocator.keys_derive(idx).unwrap();
    let i1 = h.invitations.create(Direction::Sent, "alice", 10_000, 50).unwrap();
    h.allocator.reserve_index(idx, &i1.id).unwrap();
    h.invitations
        .assign_address(&i1.id, &derived.address, Some(&derived.public_key), Some(idx))
        .unwrap();

    // Cancel I1: index 0 becomes a gap, exactly once even if canceled twice.
    if let Some(freed) = h.invitations.cancel(&i1.id).unwrap() {
        h.allocator.free_index(freed).unwrap();
    }
    assert_eq!(h.invitations.cancel(&i1.id).unwrap(), None);
    let snapshot = h.allocator.state_snapshot().unwrap();
    assert_eq!(snapshot.gap_indices.iter().copied().collect::<Vec<_>>(), vec![0]);

    // Reallocation returns the freed index; promise it to I2.
    let idx2 = h.allocator.next_available_index(&no_skip).unwrap();
    assert_eq!(idx2, 0, "freed index is reused before extending");
    let i2 = h.invitations.create(Direction::Sent, "bob", 20_000, 80).unwrap();
    h.allocator.reserve_index(idx2, &i2.id).unwrap();
    h.invitations
        .assign_address(&i2.id, &derived.address, Some(&derived.public_key), Some(idx2))
        .unwrap();

    // Confirm I2 via its matching transaction.
    h.invitations.set_expected_txid(&i2.id, "tx-e2e").unwrap();
    h.feed
        .observe_transaction(&TransactionRecord {
            txid: "tx-e2e".to_string(),
            amount_sats: 20_000,
            placeholder_for: None,
        })
        .unwrap();
    assert_eq!(h.worker.link_fulfilled_requests_with_transactions().unwrap(), 1);

    let completed = h.invitations.get(&i2.id).unwrap().unwrap();
    assert_eq!(completed.status, InvitationStatus::Completed);

    // Index 0 is now used on-chain: permanently reserved, never a gap again.
    let final_state = h.allocator.state_snapshot().unwrap();
    assert!(final_state.gap_indices.is_empty());
    assert_eq!(final_state.reserved.get(&0).map(String::as_str), Some(i2.id.as_str()));
    assert_eq!(h.allocator.next_available_index(&no_skip).unwrap(), 1);
}
