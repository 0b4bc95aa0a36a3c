//! Reconciliation between local invitation/address state and the
//! address-request service plus the transaction feed.
//!
//! Every operation here is a pure function over current state plus new
//! inputs: a failed or partial cycle leaves state consistent and is safely
//! re-run on the next tick. Verification always completes for a batch
//! before any of that batch commits (verify-then-commit, never the
//! reverse).

use crate::allocator::Allocator;
use crate::config;
use crate::derivation::DerivedAddress;
use crate::invitations::{InvitationStatus, InvitationStore};
use crate::requests::{AddressRequestResponse, RequestStatus};
use crate::storage::{Store, CF_LEDGER, CF_TRANSACTION};
use crate::verifier;
use anyhow::{Result, Context};
use rocksdb::WriteBatch;
use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::{sync::{broadcast, mpsc}, task, time::{interval, Duration}};

// Routine reconciliation logs are noisy; gate behind a static flag disabled
// by default.
static ALLOW_ROUTINE_SYNC: AtomicBool = AtomicBool::new(false);
macro_rules! sync_routine {
    ($($arg:tt)*) => {
        if ALLOW_ROUTINE_SYNC.load(Ordering::Relaxed) { println!($($arg)*); }
    };
}

pub fn set_routine_logging(enabled: bool) {
    ALLOW_ROUTINE_SYNC.store(enabled, Ordering::Relaxed);
}

/// An observed (or placeholder) transaction in the local ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub txid: String,
    pub amount_sats: u64,
    /// Set when this record is a stand-in for a payment whose real
    /// transaction has not been observed yet; holds the invitation id.
    pub placeholder_for: Option<String>,
}

/// A Lightning ledger entry; correlates invitations paid off-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub amount_sats: u64,
}

/// Network collaborator: fetches fulfillment responses and accepts the
/// pre-generated address pool. Transport and retry policy live behind this
/// boundary.
pub trait RequestClient {
    fn fetch_sent_address_requests(
        &self,
    ) -> impl Future<Output = Result<Vec<AddressRequestResponse>>> + Send;

    fn fetch_received_address_requests(
        &self,
    ) -> impl Future<Output = Result<Vec<AddressRequestResponse>>> + Send;

    fn submit_address_pool(
        &self,
        addresses: &[DerivedAddress],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Transaction feed collaborator: lookup of observed transactions and
/// Lightning ledger entries by id.
pub trait TransactionFeed {
    fn find_transaction(&self, txid: &str) -> Result<Option<TransactionRecord>>;
    fn find_ledger_entry(&self, id: &str) -> Result<Option<LedgerEntry>>;
}

/// Store-backed feed over the `transaction` and `ledger` column families.
#[derive(Clone)]
pub struct StoreFeed {
    store: Arc<Store>,
}

impl StoreFeed {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Records a transaction observed by the external chain watcher.
    pub fn observe_transaction(&self, record: &TransactionRecord) -> Result<()> {
        self.store.put(CF_TRANSACTION, record.txid.as_bytes(), record)
    }

    /// Records a settled Lightning ledger entry.
    pub fn observe_ledger_entry(&self, entry: &LedgerEntry) -> Result<()> {
        self.store.put(CF_LEDGER, entry.id.as_bytes(), entry)
    }
}

impl TransactionFeed for StoreFeed {
    fn find_transaction(&self, txid: &str) -> Result<Option<TransactionRecord>> {
        self.store.get(CF_TRANSACTION, txid.as_bytes())
    }

    fn find_ledger_entry(&self, id: &str) -> Result<Option<LedgerEntry>> {
        self.store.get(CF_LEDGER, id.as_bytes())
    }
}

pub struct ReconciliationWorker<C, F> {
    store: Arc<Store>,
    allocator: Arc<Allocator>,
    invitations: Arc<InvitationStore>,
    client: C,
    feed: F,
    pool_target: usize,
    ack_window: chrono::Duration,
    cancel: Arc<AtomicBool>,
}

impl<C: RequestClient, F: TransactionFeed> ReconciliationWorker<C, F> {
    pub fn new(
        store: Arc<Store>,
        allocator: Arc<Allocator>,
        invitations: Arc<InvitationStore>,
        client: C,
        feed: F,
        wallet_cfg: &config::Wallet,
        reconcile_cfg: &config::Reconcile,
    ) -> Self {
        Self {
            store,
            allocator,
            invitations,
            client,
            feed,
            pool_target: wallet_cfg.pool_target as usize,
            ack_window: chrono::Duration::seconds(reconcile_cfg.ack_window_secs as i64),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked before every mutation phase; a superseded or shutting
    /// down cycle aborts cleanly without partial index commitment.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Map from address to derivation index for every address this wallet
    /// could currently be asked about: all issued indices plus the preview
    /// of the next pool batch that may already sit server-side.
    fn derived_index_map(&self) -> Result<HashMap<String, u32>> {
        let mut map = HashMap::new();
        let snapshot = self.allocator.state_snapshot()?;
        if snapshot.last_issued_index >= 0 {
            for index in 0..=(snapshot.last_issued_index as u32) {
                let derived = self.allocator.keys_derive(index)?;
                map.insert(derived.address, index);
            }
        }
        for index in self.allocator.preview_next_indices(self.pool_target)? {
            let derived = self.allocator.keys_derive(index)?;
            map.insert(derived.address, index);
        }
        Ok(map)
    }

    /// Verifier wrapper; rejected entries are reported as a security metric
    /// inside [`verifier::verify`], never thrown.
    pub fn check_address_integrity(
        &self,
        responses: Vec<AddressRequestResponse>,
    ) -> Result<Vec<AddressRequestResponse>> {
        let index_map = self.derived_index_map()?;
        let known = index_map.keys().cloned().collect();
        Ok(verifier::verify(responses, &known))
    }

    /// Submits the preview of the next pool addresses to the server. The
    /// same set is re-submitted until the server consumes entries, so the
    /// call is idempotent and never grows the index space by itself.
    pub async fn refresh_address_pool(&self) -> Result<()> {
        let indices = self.allocator.preview_next_indices(self.pool_target)?;
        let mut addresses = Vec::with_capacity(indices.len());
        for index in indices {
            addresses.push(self.allocator.keys_derive(index)?);
        }
        self.client
            .submit_address_pool(&addresses)
            .await
            .with_context(|| "failed to submit address pool")
    }

    fn apply_response(
        &self,
        response: &AddressRequestResponse,
        index_map: &HashMap<String, u32>,
    ) -> Result<()> {
        let Some(invitation) = self.invitations.get(&response.id)? else {
            sync_routine!("🤷 No local invitation for address request {}", response.id);
            return Ok(());
        };

        // Any response naming this invitation proves the server saw the
        // original request.
        if !invitation.acknowledged {
            self.invitations.mark_acknowledged(&invitation.id)?;
        }

        match response.status {
            RequestStatus::Completed => {
                if let Some(address) = response.address.as_deref() {
                    if !invitation.status.is_terminal() && invitation.address.is_none() {
                        let index = index_map.get(address).copied();
                        if let Some(index) = index {
                            self.allocator.reserve_index(index, &invitation.id)?;
                        }
                        self.invitations.assign_address(
                            &invitation.id,
                            address,
                            response.address_pubkey.as_deref(),
                            index,
                        )?;
                        sync_routine!(
                            "📬 Assigned address to invitation {} (index {:?})",
                            invitation.id, index
                        );
                    }
                }
                if let Some(txid) = response.txid.as_deref() {
                    self.note_expected_txid(&response.id, txid)?;
                    self.try_link(&response.id)?;
                }
            }
            RequestStatus::Canceled => {
                if let Some(freed) = self.invitations.cancel(&invitation.id)? {
                    self.allocator.free_index(freed)?;
                }
            }
            RequestStatus::Expired => {
                if let Some(freed) = self.invitations.expire(&invitation.id)? {
                    self.allocator.free_index(freed)?;
                }
            }
            RequestStatus::New => {}
        }
        Ok(())
    }

    /// Records the server-reported txid on the invitation and keeps a
    /// placeholder transaction row until the real transaction is observed.
    fn note_expected_txid(&self, invitation_id: &str, txid: &str) -> Result<()> {
        let Some(invitation) = self.invitations.get(invitation_id)? else {
            return Ok(());
        };
        if invitation.status.is_terminal() || invitation.address.is_none() {
            return Ok(());
        }
        if invitation.txid.as_deref() != Some(txid) {
            self.invitations.set_expected_txid(invitation_id, txid)?;
        }
        if self.feed.find_transaction(txid)?.is_none() {
            let placeholder = TransactionRecord {
                txid: txid.to_string(),
                amount_sats: invitation.btc_sats,
                placeholder_for: Some(invitation_id.to_string()),
            };
            self.store
                .put(CF_TRANSACTION, invitation_id.as_bytes(), &placeholder)?;
        }
        Ok(())
    }

    /// Attempts to correlate one invitation with its observed transaction or
    /// ledger entry. Returns true when a link was applied.
    fn try_link(&self, invitation_id: &str) -> Result<bool> {
        let Some(invitation) = self.invitations.get(invitation_id)? else {
            return Ok(false);
        };
        if invitation.status == InvitationStatus::Completed {
            return Ok(false);
        }
        let Some(expected) = invitation.txid.clone() else {
            return Ok(false);
        };

        let found = self.feed.find_transaction(&expected)?.is_some()
            || self.feed.find_ledger_entry(&expected)?.is_some();
        if !found {
            return Ok(false);
        }

        // The real transaction now stands on its own; the placeholder row
        // keyed by the invitation id is redundant. Both records commit in
        // one batch so the delete cannot be lost after a successful link.
        let mut batch = WriteBatch::default();
        self.store
            .batch_delete(&mut batch, CF_TRANSACTION, invitation_id.as_bytes())?;
        self.invitations
            .link_transaction_atomic(invitation_id, &expected, batch)?;
        crate::metrics::TRANSACTIONS_LINKED.inc();
        sync_routine!("🔗 Linked invitation {} to {}", invitation_id, expected);
        Ok(true)
    }

    /// Fetches pending address requests from the service, verifies the batch
    /// against local derivation, then commits the verified subset.
    pub async fn sync_fulfilled_address_requests(&self) -> Result<()> {
        let mut responses = self
            .client
            .fetch_sent_address_requests()
            .await
            .with_context(|| "failed to fetch sent address requests")?;
        responses.extend(
            self.client
                .fetch_received_address_requests()
                .await
                .with_context(|| "failed to fetch received address requests")?,
        );

        if self.cancelled() {
            return Ok(());
        }

        // Verify the whole batch before any assignment commits.
        let index_map = self.derived_index_map()?;
        let known = index_map.keys().cloned().collect();
        let verified = verifier::verify(responses, &known);

        for response in &verified {
            if self.cancelled() {
                return Ok(());
            }
            self.apply_response(response, &index_map)?;
        }
        Ok(())
    }

    /// Scans every invitation holding an address but no linked transaction
    /// and links those whose transaction (or ledger entry) has appeared.
    /// Safe to call repeatedly; a second run on unchanged state is a no-op.
    pub fn link_fulfilled_requests_with_transactions(&self) -> Result<usize> {
        let mut linked = 0;
        for invitation in self.invitations.pending_links()? {
            if self.cancelled() {
                break;
            }
            if self.try_link(&invitation.id)? {
                linked += 1;
            }
        }
        Ok(linked)
    }

    /// Deletes sent invitations the server never acknowledged within the
    /// acknowledgment window, freeing their reserved indices.
    pub fn prune_unacknowledged_invitations(&self) -> Result<usize> {
        let now = chrono::Utc::now();
        let mut pruned = 0;
        for invitation in self.invitations.find_unacknowledged()? {
            if self.cancelled() {
                break;
            }
            if now - invitation.created_at < self.ack_window {
                continue;
            }
            if let Some(index) = invitation.address_index {
                self.allocator.free_index(index)?;
            }
            self.invitations.delete(&invitation.id)?;
            // A pruned invitation's placeholder row goes with it.
            self.store.delete(CF_TRANSACTION, invitation.id.as_bytes())?;
            crate::metrics::INVITATIONS_PRUNED.inc();
            println!("🧹 Pruned unacknowledged invitation {}", invitation.id);
            pruned += 1;
        }
        Ok(pruned)
    }

    /// One full reconciliation pass. Each phase is idempotent and the cancel
    /// flag is consulted between phases, so a superseded cycle never leaves
    /// half-applied state.
    pub async fn run_cycle(&self) -> Result<()> {
        self.refresh_address_pool().await?;
        if self.cancelled() {
            return Ok(());
        }
        self.sync_fulfilled_address_requests().await?;
        if self.cancelled() {
            return Ok(());
        }
        self.link_fulfilled_requests_with_transactions()?;
        if self.cancelled() {
            return Ok(());
        }
        self.prune_unacknowledged_invitations()?;
        crate::metrics::SYNC_CYCLES.inc();
        Ok(())
    }
}

/// Spawns the background reconciliation loop: a periodic tick, an on-demand
/// trigger (e.g. app foregrounding), and a shutdown receiver.
pub fn spawn<C, F>(
    worker: ReconciliationWorker<C, F>,
    interval_secs: u64,
    mut trigger_rx: mpsc::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> task::JoinHandle<()>
where
    C: RequestClient + Send + Sync + 'static,
    F: TransactionFeed + Send + Sync + 'static,
{
    task::spawn(async move {
        let cancel = worker.cancel_flag();
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    println!("🛑 Reconciliation task received shutdown signal");
                    cancel.store(true, Ordering::Relaxed);
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = worker.run_cycle().await {
                        eprintln!("⚠️  Reconciliation cycle failed (will retry): {e:#}");
                    }
                }
                Some(()) = trigger_rx.recv() => {
                    sync_routine!("⏩ Manual sync trigger received");
                    if let Err(e) = worker.run_cycle().await {
                        eprintln!("⚠️  Triggered reconciliation cycle failed: {e:#}");
                    }
                }
            }
        }
        println!("✅ Reconciliation task shutdown complete");
    })
}

/// File-spool request client: an external transport drops fulfillment
/// responses as JSON under `<dir>/sent/` and `<dir>/received/`, and picks
/// up the submitted pool from `<dir>/pool.json`. Lets the daemon run end to
/// end without this crate owning any network transport.
#[derive(Clone)]
pub struct SpoolClient {
    dir: std::path::PathBuf,
}

impl SpoolClient {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(dir.join("sent"))?;
        std::fs::create_dir_all(dir.join("received"))?;
        Ok(Self { dir })
    }

    fn read_responses(&self, sub: &str) -> Result<Vec<AddressRequestResponse>> {
        let mut out = Vec::new();
        let dir = self.dir.join(sub);
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return Ok(out),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read spool file {}", path.display()))?;
            // A file holds either one response or an array of them.
            if let Ok(batch) = serde_json::from_str::<Vec<AddressRequestResponse>>(&text) {
                out.extend(batch);
            } else {
                match serde_json::from_str::<AddressRequestResponse>(&text) {
                    Ok(single) => out.push(single),
                    Err(e) => eprintln!("⚠️  Skipping malformed spool file {}: {}", path.display(), e),
                }
            }
        }
        Ok(out)
    }
}

impl RequestClient for SpoolClient {
    async fn fetch_sent_address_requests(&self) -> Result<Vec<AddressRequestResponse>> {
        self.read_responses("sent")
    }

    async fn fetch_received_address_requests(&self) -> Result<Vec<AddressRequestResponse>> {
        self.read_responses("received")
    }

    async fn submit_address_pool(&self, addresses: &[DerivedAddress]) -> Result<()> {
        let path = self.dir.join("pool.json");
        let text = serde_json::to_string_pretty(addresses)?;
        std::fs::write(&path, text)
            .with_context(|| format!("failed to write pool file {}", path.display()))
    }
}
