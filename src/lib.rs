// Library interface for the paylink reconciliation engine.
// This allows tests and external consumers to use the wallet functionality.

pub mod config;
pub mod storage;
pub mod wallet;
pub mod derivation;
pub mod allocator;
pub mod verifier;
pub mod invitations;
pub mod requests;
pub mod reconcile;
pub mod metrics;

pub use storage::Store;
pub use wallet::RootWallet;
pub use derivation::{DerivationPath, DerivedAddress, KeySource};
pub use allocator::{Allocator, AllocationState, AllocationSummary, AllocatorError, Bucket};
pub use invitations::{Direction, Invitation, InvitationStatus, InvitationStore, InvitationError};
pub use requests::{AddressRequestResponse, RequestStatus};
pub use reconcile::{ReconciliationWorker, RequestClient, TransactionFeed, StoreFeed};
