//! Destination-chain wallet: coin selection, transaction building, and the
//! per-wallet funding critical section

pub mod builder;
pub mod selector;
pub mod wallet;

pub use selector::{Selection, UtxoSelector};
pub use wallet::{FundingSession, PreparedFunding, WalletCoordinator};
