//! Hash-time-locked contract codec for UTXO chains
//!
//! Pure functions only:
//! - Redeem script construction and parsing
//! - Locking address derivation (P2WSH / P2SH)
//! - Claim / refund witness assembly and secret extraction
//! - A small interpreter for the HTLC template

pub mod script;
pub mod witness;

pub use script::{
    build_script, decode_timelock, encode_timelock, locking_address, parse_script,
    timelock_is_script_num_safe, ChainParams, HtlcParams, LockingAddress,
};
pub use witness::{
    claim_witness, evaluate, extract_secret, refund_witness, SpendContext, SpendPath,
};
