//! HTLC resolver
//!
//! Watches an EVM order registry for cross-chain swap orders, funds a
//! hash-time-locked contract on a UTXO chain for the profitable ones, and
//! completes the source side once the maker's claim reveals the secret.
//! Funded HTLCs the maker never claims are refunded after their timelock.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod htlc;
pub mod metrics;
pub mod signing;
pub mod state;
pub mod swap;
pub mod tx;
pub mod utxo;

#[cfg(test)]
mod testing;
