//! Key derivation and signing behind one interface
//!
//! The engine never sees key material. It asks a `SigningProvider` for the
//! public side of a derivation path and for signatures over 32-byte digests.
//! `LocalSigner` holds a BIP32 seed in process; `RemoteSigner` forwards the
//! same requests to an MPC signing service.

mod local;
mod remote;

pub use local::LocalSigner;
pub use remote::RemoteSigner;

use crate::chain::ChainKind;
use crate::config::SignerConfig;
use crate::error::{ResolverError, ResolverResult};

use async_trait::async_trait;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, CompressedPublicKey, Network};
use std::sync::Arc;
use std::time::Duration;

/// Public side of a derived key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    /// Compressed SEC1 encoding
    pub public_key: Vec<u8>,
    /// HASH160 for UTXO chains, the account address bytes for EVM chains
    pub public_key_hash: [u8; 20],
    pub address: String,
}

#[async_trait]
pub trait SigningProvider: Send + Sync {
    /// Backend name for logs and errors
    fn backend(&self) -> &str;

    async fn derive_key(&self, chain: ChainKind, path: &str) -> ResolverResult<DerivedKey>;

    /// DER-encoded ECDSA signature over a 32-byte digest, without sighash flag
    async fn sign(&self, chain: ChainKind, path: &str, digest: &[u8; 32])
        -> ResolverResult<Vec<u8>>;
}

/// Build the configured signing backend
pub fn from_config(
    config: &SignerConfig,
    network: Network,
) -> ResolverResult<Arc<dyn SigningProvider>> {
    match config {
        SignerConfig::Local { seed_env } => {
            let seed_hex = std::env::var(seed_env).map_err(|_| {
                ResolverError::Config(format!("Signer seed not configured. Set {}", seed_env))
            })?;
            let seed = hex::decode(seed_hex.trim().trim_start_matches("0x"))
                .map_err(|e| ResolverError::Config(format!("Signer seed is not hex: {}", e)))?;
            Ok(Arc::new(LocalSigner::from_seed(&seed, network)?))
        }
        SignerConfig::Remote {
            url,
            api_key_env,
            timeout_ms,
        } => {
            let api_key = api_key_env.as_ref().and_then(|name| std::env::var(name).ok());
            Ok(Arc::new(RemoteSigner::new(
                url,
                api_key,
                Duration::from_millis(*timeout_ms),
                network,
            )?))
        }
    }
}

/// Compute hash and address for a compressed public key
pub(crate) fn describe_key(
    chain: ChainKind,
    network: Network,
    public_key: &[u8],
) -> ResolverResult<DerivedKey> {
    let pk = PublicKey::from_slice(public_key)
        .map_err(|e| ResolverError::Wallet(format!("Invalid public key: {}", e)))?;
    let compressed = pk.serialize();

    let (public_key_hash, address) = match chain {
        ChainKind::Bitcoin => {
            let pkh = hash160::Hash::hash(&compressed).to_byte_array();
            let address = Address::p2wpkh(&CompressedPublicKey(pk), network);
            (pkh, address.to_string())
        }
        ChainKind::Evm => {
            let uncompressed = pk.serialize_uncompressed();
            let digest = ethers::utils::keccak256(&uncompressed[1..]);
            let mut account = [0u8; 20];
            account.copy_from_slice(&digest[12..]);
            let address = format!("{:?}", ethers::types::Address::from(account));
            (account, address)
        }
    };

    Ok(DerivedKey {
        public_key: compressed.to_vec(),
        public_key_hash,
        address,
    })
}
