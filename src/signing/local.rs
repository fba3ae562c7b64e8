//! In-process BIP32 signer

use super::{describe_key, DerivedKey, SigningProvider};
use crate::chain::ChainKind;
use crate::error::{ResolverError, ResolverResult};

use async_trait::async_trait;
use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::Network;
use std::str::FromStr;
use tracing::debug;

pub struct LocalSigner {
    master: Xpriv,
    network: Network,
    secp: Secp256k1<All>,
}

impl LocalSigner {
    pub fn from_seed(seed: &[u8], network: Network) -> ResolverResult<Self> {
        if seed.len() < 16 {
            return Err(ResolverError::Config(
                "Signer seed must be at least 16 bytes".to_string(),
            ));
        }
        let master = Xpriv::new_master(network, seed)
            .map_err(|e| ResolverError::Wallet(format!("Invalid seed: {}", e)))?;
        Ok(Self {
            master,
            network,
            secp: Secp256k1::new(),
        })
    }

    fn secret_key(&self, path: &str) -> ResolverResult<SecretKey> {
        let path = DerivationPath::from_str(path)
            .map_err(|e| ResolverError::Wallet(format!("Invalid derivation path {}: {}", path, e)))?;
        let child = self
            .master
            .derive_priv(&self.secp, &path)
            .map_err(|e| ResolverError::Wallet(format!("Key derivation failed: {}", e)))?;
        Ok(child.private_key)
    }
}

#[async_trait]
impl SigningProvider for LocalSigner {
    fn backend(&self) -> &str {
        "local"
    }

    async fn derive_key(&self, chain: ChainKind, path: &str) -> ResolverResult<DerivedKey> {
        let secret = self.secret_key(path)?;
        let public = PublicKey::from_secret_key(&self.secp, &secret);
        debug!("Derived {} key at {}", chain, path);
        describe_key(chain, self.network, &public.serialize())
    }

    async fn sign(
        &self,
        _chain: ChainKind,
        path: &str,
        digest: &[u8; 32],
    ) -> ResolverResult<Vec<u8>> {
        let secret = self.secret_key(path)?;
        let message = Message::from_digest(*digest);
        let signature = self.secp.sign_ecdsa(&message, &secret);
        Ok(signature.serialize_der().to_vec())
    }
}
