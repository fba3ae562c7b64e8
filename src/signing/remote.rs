//! Remote MPC signing service client
//!
//! Endpoints:
//! - `POST {url}/v1/keys`  `{chain, path}` -> `{public_key}`
//! - `POST {url}/v1/sign`  `{chain, path, digest}` -> `{signature}`
//!
//! All byte fields are hex. Signatures are DER encoded.

use super::{describe_key, DerivedKey, SigningProvider};
use crate::chain::ChainKind;
use crate::error::{ResolverError, ResolverResult};

use async_trait::async_trait;
use bitcoin::Network;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Serialize)]
struct KeyRequest<'a> {
    chain: ChainKind,
    path: &'a str,
}

#[derive(Deserialize)]
struct KeyResponse {
    public_key: String,
}

#[derive(Serialize)]
struct SignRequest<'a> {
    chain: ChainKind,
    path: &'a str,
    digest: String,
}

#[derive(Deserialize)]
struct SignResponse {
    signature: String,
}

pub struct RemoteSigner {
    base_url: String,
    api_key: Option<String>,
    network: Network,
    client: reqwest::Client,
    /// Public keys never change for a path
    key_cache: DashMap<(ChainKind, String), DerivedKey>,
}

impl RemoteSigner {
    pub fn new(
        url: &str,
        api_key: Option<String>,
        timeout: Duration,
        network: Network,
    ) -> ResolverResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| signing_error(e.to_string(), false))?;

        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            api_key,
            network,
            client,
            key_cache: DashMap::new(),
        })
    }

    async fn post<Req, Resp>(&self, endpoint: &str, body: &Req) -> ResolverResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ResolverError::Timeout {
                    operation: format!("remote signer {}", endpoint),
                }
            } else {
                signing_error(e.to_string(), true)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Remote signer {} returned {}: {}", endpoint, status, text);
            // quorum unavailability and overload are worth retrying, bad requests are not
            return Err(signing_error(
                format!("{} returned {}: {}", endpoint, status, text),
                status.is_server_error() || status.as_u16() == 429,
            ));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| signing_error(format!("invalid {} response: {}", endpoint, e), false))
    }
}

fn signing_error(message: String, retryable: bool) -> ResolverError {
    ResolverError::Signing {
        backend: "remote".to_string(),
        message,
        retryable,
    }
}

#[async_trait]
impl SigningProvider for RemoteSigner {
    fn backend(&self) -> &str {
        "remote"
    }

    async fn derive_key(&self, chain: ChainKind, path: &str) -> ResolverResult<DerivedKey> {
        let cache_key = (chain, path.to_string());
        if let Some(key) = self.key_cache.get(&cache_key) {
            return Ok(key.clone());
        }

        let response: KeyResponse = self.post("/v1/keys", &KeyRequest { chain, path }).await?;
        let public_key = hex::decode(response.public_key.trim_start_matches("0x"))
            .map_err(|e| signing_error(format!("public key is not hex: {}", e), false))?;
        let key = describe_key(chain, self.network, &public_key)?;

        debug!("Remote signer derived {} key at {}", chain, path);
        self.key_cache.insert(cache_key, key.clone());
        Ok(key)
    }

    async fn sign(
        &self,
        chain: ChainKind,
        path: &str,
        digest: &[u8; 32],
    ) -> ResolverResult<Vec<u8>> {
        let request = SignRequest {
            chain,
            path,
            digest: hex::encode(digest),
        };
        let response: SignResponse = self.post("/v1/sign", &request).await?;
        let signature = hex::decode(response.signature.trim_start_matches("0x"))
            .map_err(|e| signing_error(format!("signature is not hex: {}", e), false))?;

        bitcoin::secp256k1::ecdsa::Signature::from_der(&signature)
            .map_err(|e| signing_error(format!("signature is not DER: {}", e), false))?;
        Ok(signature)
    }
}
