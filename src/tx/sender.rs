//! Settlement transaction sender with retry logic

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::chain::{ChainProvider, GasPrice};
use crate::error::{ResolverError, ResolverResult};
use crate::events::encode_withdraw;
use crate::swap::order::OrderHash;

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Percent bump applied after an "underpriced" rejection
const UNDERPRICED_BUMP_PERCENT: u64 = 125;

/// Signs and submits `withdraw` calls on the source chain
pub struct TransactionSender {
    provider: Arc<ChainProvider>,
    nonce_manager: NonceManager,
    gas_estimator: GasEstimator,
    wallet: LocalWallet,
    registry: Address,
    max_attempts: u32,
    retry_delay: Duration,
    send_timeout: Duration,
}

impl TransactionSender {
    pub async fn new(
        provider: Arc<ChainProvider>,
        private_key_env: &str,
        max_attempts: u32,
        retry_delay: Duration,
        send_timeout: Duration,
    ) -> ResolverResult<Self> {
        let wallet = Self::load_wallet(private_key_env)?.with_chain_id(provider.chain_id());
        let registry: Address = provider
            .registry_address()
            .parse()
            .map_err(|e| ResolverError::Config(format!("Invalid registry address: {}", e)))?;

        info!(
            "Transaction sender initialized with wallet: {:?}",
            wallet.address()
        );

        let nonce_manager = NonceManager::new(wallet.address(), provider.chain_id());
        if let Err(e) = nonce_manager.init(&provider).await {
            warn!("Failed to init nonce for chain {}: {}", provider.name(), e);
        }

        Ok(Self {
            provider,
            nonce_manager,
            gas_estimator: GasEstimator::new(),
            wallet,
            registry,
            max_attempts: max_attempts.max(1),
            retry_delay,
            send_timeout,
        })
    }

    fn load_wallet(private_key_env: &str) -> ResolverResult<LocalWallet> {
        let key = std::env::var(private_key_env).map_err(|_| {
            ResolverError::Wallet(format!("No EVM key configured. Set {}", private_key_env))
        })?;
        key.parse::<LocalWallet>()
            .map_err(|e| ResolverError::Wallet(format!("Invalid private key: {}", e)))
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    /// Worst-case settlement cost in wei at current gas prices
    pub async fn estimate_withdraw_cost(&self) -> ResolverResult<U256> {
        let gas_price = self.gas_estimator.get_gas_price(&self.provider).await?;
        Ok(GasEstimator::calculate_cost(
            self.gas_estimator.default_withdraw_gas(),
            &gas_price,
        ))
    }

    /// Submit `withdraw(orderHash, secret)`
    pub async fn submit_withdraw(
        &self,
        order_hash: &OrderHash,
        secret: &[u8; 32],
    ) -> ResolverResult<H256> {
        let data = encode_withdraw(order_hash, secret);
        let mut gas_price = self.gas_estimator.get_gas_price(&self.provider).await?;
        let mut nonce = self.nonce_manager.next().await?;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let probe = self.build_tx(data.clone(), nonce, None, &gas_price);
            let gas_limit = self
                .gas_estimator
                .estimate_withdraw_gas(&self.provider, &probe)
                .await;
            let tx = self.build_tx(data.clone(), nonce, Some(gas_limit), &gas_price);

            let signed = match self.wallet.sign_transaction(&tx).await {
                Ok(sig) => tx.rlp_signed(&sig),
                Err(e) => {
                    error!("Failed to sign transaction: {}", e);
                    self.nonce_manager.release(nonce).await?;
                    return Err(ResolverError::Signing {
                        backend: "evm-local".to_string(),
                        message: e.to_string(),
                        retryable: false,
                    });
                }
            };

            match timeout(
                self.send_timeout,
                self.provider.http().send_raw_transaction(signed),
            )
            .await
            {
                Ok(Ok(pending)) => {
                    let tx_hash = pending.tx_hash();
                    info!(
                        "Withdraw for order {} sent: {:?} (attempt {}/{})",
                        order_hash, tx_hash, attempt, self.max_attempts
                    );
                    self.nonce_manager
                        .mark_pending(nonce, &format!("{:?}", tx_hash))
                        .await?;
                    crate::metrics::record_tx_submitted(self.provider.chain_id());
                    return Ok(tx_hash);
                }
                Ok(Err(e)) => {
                    let message = e.to_string();
                    if message.contains("nonce too low") {
                        warn!("Nonce too low, syncing and retrying");
                        self.nonce_manager.sync(&self.provider).await?;
                        nonce = self.nonce_manager.next().await?;
                    } else if message.contains("underpriced") {
                        warn!("Transaction underpriced, increasing gas");
                        gas_price = self
                            .gas_estimator
                            .speed_up_gas_price(&gas_price, UNDERPRICED_BUMP_PERCENT);
                    } else if message.contains("insufficient funds") {
                        self.nonce_manager.release(nonce).await?;
                        return Err(ResolverError::Wallet(format!(
                            "insufficient gas funds on {}",
                            self.provider.name()
                        )));
                    }
                    last_error = Some(ResolverError::Rpc {
                        chain: self.provider.name().to_string(),
                        message,
                    });
                }
                Err(_) => {
                    warn!("Transaction send timeout (attempt {})", attempt);
                    last_error = Some(ResolverError::Timeout {
                        operation: "send withdraw".to_string(),
                    });
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay * attempt).await;
            }
        }

        self.nonce_manager.release(nonce).await?;
        crate::metrics::record_tx_failed(self.provider.chain_id());
        Err(last_error.unwrap_or_else(|| ResolverError::Transaction("Unknown error".to_string())))
    }

    fn build_tx(
        &self,
        data: Bytes,
        nonce: u64,
        gas_limit: Option<U256>,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        match gas_price {
            GasPrice::Legacy(price) => {
                let mut tx = TransactionRequest::new()
                    .from(self.wallet.address())
                    .to(self.registry)
                    .data(data)
                    .nonce(nonce)
                    .gas_price(*price)
                    .chain_id(self.provider.chain_id());
                if let Some(gas) = gas_limit {
                    tx = tx.gas(gas);
                }
                TypedTransaction::Legacy(tx)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let mut tx = Eip1559TransactionRequest::new()
                    .from(self.wallet.address())
                    .to(self.registry)
                    .data(data)
                    .nonce(nonce)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                    .chain_id(self.provider.chain_id());
                if let Some(gas) = gas_limit {
                    tx = tx.gas(gas);
                }
                TypedTransaction::Eip1559(tx)
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.nonce_manager.pending_count().await
    }
}
