//! Gas estimation for source-chain settlement

use crate::chain::{ChainProvider, GasPrice};
use crate::error::ResolverResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::{debug, warn};

/// Gas used by `withdraw` when estimation is unavailable
const DEFAULT_WITHDRAW_GAS: u64 = 120_000;

pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Gas limit for a `withdraw` call, buffered
    pub async fn estimate_withdraw_gas(
        &self,
        provider: &ChainProvider,
        tx: &TypedTransaction,
    ) -> U256 {
        let base_gas = match provider.estimate_gas(tx).await {
            Ok(gas) => gas,
            Err(e) => {
                // reverts until the caller is the matched resolver, so fall back
                warn!("Gas estimation failed, using default: {}", e);
                U256::from(DEFAULT_WITHDRAW_GAS)
            }
        };
        base_gas + base_gas * self.gas_limit_buffer_percent / 100
    }

    /// Buffered gas limit for cost estimates made before a transaction exists
    pub fn default_withdraw_gas(&self) -> U256 {
        let base_gas = U256::from(DEFAULT_WITHDRAW_GAS);
        base_gas + base_gas * self.gas_limit_buffer_percent / 100
    }

    /// Get buffered gas price for the chain
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> ResolverResult<GasPrice> {
        let gas_price = provider.get_gas_price().await?;

        let buffered = match gas_price {
            GasPrice::Legacy(price) => {
                GasPrice::Legacy(price + price * self.gas_price_buffer_percent / 100)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: max_fee_per_gas
                    + max_fee_per_gas * self.gas_price_buffer_percent / 100,
                max_priority_fee_per_gas: max_priority_fee_per_gas
                    + max_priority_fee_per_gas * self.gas_price_buffer_percent / 100,
            },
        };

        debug!("Gas price for chain {}: {:?}", provider.name(), buffered);
        Ok(buffered)
    }

    /// Price bumped by `factor` percent, for replacing an underpriced transaction
    pub fn speed_up_gas_price(&self, current: &GasPrice, factor: u64) -> GasPrice {
        match current {
            GasPrice::Legacy(price) => GasPrice::Legacy(*price * factor / 100),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: *max_fee_per_gas * factor / 100,
                max_priority_fee_per_gas: *max_priority_fee_per_gas * factor / 100,
            },
        }
    }

    /// Worst-case cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        match gas_price {
            GasPrice::Legacy(price) => gas_limit * *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => gas_limit * *max_fee_per_gas,
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}
