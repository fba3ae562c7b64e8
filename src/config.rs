//! Configuration management for the HTLC resolver
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::htlc::timelock_is_script_num_safe;
use crate::swap::destination::MAX_RELATIVE_TIMELOCK_BLOCKS;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub resolver: ResolverConfig,
    pub profitability: ProfitabilityConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub source_chain: SourceChainConfig,
    pub bitcoin: BitcoinConfig,
    pub signer: SignerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    pub instance_id: String,
    pub max_concurrent_executions: usize,
    pub poll_interval_ms: u64,
    pub scan_interval_secs: u64,
    pub refund_interval_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub rpc_timeout_ms: u64,
    pub funding_confirmations: u32,
    pub claim_confirmations: u32,
    pub expiry_safety_margin_secs: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfitabilityConfig {
    pub min_profit_threshold: i64,
    pub max_risk: f64,
    pub min_time_to_expiry_secs: u64,
    pub urgency_horizon_secs: u64,
    pub max_order_size: u64,
    pub time_risk_weight: f64,
    pub size_risk_weight: f64,
    /// Destination fee rate (sat/vB) above which orders are deferred
    pub max_fee_rate: u64,
    pub defer_secs: u64,
    pub min_safety_deposit_bps: u16,
    pub max_capital_per_order: u64,
    /// Multiplier converting destination-chain fees into resolver fee units
    pub destination_fee_conversion: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `postgres://...` or `memory://` for a non-durable development store
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub registry_address: String,
    pub confirmation_blocks: u64,
    pub scan_window_blocks: u64,
    pub max_blocks_per_query: u64,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    /// Environment variable holding the resolver's EVM private key
    pub private_key_env: String,
    /// Wei per resolver fee unit, used to express completion gas costs
    #[serde(default = "default_fee_unit_wei")]
    pub fee_unit_wei: u64,
}

fn default_fee_unit_wei() -> u64 {
    1_000_000_000
}

fn default_block_interval_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinConfig {
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub network: BitcoinNetwork,
    /// Derivation path of the resolver's funding wallet key
    pub wallet_key_path: String,
    /// Account prefix for per-order refund keys
    pub refund_key_prefix: String,
    pub htlc_timelock_blocks: u32,
    /// Expected seconds per block, used to compare timelocks with deadlines
    #[serde(default = "default_block_interval_secs")]
    pub block_interval_secs: u64,
    pub dust_threshold: u64,
    pub htlc_address_type: HtlcAddressType,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BitcoinNetwork {
    Bitcoin,
    Testnet,
    Signet,
    Regtest,
}

impl BitcoinNetwork {
    pub fn to_network(self) -> bitcoin::Network {
        match self {
            BitcoinNetwork::Bitcoin => bitcoin::Network::Bitcoin,
            BitcoinNetwork::Testnet => bitcoin::Network::Testnet,
            BitcoinNetwork::Signet => bitcoin::Network::Signet,
            BitcoinNetwork::Regtest => bitcoin::Network::Regtest,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HtlcAddressType {
    P2wsh,
    P2sh,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum SignerConfig {
    Local {
        /// Environment variable holding the hex-encoded BIP32 seed
        seed_env: String,
    },
    Remote {
        url: String,
        api_key_env: Option<String>,
        timeout_ms: u64,
    },
}

impl Settings {
    /// Load settings from the file named by `RESOLVER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("RESOLVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from TOML text
    pub fn from_toml(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.resolver.max_concurrent_executions == 0 {
            anyhow::bail!("max_concurrent_executions must be at least 1");
        }
        if self.resolver.claim_confirmations == 0 {
            anyhow::bail!("claim_confirmations must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.profitability.max_risk) {
            anyhow::bail!(
                "max_risk must be within [0, 1], got {}",
                self.profitability.max_risk
            );
        }
        if self.profitability.min_safety_deposit_bps > 10_000 {
            anyhow::bail!("min_safety_deposit_bps cannot exceed 10000");
        }
        if self.bitcoin.htlc_timelock_blocks == 0 {
            anyhow::bail!("htlc_timelock_blocks must be positive");
        }
        if self.bitcoin.htlc_timelock_blocks > MAX_RELATIVE_TIMELOCK_BLOCKS {
            anyhow::bail!(
                "htlc_timelock_blocks {} exceeds the relative lock time range",
                self.bitcoin.htlc_timelock_blocks
            );
        }
        if !timelock_is_script_num_safe(self.bitcoin.htlc_timelock_blocks) {
            tracing::warn!(
                "htlc_timelock_blocks {} is not pushed as a positive script number; \
                 nodes enforcing CHECKSEQUENCEVERIFY will reject the refund branch",
                self.bitcoin.htlc_timelock_blocks
            );
        }
        if self.bitcoin.block_interval_secs == 0 {
            anyhow::bail!("block_interval_secs must be positive");
        }
        if self.bitcoin.dust_threshold == 0 {
            anyhow::bail!("dust_threshold must be positive");
        }
        if self.source_chain.rpc_urls.is_empty() {
            anyhow::bail!(
                "Source chain {} has no RPC URLs configured",
                self.source_chain.name
            );
        }
        if self.source_chain.registry_address.is_empty() {
            tracing::warn!(
                "Source chain {} has no registry address - order discovery disabled",
                self.source_chain.name
            );
        }

        Ok(())
    }
}

lazy_static! {
    static ref ENV_VAR_PATTERN: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const SAMPLE: &str = r#"
[resolver]
instance_id = "resolver-1"
max_concurrent_executions = 3
poll_interval_ms = 500
scan_interval_secs = 30
refund_interval_secs = 60
max_retries = 3
retry_base_delay_ms = 10
retry_max_delay_ms = 100
rpc_timeout_ms = 5000
funding_confirmations = 1
claim_confirmations = 1
expiry_safety_margin_secs = 600
health_check_interval_secs = 30

[profitability]
min_profit_threshold = 1
max_risk = 0.8
min_time_to_expiry_secs = 1800
urgency_horizon_secs = 86400
max_order_size = 100000000
time_risk_weight = 0.6
size_risk_weight = 0.4
max_fee_rate = 200
defer_secs = 120
min_safety_deposit_bps = 500
max_capital_per_order = 500000000
destination_fee_conversion = 1.0

[database]
url = "memory://"
max_connections = 5
min_connections = 1

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[logging]
format = "json"

[source_chain]
chain_id = 11155111
name = "sepolia"
rpc_urls = ["https://rpc.${RESOLVER_TEST_HOST}/v1"]
registry_address = "0x0000000000000000000000000000000000000001"
confirmation_blocks = 12
scan_window_blocks = 500
max_blocks_per_query = 1000
gas_price_strategy = "eip1559"
max_gas_price_gwei = 200
private_key_env = "RESOLVER_EVM_KEY"

[bitcoin]
rpc_url = "http://127.0.0.1:18443"
network = "regtest"
wallet_key_path = "m/84'/1'/0'/0/0"
refund_key_prefix = "m/84'/1'/1'/0"
htlc_timelock_blocks = 144
dust_threshold = 546
htlc_address_type = "p2wsh"

[signer]
backend = "local"
seed_env = "RESOLVER_SEED"
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file() {
        env::set_var("RESOLVER_TEST_HOST", "example.org");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.resolver.max_concurrent_executions, 3);
        assert_eq!(settings.source_chain.rpc_urls[0], "https://rpc.example.org/v1");
        assert_eq!(settings.bitcoin.network.to_network(), bitcoin::Network::Regtest);
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert!(settings.database.is_memory());
        assert!(matches!(settings.signer, SignerConfig::Local { .. }));
    }

    #[test]
    fn test_rejects_out_of_range_risk() {
        let bad = SAMPLE.replace("max_risk = 0.8", "max_risk = 1.5");
        assert!(Settings::from_toml(&bad).is_err());
    }

    #[test]
    fn test_timelock_range() {
        let bad = SAMPLE.replace("htlc_timelock_blocks = 144", "htlc_timelock_blocks = 70000");
        assert!(Settings::from_toml(&bad).is_err());

        // loads with a warning only
        let settings = Settings::from_toml(SAMPLE).unwrap();
        assert_eq!(settings.bitcoin.htlc_timelock_blocks, 144);
        assert_eq!(settings.bitcoin.block_interval_secs, 600);
        let safe = SAMPLE.replace("htlc_timelock_blocks = 144", "htlc_timelock_blocks = 100");
        assert!(Settings::from_toml(&safe).is_ok());
    }

    #[test]
    fn test_rejects_zero_timelock() {
        let bad = SAMPLE.replace("htlc_timelock_blocks = 144", "htlc_timelock_blocks = 0");
        assert!(Settings::from_toml(&bad).is_err());
    }
}
