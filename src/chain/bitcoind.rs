//! bitcoind JSON-RPC client
//!
//! Coin listing uses `scantxoutset`, so no node wallet is needed. Confirmation
//! queries for arbitrary transactions require the node to run with `txindex=1`.

use super::{Coin, SpendInfo, UtxoChain};
use crate::config::BitcoinConfig;
use crate::error::{ResolverError, ResolverResult};

use async_trait::async_trait;
use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::script::Instruction;
use bitcoin::{Amount, Network, Script, Transaction};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Fee rate used when the node has no estimate (regtest, fresh nodes)
const FALLBACK_FEE_RATE: u64 = 2;
/// Confirmation target for `estimatesmartfee`
const FEE_TARGET_BLOCKS: u32 = 6;

// bitcoind RPC error codes
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
const RPC_VERIFY_ERROR: i64 = -25;
const RPC_VERIFY_REJECTED: i64 = -26;
const RPC_VERIFY_ALREADY_IN_CHAIN: i64 = -27;
const RPC_METHOD_NOT_FOUND: i64 = -32601;

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'a str,
    id: &'a str,
    method: &'a str,
    params: Value,
}

/// RPC failure split into transport problems and node-reported errors
enum CallError {
    Transport(ResolverError),
    Node { code: i64, message: String },
}

pub struct BitcoinRpcClient {
    url: String,
    user: Option<String>,
    pass: Option<String>,
    network: Network,
    client: reqwest::Client,
}

impl BitcoinRpcClient {
    pub fn new(config: &BitcoinConfig, timeout: Duration) -> ResolverResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResolverError::ChainConnection {
                chain: "bitcoin".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            url: config.rpc_url.clone(),
            user: config.rpc_user.clone(),
            pass: config.rpc_password.clone(),
            network: config.network.to_network(),
            client,
        })
    }

    async fn raw_call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        let request = JsonRpcRequest {
            jsonrpc: "1.0",
            id: "htlc-resolver",
            method,
            params,
        };

        let mut req = self.client.post(&self.url).json(&request);
        if let (Some(user), Some(pass)) = (&self.user, &self.pass) {
            req = req.basic_auth(user, Some(pass));
        }

        let response = req.send().await.map_err(|e| {
            CallError::Transport(if e.is_timeout() {
                ResolverError::Timeout {
                    operation: format!("bitcoind {}", method),
                }
            } else {
                ResolverError::ChainConnection {
                    chain: "bitcoin".to_string(),
                    message: e.to_string(),
                }
            })
        })?;

        // bitcoind answers RPC errors with HTTP 500 and a JSON body
        let body: Value = response.json().await.map_err(|e| {
            CallError::Transport(ResolverError::Rpc {
                chain: "bitcoin".to_string(),
                message: format!("invalid response to {}: {}", method, e),
            })
        })?;

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(CallError::Node {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }

        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn call(&self, method: &str, params: Value) -> ResolverResult<Value> {
        self.raw_call(method, params).await.map_err(|e| match e {
            CallError::Transport(err) => err,
            CallError::Node { code, message } => ResolverError::Rpc {
                chain: "bitcoin".to_string(),
                message: format!("{} failed ({}): {}", method, code, message),
            },
        })
    }

    async fn tip(&self) -> ResolverResult<u64> {
        let count = self.call("getblockcount", json!([])).await?;
        count.as_u64().ok_or_else(|| malformed("getblockcount"))
    }

    /// Spending txid reported by `gettxspendingprevout` for a single outpoint
    fn spending_txid(result: &Value) -> Option<String> {
        result
            .as_array()?
            .first()?
            .get("spendingtxid")?
            .as_str()
            .map(str::to_string)
    }

    /// Mempool spend of an outpoint, looked up through the node's spend index
    async fn mempool_spend(&self, txid: &str, vout: u32) -> ResolverResult<Option<SpendInfo>> {
        let result = match self
            .raw_call(
                "gettxspendingprevout",
                json!([[{ "txid": txid, "vout": vout }]]),
            )
            .await
        {
            Ok(result) => result,
            Err(CallError::Node { code, .. }) if code == RPC_METHOD_NOT_FOUND => {
                debug!(
                    "Node lacks gettxspendingprevout; mempool spends of {}:{} not visible",
                    txid, vout
                );
                return Ok(None);
            }
            Err(CallError::Node { code, message }) => {
                return Err(ResolverError::Rpc {
                    chain: "bitcoin".to_string(),
                    message: format!("gettxspendingprevout failed ({}): {}", code, message),
                })
            }
            Err(CallError::Transport(err)) => return Err(err),
        };
        let Some(spender) = Self::spending_txid(&result) else {
            return Ok(None);
        };

        let tx = match self
            .raw_call("getrawtransaction", json!([spender, true]))
            .await
        {
            Ok(tx) => tx,
            // mined or evicted since the lookup; the block scan covers the former
            Err(CallError::Node { code, .. }) if code == RPC_INVALID_ADDRESS_OR_KEY => {
                return Ok(None)
            }
            Err(CallError::Node { code, message }) => {
                return Err(ResolverError::Rpc {
                    chain: "bitcoin".to_string(),
                    message: format!("getrawtransaction failed ({}): {}", code, message),
                })
            }
            Err(CallError::Transport(err)) => return Err(err),
        };
        Ok(
            Self::spend_in_txs(std::slice::from_ref(&tx), txid, vout).map(|(spender, witness)| {
                SpendInfo {
                    txid: spender,
                    witness,
                    confirmations: 0,
                }
            }),
        )
    }

    fn spend_in_txs(txs: &[Value], txid: &str, vout: u32) -> Option<(String, Vec<Vec<u8>>)> {
        for tx in txs {
            let Some(inputs) = tx.get("vin").and_then(Value::as_array) else {
                continue;
            };
            for input in inputs {
                let spends = input.get("txid").and_then(Value::as_str) == Some(txid)
                    && input.get("vout").and_then(Value::as_u64) == Some(vout as u64);
                if !spends {
                    continue;
                }
                // P2SH spends carry the same items as scriptSig pushes
                let witness = input
                    .get("txinwitness")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .filter_map(|h| hex::decode(h).ok())
                            .collect()
                    })
                    .or_else(|| {
                        input
                            .get("scriptSig")
                            .and_then(|s| s.get("hex"))
                            .and_then(Value::as_str)
                            .and_then(|h| hex::decode(h).ok())
                            .map(|raw| script_sig_pushes(&raw))
                    })
                    .unwrap_or_default();
                let spender = tx.get("txid").and_then(Value::as_str)?.to_string();
                return Some((spender, witness));
            }
        }
        None
    }
}

fn malformed(method: &str) -> ResolverError {
    ResolverError::Rpc {
        chain: "bitcoin".to_string(),
        message: format!("malformed {} response", method),
    }
}

fn btc_to_sat(value: &Value) -> Option<u64> {
    Amount::from_btc(value.as_f64()?).ok().map(|a| a.to_sat())
}

/// Data pushes of a scriptSig, with small-integer opcodes read as one byte
fn script_sig_pushes(raw: &[u8]) -> Vec<Vec<u8>> {
    Script::from_bytes(raw)
        .instructions()
        .filter_map(Result::ok)
        .map(|ins| match ins {
            Instruction::PushBytes(data) => data.as_bytes().to_vec(),
            Instruction::Op(op) => match op.to_u8() {
                n @ 0x51..=0x60 => vec![n - 0x50],
                _ => Vec::new(),
            },
        })
        .collect()
}

#[async_trait]
impl UtxoChain for BitcoinRpcClient {
    fn name(&self) -> &str {
        "bitcoin"
    }

    fn network(&self) -> Network {
        self.network
    }

    async fn list_coins(&self, address: &str) -> ResolverResult<Vec<Coin>> {
        let descriptor = format!("addr({})", address);
        let result = self
            .call("scantxoutset", json!(["start", [descriptor]]))
            .await?;
        let tip = result
            .get("height")
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed("scantxoutset"))?;

        let unspents = result
            .get("unspents")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("scantxoutset"))?;

        let mut coins = Vec::with_capacity(unspents.len());
        for utxo in unspents {
            let txid = utxo.get("txid").and_then(Value::as_str);
            let vout = utxo.get("vout").and_then(Value::as_u64);
            let value = utxo.get("amount").and_then(btc_to_sat);
            let script = utxo
                .get("scriptPubKey")
                .and_then(Value::as_str)
                .and_then(|s| hex::decode(s).ok());
            let height = utxo.get("height").and_then(Value::as_u64).unwrap_or(tip);

            match (txid, vout, value, script) {
                (Some(txid), Some(vout), Some(value), Some(script_pubkey)) => coins.push(Coin {
                    txid: txid.to_string(),
                    vout: vout as u32,
                    value,
                    script_pubkey,
                    confirmations: (tip + 1).saturating_sub(height) as u32,
                }),
                _ => warn!("Skipping malformed unspent entry for {}", address),
            }
        }

        debug!("Listed {} coins for {}", coins.len(), address);
        Ok(coins)
    }

    async fn estimate_fee_rate(&self) -> ResolverResult<u64> {
        let result = self
            .call("estimatesmartfee", json!([FEE_TARGET_BLOCKS]))
            .await?;

        // BTC per kvB
        match result.get("feerate").and_then(Value::as_f64) {
            Some(btc_per_kvb) => {
                let sat_per_vb = (btc_per_kvb * 100_000.0).ceil() as u64;
                Ok(sat_per_vb.max(1))
            }
            None => {
                debug!("No fee estimate available, using {} sat/vB", FALLBACK_FEE_RATE);
                Ok(FALLBACK_FEE_RATE)
            }
        }
    }

    async fn chain_height(&self) -> ResolverResult<u64> {
        self.tip().await
    }

    async fn chain_time(&self) -> ResolverResult<u64> {
        let info = self.call("getblockchaininfo", json!([])).await?;
        info.get("mediantime")
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed("getblockchaininfo"))
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> ResolverResult<String> {
        match self
            .raw_call("sendrawtransaction", json!([raw_tx_hex]))
            .await
        {
            Ok(txid) => txid
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| malformed("sendrawtransaction")),
            Err(CallError::Transport(err)) => Err(err),
            Err(CallError::Node { code, message }) if code == RPC_VERIFY_ALREADY_IN_CHAIN => {
                debug!("Transaction already confirmed: {}", message);
                let tx: Transaction = deserialize_hex(raw_tx_hex)
                    .map_err(|e| ResolverError::Transaction(e.to_string()))?;
                Ok(tx.compute_txid().to_string())
            }
            Err(CallError::Node { code, message }) => {
                let transient = (code != RPC_VERIFY_REJECTED && code != RPC_VERIFY_ERROR)
                    || message.contains("mempool full")
                    || message.contains("min relay fee not met");
                Err(ResolverError::BroadcastRejected {
                    chain: "bitcoin".to_string(),
                    message: format!("({}) {}", code, message),
                    transient,
                })
            }
        }
    }

    async fn get_confirmations(&self, txid: &str) -> ResolverResult<Option<u32>> {
        match self
            .raw_call("getrawtransaction", json!([txid, true]))
            .await
        {
            Ok(tx) => Ok(Some(
                tx.get("confirmations")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
            )),
            Err(CallError::Node { code, .. }) if code == RPC_INVALID_ADDRESS_OR_KEY => Ok(None),
            Err(CallError::Node { code, message }) => Err(ResolverError::Rpc {
                chain: "bitcoin".to_string(),
                message: format!("getrawtransaction failed ({}): {}", code, message),
            }),
            Err(CallError::Transport(err)) => Err(err),
        }
    }

    async fn find_spend(
        &self,
        txid: &str,
        vout: u32,
        from_height: u64,
    ) -> ResolverResult<Option<SpendInfo>> {
        // Unspent outputs (including mempool spends) short-circuit the scan
        let utxo = self.call("gettxout", json!([txid, vout, true])).await?;
        if !utxo.is_null() {
            return Ok(None);
        }

        if let Some(spend) = self.mempool_spend(txid, vout).await? {
            return Ok(Some(spend));
        }

        let tip = self.tip().await?;
        for height in from_height..=tip {
            let hash = self.call("getblockhash", json!([height])).await?;
            let block = self.call("getblock", json!([hash, 2])).await?;
            let txs = block
                .get("tx")
                .and_then(Value::as_array)
                .ok_or_else(|| malformed("getblock"))?;
            if let Some((spender, witness)) = Self::spend_in_txs(txs, txid, vout) {
                return Ok(Some(SpendInfo {
                    txid: spender,
                    witness,
                    confirmations: (tip + 1 - height) as u32,
                }));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_btc_to_sat() {
        assert_eq!(btc_to_sat(&json!(0.0001)), Some(10_000));
        assert_eq!(btc_to_sat(&json!(1.5)), Some(150_000_000));
        assert_eq!(btc_to_sat(&json!("x")), None);
    }

    #[test]
    fn test_spend_in_txs_extracts_witness() {
        let txs = vec![
            json!({"txid": "aa", "vin": [{"txid": "00", "vout": 0}]}),
            json!({
                "txid": "bb",
                "vin": [{"txid": "ff", "vout": 1, "txinwitness": ["3044", "02", "", "01"]}]
            }),
        ];
        let (spender, witness) = BitcoinRpcClient::spend_in_txs(&txs, "ff", 1).unwrap();
        assert_eq!(spender, "bb");
        assert_eq!(witness, vec![vec![0x30, 0x44], vec![0x02], vec![], vec![0x01]]);

        assert!(BitcoinRpcClient::spend_in_txs(&txs, "ff", 0).is_none());
    }

    #[test]
    fn test_spending_txid_parsing() {
        let spent = json!([{"txid": "ff", "vout": 1, "spendingtxid": "bb"}]);
        assert_eq!(
            BitcoinRpcClient::spending_txid(&spent),
            Some("bb".to_string())
        );

        let unspent = json!([{"txid": "ff", "vout": 1}]);
        assert_eq!(BitcoinRpcClient::spending_txid(&unspent), None);
        assert_eq!(BitcoinRpcClient::spending_txid(&json!([])), None);
    }

    #[test]
    fn test_spend_in_txs_reads_script_sig() {
        // <3044> <02> OP_0 OP_1
        let txs = vec![json!({
            "txid": "cc",
            "vin": [{"txid": "ee", "vout": 0, "scriptSig": {"hex": "02304401020051"}}]
        })];
        let (spender, pushes) = BitcoinRpcClient::spend_in_txs(&txs, "ee", 0).unwrap();
        assert_eq!(spender, "cc");
        assert_eq!(pushes, vec![vec![0x30, 0x44], vec![0x02], vec![], vec![0x01]]);
    }
}
