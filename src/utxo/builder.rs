//! Funding and refund transaction construction and signing

use super::selector::Selection;
use crate::chain::{ChainKind, Coin};
use crate::config::HtlcAddressType;
use crate::error::{ResolverError, ResolverResult};
use crate::htlc::refund_witness;
use crate::swap::state::HtlcRecord;
use crate::signing::SigningProvider;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use std::str::FromStr;

/// HTLC output position in funding transactions
pub const HTLC_OUTPUT_INDEX: u32 = 0;

/// Standardness limit on a single pushed element
const MAX_PUSH_SIZE: usize = 520;

fn parse_txid(txid: &str) -> ResolverResult<Txid> {
    Txid::from_str(txid).map_err(|e| ResolverError::Transaction(format!("bad txid {}: {}", txid, e)))
}

fn unsigned_input(txid: &str, vout: u32, sequence: Sequence) -> ResolverResult<TxIn> {
    Ok(TxIn {
        previous_output: OutPoint {
            txid: parse_txid(txid)?,
            vout,
        },
        script_sig: ScriptBuf::new(),
        sequence,
        witness: Witness::new(),
    })
}

/// Funding transaction paying the HTLC at output 0 and change at output 1
pub fn unsigned_funding(
    selection: &Selection,
    htlc_script_pubkey: &ScriptBuf,
    value: u64,
    change_script_pubkey: &ScriptBuf,
) -> ResolverResult<Transaction> {
    let input = selection
        .inputs
        .iter()
        .map(|coin| unsigned_input(&coin.txid, coin.vout, Sequence::ENABLE_RBF_NO_LOCKTIME))
        .collect::<ResolverResult<Vec<_>>>()?;

    let mut output = vec![TxOut {
        value: Amount::from_sat(value),
        script_pubkey: htlc_script_pubkey.clone(),
    }];
    if selection.change > 0 {
        output.push(TxOut {
            value: Amount::from_sat(selection.change),
            script_pubkey: change_script_pubkey.clone(),
        });
    }

    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output,
    })
}

/// Sign every input of `tx` as a P2WPKH spend of the matching coin
pub async fn sign_p2wpkh_inputs(
    tx: &mut Transaction,
    coins: &[Coin],
    signer: &dyn SigningProvider,
    key_path: &str,
    public_key: &[u8],
) -> ResolverResult<()> {
    if coins.len() != tx.input.len() {
        return Err(ResolverError::Internal(format!(
            "{} coins for {} inputs",
            coins.len(),
            tx.input.len()
        )));
    }

    let mut digests = Vec::with_capacity(coins.len());
    {
        let mut cache = SighashCache::new(&*tx);
        for (index, coin) in coins.iter().enumerate() {
            let sighash = cache
                .p2wpkh_signature_hash(
                    index,
                    Script::from_bytes(&coin.script_pubkey),
                    Amount::from_sat(coin.value),
                    EcdsaSighashType::All,
                )
                .map_err(|e| ResolverError::Transaction(format!("sighash failed: {}", e)))?;
            digests.push(sighash.to_byte_array());
        }
    }

    for (index, digest) in digests.iter().enumerate() {
        let mut signature = signer.sign(ChainKind::Bitcoin, key_path, digest).await?;
        signature.push(EcdsaSighashType::All as u8);
        tx.input[index].witness = Witness::from_slice(&[signature.as_slice(), public_key]);
    }
    Ok(())
}

/// Refund transaction spending the HTLC through its timeout branch
///
/// Relative timelocks go in the input sequence, absolute ones in the
/// transaction lock time.
pub fn unsigned_refund(
    htlc: &HtlcRecord,
    destination: &ScriptBuf,
    fee: u64,
    dust_threshold: u64,
) -> ResolverResult<Transaction> {
    let funding_txid = htlc
        .funding_txid
        .as_deref()
        .ok_or_else(|| ResolverError::Internal("refund of an unfunded HTLC".to_string()))?;
    let vout = htlc.output_index.unwrap_or(HTLC_OUTPUT_INDEX);

    let payout = htlc.value.saturating_sub(fee);
    if payout < dust_threshold {
        return Err(ResolverError::InsufficientFunds {
            available: htlc.value,
            required: fee + dust_threshold,
        });
    }

    let (sequence, lock_time) = if htlc.params.timelock_is_relative {
        (Sequence::from_consensus(htlc.params.timelock), LockTime::ZERO)
    } else {
        (
            Sequence::ENABLE_LOCKTIME_NO_RBF,
            LockTime::from_consensus(htlc.params.timelock),
        )
    };

    Ok(Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![unsigned_input(funding_txid, vout, sequence)?],
        output: vec![TxOut {
            value: Amount::from_sat(payout),
            script_pubkey: destination.clone(),
        }],
    })
}

/// Sign a refund and attach the timeout-branch witness or scriptSig
pub async fn sign_refund(
    tx: &mut Transaction,
    htlc: &HtlcRecord,
    address_type: HtlcAddressType,
    signer: &dyn SigningProvider,
    public_key: &[u8],
) -> ResolverResult<()> {
    let script = htlc.script()?;
    let redeem = Script::from_bytes(&script);

    let digest = {
        let mut cache = SighashCache::new(&*tx);
        match address_type {
            HtlcAddressType::P2wsh => cache
                .p2wsh_signature_hash(0, redeem, Amount::from_sat(htlc.value), EcdsaSighashType::All)
                .map_err(|e| ResolverError::Transaction(format!("sighash failed: {}", e)))?
                .to_byte_array(),
            HtlcAddressType::P2sh => cache
                .legacy_signature_hash(0, redeem, EcdsaSighashType::All.to_u32())
                .map_err(|e| ResolverError::Transaction(format!("sighash failed: {}", e)))?
                .to_byte_array(),
        }
    };

    let mut signature = signer
        .sign(ChainKind::Bitcoin, &htlc.refund_key_path, &digest)
        .await?;
    signature.push(EcdsaSighashType::All as u8);

    let items = refund_witness(&signature, public_key, &script);
    match address_type {
        HtlcAddressType::P2wsh => tx.input[0].witness = Witness::from_slice(&items),
        HtlcAddressType::P2sh => {
            tx.input[0].script_sig = script_sig(&items)?;
        }
    }
    Ok(())
}

/// Serialize stack items as data pushes
fn script_sig(items: &[Vec<u8>]) -> ResolverResult<ScriptBuf> {
    let mut builder = Builder::new();
    for item in items {
        if item.len() > MAX_PUSH_SIZE {
            return Err(ResolverError::Script(format!(
                "push of {} bytes exceeds the element limit",
                item.len()
            )));
        }
        let push = PushBytesBuf::try_from(item.clone())
            .map_err(|e| ResolverError::Script(format!("bad push: {}", e)))?;
        builder = builder.push_slice(push);
    }
    Ok(builder.into_script())
}
