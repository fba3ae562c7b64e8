//! Witness assembly, secret extraction and template evaluation

use super::script::decode_timelock;
use crate::error::{ResolverError, ResolverResult};

use bitcoin::hashes::{hash160, sha256, Hash};
use bitcoin::opcodes::all::*;
use bitcoin::script::{Instruction, Script};

/// nSequence bit that disables relative locktime
const SEQUENCE_DISABLE_FLAG: u32 = 1 << 31;
/// nSequence bit selecting time-based relative locktime
const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;
const SEQUENCE_MASK: u32 = 0x0000_ffff;
/// Locktime values at or above this are timestamps
const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Which branch of the HTLC a witness satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendPath {
    Claim,
    Refund,
}

/// Transaction fields the timelock opcodes inspect
#[derive(Debug, Clone, Copy)]
pub struct SpendContext {
    pub tx_version: i32,
    pub input_sequence: u32,
    pub tx_lock_time: u32,
}

/// Witness stack for the claim branch: `<sig> <pubkey> <secret> 1 <script>`
pub fn claim_witness(signature: &[u8], pubkey: &[u8], secret: &[u8], script: &[u8]) -> Vec<Vec<u8>> {
    vec![
        signature.to_vec(),
        pubkey.to_vec(),
        secret.to_vec(),
        vec![0x01],
        script.to_vec(),
    ]
}

/// Witness stack for the refund branch: `<sig> <pubkey> <> <script>`
pub fn refund_witness(signature: &[u8], pubkey: &[u8], script: &[u8]) -> Vec<Vec<u8>> {
    vec![signature.to_vec(), pubkey.to_vec(), Vec::new(), script.to_vec()]
}

/// Pull the preimage out of a claim witness, checking it against the hashlock
pub fn extract_secret(witness: &[Vec<u8>], hashlock: &[u8; 32]) -> Option<[u8; 32]> {
    if witness.len() != 5 || witness[3] != [0x01] {
        return None;
    }
    let secret: [u8; 32] = witness[2].as_slice().try_into().ok()?;
    if sha256::Hash::hash(&secret).to_byte_array() == *hashlock {
        Some(secret)
    } else {
        None
    }
}

fn is_true(item: &[u8]) -> bool {
    match item.split_last() {
        None => false,
        // negative zero is false
        Some((last, rest)) => rest.iter().any(|b| *b != 0) || (*last != 0 && *last != 0x80),
    }
}

fn script_err(msg: &str) -> ResolverError {
    ResolverError::Script(msg.to_string())
}

fn check_sequence(required: u32, ctx: &SpendContext) -> ResolverResult<()> {
    if required & SEQUENCE_DISABLE_FLAG != 0 {
        return Ok(());
    }
    if ctx.tx_version < 2 {
        return Err(script_err("relative timelock requires tx version 2"));
    }
    if ctx.input_sequence & SEQUENCE_DISABLE_FLAG != 0 {
        return Err(script_err("input sequence disables relative timelock"));
    }
    if (required & SEQUENCE_TYPE_FLAG) != (ctx.input_sequence & SEQUENCE_TYPE_FLAG) {
        return Err(script_err("relative timelock type mismatch"));
    }
    if (required & SEQUENCE_MASK) > (ctx.input_sequence & SEQUENCE_MASK) {
        return Err(script_err("relative timelock not satisfied"));
    }
    Ok(())
}

fn check_lock_time(required: u32, ctx: &SpendContext) -> ResolverResult<()> {
    if (required < LOCKTIME_THRESHOLD) != (ctx.tx_lock_time < LOCKTIME_THRESHOLD) {
        return Err(script_err("absolute timelock type mismatch"));
    }
    if required > ctx.tx_lock_time {
        return Err(script_err("absolute timelock not satisfied"));
    }
    if ctx.input_sequence == u32::MAX {
        return Err(script_err("final sequence disables absolute timelock"));
    }
    Ok(())
}

/// Evaluate the HTLC template against a witness stack (script excluded)
///
/// `check_sig(signature, pubkey)` verifies a signature over the spending
/// transaction. Only the opcodes emitted by `build_script` are supported.
pub fn evaluate<F>(
    script: &[u8],
    witness_stack: &[Vec<u8>],
    ctx: &SpendContext,
    check_sig: F,
) -> ResolverResult<SpendPath>
where
    F: Fn(&[u8], &[u8]) -> bool,
{
    let mut stack: Vec<Vec<u8>> = witness_stack.to_vec();
    let mut exec: Vec<bool> = Vec::new();
    let mut path: Option<SpendPath> = None;

    let pop = |stack: &mut Vec<Vec<u8>>| -> ResolverResult<Vec<u8>> {
        stack.pop().ok_or_else(|| script_err("stack underflow"))
    };

    for ins in Script::from_bytes(script).instructions() {
        let ins = ins.map_err(|e| ResolverError::Script(format!("malformed script: {}", e)))?;
        let executing = exec.iter().all(|e| *e);

        let op = match ins {
            Instruction::PushBytes(data) => {
                if executing {
                    stack.push(data.as_bytes().to_vec());
                }
                continue;
            }
            Instruction::Op(op) => op,
        };

        match op {
            OP_IF => {
                let mut branch = false;
                if executing {
                    branch = is_true(&pop(&mut stack)?);
                    if path.is_none() {
                        path = Some(if branch {
                            SpendPath::Claim
                        } else {
                            SpendPath::Refund
                        });
                    }
                }
                exec.push(branch);
            }
            OP_ELSE => {
                let top = exec.last_mut().ok_or_else(|| script_err("ELSE without IF"))?;
                *top = !*top;
            }
            OP_ENDIF => {
                exec.pop().ok_or_else(|| script_err("ENDIF without IF"))?;
            }
            _ if !executing => {}
            OP_SHA256 => {
                let item = pop(&mut stack)?;
                stack.push(sha256::Hash::hash(&item).to_byte_array().to_vec());
            }
            OP_HASH160 => {
                let item = pop(&mut stack)?;
                stack.push(hash160::Hash::hash(&item).to_byte_array().to_vec());
            }
            OP_DUP => {
                let top = stack.last().cloned().ok_or_else(|| script_err("stack underflow"))?;
                stack.push(top);
            }
            OP_DROP => {
                pop(&mut stack)?;
            }
            OP_EQUALVERIFY => {
                let a = pop(&mut stack)?;
                let b = pop(&mut stack)?;
                if a != b {
                    return Err(script_err("EQUALVERIFY failed"));
                }
            }
            OP_CSV => {
                let top = stack.last().ok_or_else(|| script_err("stack underflow"))?;
                check_sequence(decode_timelock(top)?, ctx)?;
            }
            OP_CLTV => {
                let top = stack.last().ok_or_else(|| script_err("stack underflow"))?;
                check_lock_time(decode_timelock(top)?, ctx)?;
            }
            OP_CHECKSIG => {
                let pubkey = pop(&mut stack)?;
                let sig = pop(&mut stack)?;
                let ok = check_sig(&sig, &pubkey);
                stack.push(if ok { vec![0x01] } else { Vec::new() });
            }
            other => {
                return Err(ResolverError::Script(format!(
                    "unsupported opcode {}",
                    other
                )))
            }
        }
    }

    if !exec.is_empty() {
        return Err(script_err("unbalanced conditional"));
    }
    match stack.last() {
        Some(top) if is_true(top) => path.ok_or_else(|| script_err("no branch taken")),
        _ => Err(script_err("script evaluated to false")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::htlc::script::{build_script, HtlcParams};

    const PUBKEY_CLAIM: &[u8] = &[0x02; 33];
    const PUBKEY_REFUND: &[u8] = &[0x03; 33];
    const GOOD_SIG: &[u8] = &[0x30, 0x44, 0x01];

    fn pkh(pubkey: &[u8]) -> [u8; 20] {
        hash160::Hash::hash(pubkey).to_byte_array()
    }

    fn setup(relative: bool) -> (Vec<u8>, [u8; 32]) {
        let secret = [0x5a; 32];
        let params = HtlcParams {
            hashlock: sha256::Hash::hash(&secret).to_byte_array(),
            timelock: 10,
            timelock_is_relative: relative,
            recipient_pubkey_hash: pkh(PUBKEY_CLAIM),
            refund_pubkey_hash: pkh(PUBKEY_REFUND),
        };
        (build_script(&params).unwrap(), secret)
    }

    fn sig_ok(sig: &[u8], _pubkey: &[u8]) -> bool {
        sig == GOOD_SIG
    }

    fn strip_script(witness: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        witness[..witness.len() - 1].to_vec()
    }

    const ANY_CTX: SpendContext = SpendContext {
        tx_version: 2,
        input_sequence: 0xffff_fffe,
        tx_lock_time: 0,
    };

    #[test]
    fn test_claim_branch_with_correct_secret() {
        let (script, secret) = setup(true);
        let witness = strip_script(claim_witness(GOOD_SIG, PUBKEY_CLAIM, &secret, &script));
        assert_eq!(
            evaluate(&script, &witness, &ANY_CTX, sig_ok).unwrap(),
            SpendPath::Claim
        );
    }

    #[test]
    fn test_wrong_secret_satisfies_neither_branch() {
        let (script, _) = setup(true);
        let wrong = [0x00; 32];
        let witness = strip_script(claim_witness(GOOD_SIG, PUBKEY_CLAIM, &wrong, &script));
        assert!(evaluate(&script, &witness, &ANY_CTX, sig_ok).is_err());

        // a refund-shaped witness with the claim key cannot take the refund path either
        let witness = strip_script(refund_witness(GOOD_SIG, PUBKEY_CLAIM, &script));
        let ctx = SpendContext {
            input_sequence: 10,
            ..ANY_CTX
        };
        assert!(evaluate(&script, &witness, &ctx, sig_ok).is_err());
    }

    #[test]
    fn test_refund_branch_after_relative_timelock() {
        let (script, _) = setup(true);
        let witness = strip_script(refund_witness(GOOD_SIG, PUBKEY_REFUND, &script));

        let ready = SpendContext {
            tx_version: 2,
            input_sequence: 10,
            tx_lock_time: 0,
        };
        assert_eq!(
            evaluate(&script, &witness, &ready, sig_ok).unwrap(),
            SpendPath::Refund
        );

        let early = SpendContext {
            input_sequence: 9,
            ..ready
        };
        assert!(evaluate(&script, &witness, &early, sig_ok).is_err());
    }

    #[test]
    fn test_refund_branch_after_absolute_timelock() {
        let (script, _) = setup(false);
        let witness = strip_script(refund_witness(GOOD_SIG, PUBKEY_REFUND, &script));

        let ready = SpendContext {
            tx_version: 2,
            input_sequence: 0xffff_fffe,
            tx_lock_time: 10,
        };
        assert_eq!(
            evaluate(&script, &witness, &ready, sig_ok).unwrap(),
            SpendPath::Refund
        );
        let early = SpendContext {
            tx_lock_time: 9,
            ..ready
        };
        assert!(evaluate(&script, &witness, &early, sig_ok).is_err());
    }

    #[test]
    fn test_bad_signature_fails() {
        let (script, secret) = setup(true);
        let witness = strip_script(claim_witness(&[0x30], PUBKEY_CLAIM, &secret, &script));
        assert!(evaluate(&script, &witness, &ANY_CTX, sig_ok).is_err());
    }

    #[test]
    fn test_extract_secret() {
        let (script, secret) = setup(true);
        let hashlock = sha256::Hash::hash(&secret).to_byte_array();
        let witness = claim_witness(GOOD_SIG, PUBKEY_CLAIM, &secret, &script);
        assert_eq!(extract_secret(&witness, &hashlock), Some(secret));

        let refund = refund_witness(GOOD_SIG, PUBKEY_REFUND, &script);
        assert_eq!(extract_secret(&refund, &hashlock), None);

        let forged = claim_witness(GOOD_SIG, PUBKEY_CLAIM, &[0x01; 32], &script);
        assert_eq!(extract_secret(&forged, &hashlock), None);
    }
}
