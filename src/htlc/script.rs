//! HTLC redeem script construction, parsing and address derivation

use crate::config::HtlcAddressType;
use crate::error::{ResolverError, ResolverResult};

use bitcoin::opcodes::all::*;
use bitcoin::opcodes::Opcode;
use bitcoin::script::{Builder, Instruction, Instructions, PushBytesBuf};
use bitcoin::{Address, Network, Script, ScriptBuf};
use serde::{Deserialize, Serialize};

/// Marker byte for a 2-byte little-endian timelock
const TIMELOCK_MARKER_U16: u8 = 0xfd;
/// Marker byte for a 4-byte little-endian timelock
const TIMELOCK_MARKER_U32: u8 = 0xfe;

/// Parameters of one hash-time-locked output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcParams {
    pub hashlock: [u8; 32],
    pub timelock: u32,
    pub timelock_is_relative: bool,
    pub recipient_pubkey_hash: [u8; 20],
    pub refund_pubkey_hash: [u8; 20],
}

impl HtlcParams {
    pub fn validate(&self) -> ResolverResult<()> {
        if self.timelock == 0 {
            return Err(ResolverError::InvalidHtlcParams(
                "timelock must be positive".to_string(),
            ));
        }
        if self.recipient_pubkey_hash == self.refund_pubkey_hash {
            return Err(ResolverError::InvalidHtlcParams(
                "recipient and refund pubkey hashes must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// Network and output type used to derive locking addresses
#[derive(Debug, Clone, Copy)]
pub struct ChainParams {
    pub network: Network,
    pub address_type: HtlcAddressType,
}

/// A derived locking address with its output script
#[derive(Debug, Clone)]
pub struct LockingAddress {
    pub address: String,
    pub script_pubkey: ScriptBuf,
}

/// Encode a timelock using the compact size form
pub fn encode_timelock(timelock: u32) -> Vec<u8> {
    if timelock < TIMELOCK_MARKER_U16 as u32 {
        vec![timelock as u8]
    } else if timelock <= u16::MAX as u32 {
        let mut out = vec![TIMELOCK_MARKER_U16];
        out.extend_from_slice(&(timelock as u16).to_le_bytes());
        out
    } else {
        let mut out = vec![TIMELOCK_MARKER_U32];
        out.extend_from_slice(&timelock.to_le_bytes());
        out
    }
}

/// Decode a compact size timelock, rejecting non-canonical forms
pub fn decode_timelock(bytes: &[u8]) -> ResolverResult<u32> {
    let value = match bytes {
        [b] if *b < TIMELOCK_MARKER_U16 => *b as u32,
        [TIMELOCK_MARKER_U16, lo, hi] => {
            let v = u16::from_le_bytes([*lo, *hi]) as u32;
            if v < TIMELOCK_MARKER_U16 as u32 {
                return Err(ResolverError::Script(format!(
                    "non-canonical 2-byte timelock {}",
                    v
                )));
            }
            v
        }
        [TIMELOCK_MARKER_U32, a, b, c, d] => {
            let v = u32::from_le_bytes([*a, *b, *c, *d]);
            if v <= u16::MAX as u32 {
                return Err(ResolverError::Script(format!(
                    "non-canonical 4-byte timelock {}",
                    v
                )));
            }
            v
        }
        _ => {
            return Err(ResolverError::Script(format!(
                "malformed timelock encoding {}",
                hex::encode(bytes)
            )))
        }
    };
    Ok(value)
}

fn push_bytes(data: &[u8]) -> ResolverResult<PushBytesBuf> {
    PushBytesBuf::try_from(data.to_vec())
        .map_err(|e| ResolverError::Script(format!("cannot push {} bytes: {}", data.len(), e)))
}

/// Build the HTLC redeem script
///
/// ```text
/// OP_IF
///     OP_SHA256 <hashlock> OP_EQUALVERIFY OP_DUP OP_HASH160 <recipient>
/// OP_ELSE
///     <timelock> OP_CSV|OP_CLTV OP_DROP OP_DUP OP_HASH160 <refund>
/// OP_ENDIF
/// OP_EQUALVERIFY OP_CHECKSIG
/// ```
pub fn build_script(params: &HtlcParams) -> ResolverResult<Vec<u8>> {
    params.validate()?;

    let timelock_op = if params.timelock_is_relative {
        OP_CSV
    } else {
        OP_CLTV
    };

    let script = Builder::new()
        .push_opcode(OP_IF)
        .push_opcode(OP_SHA256)
        .push_slice(push_bytes(&params.hashlock)?)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(push_bytes(&params.recipient_pubkey_hash)?)
        .push_opcode(OP_ELSE)
        .push_slice(push_bytes(&encode_timelock(params.timelock))?)
        .push_opcode(timelock_op)
        .push_opcode(OP_DROP)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(push_bytes(&params.refund_pubkey_hash)?)
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script();

    Ok(script.into_bytes())
}

/// Whether the timelock push reads back as the same positive number when a
/// node evaluates it as a script integer
pub fn timelock_is_script_num_safe(timelock: u32) -> bool {
    let pushed = encode_timelock(timelock);
    let minimal = Builder::new().push_int(timelock as i64).into_script();
    let mut expected = Vec::new();
    for ins in minimal.instructions().flatten() {
        match ins {
            Instruction::PushBytes(data) => expected = data.as_bytes().to_vec(),
            // OP_1..OP_16 carry their value in the opcode
            Instruction::Op(_) => return false,
        }
    }
    pushed == expected
}

/// Instruction cursor for template matching
struct Reader<'a> {
    instructions: Instructions<'a>,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            instructions: Script::from_bytes(bytes).instructions(),
        }
    }

    fn next(&mut self) -> ResolverResult<Instruction<'a>> {
        match self.instructions.next() {
            Some(Ok(ins)) => Ok(ins),
            Some(Err(e)) => Err(ResolverError::Script(format!("malformed script: {}", e))),
            None => Err(ResolverError::Script("unexpected end of script".to_string())),
        }
    }

    fn opcode(&mut self, expected: Opcode) -> ResolverResult<()> {
        match self.next()? {
            Instruction::Op(op) if op == expected => Ok(()),
            other => Err(ResolverError::Script(format!(
                "expected {}, found {:?}",
                expected, other
            ))),
        }
    }

    fn any_of(&mut self, choices: &[Opcode]) -> ResolverResult<Opcode> {
        match self.next()? {
            Instruction::Op(op) if choices.contains(&op) => Ok(op),
            other => Err(ResolverError::Script(format!("unexpected {:?}", other))),
        }
    }

    fn push(&mut self) -> ResolverResult<&'a [u8]> {
        match self.next()? {
            Instruction::PushBytes(data) if !data.is_empty() => Ok(data.as_bytes()),
            other => Err(ResolverError::Script(format!(
                "expected data push, found {:?}",
                other
            ))),
        }
    }

    fn fixed<const N: usize>(&mut self) -> ResolverResult<[u8; N]> {
        let data = self.push()?;
        data.try_into().map_err(|_| {
            ResolverError::Script(format!("expected {}-byte push, got {}", N, data.len()))
        })
    }

    fn finish(&mut self) -> ResolverResult<()> {
        match self.instructions.next() {
            None => Ok(()),
            Some(_) => Err(ResolverError::Script("trailing bytes after script".to_string())),
        }
    }
}

/// Parse a redeem script produced by [`build_script`] back into its parameters
pub fn parse_script(script: &[u8]) -> ResolverResult<HtlcParams> {
    let mut r = Reader::new(script);
    r.opcode(OP_IF)?;
    r.opcode(OP_SHA256)?;
    let hashlock = r.fixed::<32>()?;
    r.opcode(OP_EQUALVERIFY)?;
    r.opcode(OP_DUP)?;
    r.opcode(OP_HASH160)?;
    let recipient_pubkey_hash = r.fixed::<20>()?;
    r.opcode(OP_ELSE)?;
    let timelock = decode_timelock(r.push()?)?;
    let timelock_op = r.any_of(&[OP_CSV, OP_CLTV])?;
    r.opcode(OP_DROP)?;
    r.opcode(OP_DUP)?;
    r.opcode(OP_HASH160)?;
    let refund_pubkey_hash = r.fixed::<20>()?;
    r.opcode(OP_ENDIF)?;
    r.opcode(OP_EQUALVERIFY)?;
    r.opcode(OP_CHECKSIG)?;
    r.finish()?;

    let params = HtlcParams {
        hashlock,
        timelock,
        timelock_is_relative: timelock_op == OP_CSV,
        recipient_pubkey_hash,
        refund_pubkey_hash,
    };
    params.validate()?;
    Ok(params)
}

/// Derive the locking address for a redeem script
pub fn locking_address(script: &[u8], chain: ChainParams) -> ResolverResult<LockingAddress> {
    let script = ScriptBuf::from_bytes(script.to_vec());
    let address = match chain.address_type {
        HtlcAddressType::P2wsh => Address::p2wsh(&script, chain.network),
        HtlcAddressType::P2sh => Address::p2sh(&script, chain.network)
            .map_err(|e| ResolverError::Script(format!("P2SH derivation failed: {}", e)))?,
    };

    Ok(LockingAddress {
        address: address.to_string(),
        script_pubkey: address.script_pubkey(),
    })
}
