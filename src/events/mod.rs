//! Order registry events and ABI helpers
//!
//! The registry emits
//! `OrderCreated(bytes32 indexed orderHash, address indexed maker, address sourceAsset,
//! uint256 sourceAmount, uint256 destinationChainId, bytes destinationExecutionParams,
//! uint256 resolverFeeAmount, uint256 expiryTime, bytes32 hashlock)`
//! and exposes `getOrderStatus(bytes32) -> uint8` and `withdraw(bytes32,bytes32)`.

use crate::error::{ResolverError, ResolverResult};
use crate::swap::order::{Order, OrderHash};

use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::utils::id;
use lazy_static::lazy_static;
use std::str::FromStr;

pub const ORDER_CREATED_SIGNATURE: &str =
    "OrderCreated(bytes32,address,address,uint256,uint256,bytes,uint256,uint256,bytes32)";
pub const GET_ORDER_STATUS_SIGNATURE: &str = "getOrderStatus(bytes32)";
pub const WITHDRAW_SIGNATURE: &str = "withdraw(bytes32,bytes32)";

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use ethers::types::H256;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref ORDER_CREATED: H256 =
            H256::from(ethers::utils::keccak256(super::ORDER_CREATED_SIGNATURE));
    }
}

lazy_static! {
    /// Non-indexed fields of `OrderCreated`, in data order
    static ref ORDER_CREATED_DATA: Vec<ParamType> = vec![
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Bytes,
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::FixedBytes(32),
    ];
}

/// On-chain order status reported by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryStatus {
    Unknown,
    Pending,
    Matched,
    Claimed,
    Refunded,
}

impl RegistryStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => RegistryStatus::Pending,
            2 => RegistryStatus::Matched,
            3 => RegistryStatus::Claimed,
            4 => RegistryStatus::Refunded,
            _ => RegistryStatus::Unknown,
        }
    }

    /// Maker funds are still escrowed by the registry
    pub fn is_locked(&self) -> bool {
        matches!(self, RegistryStatus::Pending | RegistryStatus::Matched)
    }
}

/// Parses registry logs into orders
pub struct EventParser {
    registry: Address,
}

impl EventParser {
    pub fn new(registry_address: &str) -> ResolverResult<Self> {
        let registry = Address::from_str(registry_address)
            .map_err(|e| ResolverError::Config(format!("Invalid registry address: {}", e)))?;
        Ok(Self { registry })
    }

    pub fn registry(&self) -> Address {
        self.registry
    }

    /// Log filter for `OrderCreated` over a block range
    pub fn order_filter(&self, from_block: u64, to_block: u64) -> Filter {
        Filter::new()
            .address(self.registry)
            .topic0(*topics::ORDER_CREATED)
            .from_block(from_block)
            .to_block(to_block)
    }

    /// Parse an `OrderCreated` log; other logs yield `None`
    pub fn parse_log(&self, log: &Log) -> ResolverResult<Option<Order>> {
        if log.address != self.registry || log.topics.first() != Some(&*topics::ORDER_CREATED) {
            return Ok(None);
        }

        let order_hash = log
            .topics
            .get(1)
            .map(|t| OrderHash(t.0))
            .ok_or_else(|| ResolverError::EventParsing("missing orderHash topic".to_string()))?;
        let maker = log
            .topics
            .get(2)
            .map(|t| Address::from_slice(&t.0[12..32]))
            .ok_or_else(|| ResolverError::EventParsing("missing maker topic".to_string()))?;

        let tokens = abi::decode(&ORDER_CREATED_DATA, &log.data)
            .map_err(|e| ResolverError::EventParsing(format!("OrderCreated data: {}", e)))?;

        let mut tokens = tokens.into_iter();
        let mut next = || {
            tokens
                .next()
                .ok_or_else(|| ResolverError::EventParsing("truncated OrderCreated".to_string()))
        };

        let source_asset = next()?
            .into_address()
            .ok_or_else(|| field_error("sourceAsset"))?;
        let source_amount = uint_u64(next()?, "sourceAmount")?;
        let destination_chain_id = uint_u64(next()?, "destinationChainId")?;
        let destination_execution_params = next()?
            .into_bytes()
            .ok_or_else(|| field_error("destinationExecutionParams"))?;
        let resolver_fee_amount = uint_u64(next()?, "resolverFeeAmount")?;
        let expiry_time = uint_u64(next()?, "expiryTime")?;
        let hashlock: [u8; 32] = next()?
            .into_fixed_bytes()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| field_error("hashlock"))?;

        Ok(Some(Order {
            order_hash,
            maker: format!("{:?}", maker),
            source_asset: format!("{:?}", source_asset),
            source_amount,
            destination_chain_id,
            destination_execution_params,
            resolver_fee_amount,
            expiry_time,
            hashlock,
            source_block: log.block_number.map(|b| b.as_u64()).unwrap_or(0),
        }))
    }
}

fn field_error(field: &str) -> ResolverError {
    ResolverError::EventParsing(format!("invalid {} field", field))
}

fn uint_u64(token: Token, field: &str) -> ResolverResult<u64> {
    let value = token.into_uint().ok_or_else(|| field_error(field))?;
    if value > U256::from(u64::MAX) {
        return Err(ResolverError::EventParsing(format!(
            "{} does not fit in 64 bits",
            field
        )));
    }
    Ok(value.as_u64())
}

/// Calldata for `getOrderStatus(orderHash)`
pub fn encode_get_order_status(order_hash: &OrderHash) -> Bytes {
    let mut data = id(GET_ORDER_STATUS_SIGNATURE).to_vec();
    data.extend(abi::encode(&[Token::FixedBytes(order_hash.as_bytes().to_vec())]));
    data.into()
}

pub fn decode_order_status(output: &[u8]) -> ResolverResult<RegistryStatus> {
    let tokens = abi::decode(&[ParamType::Uint(8)], output)
        .map_err(|e| ResolverError::EventParsing(format!("getOrderStatus output: {}", e)))?;
    let code = tokens
        .into_iter()
        .next()
        .and_then(Token::into_uint)
        .ok_or_else(|| field_error("status"))?;
    Ok(RegistryStatus::from_code(code.low_u32() as u8))
}

/// Calldata for `withdraw(orderHash, secret)`
pub fn encode_withdraw(order_hash: &OrderHash, secret: &[u8; 32]) -> Bytes {
    let mut data = id(WITHDRAW_SIGNATURE).to_vec();
    data.extend(abi::encode(&[
        Token::FixedBytes(order_hash.as_bytes().to_vec()),
        Token::FixedBytes(secret.to_vec()),
    ]));
    data.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = "0x00000000000000000000000000000000000000aa";

    fn order_log(data: Vec<u8>) -> Log {
        let maker = Address::from_low_u64_be(0xbeef);
        Log {
            address: REGISTRY.parse().unwrap(),
            topics: vec![
                *topics::ORDER_CREATED,
                H256::repeat_byte(0x11),
                H256::from(maker),
            ],
            data: data.into(),
            block_number: Some(U64::from(77)),
            ..Default::default()
        }
    }

    fn order_data() -> Vec<u8> {
        abi::encode(&[
            Token::Address(Address::from_low_u64_be(0xcafe)),
            Token::Uint(U256::from(1_000_000u64)),
            Token::Uint(U256::from(0u64)),
            Token::Bytes(vec![0xab; 28]),
            Token::Uint(U256::from(20u64)),
            Token::Uint(U256::from(1_900_000_000u64)),
            Token::FixedBytes(vec![0x22; 32]),
        ])
    }

    #[test]
    fn test_parse_order_created() {
        let parser = EventParser::new(REGISTRY).unwrap();
        let order = parser.parse_log(&order_log(order_data())).unwrap().unwrap();

        assert_eq!(order.order_hash, OrderHash([0x11; 32]));
        assert_eq!(order.source_amount, 1_000_000);
        assert_eq!(order.destination_execution_params, vec![0xab; 28]);
        assert_eq!(order.resolver_fee_amount, 20);
        assert_eq!(order.expiry_time, 1_900_000_000);
        assert_eq!(order.hashlock, [0x22; 32]);
        assert_eq!(order.source_block, 77);
        assert!(order.maker.ends_with("beef"));
    }

    #[test]
    fn test_ignores_foreign_logs() {
        let parser = EventParser::new(REGISTRY).unwrap();
        let mut log = order_log(order_data());
        log.topics[0] = H256::repeat_byte(0x99);
        assert!(parser.parse_log(&log).unwrap().is_none());
    }

    #[test]
    fn test_rejects_truncated_data() {
        let parser = EventParser::new(REGISTRY).unwrap();
        let mut data = order_data();
        data.truncate(64);
        assert!(parser.parse_log(&order_log(data)).is_err());
    }

    #[test]
    fn test_withdraw_calldata() {
        let data = encode_withdraw(&OrderHash([1; 32]), &[2; 32]);
        assert_eq!(&data[..4], &id(WITHDRAW_SIGNATURE));
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[4..36], &[1; 32]);
        assert_eq!(&data[36..], &[2; 32]);
    }

    #[test]
    fn test_decode_order_status() {
        let out = abi::encode(&[Token::Uint(U256::from(2u8))]);
        let status = decode_order_status(&out).unwrap();
        assert_eq!(status, RegistryStatus::Matched);
        assert!(status.is_locked());
        assert!(!RegistryStatus::from_code(3).is_locked());
    }
}
