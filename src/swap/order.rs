//! Orders published by the source-chain registry

use bitcoin::hashes::{sha256, Hash};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 32-byte order identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderHash(pub [u8; 32]);

impl OrderHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Stable 31-bit index used for per-order key derivation
    pub fn key_index(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]) & 0x7fff_ffff
    }
}

impl fmt::Display for OrderHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for OrderHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderHash({})", self)
    }
}

impl FromStr for OrderHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex_array::parse(s).map(OrderHash)
    }
}

impl Serialize for OrderHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OrderHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Immutable order facts as published on the source chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_hash: OrderHash,
    pub maker: String,
    pub source_asset: String,
    pub source_amount: u64,
    pub destination_chain_id: u64,
    #[serde(with = "hex_vec")]
    pub destination_execution_params: Vec<u8>,
    pub resolver_fee_amount: u64,
    /// Absolute expiry, unix seconds
    pub expiry_time: u64,
    #[serde(with = "hex_array")]
    pub hashlock: [u8; 32],
    /// Source-chain block the order was created in
    pub source_block: u64,
}

impl Order {
    /// Seconds left before expiry, `None` once expired
    pub fn time_to_expiry(&self, now: u64) -> Option<u64> {
        self.expiry_time.checked_sub(now).filter(|left| *left > 0)
    }

    pub fn verify_secret(&self, secret: &[u8]) -> bool {
        sha256::Hash::hash(secret).to_byte_array() == self.hashlock
    }

    /// Safety deposit the resolver posts alongside the order amount
    pub fn safety_deposit(&self, bps: u16) -> u64 {
        ((self.source_amount as u128 * bps as u128) / 10_000) as u64
    }
}

/// Hex (de)serialization for fixed-size byte arrays
pub mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse<const N: usize>(s: &str) -> Result<[u8; N], String> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| e.to_string())?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("expected {} bytes, got {}", N, bytes.len()))
    }

    pub fn serialize<S: Serializer, const N: usize>(
        value: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Hex (de)serialization for byte vectors
pub mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_hash_round_trips_through_json() {
        let hash = OrderHash([0xab; 32]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"0x{}\"", "ab".repeat(32)));
        let back: OrderHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
        assert!("0x1234".parse::<OrderHash>().is_err());
    }

    #[test]
    fn test_time_to_expiry_and_safety_deposit() {
        let order = crate::testing::order(1, 20);
        let now = order.expiry_time - 100;
        assert_eq!(order.time_to_expiry(now), Some(100));
        assert_eq!(order.time_to_expiry(order.expiry_time), None);
        assert_eq!(order.time_to_expiry(order.expiry_time + 5), None);
        assert_eq!(order.safety_deposit(500), order.source_amount / 20);
    }

    #[test]
    fn test_verify_secret() {
        let order = crate::testing::order(2, 20);
        assert!(order.verify_secret(&crate::testing::secret_for(2)));
        assert!(!order.verify_secret(&[0u8; 32]));
    }
}
