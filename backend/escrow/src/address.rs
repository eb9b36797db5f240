//! Wallet addresses.
//!
//! Accounts are keyed by 20-byte Ethereum-style addresses, always rendered as
//! lower-case `0x` hex so that the ledger's natural key is canonical.

use std::fmt;
use std::str::FromStr;

use secp256k1::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};

use crate::errors::{EscrowError, Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 20]);

impl Address {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Last 20 bytes of Keccak-256 over the uncompressed key (without the 0x04 tag).
    pub fn from_public_key(key: &PublicKey) -> Self {
        let uncompressed = key.serialize_uncompressed();
        let hash = Keccak256::digest(&uncompressed[1..]);
        let mut out = [0u8; 20];
        out.copy_from_slice(&hash[12..]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EscrowError::Validation(format!("invalid address: {s:?}"));
        let digits = s
            .trim()
            .strip_prefix("0x")
            .or_else(|| s.trim().strip_prefix("0X"))
            .ok_or_else(invalid)?;
        let bytes = hex::decode(digits).map_err(|_| invalid())?;
        let bytes: [u8; 20] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Secp256k1, SecretKey};

    #[test]
    fn parses_case_insensitively_and_renders_lower_case() {
        let a: Address = "0xAbCdEf0123456789aBcDeF0123456789AbCdEf01".parse().unwrap();
        assert_eq!(a.to_string(), "0xabcdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn rejects_wrong_length_and_missing_prefix() {
        assert!("0x1234".parse::<Address>().is_err());
        assert!("abcdef0123456789abcdef0123456789abcdef01".parse::<Address>().is_err());
        assert!("0xzz".parse::<Address>().is_err());
    }

    #[test]
    fn derives_known_address_from_key() {
        // Secret key 1 maps to the well-known address of the generator point.
        let secp = Secp256k1::new();
        let mut raw = [0u8; 32];
        raw[31] = 1;
        let sk = SecretKey::from_slice(&raw).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        assert_eq!(
            Address::from_public_key(&pk).to_string(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }
}
