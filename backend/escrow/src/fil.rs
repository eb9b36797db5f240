//! Exact FIL amounts.
//!
//! A [`Fil`] is an unsigned, arbitrary-precision count of attoFIL
//! (10^18 attoFIL = 1 FIL). No floating point is involved anywhere: parsing,
//! arithmetic and comparisons are all integer operations.
//!
//! | Form    | Example                      |
//! |---------|------------------------------|
//! | JSON    | `"1.5 FIL"`                  |
//! | Parsing | `"1.5 FIL"`, `"1.5"`, `"1500000000000000000 attoFIL"` |
//! | SQL     | 40-digit zero-padded decimal |
//! | RPC     | `0x`-prefixed hex quantity   |

use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use num_bigint::BigUint;
use num_traits::{CheckedSub, ToPrimitive, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{EscrowError, Result};

/// attoFIL in one FIL.
pub const ATTO_PER_FIL: u64 = 1_000_000_000_000_000_000;
const FRACTION_DIGITS: usize = 18;

/// Width of the stored decimal string. Values above `10^40 - 1` attoFIL are rejected.
pub const STORAGE_WIDTH: usize = 40;

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fil(BigUint);

impl Fil {
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    pub fn from_atto(atto: impl Into<BigUint>) -> Self {
        Self(atto.into())
    }

    pub fn from_whole(fil: u64) -> Self {
        Self(BigUint::from(fil) * BigUint::from(ATTO_PER_FIL))
    }

    pub fn atto(&self) -> &BigUint {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// `self - other`, or `None` when the result would be negative.
    pub fn checked_sub(&self, other: &Fil) -> Option<Fil> {
        self.0.checked_sub(&other.0).map(Fil)
    }

    /// Zero-padded decimal form used by the ledger tables.
    pub fn to_db(&self) -> Result<String> {
        let digits = self.0.to_str_radix(10);
        if digits.len() > STORAGE_WIDTH {
            return Err(EscrowError::Validation(format!(
                "amount exceeds {STORAGE_WIDTH} digits of attoFIL"
            )));
        }
        Ok(format!("{digits:0>width$}", width = STORAGE_WIDTH))
    }

    pub fn from_db(raw: &str) -> Result<Fil> {
        BigUint::parse_bytes(raw.trim().as_bytes(), 10)
            .map(Fil)
            .ok_or_else(|| EscrowError::Validation(format!("corrupt stored amount: {raw}")))
    }

    /// Parse an Ethereum JSON-RPC quantity (`0x1bc16d674ec80000`).
    pub fn from_hex_quantity(raw: &str) -> Result<Fil> {
        let digits = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .ok_or_else(|| EscrowError::Validation(format!("not a hex quantity: {raw}")))?;
        if digits.is_empty() {
            return Ok(Fil::zero());
        }
        BigUint::parse_bytes(digits.as_bytes(), 16)
            .map(Fil)
            .ok_or_else(|| EscrowError::Validation(format!("not a hex quantity: {raw}")))
    }

    pub fn to_hex_quantity(&self) -> String {
        format!("0x{}", self.0.to_str_radix(16))
    }
}

impl Add for Fil {
    type Output = Fil;

    fn add(self, rhs: Fil) -> Fil {
        Fil(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a Fil> for &'a Fil {
    type Output = Fil;

    fn add(self, rhs: &'a Fil) -> Fil {
        Fil(&self.0 + &rhs.0)
    }
}

impl fmt::Display for Fil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scale = BigUint::from(ATTO_PER_FIL);
        let whole = &self.0 / &scale;
        let frac = (&self.0 % &scale).to_u64().unwrap_or_default();
        if frac == 0 {
            return write!(f, "{whole} FIL");
        }
        let frac = format!("{frac:0>width$}", width = FRACTION_DIGITS);
        write!(f, "{whole}.{} FIL", frac.trim_end_matches('0'))
    }
}

impl FromStr for Fil {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EscrowError::Validation(format!("invalid FIL amount: {s:?}"));

        let mut parts = s.split_whitespace();
        let number = parts.next().ok_or_else(invalid)?;
        let unit = parts.next().unwrap_or("FIL");
        if parts.next().is_some() {
            return Err(invalid());
        }

        let fil = match unit.to_ascii_lowercase().as_str() {
            "fil" => parse_decimal_fil(number).ok_or_else(invalid)?,
            "attofil" => {
                if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                BigUint::parse_bytes(number.as_bytes(), 10)
                    .map(Fil)
                    .ok_or_else(invalid)?
            }
            _ => return Err(invalid()),
        };

        // Reject anything the ledger could not store.
        fil.to_db()?;
        Ok(fil)
    }
}

fn parse_decimal_fil(number: &str) -> Option<Fil> {
    let (whole, frac) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if frac.len() > FRACTION_DIGITS
        || !whole.bytes().all(|b| b.is_ascii_digit())
        || !frac.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let whole = if whole.is_empty() {
        BigUint::zero()
    } else {
        BigUint::parse_bytes(whole.as_bytes(), 10)?
    };
    let frac = format!("{frac:0<width$}", width = FRACTION_DIGITS);
    let frac = BigUint::parse_bytes(frac.as_bytes(), 10)?;

    Some(Fil(whole * BigUint::from(ATTO_PER_FIL) + frac))
}

impl Serialize for Fil {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fil {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fil(s: &str) -> Fil {
        s.parse().unwrap()
    }

    #[test]
    fn parses_decimal_and_atto_forms() {
        assert_eq!(fil("5 FIL"), Fil::from_whole(5));
        assert_eq!(fil("5"), Fil::from_whole(5));
        assert_eq!(fil("0.4 FIL"), Fil::from_atto(400_000_000_000_000_000u64));
        assert_eq!(fil(".5 fil"), Fil::from_atto(500_000_000_000_000_000u64));
        assert_eq!(fil("42 attoFIL"), Fil::from_atto(42u64));
    }

    #[test]
    fn rejects_malformed_amounts() {
        for bad in [
            "",
            "-1 FIL",
            "1.2.3",
            "1 FOO",
            "1 FIL extra",
            "0.0000000000000000001 FIL",
            "1.5 attoFIL",
            ".",
            "1e3",
        ] {
            assert!(bad.parse::<Fil>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn rejects_amounts_wider_than_storage() {
        let too_big = format!("{} attoFIL", "9".repeat(STORAGE_WIDTH + 1));
        assert!(too_big.parse::<Fil>().is_err());
        let max = format!("{} attoFIL", "9".repeat(STORAGE_WIDTH));
        assert!(max.parse::<Fil>().is_ok());
    }

    #[test]
    fn display_trims_fraction() {
        assert_eq!(Fil::zero().to_string(), "0 FIL");
        assert_eq!(Fil::from_whole(3).to_string(), "3 FIL");
        assert_eq!(fil("0.6").to_string(), "0.6 FIL");
        assert_eq!(Fil::from_atto(1u64).to_string(), "0.000000000000000001 FIL");
    }

    #[test]
    fn storage_form_orders_numerically() {
        let small = Fil::from_atto(9u64).to_db().unwrap();
        let large = Fil::from_whole(1).to_db().unwrap();
        assert_eq!(small.len(), STORAGE_WIDTH);
        assert!(small < large);
        assert_eq!(Fil::from_db(&large).unwrap(), Fil::from_whole(1));
    }

    #[test]
    fn hex_quantities() {
        let one = Fil::from_whole(1);
        assert_eq!(one.to_hex_quantity(), "0xde0b6b3a7640000");
        assert_eq!(Fil::from_hex_quantity("0xde0b6b3a7640000").unwrap(), one);
        assert_eq!(Fil::from_hex_quantity("0x0").unwrap(), Fil::zero());
        assert!(Fil::from_hex_quantity("12").is_err());
    }

    #[test]
    fn checked_sub_never_goes_negative() {
        assert_eq!(fil("1").checked_sub(&fil("0.4")), Some(fil("0.6")));
        assert_eq!(fil("0.4").checked_sub(&fil("1")), None);
    }

    #[test]
    fn json_round_trip_uses_strings() {
        let json = serde_json::to_string(&fil("2.25")).unwrap();
        assert_eq!(json, r#""2.25 FIL""#);
        let back: Fil = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fil("2.25"));
    }
}
