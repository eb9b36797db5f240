//! Request signatures.
//!
//! A signed request carries three headers:
//!
//! | Header | Content                                                        |
//! |--------|----------------------------------------------------------------|
//! | `msg`  | hex of `timestamp (8 bytes, big-endian unix seconds) ‖ body`   |
//! | `sig`  | hex of a 65-byte recoverable secp256k1 signature `r ‖ s ‖ v` over Keccak-256(`msg`) |
//! | `pub`  | the claimed `0x` address, or a hex secp256k1 public key        |
//!
//! [`SignatureAuth`] checks all three against the received body and yields the
//! authenticated [`Address`]. [`Signer`] produces them.

use std::fmt;
use std::sync::Arc;

use chrono::Duration;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use sha3::{Digest, Keccak256};

use crate::address::Address;
use crate::clock::Clock;
use crate::errors::{EscrowError, Result};

pub const HEADER_SIG: &str = "sig";
pub const HEADER_PUB: &str = "pub";
pub const HEADER_MSG: &str = "msg";

const TIMESTAMP_LEN: usize = 8;
const SIGNATURE_LEN: usize = 65;

/// Header values for one signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub sig: String,
    pub public: String,
    pub msg: String,
}

/// `timestamp ‖ body`
pub fn frame_message(timestamp: i64, body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(TIMESTAMP_LEN + body.len());
    msg.extend_from_slice(&timestamp.to_be_bytes());
    msg.extend_from_slice(body);
    msg
}

fn split_message(msg: &[u8]) -> Result<(i64, &[u8])> {
    if msg.len() < TIMESTAMP_LEN {
        return Err(invalid("message too short"));
    }
    let (ts, body) = msg.split_at(TIMESTAMP_LEN);
    let mut raw = [0u8; TIMESTAMP_LEN];
    raw.copy_from_slice(ts);
    Ok((i64::from_be_bytes(raw), body))
}

fn digest(msg: &[u8]) -> Message {
    Message::from_digest(Keccak256::digest(msg).into())
}

fn invalid(reason: &str) -> EscrowError {
    EscrowError::SignatureInvalid(reason.to_string())
}

/// Recover the signing key of a 65-byte `r ‖ s ‖ v` signature over `msg`.
fn recover(secp: &Secp256k1<All>, msg: &[u8], sig: &[u8]) -> Result<PublicKey> {
    if sig.len() != SIGNATURE_LEN {
        return Err(invalid("signature must be 65 bytes"));
    }
    let v = match sig[64] {
        v @ 0..=1 => v,
        v @ 27..=28 => v - 27,
        _ => return Err(invalid("bad recovery id")),
    };
    let recid = RecoveryId::from_i32(i32::from(v)).map_err(|_| invalid("bad recovery id"))?;
    let sig = RecoverableSignature::from_compact(&sig[..64], recid)
        .map_err(|_| invalid("malformed signature"))?;
    secp.recover_ecdsa(&digest(msg), &sig)
        .map_err(|_| invalid("signature does not recover"))
}

// ─────────────────────────────────────────────────────────
// Verification
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SignatureAuth {
    secp: Secp256k1<All>,
    clock: Arc<dyn Clock>,
    max_age: Duration,
}

impl SignatureAuth {
    pub fn new(clock: Arc<dyn Clock>, max_age: Duration) -> Self {
        Self {
            secp: Secp256k1::new(),
            clock,
            max_age,
        }
    }

    /// Authenticate a request from its raw header values and received body.
    pub fn verify(&self, sig: &str, public: &str, msg: &str, body: &[u8]) -> Result<Address> {
        let sig = hex::decode(strip_0x(sig)).map_err(|_| invalid("sig is not hex"))?;
        let msg = hex::decode(strip_0x(msg)).map_err(|_| invalid("msg is not hex"))?;

        let recovered = recover(&self.secp, &msg, &sig)?;
        let signer = Address::from_public_key(&recovered);

        let claimed = if public.trim().len() == 42 {
            public
                .parse::<Address>()
                .map_err(|_| invalid("pub is not an address"))?
        } else {
            let raw = hex::decode(strip_0x(public)).map_err(|_| invalid("pub is not hex"))?;
            let key = PublicKey::from_slice(&raw).map_err(|_| invalid("pub is not a key"))?;
            if key != recovered {
                return Err(invalid("signature does not match public key"));
            }
            Address::from_public_key(&key)
        };
        if claimed != signer {
            return Err(invalid("signature does not match address"));
        }

        let (timestamp, signed_body) = split_message(&msg)?;
        let age = self
            .clock
            .now()
            .timestamp()
            .checked_sub(timestamp)
            .and_then(i64::checked_abs)
            .ok_or_else(|| invalid("signed timestamp out of range"))?;
        if age > self.max_age.num_seconds() {
            return Err(invalid("signed message expired"));
        }
        if signed_body != body {
            return Err(invalid("body does not match signed message"));
        }

        Ok(signer)
    }
}

fn strip_0x(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix("0x").unwrap_or(s)
}

// ─────────────────────────────────────────────────────────
// Signing
// ─────────────────────────────────────────────────────────

pub struct Signer {
    secp: Secp256k1<All>,
    secret: SecretKey,
    address: Address,
}

impl Signer {
    pub fn new(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let address = Address::from_public_key(&PublicKey::from_secret_key(&secp, &secret));
        Self {
            secp,
            secret,
            address,
        }
    }

    pub fn from_hex(raw: &str) -> Result<Self> {
        let bytes = hex::decode(strip_0x(raw))
            .map_err(|_| EscrowError::Config("secret key is not hex".to_string()))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|_| EscrowError::Config("invalid secp256k1 secret key".to_string()))?;
        Ok(Self::new(secret))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sign(&self, timestamp: i64, body: &[u8]) -> SignedHeaders {
        let msg = frame_message(timestamp, body);
        let (recid, compact) = self
            .secp
            .sign_ecdsa_recoverable(&digest(&msg), &self.secret)
            .serialize_compact();

        let mut sig = Vec::with_capacity(SIGNATURE_LEN);
        sig.extend_from_slice(&compact);
        sig.push(recid.to_i32() as u8);

        SignedHeaders {
            sig: hex::encode(sig),
            public: self.address.to_string(),
            msg: hex::encode(msg),
        }
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
